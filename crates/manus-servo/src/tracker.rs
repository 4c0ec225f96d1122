//! 多圈位置跟踪
//!
//! 舵机只上报单圈原始位置（0..4096）。比较相邻两次读数的差值即可
//! 检测跨圈：差值超过半圈，说明读数从量程另一侧绕了回来。累计圈数
//! 后得到多圈绝对位置，并钳制在行程范围内。
//!
//! 该算法假设相邻两次轮询之间的转动不超过半圈；更快的转动会把跨圈
//! 方向判反。这是已知的使用限制，不在此层修补。

use manus_protocol::{SERVO_ABS_MAX, SERVO_ABS_MIN, SERVO_HALF_REV, SERVO_UNITS_PER_REV};

/// 单个舵机的多圈位置跟踪器
///
/// 首次观测不计算差值：圈数从 0 开始，绝对位置等于原始读数，
/// 避免与未初始化的"上一次读数"比较产生虚假跳变。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MultiTurnTracker {
    raw: u16,
    last_raw: u16,
    turn_count: i32,
    absolute: i32,
    initialized: bool,
}

impl MultiTurnTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// 送入一次新的原始读数，返回更新后的绝对位置
    pub fn update(&mut self, raw: u16) -> i32 {
        if !self.initialized {
            self.raw = raw;
            self.last_raw = raw;
            self.turn_count = 0;
            self.absolute = raw as i32;
            self.initialized = true;
            return self.absolute;
        }

        let delta = raw as i32 - self.last_raw as i32;
        if delta > SERVO_HALF_REV {
            // 读数跳上高端：实际反向转过零点
            self.turn_count -= 1;
        } else if delta < -SERVO_HALF_REV {
            // 读数跳下低端：实际正向转过零点
            self.turn_count += 1;
        }

        self.raw = raw;
        self.last_raw = raw;
        // i64 中间量，极端圈数下乘法不溢出
        self.absolute = ((self.turn_count as i64) * (SERVO_UNITS_PER_REV as i64)
            + raw as i64)
            .clamp(SERVO_ABS_MIN as i64, SERVO_ABS_MAX as i64) as i32;
        self.absolute
    }

    /// 把当前位置设为零点：圈数清零，绝对位置回到单圈读数
    ///
    /// 不影响跨圈检测的连续性（上一次读数保持不变）。
    pub fn reset(&mut self) {
        self.turn_count = 0;
        self.absolute = self.raw as i32;
    }

    pub fn raw(&self) -> u16 {
        self.raw
    }

    pub fn turn_count(&self) -> i32 {
        self.turn_count
    }

    pub fn absolute(&self) -> i32 {
        self.absolute
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }
}
