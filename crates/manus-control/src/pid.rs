//! 位置式 PID
//!
//! 固定周期下的离散位置式实现：误差先过死区（|e| ≤ deadband 时按零
//! 处理），比例项 kp·e，积分项累加 ki·e 并对称钳制，微分项
//! kd·(e − e_prev)，三项之和再做对称输出钳制。

use serde::{Deserialize, Serialize};

/// 一组 PID 增益与限幅参数
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PidGains {
    pub kp: f32,
    pub ki: f32,
    pub kd: f32,
    /// 误差死区：|e| 不超过该值时按 0 处理
    pub deadband: f32,
    /// 积分累加器的对称钳制幅值
    pub integral_limit: f32,
    /// 输出的对称钳制幅值
    pub output_limit: f32,
}

/// 单个位置式 PID 回路
#[derive(Debug, Clone, Copy)]
pub struct PositionPid {
    gains: PidGains,
    integral: f32,
    prev_error: f32,
    output: f32,
}

impl PositionPid {
    pub fn new(gains: PidGains) -> Self {
        Self {
            gains,
            integral: 0.0,
            prev_error: 0.0,
            output: 0.0,
        }
    }

    /// 执行一次更新，返回钳制后的输出
    pub fn update(&mut self, target: f32, measure: f32) -> f32 {
        let mut error = target - measure;
        if error.abs() <= self.gains.deadband {
            error = 0.0;
        }

        let p = self.gains.kp * error;

        self.integral = (self.integral + self.gains.ki * error)
            .clamp(-self.gains.integral_limit, self.gains.integral_limit);

        let d = self.gains.kd * (error - self.prev_error);
        self.prev_error = error;

        self.output =
            (p + self.integral + d).clamp(-self.gains.output_limit, self.gains.output_limit);
        self.output
    }

    /// 最近一次的输出
    pub fn output(&self) -> f32 {
        self.output
    }

    /// 清零积分累加器、上次误差和输出
    pub fn reset(&mut self) {
        self.integral = 0.0;
        self.prev_error = 0.0;
        self.output = 0.0;
    }
}
