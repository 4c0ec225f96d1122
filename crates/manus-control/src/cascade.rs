//! 级联双环控制器
//!
//! 每个关节一对串联回路：外环拿规划角度对磁编角度求修正量，内环把
//! "修正量 + 舵机反馈角度"作为设定值、舵机反馈角度作为测量值，输出
//! 直接用作舵机命令（单位由内环增益吸收）。
//!
//! 磁编数据缺失的周期用 [`OuterMode::Hold`]：外环整体跳过（状态不被
//! 无效数据污染），修正量取零，内环设定值等于反馈，命令保持原地。

use crate::pid::{PidGains, PositionPid};
use manus_protocol::JOINT_COUNT;

/// 外环在本周期的运行方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OuterMode {
    /// 正常跟踪：外环参与计算
    Track,
    /// 保持：外环跳过，修正量为零
    Hold,
}

struct JointLoops {
    outer: PositionPid,
    inner: PositionPid,
}

/// 全部关节的级联控制器
pub struct CascadeController {
    joints: Vec<JointLoops>,
}

impl CascadeController {
    /// 全部关节共享同一组外环/内环增益
    pub fn new(outer: PidGains, inner: PidGains) -> Self {
        Self {
            joints: (0..JOINT_COUNT)
                .map(|_| JointLoops {
                    outer: PositionPid::new(outer),
                    inner: PositionPid::new(inner),
                })
                .collect(),
        }
    }

    /// 每个关节独立的 (外环, 内环) 增益
    pub fn with_joint_gains(pairs: &[(PidGains, PidGains); JOINT_COUNT]) -> Self {
        Self {
            joints: pairs
                .iter()
                .map(|&(outer, inner)| JointLoops {
                    outer: PositionPid::new(outer),
                    inner: PositionPid::new(inner),
                })
                .collect(),
        }
    }

    /// 对全部关节各跑一遍两级回路，输出写入 `out`
    ///
    /// 普通调用绝不隐式复位任何回路状态。
    pub fn compute(
        &mut self,
        targets: &[f32; JOINT_COUNT],
        sensed: &[f32; JOINT_COUNT],
        feedback: &[f32; JOINT_COUNT],
        mode: OuterMode,
        out: &mut [f32; JOINT_COUNT],
    ) {
        for (i, loops) in self.joints.iter_mut().enumerate() {
            let correction = match mode {
                OuterMode::Track => loops.outer.update(targets[i], sensed[i]),
                OuterMode::Hold => 0.0,
            };

            let inner_setpoint = correction + feedback[i];
            out[i] = loops.inner.update(inner_setpoint, feedback[i]);
        }
    }

    /// 清零每个关节两级回路的积分、上次误差和输出
    pub fn reset_all(&mut self) {
        for loops in &mut self.joints {
            loops.outer.reset();
            loops.inner.reset();
        }
    }
}
