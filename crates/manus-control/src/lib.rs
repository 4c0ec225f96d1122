//! # Manus 级联控制器
//!
//! 每个关节由两级串联的位置式 PID 驱动：
//! - 外环：规划角度 vs 磁编角度，输出一个修正量
//! - 内环：(修正量 + 舵机反馈角度) vs 舵机反馈角度，输出最终命令
//!
//! 内环持续跟踪"当前位置加所需修正"，当磁编角度追上规划角度时
//! 修正量收敛到零。控制周期固定，增益吸收周期因子，更新式中不含 dt。

pub mod cascade;
pub mod pid;

pub use cascade::{CascadeController, OuterMode};
pub use pid::{PidGains, PositionPid};
