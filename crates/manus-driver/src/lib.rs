//! # Manus 板卡驱动层
//!
//! 围绕一套共享状态装配三个任务线程：
//! - 传感 IO：广播网络的分片帧重组 + 维护命令泵
//! - 主机链路：字节流命令解析、快照与标定回执上报
//! - 控制编排：固定周期的读-算-写主回路
//!
//! 嵌入方通过 [`Board`]/[`BoardBuilder`] 启动与关停，经无锁快照和
//! 目标槽与控制回路交互。传输端都是 trait 注入：接上 mock 传输端
//! 即可在无硬件环境把整个驱动跑起来。

mod board;
pub mod config;
mod error;
pub mod hostlink;
pub mod orchestrator;
pub mod reassembly;
pub mod state;

pub use board::{Board, BoardBuilder};
pub use config::{BoardConfig, JointMapEntry};
pub use error::DriverError;
pub use hostlink::{HostLinkSettings, HostPort, host_link_loop};
pub use orchestrator::{ControlOrchestrator, OrchestratorSettings, control_loop};
pub use reassembly::{FrameReassembler, sensor_io_loop};
pub use state::*;
