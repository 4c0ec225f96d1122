//! 驱动层错误类型定义

use manus_can::CanError;
use manus_protocol::ProtocolError;
use manus_servo::ServoError;
use thiserror::Error;

/// 驱动层错误类型
#[derive(Error, Debug)]
pub enum DriverError {
    /// CAN 驱动错误
    #[error("CAN driver error: {0}")]
    Can(#[from] CanError),

    /// 舵机总线错误
    #[error("Servo bus error: {0}")]
    Servo(#[from] ServoError),

    /// 协议解析错误
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// IO 错误（配置文件读取、主机链路端口等）
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// 配置无效
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// 线程创建失败
    #[error("Failed to spawn thread {name}: {source}")]
    ThreadSpawn {
        name: &'static str,
        #[source]
        source: std::io::Error,
    },

    /// 板卡未运行（已关闭或 IO 线程已退出）
    #[error("Board is not running")]
    NotRunning,
}
