//! # Manus 舵机总线层
//!
//! 每条物理多机串口总线对应一个 [`ServoBus`]：缓存写批次、执行批量
//! 读写事务、为总线上的每个舵机维护多圈位置跟踪状态。
//!
//! 线上编码属于外部舵机协议库的职责，本层通过 [`ServoPort`] 契约
//! 消费"批量读 / 批量写"两个操作。

use thiserror::Error;

pub mod bus;
pub mod tracker;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

pub use bus::{ServoBus, ServoFeedback, ServoPort, TargetCommand};
pub use tracker::MultiTurnTracker;

#[cfg(any(test, feature = "mock"))]
pub use mock::{MockServoHandle, MockServoPort};

/// 舵机总线层统一错误类型
///
/// 单个舵机不应答不算错误（它只是缺席于读结果，并被标记离线）；
/// 这里的错误指整个事务层面的失败。
#[derive(Error, Debug)]
pub enum ServoError {
    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Bus transaction failed: {0}")]
    Transaction(String),
}
