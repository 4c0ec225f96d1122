//! # Manus CAN 适配层
//!
//! CAN 硬件抽象层，为上层的舵机总线和传感器广播链路提供统一的收发接口。
//!
//! 后端：
//! - Linux 下的 SocketCAN（[`SocketCanAdapter`]）
//! - 无硬件的 Mock 后端（[`mock::MockCanAdapter`]，需启用 `mock` feature）

use std::time::Duration;
use thiserror::Error;

// 重新导出 manus-protocol 中的 BusFrame
pub use manus_protocol::BusFrame;

#[cfg(target_os = "linux")]
pub mod socketcan;

#[cfg(target_os = "linux")]
pub use socketcan::SocketCanAdapter;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

#[cfg(any(test, feature = "mock"))]
pub use mock::{MockCanAdapter, MockCanHandle};

/// CAN 适配层统一错误类型
#[derive(Error, Debug)]
pub enum CanError {
    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Device Error: {0}")]
    Device(#[from] CanDeviceError),
    #[error("Read timeout")]
    Timeout,
    #[error("Buffer overflow")]
    BufferOverflow,
    #[error("Bus off")]
    BusOff,
    #[error("Device not started")]
    NotStarted,
}

/// 设备/后端错误的结构化分类
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CanDeviceErrorKind {
    Unknown,
    NotFound,
    NoDevice,
    AccessDenied,
    InvalidFrame,
}

/// 结构化设备错误
#[derive(Error, Debug, Clone)]
#[error("{kind:?}: {message}")]
pub struct CanDeviceError {
    pub kind: CanDeviceErrorKind,
    pub message: String,
}

impl CanDeviceError {
    pub fn new(kind: CanDeviceErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// 致命错误：设备消失或权限不足，IO 循环应当停止而不是重试
    pub fn is_fatal(&self) -> bool {
        matches!(
            self.kind,
            CanDeviceErrorKind::NoDevice
                | CanDeviceErrorKind::AccessDenied
                | CanDeviceErrorKind::NotFound
        )
    }
}

impl From<String> for CanDeviceError {
    fn from(message: String) -> Self {
        Self::new(CanDeviceErrorKind::Unknown, message)
    }
}

impl From<&str> for CanDeviceError {
    fn from(message: &str) -> Self {
        Self::new(CanDeviceErrorKind::Unknown, message)
    }
}

/// CAN 适配器统一接口
///
/// 单个适配器同时承担收发：传感器 IO 循环在一个线程里
/// 交替执行带超时的接收和命令队列的发送。
pub trait CanAdapter {
    fn send(&mut self, frame: BusFrame) -> Result<(), CanError>;
    fn receive(&mut self) -> Result<BusFrame, CanError>;
    fn set_receive_timeout(&mut self, _timeout: Duration) {}
    fn receive_timeout(&mut self, timeout: Duration) -> Result<BusFrame, CanError> {
        self.set_receive_timeout(timeout);
        self.receive()
    }
    fn try_receive(&mut self) -> Result<Option<BusFrame>, CanError> {
        match self.receive_timeout(Duration::ZERO) {
            Ok(frame) => Ok(Some(frame)),
            Err(CanError::Timeout) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_error_fatal_classification() {
        let fatal_kinds = [
            CanDeviceErrorKind::NoDevice,
            CanDeviceErrorKind::AccessDenied,
            CanDeviceErrorKind::NotFound,
        ];
        for kind in fatal_kinds {
            assert!(CanDeviceError::new(kind, "x").is_fatal());
        }
        assert!(!CanDeviceError::new(CanDeviceErrorKind::Unknown, "x").is_fatal());
        assert!(!CanDeviceError::new(CanDeviceErrorKind::InvalidFrame, "x").is_fatal());
    }

    #[test]
    fn test_device_error_from_str_is_unknown() {
        let err: CanDeviceError = "something went wrong".into();
        assert_eq!(err.kind, CanDeviceErrorKind::Unknown);
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_device_error_display() {
        let err = CanDeviceError::new(CanDeviceErrorKind::NotFound, "can0 missing");
        assert_eq!(format!("{}", err), "NotFound: can0 missing");
    }

    // 用最小的内存适配器验证 trait 的默认方法
    struct OneShotAdapter {
        frame: Option<BusFrame>,
    }

    impl CanAdapter for OneShotAdapter {
        fn send(&mut self, _frame: BusFrame) -> Result<(), CanError> {
            Ok(())
        }

        fn receive(&mut self) -> Result<BusFrame, CanError> {
            self.frame.take().ok_or(CanError::Timeout)
        }
    }

    #[test]
    fn test_try_receive_maps_timeout_to_none() {
        let mut adapter = OneShotAdapter {
            frame: Some(BusFrame::new_standard(0x123, &[1, 2, 3])),
        };

        let first = adapter.try_receive().unwrap();
        assert_eq!(first.map(|f| f.id), Some(0x123));

        // 队列空了之后 Timeout 应被吸收为 None
        assert!(adapter.try_receive().unwrap().is_none());
    }
}
