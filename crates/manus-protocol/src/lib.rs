//! # Manus Protocol
//!
//! manus 舵机板的线上格式定义（无硬件依赖）
//!
//! ## 模块
//!
//! - `ids`: 传感器广播网络的帧 ID 常量
//! - `sensor`: 磁编码器广播帧、错误状态帧、校准帧的解析与构建
//! - `host`: 上位机串口协议（`[0xFE][LEN][TYPE][PAYLOAD][0xFF]`）
//!
//! ## 字节序
//!
//! 广播网络与上位机链路的 16 位数值均为高位在前（大端字节序）；
//! 仅错误状态帧的 32 位位图为小端（与发送端固件一致）。

pub mod host;
pub mod ids;
pub mod sensor;

pub use host::*;
pub use ids::*;
pub use sensor::*;

use thiserror::Error;

/// 关节总数（板卡驱动的自由度数量）
pub const JOINT_COUNT: usize = 21;

/// 舵机总线条数
pub const BUS_COUNT: usize = 4;

/// 单条总线一次批量事务的最大舵机数
pub const BUS_CAPACITY: usize = 8;

/// 支持的最大舵机 ID
pub const MAX_SERVO_ID: u8 = 32;

/// 舵机单圈计数（每圈 4096 步）
pub const SERVO_UNITS_PER_REV: i32 = 4096;

/// 半圈计数，跨圈判定阈值
pub const SERVO_HALF_REV: i32 = SERVO_UNITS_PER_REV / 2;

/// 多圈绝对位置下限
pub const SERVO_ABS_MIN: i32 = -30719;

/// 多圈绝对位置上限
pub const SERVO_ABS_MAX: i32 = 30719;

/// 磁编码器单圈计数（原始值 0..16383）
pub const SENSOR_UNITS_PER_REV: u16 = 16384;

/// 磁编码器错误哨兵掩码：符号位置位（含 0xFFFF）即为无效读数
pub const SENSOR_ERROR_MASK: u16 = 0x8000;

/// 广播网络帧的统一抽象
///
/// 协议层与适配层之间的中间类型：协议层通过 `TryFrom<BusFrame>` 解析、
/// 通过构建函数生成，适配层负责与具体后端（SocketCAN 等）互转。
/// `Copy` 且固定 8 字节，高频场景下无堆分配。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BusFrame {
    /// 帧 ID（标准帧，11-bit）
    pub id: u32,

    /// 帧数据（固定 8 字节，未使用部分为 0）
    pub data: [u8; 8],

    /// 有效数据长度 (0-8)
    pub len: u8,
}

impl BusFrame {
    /// 创建标准帧
    pub fn new_standard(id: u16, data: &[u8]) -> Self {
        let mut fixed_data = [0u8; 8];
        let len = data.len().min(8);
        fixed_data[..len].copy_from_slice(&data[..len]);

        Self {
            id: id as u32,
            data: fixed_data,
            len: len as u8,
        }
    }

    /// 获取数据切片（只包含有效数据）
    pub fn data_slice(&self) -> &[u8] {
        &self.data[..self.len as usize]
    }
}

/// 协议解析错误类型
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Invalid frame length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },

    #[error("Invalid frame ID: 0x{id:X}")]
    InvalidFrameId { id: u32 },

    #[error("Invalid value for field {field}: {value}")]
    InvalidValue { field: String, value: u8 },
}

/// 舵机多圈计数转角度（每圈 4096 步 = 360°）
pub fn servo_units_to_deg(units: i32) -> f32 {
    units as f32 * 360.0 / SERVO_UNITS_PER_REV as f32
}

/// 磁编码器原始值转角度（0..16383 -> 0..360°）
pub fn sensor_raw_to_deg(raw: u16) -> f32 {
    raw as f32 * 360.0 / SENSOR_UNITS_PER_REV as f32
}

/// 判断磁编码器读数是否为错误哨兵值
pub fn sensor_value_is_error(raw: u16) -> bool {
    raw & SENSOR_ERROR_MASK != 0
}
