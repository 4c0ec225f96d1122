//! 广播网络帧 ID 定义（与传感器板发送端一致）

use crate::JOINT_COUNT;

/// 编码器数据帧组的起始 ID
pub const ID_ENCODER_BASE: u32 = 0x100;

/// 编码器帧组的帧数：每帧 4 个读数，最后一帧可不满
pub const ENCODER_FRAME_COUNT: usize = (JOINT_COUNT + 3) / 4;

/// 编码器帧组的最后一个 ID，收到即发布快照
pub const ID_ENCODER_LAST: u32 = ID_ENCODER_BASE + ENCODER_FRAME_COUNT as u32 - 1;

/// 错误状态帧：小端 32 位位图 + 若干单体错误字节
pub const ID_ERROR_STATUS: u32 = 0x1F0;

/// 校准完成应答帧：data[0] 为状态字节
pub const ID_CALIB_ACK: u32 = 0x1F1;

/// 板卡发往传感器板的命令帧
pub const ID_BOARD_COMMAND: u32 = 0x200;

/// 命令帧载荷：触发编码器零位校准
pub const CALIBRATE_OPCODE: u8 = 0xCA;
