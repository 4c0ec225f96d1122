//! 传感器广播帧的解析与构建
//!
//! 编码器数据以帧组形式广播：ID `0x100..=0x105`，每帧最多 4 个
//! 大端 16 位读数，第 `i` 帧只覆盖快照数组的 `[i*4, i*4+4)` 切片。
//! 最后一帧（0x105）只带 1 个读数，收到它即视为一组完整。

use crate::host::CalibStatus;
use crate::ids::*;
use crate::{BusFrame, JOINT_COUNT, ProtocolError};

/// 单帧最多携带的读数个数
pub const VALUES_PER_FRAME: usize = 4;

/// 第 `index` 帧携带的读数个数（最后一帧可不满）
pub const fn encoder_frame_values(index: usize) -> usize {
    if index + 1 == ENCODER_FRAME_COUNT {
        JOINT_COUNT - VALUES_PER_FRAME * (ENCODER_FRAME_COUNT - 1)
    } else {
        VALUES_PER_FRAME
    }
}

/// 编码器帧组中的一帧
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncoderFrame {
    /// 帧组内序号（0 起）
    pub index: usize,
    /// 本帧携带的读数，前 `count` 个有效
    pub values: [u16; VALUES_PER_FRAME],
    /// 有效读数个数
    pub count: usize,
}

impl EncoderFrame {
    /// 本帧在快照数组中的起始下标
    pub fn slice_start(&self) -> usize {
        self.index * VALUES_PER_FRAME
    }

    /// 是否为帧组最后一帧（发布触发帧）
    pub fn is_last(&self) -> bool {
        self.index + 1 == ENCODER_FRAME_COUNT
    }

    /// 构建一帧（供发送端/仿真使用）
    ///
    /// `values` 长度必须与该序号应携带的读数个数一致。
    pub fn encode(index: usize, values: &[u16]) -> Result<BusFrame, ProtocolError> {
        if index >= ENCODER_FRAME_COUNT {
            return Err(ProtocolError::InvalidFrameId {
                id: ID_ENCODER_BASE + index as u32,
            });
        }
        let expected = encoder_frame_values(index);
        if values.len() != expected {
            return Err(ProtocolError::InvalidLength {
                expected: expected * 2,
                actual: values.len() * 2,
            });
        }

        let mut data = [0u8; 8];
        for (i, v) in values.iter().enumerate() {
            data[2 * i..2 * i + 2].copy_from_slice(&v.to_be_bytes());
        }
        Ok(BusFrame::new_standard(
            (ID_ENCODER_BASE + index as u32) as u16,
            &data[..expected * 2],
        ))
    }
}

impl TryFrom<BusFrame> for EncoderFrame {
    type Error = ProtocolError;

    fn try_from(frame: BusFrame) -> Result<Self, Self::Error> {
        if !(ID_ENCODER_BASE..=ID_ENCODER_LAST).contains(&frame.id) {
            return Err(ProtocolError::InvalidFrameId { id: frame.id });
        }

        let index = (frame.id - ID_ENCODER_BASE) as usize;
        let count = encoder_frame_values(index);
        let expected = count * 2;
        if (frame.len as usize) < expected {
            return Err(ProtocolError::InvalidLength {
                expected,
                actual: frame.len as usize,
            });
        }

        let mut values = [0u16; VALUES_PER_FRAME];
        for (i, v) in values.iter_mut().enumerate().take(count) {
            *v = u16::from_be_bytes([frame.data[2 * i], frame.data[2 * i + 1]]);
        }

        Ok(Self {
            index,
            values,
            count,
        })
    }
}

/// 错误状态帧 (0x1F0)
///
/// 字节 0-3 为小端 32 位全局错误位图，其后为若干单体错误字节，
/// 依次对应关节 0 起的前几个关节（一帧放不下全部关节，够用即可）。
/// 该帧独立于快照发布，后写覆盖先写。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorStatusFrame {
    /// 全局错误位图，bit i 对应关节 i
    pub bitmap: u32,
    /// 随帧携带的单体错误字节
    flags: [u8; 4],
    flag_count: usize,
}

impl ErrorStatusFrame {
    /// 随帧携带的单体错误字节（从关节 0 起）
    pub fn joint_flags(&self) -> &[u8] {
        &self.flags[..self.flag_count]
    }

    /// 构建错误状态帧（供发送端/仿真使用），最多 4 个单体错误字节
    pub fn encode(bitmap: u32, joint_flags: &[u8]) -> BusFrame {
        let mut data = [0u8; 8];
        data[..4].copy_from_slice(&bitmap.to_le_bytes());
        let n = joint_flags.len().min(4);
        data[4..4 + n].copy_from_slice(&joint_flags[..n]);
        BusFrame::new_standard(ID_ERROR_STATUS as u16, &data[..4 + n])
    }
}

impl TryFrom<BusFrame> for ErrorStatusFrame {
    type Error = ProtocolError;

    fn try_from(frame: BusFrame) -> Result<Self, Self::Error> {
        if frame.id != ID_ERROR_STATUS {
            return Err(ProtocolError::InvalidFrameId { id: frame.id });
        }
        if frame.len < 4 {
            return Err(ProtocolError::InvalidLength {
                expected: 4,
                actual: frame.len as usize,
            });
        }

        let bitmap = u32::from_le_bytes([frame.data[0], frame.data[1], frame.data[2], frame.data[3]]);
        let flag_count = frame.len as usize - 4;
        let mut flags = [0u8; 4];
        flags[..flag_count].copy_from_slice(&frame.data[4..4 + flag_count]);

        Ok(Self {
            bitmap,
            flags,
            flag_count,
        })
    }
}

/// 校准完成应答帧 (0x1F1)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CalibAck {
    pub status: CalibStatus,
}

impl CalibAck {
    pub fn to_frame(self) -> BusFrame {
        BusFrame::new_standard(ID_CALIB_ACK as u16, &[self.status.into()])
    }
}

impl TryFrom<BusFrame> for CalibAck {
    type Error = ProtocolError;

    fn try_from(frame: BusFrame) -> Result<Self, Self::Error> {
        if frame.id != ID_CALIB_ACK {
            return Err(ProtocolError::InvalidFrameId { id: frame.id });
        }
        if frame.len < 1 {
            return Err(ProtocolError::InvalidLength {
                expected: 1,
                actual: 0,
            });
        }

        let status =
            CalibStatus::try_from(frame.data[0]).map_err(|_| ProtocolError::InvalidValue {
                field: "CalibStatus".to_string(),
                value: frame.data[0],
            })?;
        Ok(Self { status })
    }
}

/// 构建发往传感器板的校准请求帧 (0x200, 载荷 0xCA)
pub fn calibration_request() -> BusFrame {
    BusFrame::new_standard(ID_BOARD_COMMAND as u16, &[CALIBRATE_OPCODE])
}
