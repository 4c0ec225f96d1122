//! 上位机串口协议
//!
//! 上行数据包格式：`[0xFE][LEN][TYPE][PAYLOAD...][0xFF]`，
//! 其中 `LEN` = TYPE + PAYLOAD + 帧尾的字节数。
//!
//! 下行为无包头的触发字节流：`'c'`/0xCA 触发校准；`'b'`/0xCB 后跟
//! 每个关节一个小端 f32 的目标角度载荷，收满整包才生效。

use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::JOINT_COUNT;

/// 上行包帧头
pub const HOST_HEADER: u8 = 0xFE;

/// 上行包帧尾
pub const HOST_TAIL: u8 = 0xFF;

/// 上行包类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum HostPacketType {
    /// 传感器快照：每个关节一个大端 u16 原始读数
    Sensor = 0x01,
    /// 校准状态反馈：一个状态字节
    CalibAck = 0x02,
}

/// 校准状态字节（与上位机约定一致）
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum CalibStatus {
    Idle = 0,
    Pending = 1,
    Success = 2,
    Failed = 3,
}

/// 传感器快照包的总长度
pub const SENSOR_PACKET_LEN: usize = 4 + 2 * JOINT_COUNT;

/// 校准反馈包的总长度
pub const CALIB_ACK_PACKET_LEN: usize = 5;

/// 编码传感器快照包
pub fn encode_sensor_packet(values: &[u16; JOINT_COUNT]) -> [u8; SENSOR_PACKET_LEN] {
    let mut buf = [0u8; SENSOR_PACKET_LEN];
    let mut idx = 0;

    buf[idx] = HOST_HEADER;
    idx += 1;
    idx += 1; // LEN 占位，帧尾写入后回填
    buf[idx] = HostPacketType::Sensor.into();
    idx += 1;
    for v in values {
        buf[idx..idx + 2].copy_from_slice(&v.to_be_bytes());
        idx += 2;
    }
    buf[idx] = HOST_TAIL;
    idx += 1;

    // LEN = TYPE + PAYLOAD + TAIL，即总长去掉帧头和 LEN 本身
    buf[1] = (idx - 2) as u8;
    buf
}

/// 编码校准状态反馈包
pub fn encode_calib_ack(status: CalibStatus) -> [u8; CALIB_ACK_PACKET_LEN] {
    [
        HOST_HEADER,
        3,
        HostPacketType::CalibAck.into(),
        status.into(),
        HOST_TAIL,
    ]
}

/// 下行触发字节：校准
pub const CMD_CALIBRATE: u8 = 0xCA;

/// 下行触发字节：设置目标角度（后跟载荷）
pub const CMD_SET_TARGETS: u8 = 0xCB;

/// 目标角度载荷长度：每个关节一个小端 f32
pub const TARGET_PAYLOAD_LEN: usize = 4 * JOINT_COUNT;

/// 解析完成的下行命令
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum HostCommand {
    /// 触发编码器零位校准
    Calibrate,
    /// 整包目标角度（度）
    SetTargets([f32; JOINT_COUNT]),
}

enum ParseState {
    Idle,
    Targets {
        buf: [u8; TARGET_PAYLOAD_LEN],
        filled: usize,
    },
}

/// 下行字节流的增量解析器
///
/// 无包头协议，逐字节推进。目标角度载荷收满才产出命令，
/// 上层负责在链路静默超时后调用 [`reset`](Self::reset) 丢弃半包。
pub struct HostCommandParser {
    state: ParseState,
}

impl HostCommandParser {
    pub fn new() -> Self {
        Self {
            state: ParseState::Idle,
        }
    }

    /// 喂入一个字节，完整命令解析完成时返回
    pub fn feed(&mut self, byte: u8) -> Option<HostCommand> {
        match &mut self.state {
            ParseState::Idle => match byte {
                CMD_CALIBRATE | b'c' => Some(HostCommand::Calibrate),
                CMD_SET_TARGETS | b'b' => {
                    self.state = ParseState::Targets {
                        buf: [0u8; TARGET_PAYLOAD_LEN],
                        filled: 0,
                    };
                    None
                }
                // 其余字节静默忽略
                _ => None,
            },
            ParseState::Targets { buf, filled } => {
                buf[*filled] = byte;
                *filled += 1;
                if *filled < TARGET_PAYLOAD_LEN {
                    return None;
                }

                let mut targets = [0.0f32; JOINT_COUNT];
                for (i, t) in targets.iter_mut().enumerate() {
                    let off = 4 * i;
                    *t = f32::from_le_bytes([
                        buf[off],
                        buf[off + 1],
                        buf[off + 2],
                        buf[off + 3],
                    ]);
                }
                self.state = ParseState::Idle;
                Some(HostCommand::SetTargets(targets))
            }
        }
    }

    /// 是否有半包载荷在途
    pub fn in_progress(&self) -> bool {
        !matches!(self.state, ParseState::Idle)
    }

    /// 丢弃在途状态，回到空闲
    pub fn reset(&mut self) {
        self.state = ParseState::Idle;
    }
}

impl Default for HostCommandParser {
    fn default() -> Self {
        Self::new()
    }
}
