//! 舵机总线：写批次缓存与批量读写事务
//!
//! 一个 [`ServoBus`] 独占一条物理总线和其上全部舵机的反馈状态。
//! 写路径：`queue_target` 逐条入批，`flush` 把整批交给一次同步写
//! 事务；读路径：`read_positions` 用一次同步读事务轮询一组舵机，
//! 应答者送入多圈跟踪器并标记在线，未应答者本周期标记离线。

use crate::tracker::MultiTurnTracker;
use crate::ServoError;
use manus_protocol::{BUS_CAPACITY, MAX_SERVO_ID, SERVO_ABS_MAX, SERVO_ABS_MIN};
use smallvec::SmallVec;
use std::time::{Duration, Instant};
use tracing::trace;

/// 一条写批次里的单条目标命令
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TargetCommand {
    pub id: u8,
    /// 多圈目标位置，已钳制到行程范围（±30719，单位：原始计数）
    pub position: i16,
    pub speed: u16,
    pub accel: u8,
}

/// 外部舵机协议库的传输契约
///
/// 本层只消费两种事务，不关心线上编码：
/// - 批量写：一次事务下发整个批次，保持入批顺序
/// - 批量读：一次事务轮询一组 ID，超时内未应答的 ID 不出现在结果里
pub trait ServoPort {
    fn sync_write(&mut self, batch: &[TargetCommand]) -> Result<(), ServoError>;

    fn sync_read(
        &mut self,
        ids: &[u8],
        timeout: Duration,
    ) -> Result<SmallVec<[(u8, u16); BUS_CAPACITY]>, ServoError>;
}

/// 单个舵机的反馈状态
///
/// `online` 只反映最近一次读事务的结果，不跨周期粘滞。
#[derive(Debug, Clone, Copy, Default)]
pub struct ServoFeedback {
    pub tracker: MultiTurnTracker,
    pub online: bool,
    pub last_update: Option<Instant>,
}

/// 舵机总线管理器
pub struct ServoBus<P: ServoPort> {
    index: usize,
    port: P,
    batch: SmallVec<[TargetCommand; BUS_CAPACITY]>,
    feedback: [ServoFeedback; MAX_SERVO_ID as usize + 1],
    read_timeout: Duration,
}

impl<P: ServoPort> ServoBus<P> {
    /// 创建总线管理器，反馈表全部处于未初始化/离线状态
    pub fn new(index: usize, port: P, read_timeout: Duration) -> Self {
        Self {
            index,
            port,
            batch: SmallVec::new(),
            feedback: [ServoFeedback::default(); MAX_SERVO_ID as usize + 1],
            read_timeout,
        }
    }

    /// 把一条目标位置加入写批次
    ///
    /// 位置钳制到行程范围后入批。批次已满时本条请求被静默丢弃。
    pub fn queue_target(&mut self, id: u8, position: i32, speed: u16, accel: u8) {
        if self.batch.len() >= BUS_CAPACITY {
            trace!(
                "Bus {} write batch full, dropping target for servo {}",
                self.index, id
            );
            return;
        }

        let clamped = position.clamp(SERVO_ABS_MIN, SERVO_ABS_MAX) as i16;
        self.batch.push(TargetCommand {
            id,
            position: clamped,
            speed,
            accel,
        });
    }

    /// 把当前批次作为一次同步写事务发出
    ///
    /// 无论事务成败，批次都被清空；空批次不产生事务。
    pub fn flush(&mut self) -> Result<(), ServoError> {
        if self.batch.is_empty() {
            return Ok(());
        }

        let result = self.port.sync_write(&self.batch);
        self.batch.clear();
        result
    }

    /// 用一次同步读事务轮询一组舵机，返回成功读到的数量
    ///
    /// 应答者的原始读数送入多圈跟踪器，标记在线并更新时间戳；
    /// 未应答者本周期标记离线，不重试。整个事务失败时全部标记
    /// 离线并把错误交给调用方。
    pub fn read_positions(&mut self, ids: &[u8]) -> Result<usize, ServoError> {
        if ids.is_empty() {
            return Ok(0);
        }

        let replies = match self.port.sync_read(ids, self.read_timeout) {
            Ok(replies) => replies,
            Err(e) => {
                for &id in ids {
                    if let Some(fb) = self.feedback.get_mut(id as usize) {
                        fb.online = false;
                    }
                }
                return Err(e);
            },
        };

        let now = Instant::now();
        let mut success = 0;
        for &id in ids {
            if id > MAX_SERVO_ID {
                continue;
            }
            let fb = &mut self.feedback[id as usize];
            match replies.iter().find(|(reply_id, _)| *reply_id == id) {
                Some(&(_, raw)) => {
                    fb.tracker.update(raw);
                    fb.online = true;
                    fb.last_update = Some(now);
                    success += 1;
                },
                None => {
                    fb.online = false;
                },
            }
        }
        Ok(success)
    }

    /// 重置某个舵机的多圈计数（当前位置设为零点），不影响其他舵机
    pub fn reset_turn_counter(&mut self, id: u8) {
        if let Some(fb) = self.feedback.get_mut(id as usize) {
            fb.tracker.reset();
        }
    }

    /// 多圈绝对位置；ID 越界时返回 `None`
    pub fn absolute_position(&self, id: u8) -> Option<i32> {
        self.feedback.get(id as usize).map(|fb| fb.tracker.absolute())
    }

    /// 单圈原始位置；ID 越界时返回 `None`
    pub fn raw_position(&self, id: u8) -> Option<u16> {
        self.feedback.get(id as usize).map(|fb| fb.tracker.raw())
    }

    pub fn is_online(&self, id: u8) -> bool {
        self.feedback.get(id as usize).map(|fb| fb.online).unwrap_or(false)
    }

    pub fn feedback(&self, id: u8) -> Option<&ServoFeedback> {
        self.feedback.get(id as usize)
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// 当前批次中待发送的条数
    pub fn pending_writes(&self) -> usize {
        self.batch.len()
    }

    pub fn port(&self) -> &P {
        &self.port
    }

    pub fn port_mut(&mut self) -> &mut P {
        &mut self.port
    }
}
