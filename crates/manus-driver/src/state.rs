//! 跨任务共享状态
//!
//! 三条周期任务（传感器 IO、主机链路、控制循环）之间的全部共享数据
//! 集中在 [`BoardContext`] 中，每个字段用与其访问模式匹配的原语保护：
//!
//! - 传感器快照：`ArcSwap` 单槽覆盖，写侧整体发布，读侧无锁 load，
//!   消费者可以反复读到同一份旧快照（latest-wins，不排队）
//! - 目标角向量：`parking_lot::Mutex`，生产者只在拷贝期间持锁，
//!   消费者用有界等待拿锁，超时沿用上个周期的副本
//! - 外发命令队列：有界 crossbeam 通道，满则丢弃最新一条，绝不阻塞
//! - 运行标志 / 校准状态：原子量

use arc_swap::ArcSwap;
use crossbeam_channel::{Receiver, Sender, TrySendError};
use manus_protocol::{BusFrame, CalibStatus, JOINT_COUNT};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::time::Instant;

/// 外发命令队列容量（满则丢弃最新的入队请求）
pub const COMMAND_QUEUE_CAPACITY: usize = 5;

/// 一份完整的传感器快照
///
/// 由重组器整体发布：读者看到的要么全是上一代数据，要么全是新一代，
/// 绝不会混合。`Default` 即"无效"状态（全零、`valid = false`），
/// 控制循环在收到第一份完整帧组之前读到的就是它。
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SensorSnapshot {
    /// 每关节原始读数（0..SENSOR_UNITS_PER_REV，哨兵值见 value_errors）
    pub values: [u16; JOINT_COUNT],
    /// 每关节读数错误标志（原始值带哨兵位时置位，不阻止整体发布）
    pub value_errors: [bool; JOINT_COUNT],
    /// 全局错误位图（独立于发布更新，last-writer-wins）
    pub error_bitmap: u32,
    /// 每关节错误标志字节（同上）
    pub joint_flags: [u8; JOINT_COUNT],
    /// 板卡启动以来的单调微秒时间戳，发布时打
    pub timestamp_us: u64,
    /// 是否收到过完整帧组
    pub valid: bool,
}

/// 跨任务共享状态上下文
pub struct BoardContext {
    /// 已发布的传感器快照（单槽覆盖）
    pub snapshot: ArcSwap<SensorSnapshot>,
    /// 主机下发的目标角向量（度）
    pub targets: Mutex<[f32; JOINT_COUNT]>,
    /// 外发命令队列发送端（主机链路任务 → 传感器 IO 任务）
    command_tx: Sender<BusFrame>,
    /// 外发命令队列接收端
    command_rx: Receiver<BusFrame>,
    /// 校准状态字节（CalibStatus 编码）
    calib_status: AtomicU8,
    /// 运行标志，false 后所有任务在各自的下一个检查点退出
    running: AtomicBool,
    /// 单调时钟零点
    started_at: Instant,
}

impl BoardContext {
    pub fn new() -> Arc<Self> {
        let (command_tx, command_rx) = crossbeam_channel::bounded(COMMAND_QUEUE_CAPACITY);
        Arc::new(Self {
            snapshot: ArcSwap::from_pointee(SensorSnapshot::default()),
            targets: Mutex::new([0.0; JOINT_COUNT]),
            command_tx,
            command_rx,
            calib_status: AtomicU8::new(CalibStatus::Idle.into()),
            running: AtomicBool::new(true),
            started_at: Instant::now(),
        })
    }

    /// 非阻塞入队一条板卡命令帧
    ///
    /// 队列满时丢弃这条最新的请求并返回 false，绝不阻塞调用方。
    pub fn try_send_command(&self, frame: BusFrame) -> bool {
        match self.command_tx.try_send(frame) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => false,
        }
    }

    /// 命令队列接收端（仅传感器 IO 任务消费）
    pub fn command_receiver(&self) -> &Receiver<BusFrame> {
        &self.command_rx
    }

    /// 当前校准状态
    pub fn calib_status(&self) -> CalibStatus {
        CalibStatus::try_from(self.calib_status.load(Ordering::Relaxed))
            .unwrap_or(CalibStatus::Idle)
    }

    pub fn set_calib_status(&self, status: CalibStatus) {
        self.calib_status.store(status.into(), Ordering::Relaxed);
    }

    /// 仅当状态仍等于 `expected` 时清回 Idle
    ///
    /// 主机链路上报完一个状态后用它清除，期间到达的新状态不会被覆盖。
    pub fn clear_calib_status_if(&self, expected: CalibStatus) -> bool {
        self.calib_status
            .compare_exchange(
                expected.into(),
                CalibStatus::Idle.into(),
                Ordering::Relaxed,
                Ordering::Relaxed,
            )
            .is_ok()
    }

    pub fn is_running(&self) -> bool {
        // Acquire: 看到 false 时，设置方之前的全部写入均可见
        self.running.load(Ordering::Acquire)
    }

    /// 请求所有任务退出
    pub fn stop(&self) {
        // Release: 此前的全部写入对看到 false 的线程可见
        self.running.store(false, Ordering::Release);
    }

    /// 板卡启动以来的单调微秒数
    pub fn monotonic_us(&self) -> u64 {
        self.started_at.elapsed().as_micros() as u64
    }
}

/// 性能指标（原子计数器，热路径只做 Relaxed fetch_add）
#[derive(Debug, Default)]
pub struct BoardMetrics {
    /// 控制循环完成的周期数
    pub cycles: AtomicU64,
    /// 控制循环错过的周期边界数
    pub deadline_misses: AtomicU64,
    /// 舵机总线批量读失败次数（整条总线级别）
    pub servo_read_failures: AtomicU64,
    /// 已发布的完整快照数
    pub snapshots_published: AtomicU64,
    /// 因队列满被丢弃的命令数
    pub commands_dropped: AtomicU64,
    /// 已发送的上行主机包数
    pub host_packets_sent: AtomicU64,
    /// 已解析完成的主机命令数
    pub host_commands: AtomicU64,
    /// 快照过期而按保持模式运行的周期数
    pub stale_cycles: AtomicU64,
}

impl BoardMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// 一致性要求不高的读取快照（各计数独立 Relaxed load）
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            cycles: self.cycles.load(Ordering::Relaxed),
            deadline_misses: self.deadline_misses.load(Ordering::Relaxed),
            servo_read_failures: self.servo_read_failures.load(Ordering::Relaxed),
            snapshots_published: self.snapshots_published.load(Ordering::Relaxed),
            commands_dropped: self.commands_dropped.load(Ordering::Relaxed),
            host_packets_sent: self.host_packets_sent.load(Ordering::Relaxed),
            host_commands: self.host_commands.load(Ordering::Relaxed),
            stale_cycles: self.stale_cycles.load(Ordering::Relaxed),
        }
    }
}

/// 某一时刻的指标读数
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub cycles: u64,
    pub deadline_misses: u64,
    pub servo_read_failures: u64,
    pub snapshots_published: u64,
    pub commands_dropped: u64,
    pub host_packets_sent: u64,
    pub host_commands: u64,
    pub stale_cycles: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 默认快照必须是无效的全零状态
    #[test]
    fn test_default_snapshot_is_invalid() {
        let snapshot = SensorSnapshot::default();
        assert!(!snapshot.valid);
        assert_eq!(snapshot.timestamp_us, 0);
        assert_eq!(snapshot.values, [0u16; JOINT_COUNT]);
        assert_eq!(snapshot.value_errors, [false; JOINT_COUNT]);
    }

    /// 队列满时 try_send_command 丢弃最新的一条并返回 false
    #[test]
    fn test_command_queue_drops_newest_when_full() {
        let ctx = BoardContext::new();
        for i in 0..COMMAND_QUEUE_CAPACITY {
            let frame = BusFrame::new_standard(0x200, &[i as u8]);
            assert!(ctx.try_send_command(frame), "enqueue {} should succeed", i);
        }
        let overflow = BusFrame::new_standard(0x200, &[0xEE]);
        assert!(!ctx.try_send_command(overflow));

        // 消费端收到的是最早的 5 条，溢出那条不存在
        let rx = ctx.command_receiver();
        for i in 0..COMMAND_QUEUE_CAPACITY {
            let frame = rx.try_recv().unwrap();
            assert_eq!(frame.data_slice(), &[i as u8]);
        }
        assert!(rx.try_recv().is_err());
    }

    /// 运行标志的停止语义
    #[test]
    fn test_stop_clears_running() {
        let ctx = BoardContext::new();
        assert!(ctx.is_running());
        ctx.stop();
        assert!(!ctx.is_running());
    }

    /// 校准状态的原子读写与非法字节回退
    #[test]
    fn test_calib_status_round_trip() {
        let ctx = BoardContext::new();
        assert_eq!(ctx.calib_status(), CalibStatus::Idle);
        ctx.set_calib_status(CalibStatus::Pending);
        assert_eq!(ctx.calib_status(), CalibStatus::Pending);
        ctx.set_calib_status(CalibStatus::Success);
        assert_eq!(ctx.calib_status(), CalibStatus::Success);
    }

    /// 条件清除不覆盖期间写入的新状态
    #[test]
    fn test_clear_calib_status_if_preserves_newer_write() {
        let ctx = BoardContext::new();
        ctx.set_calib_status(CalibStatus::Pending);
        assert!(ctx.clear_calib_status_if(CalibStatus::Pending));
        assert_eq!(ctx.calib_status(), CalibStatus::Idle);

        // 清除方仍以为是 Pending，但应答已把状态推到 Success
        ctx.set_calib_status(CalibStatus::Success);
        assert!(!ctx.clear_calib_status_if(CalibStatus::Pending));
        assert_eq!(ctx.calib_status(), CalibStatus::Success);
    }

    /// 单调时间戳不回退
    #[test]
    fn test_monotonic_us_is_nondecreasing() {
        let ctx = BoardContext::new();
        let a = ctx.monotonic_us();
        let b = ctx.monotonic_us();
        assert!(b >= a);
    }

    /// 指标快照反映 fetch_add 的累积
    #[test]
    fn test_metrics_snapshot() {
        let metrics = BoardMetrics::new();
        metrics.cycles.fetch_add(3, Ordering::Relaxed);
        metrics.commands_dropped.fetch_add(1, Ordering::Relaxed);
        let snap = metrics.snapshot();
        assert_eq!(snap.cycles, 3);
        assert_eq!(snap.commands_dropped, 1);
        assert_eq!(snap.deadline_misses, 0);
    }
}
