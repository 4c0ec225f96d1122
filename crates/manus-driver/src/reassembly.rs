//! 编码器帧组重组与传感器网络 IO 循环
//!
//! 编码器读数以 6 帧一组广播，每帧只覆盖快照数组中自己的切片。
//! [`FrameReassembler`] 把这些切片累积在一份工作副本里，收到组尾帧时
//! 打时间戳并把整份快照原子发布出去（单槽覆盖，latest-wins）。
//! 丢帧不重传：某帧缺席时，对应切片保持上一代的值，直到下次被覆盖。
//!
//! [`sensor_io_loop`] 是拥有 CAN 适配器的那条线程：带超时地收帧喂给
//! 重组器，同时把命令队列里的板卡命令发出去。致命的适配器错误会清除
//! 运行标志，让整块板卡停下来。

use crate::state::{BoardContext, BoardMetrics, COMMAND_QUEUE_CAPACITY};
use manus_can::{CanAdapter, CanError};
use manus_protocol::{
    BusFrame, CalibAck, EncoderFrame, ErrorStatusFrame, ID_CALIB_ACK, ID_ENCODER_BASE,
    ID_ENCODER_LAST, ID_ERROR_STATUS, sensor_value_is_error,
};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tracing::{error, info, trace, warn};

/// 编码器帧组重组器
///
/// 持有快照的工作副本。每帧只写自己的切片；组尾帧触发整体发布。
/// 错误状态帧独立于发布更新位图和单体标志，后写覆盖先写。
pub struct FrameReassembler {
    pending: crate::state::SensorSnapshot,
    /// 本代已收到的帧位掩码，仅用于调试日志
    fresh_mask: u8,
}

impl FrameReassembler {
    pub fn new() -> Self {
        Self {
            pending: crate::state::SensorSnapshot::default(),
            fresh_mask: 0,
        }
    }

    /// 处理一帧广播
    pub fn handle_frame(&mut self, frame: &BusFrame, ctx: &BoardContext, metrics: &BoardMetrics) {
        match frame.id {
            id if (ID_ENCODER_BASE..=ID_ENCODER_LAST).contains(&id) => {
                match EncoderFrame::try_from(*frame) {
                    Ok(enc) => self.apply_encoder_frame(&enc, ctx, metrics),
                    Err(e) => {
                        warn!("Dropping malformed encoder frame 0x{:03X}: {}", frame.id, e);
                    }
                }
            }

            ID_ERROR_STATUS => match ErrorStatusFrame::try_from(*frame) {
                Ok(status) => {
                    self.pending.error_bitmap = status.bitmap;
                    for (i, &flag) in status.joint_flags().iter().enumerate() {
                        self.pending.joint_flags[i] = flag;
                    }
                    trace!("Error status updated: bitmap=0x{:08X}", status.bitmap);
                }
                Err(e) => warn!("Dropping malformed error status frame: {}", e),
            },

            ID_CALIB_ACK => match CalibAck::try_from(*frame) {
                Ok(ack) => {
                    info!("Calibration ack received: {:?}", ack.status);
                    ctx.set_calib_status(ack.status);
                }
                Err(e) => warn!("Dropping malformed calibration ack: {}", e),
            },

            id => trace!("Ignoring unrecognized frame 0x{:03X}", id),
        }
    }

    fn apply_encoder_frame(
        &mut self,
        enc: &EncoderFrame,
        ctx: &BoardContext,
        metrics: &BoardMetrics,
    ) {
        let start = enc.slice_start();
        for (offset, &value) in enc.values[..enc.count].iter().enumerate() {
            self.pending.values[start + offset] = value;
            // 哨兵读数只标记单个关节，不阻止整组发布
            self.pending.value_errors[start + offset] = sensor_value_is_error(value);
        }
        self.fresh_mask |= 1 << enc.index;

        if enc.is_last() {
            self.pending.timestamp_us = ctx.monotonic_us();
            self.pending.valid = true;
            ctx.snapshot.store(Arc::new(self.pending));
            metrics.snapshots_published.fetch_add(1, Ordering::Relaxed);
            trace!("Sensor snapshot committed: fresh_mask={:06b}", self.fresh_mask);
            self.fresh_mask = 0;
        }
    }
}

impl Default for FrameReassembler {
    fn default() -> Self {
        Self::new()
    }
}

/// 判定适配器错误是否致命（继续循环已无意义）
fn is_fatal_adapter_error(error: &CanError) -> bool {
    match error {
        CanError::Device(device) => device.is_fatal(),
        CanError::BufferOverflow | CanError::BusOff => true,
        _ => false,
    }
}

/// 清空一轮命令队列
///
/// 每轮最多发送队列容量条命令，发送失败的命令直接丢弃（尽力而为）。
/// 返回 true 表示遇到致命发送错误，调用方应当退出。
fn drain_command_queue(
    can: &mut impl CanAdapter,
    ctx: &BoardContext,
    metrics: &BoardMetrics,
) -> bool {
    for _ in 0..COMMAND_QUEUE_CAPACITY {
        let frame = match ctx.command_receiver().try_recv() {
            Ok(frame) => frame,
            // 空和断开都表示本轮无事可做
            Err(_) => break,
        };

        if let Err(e) = can.send(frame) {
            metrics.commands_dropped.fetch_add(1, Ordering::Relaxed);
            if is_fatal_adapter_error(&e) {
                error!("Fatal error sending board command, shutting down: {}", e);
                ctx.stop();
                return true;
            }
            warn!("Failed to send board command (dropped): {}", e);
        }
    }
    false
}

/// 传感器网络 IO 主循环
///
/// 单线程独占适配器：交替执行命令队列外发和带超时的接收。
/// `receive_timeout` 决定了运行标志检查的最大延迟，参考值 1ms。
pub fn sensor_io_loop(
    mut can: impl CanAdapter,
    ctx: Arc<BoardContext>,
    metrics: Arc<BoardMetrics>,
    receive_timeout: Duration,
) {
    can.set_receive_timeout(receive_timeout);
    let mut reassembler = FrameReassembler::new();

    loop {
        if !ctx.is_running() {
            trace!("Sensor IO: run flag cleared, exiting");
            break;
        }

        // ============================================================
        // 1. 外发：把主机链路排进来的板卡命令发到总线上
        // ============================================================
        if drain_command_queue(&mut can, &ctx, &metrics) {
            break;
        }

        // ============================================================
        // 2. 接收：一帧或超时，喂给重组器
        // ============================================================
        match can.receive() {
            Ok(frame) => reassembler.handle_frame(&frame, &ctx, &metrics),
            Err(CanError::Timeout) => {
                // 本轮无帧，回到循环头重查运行标志
            }
            Err(e) => {
                if is_fatal_adapter_error(&e) {
                    error!("Sensor IO: fatal adapter error, shutting down: {}", e);
                    ctx.stop();
                    break;
                }
                warn!("Sensor IO: receive error (will retry): {}", e);
            }
        }
    }

    trace!("Sensor IO: loop exited");
}
