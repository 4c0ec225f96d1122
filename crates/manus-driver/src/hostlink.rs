//! 主机链路任务
//!
//! 固定 5ms 周期服务上位机串行链路：下行方向逐字节解析命令
//! （校准触发、整包目标角度），上行方向发送校准反馈包或最新的
//! 传感器快照包。链路是尽力而为的：写失败只丢包记日志，
//! 解析半途的载荷在超时或链路中断后整体丢弃，绝不部分生效。

use crate::state::{BoardContext, BoardMetrics};
use manus_protocol::{
    CalibStatus, HostCommand, HostCommandParser, calibration_request, encode_calib_ack,
    encode_sensor_packet,
};
use std::io;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

/// 每个周期最多执行的读取次数（防止洪泛挤占周期）
const MAX_READS_PER_TICK: usize = 4;

/// 主机链路端口抽象
///
/// 由外层提供具体实现（TCP、串口等）。两个方法都必须在短时间内返回：
/// `read_some` 在内部短超时内没有数据时返回 `Ok(0)`，`write_all`
/// 把整包写完或报错。
pub trait HostPort {
    fn read_some(&mut self, buf: &mut [u8]) -> io::Result<usize>;
    fn write_all(&mut self, buf: &[u8]) -> io::Result<()>;
}

/// 主机链路任务的时序参数
#[derive(Debug, Clone, Copy)]
pub struct HostLinkSettings {
    /// 服务周期
    pub period: Duration,
    /// 目标角互斥锁的有界等待
    pub target_wait: Duration,
    /// 半包载荷的丢弃超时
    pub payload_timeout: Duration,
}

impl Default for HostLinkSettings {
    fn default() -> Self {
        Self {
            period: Duration::from_millis(5),
            target_wait: Duration::from_millis(10),
            payload_timeout: Duration::from_millis(250),
        }
    }
}

/// 链路任务的周期间状态
struct LinkState {
    parser: HostCommandParser,
    /// 半包载荷的起始时刻（用于超时丢弃）
    payload_started: Option<Instant>,
    /// 最近一次上报的快照时间戳，只上报新时间戳的快照
    last_sent_timestamp: Option<u64>,
    /// 链路健康标志，只在状态翻转时打 warn 防止刷屏
    link_healthy: bool,
}

impl LinkState {
    fn new() -> Self {
        Self {
            parser: HostCommandParser::new(),
            payload_started: None,
            last_sent_timestamp: None,
            link_healthy: true,
        }
    }
}

/// 服务链路一个周期：先收后发
fn service_host_link(
    port: &mut impl HostPort,
    ctx: &BoardContext,
    metrics: &BoardMetrics,
    settings: &HostLinkSettings,
    state: &mut LinkState,
) {
    // ============================================================
    // 1. 下行：读入可用字节并逐个喂给解析器
    // ============================================================
    let mut buf = [0u8; 256];
    for _ in 0..MAX_READS_PER_TICK {
        match port.read_some(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                if !state.link_healthy {
                    info!("Host link recovered");
                    state.link_healthy = true;
                }
                for &byte in &buf[..n] {
                    let was_idle = !state.parser.in_progress();
                    if let Some(command) = state.parser.feed(byte) {
                        state.payload_started = None;
                        handle_command(command, ctx, metrics, settings);
                    } else if was_idle && state.parser.in_progress() {
                        state.payload_started = Some(Instant::now());
                    }
                }
            }
            Err(e) => {
                if state.link_healthy {
                    warn!("Host link read error: {}", e);
                    state.link_healthy = false;
                }
                // 链路断了，在途的半包载荷作废
                if state.parser.in_progress() {
                    state.parser.reset();
                    state.payload_started = None;
                }
                break;
            }
        }
    }

    // 半包载荷超时：整包丢弃，目标角不受影响
    if state.parser.in_progress()
        && let Some(started) = state.payload_started
        && started.elapsed() > settings.payload_timeout
    {
        warn!("Discarding stalled target payload after {:?}", settings.payload_timeout);
        state.parser.reset();
        state.payload_started = None;
    }

    // ============================================================
    // 2. 上行：校准反馈优先，否则发布有新时间戳的快照
    // ============================================================
    let status = ctx.calib_status();
    if status != CalibStatus::Idle {
        let packet = encode_calib_ack(status);
        match port.write_all(&packet) {
            Ok(()) => {
                metrics.host_packets_sent.fetch_add(1, Ordering::Relaxed);
                debug!("Reported calibration status {:?}", status);
                // 条件清除：上报期间到达的新状态留到下个周期再报
                ctx.clear_calib_status_if(status);
            }
            Err(e) => {
                if state.link_healthy {
                    warn!("Host link write error (calib ack dropped): {}", e);
                    state.link_healthy = false;
                }
            }
        }
        return;
    }

    let snapshot = ctx.snapshot.load();
    if snapshot.valid && state.last_sent_timestamp != Some(snapshot.timestamp_us) {
        let packet = encode_sensor_packet(&snapshot.values);
        match port.write_all(&packet) {
            Ok(()) => {
                metrics.host_packets_sent.fetch_add(1, Ordering::Relaxed);
                state.last_sent_timestamp = Some(snapshot.timestamp_us);
                if !state.link_healthy {
                    info!("Host link recovered");
                    state.link_healthy = true;
                }
            }
            Err(e) => {
                // 丢这一包即可，下个周期重试
                if state.link_healthy {
                    warn!("Host link write error (snapshot dropped): {}", e);
                    state.link_healthy = false;
                }
            }
        }
    }
}

fn handle_command(
    command: HostCommand,
    ctx: &BoardContext,
    metrics: &BoardMetrics,
    settings: &HostLinkSettings,
) {
    metrics.host_commands.fetch_add(1, Ordering::Relaxed);
    match command {
        HostCommand::Calibrate => {
            if ctx.try_send_command(calibration_request()) {
                // 只有请求真的进了队列才转入 Pending
                ctx.set_calib_status(CalibStatus::Pending);
                info!("Calibration requested by host");
            } else {
                metrics.commands_dropped.fetch_add(1, Ordering::Relaxed);
                warn!("Command queue full, calibration request dropped");
            }
        }
        HostCommand::SetTargets(angles) => {
            // 有界等待：拿不到锁就丢弃这包目标，host 下个周期会再发
            if let Some(mut targets) = ctx.targets.try_lock_for(settings.target_wait) {
                *targets = angles;
                trace!("Host targets updated");
            } else {
                warn!(
                    "Target store contended for {:?}, set-targets dropped",
                    settings.target_wait
                );
            }
        }
    }
}

/// 主机链路主循环
///
/// 绝对时间锚点推进周期，过载时对齐到当前时刻继续，不累积漂移。
pub fn host_link_loop(
    mut port: impl HostPort,
    ctx: Arc<BoardContext>,
    metrics: Arc<BoardMetrics>,
    settings: HostLinkSettings,
) {
    let mut state = LinkState::new();
    let mut next_tick = Instant::now();

    loop {
        if !ctx.is_running() {
            trace!("Host link: run flag cleared, exiting");
            break;
        }

        next_tick += settings.period;
        service_host_link(&mut port, &ctx, &metrics, &settings, &mut state);

        let now = Instant::now();
        if next_tick > now {
            spin_sleep::sleep(next_tick - now);
        } else {
            trace!("Host link tick overrun, realigning");
            next_tick = now;
        }
    }

    trace!("Host link: loop exited");
}
