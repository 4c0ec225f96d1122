//! 板卡组合根
//!
//! [`Board`] 把三个任务线程装配到一套共享状态上并管理生命周期：
//! 传感 IO 线程（帧重组 + 维护命令泵）、主机链路线程、控制编排
//! 线程。三个传输端各自移动进对应线程独占；线程间只通过
//! [`BoardContext`] 的四条受约束通道交互。关停走运行标志，每条
//! 线程的循环都有有界等待，Drop 在限时内汇合全部线程。

use crate::config::BoardConfig;
use crate::error::DriverError;
use crate::hostlink::{self, HostPort};
use crate::orchestrator::{self, ControlOrchestrator};
use crate::reassembly;
use crate::state::{BoardContext, BoardMetrics, MetricsSnapshot, SensorSnapshot};
use manus_can::CanAdapter;
use manus_control::CascadeController;
use manus_protocol::{BUS_COUNT, CalibStatus, JOINT_COUNT, calibration_request};
use manus_servo::ServoPort;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{error, info};

/// 带超时的线程汇合扩展
trait JoinTimeout {
    fn join_timeout(self, timeout: Duration) -> std::thread::Result<()>;
}

impl<T: Send + 'static> JoinTimeout for JoinHandle<T> {
    fn join_timeout(self, timeout: Duration) -> std::thread::Result<()> {
        use std::sync::mpsc;

        let (tx, rx) = mpsc::channel();

        // 看门狗线程代为汇合，当前线程只限时等通道
        std::thread::spawn(move || {
            let _ = tx.send(self.join());
        });

        match rx.recv_timeout(timeout) {
            Ok(join_result) => join_result.map(|_| ()),
            Err(mpsc::RecvTimeoutError::Timeout) => Err(Box::new(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "Thread join timeout",
            ))),
            Err(mpsc::RecvTimeoutError::Disconnected) => Err(Box::new(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "Thread panicked during join",
            ))),
        }
    }
}

fn spawn_named(
    name: &'static str,
    f: impl FnOnce() + Send + 'static,
) -> Result<JoinHandle<()>, DriverError> {
    std::thread::Builder::new()
        .name(name.to_string())
        .spawn(f)
        .map_err(|source| DriverError::ThreadSpawn { name, source })
}

/// 板卡驱动（对外 API）
pub struct Board {
    ctx: Arc<BoardContext>,
    metrics: Arc<BoardMetrics>,
    sensor_thread: Option<JoinHandle<()>>,
    host_thread: Option<JoinHandle<()>>,
    control_thread: Option<JoinHandle<()>>,
}

impl Board {
    /// 装配并启动板卡
    ///
    /// `servo_ports` 按总线序号排列，长度必须等于总线数。配置先
    /// 校验再使用；任何一条线程启动失败都会停掉已启动的线程后
    /// 返回错误。
    pub fn new<C, S, H>(
        can: C,
        servo_ports: Vec<S>,
        host_port: H,
        config: BoardConfig,
    ) -> Result<Self, DriverError>
    where
        C: CanAdapter + Send + 'static,
        S: ServoPort + Send + 'static,
        H: HostPort + Send + 'static,
    {
        config.validate()?;
        let joint_map = config.joint_map_array()?;

        let ctx = BoardContext::new();
        let metrics = Arc::new(BoardMetrics::new());

        let controller = CascadeController::new(config.pid.outer, config.pid.inner);
        let orchestrator = ControlOrchestrator::new(
            servo_ports,
            controller,
            joint_map,
            config.orchestrator_settings(),
        )?;

        let receive_timeout = config.receive_timeout();
        let host_settings = config.host_link_settings();

        let ctx_io = ctx.clone();
        let metrics_io = metrics.clone();
        let sensor_thread = spawn_named("manus-sensor-io", move || {
            reassembly::sensor_io_loop(can, ctx_io, metrics_io, receive_timeout);
        })?;

        let ctx_host = ctx.clone();
        let metrics_host = metrics.clone();
        let host_thread = match spawn_named("manus-hostlink", move || {
            hostlink::host_link_loop(host_port, ctx_host, metrics_host, host_settings);
        }) {
            Ok(handle) => handle,
            Err(e) => {
                ctx.stop();
                let _ = sensor_thread.join_timeout(Duration::from_secs(2));
                return Err(e);
            },
        };

        let ctx_ctl = ctx.clone();
        let metrics_ctl = metrics.clone();
        let control_thread = match spawn_named("manus-control", move || {
            orchestrator::control_loop(orchestrator, ctx_ctl, metrics_ctl);
        }) {
            Ok(handle) => handle,
            Err(e) => {
                ctx.stop();
                let _ = sensor_thread.join_timeout(Duration::from_secs(2));
                let _ = host_thread.join_timeout(Duration::from_secs(2));
                return Err(e);
            },
        };

        info!(
            "Board started: {} joints across {} buses, control period {:?}",
            JOINT_COUNT,
            BUS_COUNT,
            config.control_period()
        );

        Ok(Self {
            ctx,
            metrics,
            sensor_thread: Some(sensor_thread),
            host_thread: Some(host_thread),
            control_thread: Some(control_thread),
        })
    }

    /// 最新传感快照（无锁读取，返回副本）
    pub fn snapshot(&self) -> SensorSnapshot {
        *self.ctx.snapshot.load().as_ref()
    }

    /// 当前目标角副本
    pub fn targets(&self) -> [f32; JOINT_COUNT] {
        *self.ctx.targets.lock()
    }

    /// 写入整组目标角
    ///
    /// 嵌入方 API，与主机链路写的是同一个目标槽，整组原子替换。
    pub fn set_targets(&self, targets: [f32; JOINT_COUNT]) -> Result<(), DriverError> {
        if !self.ctx.is_running() {
            return Err(DriverError::NotRunning);
        }
        *self.ctx.targets.lock() = targets;
        Ok(())
    }

    /// 请求一次标定
    ///
    /// 返回命令是否成功入队；维护命令队列满时丢弃本条请求，
    /// 状态保持不变。
    pub fn request_calibration(&self) -> Result<bool, DriverError> {
        if !self.ctx.is_running() {
            return Err(DriverError::NotRunning);
        }
        if self.ctx.try_send_command(calibration_request()) {
            self.ctx.set_calib_status(CalibStatus::Pending);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// 最近一次标定的回执状态
    pub fn calib_status(&self) -> CalibStatus {
        self.ctx.calib_status()
    }

    /// 性能指标快照
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn is_running(&self) -> bool {
        self.ctx.is_running()
    }

    /// 三条任务线程是否都存活
    pub fn is_healthy(&self) -> bool {
        let alive = |handle: &Option<JoinHandle<()>>| {
            handle.as_ref().map(|h| !h.is_finished()).unwrap_or(false)
        };
        alive(&self.sensor_thread) && alive(&self.host_thread) && alive(&self.control_thread)
    }

    /// 停止全部任务线程并限时汇合（幂等）
    pub fn shutdown(&mut self) {
        self.stop_and_join();
    }

    fn stop_and_join(&mut self) {
        // Release 保证此前的写入对各线程可见
        self.ctx.stop();

        let join_timeout = Duration::from_secs(2);

        if let Some(handle) = self.sensor_thread.take()
            && let Err(_e) = handle.join_timeout(join_timeout)
        {
            error!(
                "Sensor IO thread panicked or failed to shut down within {:?}",
                join_timeout
            );
        }

        if let Some(handle) = self.host_thread.take()
            && let Err(_e) = handle.join_timeout(join_timeout)
        {
            error!(
                "Host link thread panicked or failed to shut down within {:?}",
                join_timeout
            );
        }

        if let Some(handle) = self.control_thread.take()
            && let Err(_e) = handle.join_timeout(join_timeout)
        {
            error!(
                "Control thread panicked or failed to shut down within {:?}",
                join_timeout
            );
        }
    }
}

impl Drop for Board {
    fn drop(&mut self) {
        self.stop_and_join();
    }
}

/// Board Builder（链式构造）
///
/// 三个传输端必选，配置可以直接给定、从 TOML 文件加载或用默认值。
///
/// # Example
///
/// ```no_run
/// use manus_can::MockCanAdapter;
/// use manus_driver::{BoardBuilder, HostPort};
/// use manus_servo::MockServoPort;
/// # struct NullPort;
/// # impl HostPort for NullPort {
/// #     fn read_some(&mut self, _buf: &mut [u8]) -> std::io::Result<usize> { Ok(0) }
/// #     fn write_all(&mut self, _data: &[u8]) -> std::io::Result<()> { Ok(()) }
/// # }
///
/// let ports: Vec<MockServoPort> = (0..4).map(|_| MockServoPort::new()).collect();
/// let board = BoardBuilder::new(MockCanAdapter::new(), ports, NullPort)
///     .build()
///     .unwrap();
/// ```
pub struct BoardBuilder<C, S, H> {
    can: C,
    servo_ports: Vec<S>,
    host_port: H,
    config: Option<BoardConfig>,
    config_path: Option<PathBuf>,
}

impl<C, S, H> BoardBuilder<C, S, H>
where
    C: CanAdapter + Send + 'static,
    S: ServoPort + Send + 'static,
    H: HostPort + Send + 'static,
{
    pub fn new(can: C, servo_ports: Vec<S>, host_port: H) -> Self {
        Self {
            can,
            servo_ports,
            host_port,
            config: None,
            config_path: None,
        }
    }

    /// 直接给定配置（可选，默认参考平台配置）
    pub fn config(mut self, config: BoardConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// 从 TOML 文件加载配置（可选；与 `config` 同时给定时文件优先）
    pub fn config_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_path = Some(path.into());
        self
    }

    pub fn build(self) -> Result<Board, DriverError> {
        let config = match self.config_path {
            Some(path) => BoardConfig::from_toml_file(path)?,
            None => self.config.unwrap_or_default(),
        };
        Board::new(self.can, self.servo_ports, self.host_port, config)
    }
}
