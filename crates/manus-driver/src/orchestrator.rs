//! 控制编排器：固定周期的主控制循环
//!
//! 每个周期严格按序执行：批量读全部总线 → 解析关节反馈 → 非破坏性
//! 读取快照（含过期策略）→ 有界等待拷贝目标角 → 级联计算 → 入队 →
//! 逐总线刷写。单个舵机或单条总线失联只降级对应关节，绝不拖慢其余
//! 总线或冲掉周期节拍。
//!
//! 周期推进用绝对时间锚点：工作耗时自动从睡眠中扣除，过载周期对齐
//! 到当前时刻继续，不累积漂移。

use crate::config::JointMapEntry;
use crate::error::DriverError;
use crate::state::{BoardContext, BoardMetrics};
use manus_control::{CascadeController, OuterMode};
use manus_protocol::{
    BUS_CAPACITY, BUS_COUNT, JOINT_COUNT, SERVO_ABS_MAX, SERVO_ABS_MIN, sensor_raw_to_deg,
    servo_units_to_deg,
};
use manus_servo::{ServoBus, ServoPort};
use smallvec::SmallVec;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// 控制循环的运行参数
#[derive(Debug, Clone, Copy)]
pub struct OrchestratorSettings {
    /// 控制周期
    pub period: Duration,
    /// 写命令的速度字段
    pub speed: u16,
    /// 写命令的加速度字段
    pub accel: u8,
    /// 目标角互斥锁的有界等待
    pub target_wait: Duration,
    /// 单条总线批量读的超时
    pub servo_read_timeout: Duration,
    /// 快照过期阈值，None 表示永不过期
    pub stale_after: Option<Duration>,
    /// 每关节行程限位（计数单位），入队前先钳制到这里
    pub travel: [(i32, i32); JOINT_COUNT],
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            period: Duration::from_millis(10),
            speed: 1000,
            accel: 50,
            target_wait: Duration::from_millis(10),
            servo_read_timeout: Duration::from_millis(100),
            stale_after: None,
            travel: [(SERVO_ABS_MIN, SERVO_ABS_MAX); JOINT_COUNT],
        }
    }
}

/// 控制编排器
///
/// 拥有全部舵机总线、级联控制器和各张工作数组。工作数组都是固定
/// 长度，稳态路径不分配。
pub struct ControlOrchestrator<P: ServoPort> {
    buses: Vec<ServoBus<P>>,
    controller: CascadeController,
    joint_map: [JointMapEntry; JOINT_COUNT],
    /// 每条总线的批量读 ID 集合，由关节映射导出
    bus_ids: Vec<SmallVec<[u8; BUS_CAPACITY]>>,
    settings: OrchestratorSettings,

    /// 上个周期成功拷贝到的目标角（锁超时沿用）
    targets: [f32; JOINT_COUNT],
    /// 传感角度（度），带错误标志的读数保持上周期的值
    sensed: [f32; JOINT_COUNT],
    /// 舵机反馈角度（度），离线回退 0.0
    feedback: [f32; JOINT_COUNT],
    /// 本周期各关节反馈是否在线
    online: [bool; JOINT_COUNT],
    commands: [f32; JOINT_COUNT],
}

impl<P: ServoPort> ControlOrchestrator<P> {
    /// 从每条总线的传输端口和关节映射构造
    ///
    /// `ports` 的长度必须等于总线数，映射必须已通过配置校验。
    pub fn new(
        ports: Vec<P>,
        controller: CascadeController,
        joint_map: [JointMapEntry; JOINT_COUNT],
        settings: OrchestratorSettings,
    ) -> Result<Self, DriverError> {
        if ports.len() != BUS_COUNT {
            return Err(DriverError::Config(format!(
                "expected {} servo ports, got {}",
                BUS_COUNT,
                ports.len()
            )));
        }

        let mut bus_ids: Vec<SmallVec<[u8; BUS_CAPACITY]>> =
            vec![SmallVec::new(); BUS_COUNT];
        for entry in &joint_map {
            if entry.bus >= BUS_COUNT {
                return Err(DriverError::Config(format!(
                    "joint map references bus {} (only {} buses)",
                    entry.bus, BUS_COUNT
                )));
            }
            if !bus_ids[entry.bus].contains(&entry.id) {
                bus_ids[entry.bus].push(entry.id);
            }
        }

        let buses = ports
            .into_iter()
            .enumerate()
            .map(|(index, port)| ServoBus::new(index, port, settings.servo_read_timeout))
            .collect();

        Ok(Self {
            buses,
            controller,
            joint_map,
            bus_ids,
            settings,
            targets: [0.0; JOINT_COUNT],
            sensed: [0.0; JOINT_COUNT],
            feedback: [0.0; JOINT_COUNT],
            online: [false; JOINT_COUNT],
            commands: [0.0; JOINT_COUNT],
        })
    }

    pub fn period(&self) -> Duration {
        self.settings.period
    }

    /// 本周期各关节反馈在线标志
    pub fn joint_online(&self) -> &[bool; JOINT_COUNT] {
        &self.online
    }

    /// 指定总线（嵌入与测试用）
    pub fn bus(&self, index: usize) -> Option<&ServoBus<P>> {
        self.buses.get(index)
    }

    pub fn bus_mut(&mut self, index: usize) -> Option<&mut ServoBus<P>> {
        self.buses.get_mut(index)
    }

    /// 将某个舵机的圈数计回零（运维触发，不属于周期路径）
    pub fn reset_turn_counter(&mut self, joint: usize) {
        if let Some(entry) = self.joint_map.get(joint)
            && let Some(bus) = self.buses.get_mut(entry.bus)
        {
            bus.reset_turn_counter(entry.id);
        }
    }

    /// 执行一个控制周期
    pub fn run_cycle(&mut self, ctx: &BoardContext, metrics: &BoardMetrics) {
        // ============================================================
        // 1. 批量读全部总线（逐条有界超时，失败只降级本条）
        // ============================================================
        for bus in &mut self.buses {
            let ids = &self.bus_ids[bus.index()];
            if let Err(e) = bus.read_positions(ids) {
                metrics.servo_read_failures.fetch_add(1, Ordering::Relaxed);
                warn!("Bus {} batch read failed: {}", bus.index(), e);
            }
        }

        // ============================================================
        // 2. 解析关节反馈：在线取多圈绝对角，离线回退 0.0 并标记
        // ============================================================
        for (j, entry) in self.joint_map.iter().enumerate() {
            let bus = &self.buses[entry.bus];
            if bus.is_online(entry.id) {
                self.feedback[j] = bus
                    .absolute_position(entry.id)
                    .map(servo_units_to_deg)
                    .unwrap_or(0.0);
                self.online[j] = true;
            } else {
                self.feedback[j] = 0.0;
                self.online[j] = false;
            }
        }

        // ============================================================
        // 3. 非破坏性读取最新快照，应用过期策略
        // ============================================================
        let snapshot = ctx.snapshot.load();
        let mut mode = OuterMode::Track;
        if !snapshot.valid {
            mode = OuterMode::Hold;
        } else if let Some(stale_after) = self.settings.stale_after {
            let age_us = ctx.monotonic_us().saturating_sub(snapshot.timestamp_us);
            if age_us > stale_after.as_micros() as u64 {
                metrics.stale_cycles.fetch_add(1, Ordering::Relaxed);
                trace!("Snapshot stale ({} us old), holding outer loop", age_us);
                mode = OuterMode::Hold;
            }
        }
        if mode == OuterMode::Track {
            for j in 0..JOINT_COUNT {
                // 带错误标志的读数不可信，该关节沿用上周期的传感角
                if !snapshot.value_errors[j] {
                    self.sensed[j] = sensor_raw_to_deg(snapshot.values[j]);
                }
            }
        }

        // ============================================================
        // 4. 有界等待拷贝目标角，超时沿用上个周期的副本
        // ============================================================
        match ctx.targets.try_lock_for(self.settings.target_wait) {
            Some(guard) => self.targets = *guard,
            None => {
                debug!(
                    "Target lock wait exceeded {:?}, reusing previous targets",
                    self.settings.target_wait
                );
            }
        }

        // ============================================================
        // 5. 级联计算：两级回路一趟跑完，输出即舵机计数单位
        // ============================================================
        self.controller.compute(
            &self.targets,
            &self.sensed,
            &self.feedback,
            mode,
            &mut self.commands,
        );

        // ============================================================
        // 6. 入队 + 7. 逐总线刷写（一条总线一次事务）
        // ============================================================
        for (j, entry) in self.joint_map.iter().enumerate() {
            let (lo, hi) = self.settings.travel[j];
            self.buses[entry.bus].queue_target(
                entry.id,
                (self.commands[j] as i32).clamp(lo, hi),
                self.settings.speed,
                self.settings.accel,
            );
        }
        for bus in &mut self.buses {
            if let Err(e) = bus.flush() {
                warn!("Bus {} flush failed: {}", bus.index(), e);
            }
        }

        metrics.cycles.fetch_add(1, Ordering::Relaxed);
    }
}

/// 控制主循环
///
/// 绝对时间锚点推进周期；错过边界时计数并对齐到当前时刻，
/// 不让延迟滚雪球。
pub fn control_loop<P: ServoPort>(
    mut orchestrator: ControlOrchestrator<P>,
    ctx: Arc<BoardContext>,
    metrics: Arc<BoardMetrics>,
) {
    // 设置线程优先级（可选 feature）
    #[cfg(feature = "realtime")]
    {
        use thread_priority::*;
        use tracing::info;

        match set_current_thread_priority(ThreadPriority::Max) {
            Ok(_) => {
                info!("Control thread priority set to MAX (realtime)");
            }
            Err(e) => {
                warn!(
                    "Failed to set control thread priority: {}. \
                    On Linux, you may need to run with CAP_SYS_NICE or use rtkit.",
                    e
                );
            }
        }
    }

    let period = orchestrator.period();
    let mut next_tick = Instant::now();

    loop {
        if !ctx.is_running() {
            trace!("Control loop: run flag cleared, exiting");
            break;
        }

        next_tick += period;
        orchestrator.run_cycle(&ctx, &metrics);

        let now = Instant::now();
        if next_tick > now {
            spin_sleep::sleep(next_tick - now);
        } else {
            metrics.deadline_misses.fetch_add(1, Ordering::Relaxed);
            warn!(
                "Control cycle overran its deadline by {:?}, realigning",
                now.duration_since(next_tick)
            );
            next_tick = now;
        }
    }

    trace!("Control loop: exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BoardConfig;
    use crate::state::SensorSnapshot;
    use manus_control::PidGains;
    use manus_servo::{MockServoPort, ServoError};

    fn plain_gains(kp: f32) -> PidGains {
        PidGains {
            kp,
            ki: 0.0,
            kd: 0.0,
            deadband: 0.0,
            integral_limit: 1000.0,
            output_limit: 32000.0,
        }
    }

    /// 纯比例单位增益：跟踪模式下每关节命令 = 目标角 - 传感角
    fn test_orchestrator(
        settings: OrchestratorSettings,
        configure: impl FnOnce(&mut Vec<MockServoPort>),
    ) -> ControlOrchestrator<MockServoPort> {
        let map = BoardConfig::default().joint_map_array().unwrap();
        let mut ports: Vec<MockServoPort> = (0..BUS_COUNT).map(|_| MockServoPort::new()).collect();
        // 默认所有舵机在线且停在 0 位
        for (bus, port) in ports.iter_mut().enumerate() {
            for entry in map.iter().filter(|e| e.bus == bus) {
                port.set_position(entry.id, 0);
            }
        }
        configure(&mut ports);

        let controller = CascadeController::new(plain_gains(1.0), plain_gains(1.0));
        ControlOrchestrator::new(ports, controller, map, settings).unwrap()
    }

    fn publish_snapshot(ctx: &BoardContext, values: [u16; JOINT_COUNT]) {
        publish_snapshot_with_errors(ctx, values, [false; JOINT_COUNT]);
    }

    fn publish_snapshot_with_errors(
        ctx: &BoardContext,
        values: [u16; JOINT_COUNT],
        value_errors: [bool; JOINT_COUNT],
    ) {
        let snapshot = SensorSnapshot {
            values,
            value_errors,
            error_bitmap: 0,
            joint_flags: [0; JOINT_COUNT],
            timestamp_us: ctx.monotonic_us(),
            valid: true,
        };
        ctx.snapshot.store(Arc::new(snapshot));
    }

    fn set_targets(ctx: &BoardContext, deg: f32) {
        *ctx.targets.lock() = [deg; JOINT_COUNT];
    }

    /// 某条总线第 n 次写事务里各条命令的位置字段
    fn batch_positions(orch: &ControlOrchestrator<MockServoPort>, bus: usize, n: usize) -> Vec<i16> {
        orch.bus(bus).unwrap().port().transactions()[n]
            .iter()
            .map(|cmd| cmd.position)
            .collect()
    }

    /// 一个周期内每条总线恰好一次写事务，批次覆盖本总线全部关节
    #[test]
    fn test_cycle_reads_and_flushes_every_bus() {
        let ctx = BoardContext::new();
        let metrics = BoardMetrics::new();
        let mut orch = test_orchestrator(OrchestratorSettings::default(), |_| {});

        orch.run_cycle(&ctx, &metrics);

        for bus in 0..BUS_COUNT {
            let transactions = orch.bus(bus).unwrap().port().transactions();
            assert_eq!(transactions.len(), 1, "bus {} write transactions", bus);
            let expected = if bus == 3 { 6 } else { 5 };
            assert_eq!(transactions[0].len(), expected, "bus {} batch size", bus);
            for cmd in &transactions[0] {
                assert_eq!(cmd.speed, 1000);
                assert_eq!(cmd.accel, 50);
            }
        }
        assert!(orch.joint_online().iter().all(|&on| on));
        assert_eq!(metrics.snapshot().cycles, 1);
    }

    /// 单个舵机不应答只降级它自己的关节，批次照常包含它
    #[test]
    fn test_unresponsive_servo_degrades_single_joint() {
        let ctx = BoardContext::new();
        let metrics = BoardMetrics::new();
        // 0 号总线 ID 2 即 1 号关节
        let mut orch = test_orchestrator(OrchestratorSettings::default(), |ports| {
            ports[0].set_unresponsive(2, true);
        });

        orch.run_cycle(&ctx, &metrics);

        for (j, online) in orch.joint_online().iter().enumerate() {
            assert_eq!(*online, j != 1, "joint {} online flag", j);
        }
        // 离线关节照常接收命令
        assert_eq!(batch_positions(&orch, 0, 0).len(), 5);
        assert_eq!(metrics.snapshot().servo_read_failures, 0);
    }

    /// 整条总线读失败只降级该总线的关节，其余总线照常读写
    #[test]
    fn test_bus_read_failure_isolated() {
        let ctx = BoardContext::new();
        let metrics = BoardMetrics::new();
        let mut orch = test_orchestrator(OrchestratorSettings::default(), |ports| {
            ports[1].inject_read_error(ServoError::Transaction("wire cut".into()));
        });

        orch.run_cycle(&ctx, &metrics);

        // 1 号总线承载 5..10 号关节
        for (j, online) in orch.joint_online().iter().enumerate() {
            let expected = !(5..10).contains(&j);
            assert_eq!(*online, expected, "joint {} online flag", j);
        }
        assert_eq!(metrics.snapshot().servo_read_failures, 1);
        for bus in 0..BUS_COUNT {
            assert_eq!(orch.bus(bus).unwrap().port().transactions().len(), 1);
        }
        assert_eq!(metrics.snapshot().cycles, 1);
    }

    /// 跟踪模式：命令反映目标角与传感角之差
    #[test]
    fn test_track_mode_commands_follow_error() {
        let ctx = BoardContext::new();
        let metrics = BoardMetrics::new();
        let mut orch = test_orchestrator(OrchestratorSettings::default(), |_| {});

        // 传感 45 度（原始读数 2048/16384 圈），目标 90 度
        publish_snapshot(&ctx, [2048; JOINT_COUNT]);
        set_targets(&ctx, 90.0);
        orch.run_cycle(&ctx, &metrics);

        for bus in 0..BUS_COUNT {
            for position in batch_positions(&orch, bus, 0) {
                assert_eq!(position, 45);
            }
        }
    }

    /// 没有有效快照时外环保持，命令不追目标
    #[test]
    fn test_invalid_snapshot_forces_hold() {
        let ctx = BoardContext::new();
        let metrics = BoardMetrics::new();
        let mut orch = test_orchestrator(OrchestratorSettings::default(), |_| {});

        set_targets(&ctx, 90.0);
        orch.run_cycle(&ctx, &metrics);

        for bus in 0..BUS_COUNT {
            for position in batch_positions(&orch, bus, 0) {
                assert_eq!(position, 0);
            }
        }
        assert_eq!(metrics.snapshot().stale_cycles, 0);
    }

    /// 过期策略：超龄快照转保持并计数，新鲜快照正常跟踪
    #[test]
    fn test_stale_snapshot_forces_hold() {
        let ctx = BoardContext::new();
        let metrics = BoardMetrics::new();
        let settings = OrchestratorSettings {
            stale_after: Some(Duration::ZERO),
            ..OrchestratorSettings::default()
        };
        let mut orch = test_orchestrator(settings, |_| {});

        publish_snapshot(&ctx, [2048; JOINT_COUNT]);
        set_targets(&ctx, 90.0);
        std::thread::sleep(Duration::from_millis(1));
        orch.run_cycle(&ctx, &metrics);

        assert_eq!(metrics.snapshot().stale_cycles, 1);
        for position in batch_positions(&orch, 0, 0) {
            assert_eq!(position, 0);
        }

        // 阈值放宽到 10 秒后同样的快照算新鲜
        let ctx = BoardContext::new();
        let metrics = BoardMetrics::new();
        let settings = OrchestratorSettings {
            stale_after: Some(Duration::from_secs(10)),
            ..OrchestratorSettings::default()
        };
        let mut orch = test_orchestrator(settings, |_| {});

        publish_snapshot(&ctx, [2048; JOINT_COUNT]);
        set_targets(&ctx, 90.0);
        orch.run_cycle(&ctx, &metrics);

        assert_eq!(metrics.snapshot().stale_cycles, 0);
        for position in batch_positions(&orch, 0, 0) {
            assert_eq!(position, 45);
        }
    }

    /// 带错误标志的读数不覆盖该关节的传感角，其余关节正常更新
    #[test]
    fn test_error_flagged_value_keeps_previous_reading() {
        let ctx = BoardContext::new();
        let metrics = BoardMetrics::new();
        let mut orch = test_orchestrator(OrchestratorSettings::default(), |_| {});

        publish_snapshot(&ctx, [2048; JOINT_COUNT]);
        set_targets(&ctx, 90.0);
        orch.run_cycle(&ctx, &metrics);

        // 第二代快照：0 号关节挂错误标志，其余到位 90 度
        let mut errors = [false; JOINT_COUNT];
        errors[0] = true;
        publish_snapshot_with_errors(&ctx, [4096; JOINT_COUNT], errors);
        orch.run_cycle(&ctx, &metrics);

        let positions = batch_positions(&orch, 0, 1);
        // 0 号关节沿用上周期的 45 度传感角，命令仍是 45
        assert_eq!(positions[0], 45);
        for position in &positions[1..] {
            assert_eq!(*position, 0);
        }
        for bus in 1..BUS_COUNT {
            for position in batch_positions(&orch, bus, 1) {
                assert_eq!(position, 0);
            }
        }
    }

    /// 目标锁等待超时沿用上个周期的副本，不阻塞周期
    #[test]
    fn test_target_lock_timeout_reuses_previous_copy() {
        let ctx = BoardContext::new();
        let metrics = BoardMetrics::new();
        let settings = OrchestratorSettings {
            target_wait: Duration::from_millis(1),
            ..OrchestratorSettings::default()
        };
        let mut orch = test_orchestrator(settings, |_| {});

        publish_snapshot(&ctx, [2048; JOINT_COUNT]);
        set_targets(&ctx, 90.0);
        orch.run_cycle(&ctx, &metrics);
        assert_eq!(batch_positions(&orch, 0, 0)[0], 45);

        // 持锁期间改目标：本周期拷不到新值，沿用 90 度的旧副本
        let mut guard = ctx.targets.lock();
        *guard = [0.0; JOINT_COUNT];
        orch.run_cycle(&ctx, &metrics);
        drop(guard);
        assert_eq!(batch_positions(&orch, 0, 1)[0], 45);

        // 锁释放后新目标生效：0 - 45 = -45
        orch.run_cycle(&ctx, &metrics);
        assert_eq!(batch_positions(&orch, 0, 2)[0], -45);
    }

    /// 行程限位在入队前收紧命令
    #[test]
    fn test_travel_bounds_clamp_commands() {
        let ctx = BoardContext::new();
        let metrics = BoardMetrics::new();
        let settings = OrchestratorSettings {
            travel: [(-100, 100); JOINT_COUNT],
            ..OrchestratorSettings::default()
        };
        let mut orch = test_orchestrator(settings, |_| {});

        publish_snapshot(&ctx, [0; JOINT_COUNT]);
        set_targets(&ctx, 720.0);
        orch.run_cycle(&ctx, &metrics);

        for bus in 0..BUS_COUNT {
            for position in batch_positions(&orch, bus, 0) {
                assert_eq!(position, 100);
            }
        }
    }

    /// 圈数清零经关节映射路由到正确的总线和 ID
    #[test]
    fn test_reset_turn_counter_routes_through_map() {
        let ctx = BoardContext::new();
        let metrics = BoardMetrics::new();
        // 20 号关节即 3 号总线 ID 6
        let mut orch = test_orchestrator(OrchestratorSettings::default(), |ports| {
            ports[3].set_position(6, 3000);
        });

        orch.run_cycle(&ctx, &metrics);
        assert_eq!(orch.bus(3).unwrap().absolute_position(6), Some(3000));

        // 3000 → 500 的跳变推断为正向越过机械零点，圈数 +1
        orch.bus_mut(3).unwrap().port_mut().set_position(6, 500);
        orch.run_cycle(&ctx, &metrics);
        assert_eq!(orch.bus(3).unwrap().absolute_position(6), Some(4596));

        orch.reset_turn_counter(20);
        assert_eq!(orch.bus(3).unwrap().absolute_position(6), Some(500));
    }

    /// 端口数量与总线数不符时拒绝构造
    #[test]
    fn test_wrong_port_count_rejected() {
        let map = BoardConfig::default().joint_map_array().unwrap();
        let ports: Vec<MockServoPort> = (0..BUS_COUNT - 1).map(|_| MockServoPort::new()).collect();
        let controller = CascadeController::new(plain_gains(1.0), plain_gains(1.0));
        let result =
            ControlOrchestrator::new(ports, controller, map, OrchestratorSettings::default());
        assert!(matches!(result, Err(DriverError::Config(_))));
    }
}
