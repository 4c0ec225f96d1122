//! 仿真世界
//!
//! `--mock` 模式下顶替硬件的对端：一条线程同时扮演全部舵机和
//! 传感器板。舵机按限速朝最近一次写入的目标位置滑动；磁编读数由
//! 仿真舵机的多圈位置换算而来，因此级联回路在仿真里真的闭环收敛。
//! 传感器板侧还会应答标定请求（延迟后回成功帧），并偶尔上报一个
//! 哨兵读数模拟磁编瞬时失效。

use anyhow::{Context, Result};
use manus_can::MockCanHandle;
use manus_driver::{BoardConfig, JointMapEntry};
use manus_protocol::{
    CALIBRATE_OPCODE, CalibAck, CalibStatus, ENCODER_FRAME_COUNT, EncoderFrame, ID_BOARD_COMMAND,
    SENSOR_UNITS_PER_REV, SERVO_UNITS_PER_REV, encoder_frame_values,
};
use manus_servo::MockServoHandle;
use rand::Rng;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// 世界推进节拍
const TICK: Duration = Duration::from_millis(5);

/// 编码器帧组的广播间隔（节拍数）
const SENSOR_EVERY_TICKS: u64 = 2;

/// 舵机每节拍最多移动的计数单位（远小于半圈每控制周期，跨圈判定安全）
const SLEW_PER_TICK: i32 = 60;

/// 单个读数变成哨兵值的概率（每次广播）
const SENTINEL_PROBABILITY: f64 = 0.0005;

/// 标定请求到成功应答的延迟
const CALIB_DELAY: Duration = Duration::from_millis(200);

/// 朝目标滑动一步，步长限幅
fn step_toward(current: i32, target: i32, max_step: i32) -> i32 {
    current + (target - current).clamp(-max_step, max_step)
}

/// 舵机多圈位置换算成磁编原始读数（0..16384）
fn servo_abs_to_sensor_raw(abs: i32) -> u16 {
    let per_rev = SENSOR_UNITS_PER_REV as i64;
    let raw = (abs as i64 * per_rev / SERVO_UNITS_PER_REV as i64).rem_euclid(per_rev);
    raw as u16
}

pub struct SimWorld {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl SimWorld {
    /// 启动仿真线程
    ///
    /// `servos` 按总线序号排列，关节映射决定每个关节对应哪个仿真舵机。
    pub fn spawn(
        can: MockCanHandle,
        servos: Vec<MockServoHandle>,
        config: &BoardConfig,
    ) -> Result<Self> {
        let joint_map = config.joint_map.clone();
        let stop = Arc::new(AtomicBool::new(false));
        let flag = stop.clone();

        let thread = std::thread::Builder::new()
            .name("manus-sim".to_string())
            .spawn(move || run_world(can, servos, joint_map, flag))
            .context("failed to spawn simulation thread")?;

        Ok(Self {
            stop,
            thread: Some(thread),
        })
    }

    /// 停止并汇合仿真线程
    pub fn stop(mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for SimWorld {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn run_world(
    can: MockCanHandle,
    servos: Vec<MockServoHandle>,
    joint_map: Vec<JointMapEntry>,
    stop: Arc<AtomicBool>,
) {
    // 每个关节一个仿真舵机的多圈位置，上电全部在 0
    let mut positions = vec![0i32; joint_map.len()];
    let mut rng = rand::thread_rng();
    let mut tick = 0u64;
    let mut calib_due: Option<Instant> = None;

    while !stop.load(Ordering::SeqCst) {
        // 1. 舵机世界：朝最近一次写入的目标限速滑动
        for (joint, entry) in joint_map.iter().enumerate() {
            if let Some(cmd) = servos[entry.bus].last_command(entry.id) {
                positions[joint] =
                    step_toward(positions[joint], cmd.position as i32, SLEW_PER_TICK);
            }
            let raw = positions[joint].rem_euclid(SERVO_UNITS_PER_REV) as u16;
            servos[entry.bus].set_position(entry.id, raw);
        }

        // 2. 传感器板侧：消费板卡命令
        for frame in can.take_sent_frames() {
            if frame.id == ID_BOARD_COMMAND && frame.data_slice().first() == Some(&CALIBRATE_OPCODE)
            {
                info!("Sim: calibration request received, acking in {:?}", CALIB_DELAY);
                calib_due = Some(Instant::now() + CALIB_DELAY);
            }
        }
        if let Some(due) = calib_due
            && Instant::now() >= due
        {
            can.push_frame(
                CalibAck {
                    status: CalibStatus::Success,
                }
                .to_frame(),
            );
            calib_due = None;
        }

        // 3. 广播编码器帧组：读数由仿真舵机位置换算，偶发哨兵
        if tick % SENSOR_EVERY_TICKS == 0 {
            let mut values: Vec<u16> = positions
                .iter()
                .map(|&abs| servo_abs_to_sensor_raw(abs))
                .collect();
            for value in values.iter_mut() {
                if rng.gen_bool(SENTINEL_PROBABILITY) {
                    debug!("Sim: emitting sentinel reading");
                    *value = 0xFFFF;
                }
            }

            for index in 0..ENCODER_FRAME_COUNT {
                let start = index * 4;
                let count = encoder_frame_values(index);
                if let Ok(frame) = EncoderFrame::encode(index, &values[start..start + count]) {
                    can.push_frame(frame);
                }
            }
        }

        tick += 1;
        std::thread::sleep(TICK);
    }
}
