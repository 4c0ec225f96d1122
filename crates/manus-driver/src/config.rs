//! 板卡配置
//!
//! 一份 [`BoardConfig`] 覆盖驱动的全部静态配置面：关节到总线的映射、
//! 两级 PID 增益、各周期与有界等待时长、写命令参数与行程限位、
//! 快照过期策略。运行期不可变。
//!
//! 默认值即参考平台：21 关节分布在 4 条总线上（0-2 号总线各 5 个、
//! 3 号总线 6 个），控制周期 10ms，主机链路周期 5ms。

use crate::error::DriverError;
use crate::hostlink::HostLinkSettings;
use crate::orchestrator::OrchestratorSettings;
use manus_control::PidGains;
use manus_protocol::{
    BUS_CAPACITY, BUS_COUNT, JOINT_COUNT, MAX_SERVO_ID, SERVO_ABS_MAX, SERVO_ABS_MIN,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// 关节 → (总线, 舵机 ID) 映射项
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JointMapEntry {
    pub bus: usize,
    pub id: u8,
}

/// 两级回路的增益组（全关节共用）
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PidSection {
    pub outer: PidGains,
    pub inner: PidGains,
}

impl Default for PidSection {
    fn default() -> Self {
        Self {
            // 外环工作在角度域：输出是对目标角的修正量（度）
            outer: PidGains {
                kp: 0.8,
                ki: 0.02,
                kd: 0.1,
                deadband: 0.5,
                integral_limit: 50.0,
                output_limit: 90.0,
            },
            // 内环输出直接作为舵机计数单位，kp 吸收 4096/360 的换算；
            // 积分项负责在修正量归零后撑住稳态位置
            inner: PidGains {
                kp: 11.38,
                ki: 0.2,
                kd: 0.0,
                deadband: 0.0,
                integral_limit: 30719.0,
                output_limit: 30719.0,
            },
        }
    }
}

/// 各任务周期与有界等待
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingSection {
    /// 控制周期（毫秒）
    pub control_period_ms: u64,
    /// 主机链路服务周期（毫秒）
    pub host_period_ms: u64,
    /// 传感器网络单次接收超时（毫秒）
    pub receive_timeout_ms: u64,
    /// 目标角互斥锁的有界等待（毫秒）
    pub target_wait_ms: u64,
    /// 舵机总线批量读超时（毫秒）
    pub servo_read_timeout_ms: u64,
    /// 主机半包载荷的丢弃超时（毫秒）
    pub host_payload_timeout_ms: u64,
}

impl Default for TimingSection {
    fn default() -> Self {
        Self {
            control_period_ms: 10,
            host_period_ms: 5,
            receive_timeout_ms: 1,
            target_wait_ms: 10,
            servo_read_timeout_ms: 100,
            host_payload_timeout_ms: 250,
        }
    }
}

/// 单关节行程限位覆盖
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JointTravel {
    pub joint: usize,
    pub min: i32,
    pub max: i32,
}

/// 舵机写命令参数与行程限位
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServoSection {
    /// 写命令的速度字段
    pub speed: u16,
    /// 写命令的加速度字段
    pub accel: u8,
    /// 全局行程下限（舵机计数单位）
    pub travel_min: i32,
    /// 全局行程上限
    pub travel_max: i32,
    /// 单关节行程覆盖（未列出的关节用全局限位）
    pub joint_travel: Vec<JointTravel>,
}

impl Default for ServoSection {
    fn default() -> Self {
        Self {
            speed: 1000,
            accel: 50,
            travel_min: SERVO_ABS_MIN,
            travel_max: SERVO_ABS_MAX,
            joint_travel: Vec::new(),
        }
    }
}

/// 快照过期策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotPolicy {
    /// 超过该毫秒数即视快照为过期（外环转保持模式）。0 表示永不过期。
    pub stale_after_ms: u64,
}

impl Default for SnapshotPolicy {
    fn default() -> Self {
        Self { stale_after_ms: 0 }
    }
}

/// 板卡完整配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BoardConfig {
    pub joint_map: Vec<JointMapEntry>,
    pub pid: PidSection,
    pub timing: TimingSection,
    pub servo: ServoSection,
    pub snapshot: SnapshotPolicy,
}

impl Default for BoardConfig {
    fn default() -> Self {
        // 参考平台：0-2 号总线各挂 ID 1-5，3 号总线挂 ID 1-6
        let mut joint_map = Vec::with_capacity(JOINT_COUNT);
        for bus in 0..3 {
            for id in 1..=5u8 {
                joint_map.push(JointMapEntry { bus, id });
            }
        }
        for id in 1..=6u8 {
            joint_map.push(JointMapEntry { bus: 3, id });
        }

        Self {
            joint_map,
            pid: PidSection::default(),
            timing: TimingSection::default(),
            servo: ServoSection::default(),
            snapshot: SnapshotPolicy::default(),
        }
    }
}

impl BoardConfig {
    /// 从 TOML 文件加载并校验
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, DriverError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// 从 TOML 字符串加载并校验
    pub fn from_toml_str(text: &str) -> Result<Self, DriverError> {
        let config: Self = toml::from_str(text)
            .map_err(|e| DriverError::Config(format!("TOML parse error: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// 渲染为 TOML 文本（`manusd default-config` 用）
    pub fn to_toml_string(&self) -> Result<String, DriverError> {
        toml::to_string_pretty(self)
            .map_err(|e| DriverError::Config(format!("TOML render error: {}", e)))
    }

    /// 校验配置自洽
    pub fn validate(&self) -> Result<(), DriverError> {
        if self.joint_map.len() != JOINT_COUNT {
            return Err(DriverError::Config(format!(
                "joint map must have {} entries, got {}",
                JOINT_COUNT,
                self.joint_map.len()
            )));
        }

        let mut per_bus = [0usize; BUS_COUNT];
        let mut seen: Vec<(usize, u8)> = Vec::with_capacity(JOINT_COUNT);
        for (joint, entry) in self.joint_map.iter().enumerate() {
            if entry.bus >= BUS_COUNT {
                return Err(DriverError::Config(format!(
                    "joint {} maps to bus {} (only {} buses)",
                    joint, entry.bus, BUS_COUNT
                )));
            }
            if entry.id == 0 || entry.id > MAX_SERVO_ID {
                return Err(DriverError::Config(format!(
                    "joint {} maps to servo id {} (valid range 1..={})",
                    joint, entry.id, MAX_SERVO_ID
                )));
            }
            if seen.contains(&(entry.bus, entry.id)) {
                return Err(DriverError::Config(format!(
                    "duplicate mapping: bus {} id {} assigned to more than one joint",
                    entry.bus, entry.id
                )));
            }
            seen.push((entry.bus, entry.id));
            per_bus[entry.bus] += 1;
        }
        for (bus, count) in per_bus.iter().enumerate() {
            if *count > BUS_CAPACITY {
                return Err(DriverError::Config(format!(
                    "bus {} carries {} servos, batch capacity is {}",
                    bus, count, BUS_CAPACITY
                )));
            }
        }

        for field in [
            ("control_period_ms", self.timing.control_period_ms),
            ("host_period_ms", self.timing.host_period_ms),
            ("receive_timeout_ms", self.timing.receive_timeout_ms),
        ] {
            if field.1 == 0 {
                return Err(DriverError::Config(format!("{} must be nonzero", field.0)));
            }
        }

        self.validate_travel(self.servo.travel_min, self.servo.travel_max, None)?;
        let mut seen_joints: Vec<usize> = Vec::new();
        for travel in &self.servo.joint_travel {
            if travel.joint >= JOINT_COUNT {
                return Err(DriverError::Config(format!(
                    "travel override references joint {} (only {} joints)",
                    travel.joint, JOINT_COUNT
                )));
            }
            if seen_joints.contains(&travel.joint) {
                return Err(DriverError::Config(format!(
                    "duplicate travel override for joint {}",
                    travel.joint
                )));
            }
            seen_joints.push(travel.joint);
            self.validate_travel(travel.min, travel.max, Some(travel.joint))?;
        }

        Ok(())
    }

    fn validate_travel(&self, min: i32, max: i32, joint: Option<usize>) -> Result<(), DriverError> {
        let scope = match joint {
            Some(j) => format!("joint {} travel", j),
            None => "global travel".to_string(),
        };
        if min > max {
            return Err(DriverError::Config(format!(
                "{}: min {} exceeds max {}",
                scope, min, max
            )));
        }
        if min < SERVO_ABS_MIN || max > SERVO_ABS_MAX {
            return Err(DriverError::Config(format!(
                "{}: [{}, {}] outside supported envelope [{}, {}]",
                scope, min, max, SERVO_ABS_MIN, SERVO_ABS_MAX
            )));
        }
        Ok(())
    }

    /// 关节映射的定长数组形式
    pub fn joint_map_array(&self) -> Result<[JointMapEntry; JOINT_COUNT], DriverError> {
        <[JointMapEntry; JOINT_COUNT]>::try_from(self.joint_map.as_slice()).map_err(|_| {
            DriverError::Config(format!(
                "joint map must have {} entries, got {}",
                JOINT_COUNT,
                self.joint_map.len()
            ))
        })
    }

    /// 每关节的生效行程限位（全局限位套用单关节覆盖）
    pub fn joint_travel_bounds(&self) -> [(i32, i32); JOINT_COUNT] {
        let mut bounds = [(self.servo.travel_min, self.servo.travel_max); JOINT_COUNT];
        for travel in &self.servo.joint_travel {
            if travel.joint < JOINT_COUNT {
                bounds[travel.joint] = (travel.min, travel.max);
            }
        }
        bounds
    }

    pub fn control_period(&self) -> Duration {
        Duration::from_millis(self.timing.control_period_ms)
    }

    pub fn receive_timeout(&self) -> Duration {
        Duration::from_millis(self.timing.receive_timeout_ms)
    }

    /// 控制编排器参数
    pub fn orchestrator_settings(&self) -> OrchestratorSettings {
        OrchestratorSettings {
            period: self.control_period(),
            speed: self.servo.speed,
            accel: self.servo.accel,
            target_wait: Duration::from_millis(self.timing.target_wait_ms),
            servo_read_timeout: Duration::from_millis(self.timing.servo_read_timeout_ms),
            stale_after: match self.snapshot.stale_after_ms {
                0 => None,
                ms => Some(Duration::from_millis(ms)),
            },
            travel: self.joint_travel_bounds(),
        }
    }

    /// 主机链路任务参数
    pub fn host_link_settings(&self) -> HostLinkSettings {
        HostLinkSettings {
            period: Duration::from_millis(self.timing.host_period_ms),
            target_wait: Duration::from_millis(self.timing.target_wait_ms),
            payload_timeout: Duration::from_millis(self.timing.host_payload_timeout_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 默认配置即参考平台，必须通过校验
    #[test]
    fn test_default_config_is_valid() {
        let config = BoardConfig::default();
        config.validate().unwrap();
        assert_eq!(config.joint_map.len(), JOINT_COUNT);

        let mut per_bus = [0usize; BUS_COUNT];
        for entry in &config.joint_map {
            per_bus[entry.bus] += 1;
        }
        assert_eq!(per_bus, [5, 5, 5, 6]);
    }

    /// 重复 (总线, ID) 被拒
    #[test]
    fn test_duplicate_mapping_rejected() {
        let mut config = BoardConfig::default();
        config.joint_map[1] = config.joint_map[0];
        let err = config.validate().unwrap_err();
        assert!(format!("{}", err).contains("duplicate mapping"));
    }

    /// 总线序号越界被拒
    #[test]
    fn test_bus_out_of_range_rejected() {
        let mut config = BoardConfig::default();
        config.joint_map[0].bus = BUS_COUNT;
        assert!(config.validate().is_err());
    }

    /// 舵机 ID 0 和超上限都被拒
    #[test]
    fn test_servo_id_range_enforced() {
        let mut config = BoardConfig::default();
        config.joint_map[0].id = 0;
        assert!(config.validate().is_err());

        let mut config = BoardConfig::default();
        config.joint_map[0].id = MAX_SERVO_ID + 1;
        assert!(config.validate().is_err());
    }

    /// 单总线超出批量容量被拒
    #[test]
    fn test_bus_capacity_enforced() {
        let mut config = BoardConfig::default();
        // 把 3 号总线的 6 个关节全部压到 0 号总线，0 号变成 5+6=11 > 8
        for entry in config.joint_map.iter_mut().filter(|e| e.bus == 3) {
            entry.bus = 0;
            entry.id += 10;
        }
        let err = config.validate().unwrap_err();
        assert!(format!("{}", err).contains("batch capacity"));
    }

    /// 关节数量不对被拒
    #[test]
    fn test_wrong_joint_count_rejected() {
        let mut config = BoardConfig::default();
        config.joint_map.pop();
        assert!(config.validate().is_err());
        assert!(config.joint_map_array().is_err());
    }

    /// 行程限位校验：min > max、越出包络、重复覆盖、关节越界
    #[test]
    fn test_travel_bounds_validation() {
        let mut config = BoardConfig::default();
        config.servo.travel_min = 100;
        config.servo.travel_max = -100;
        assert!(config.validate().is_err());

        let mut config = BoardConfig::default();
        config.servo.travel_max = SERVO_ABS_MAX + 1;
        assert!(config.validate().is_err());

        let mut config = BoardConfig::default();
        config.servo.joint_travel.push(JointTravel {
            joint: JOINT_COUNT,
            min: -100,
            max: 100,
        });
        assert!(config.validate().is_err());

        let mut config = BoardConfig::default();
        config.servo.joint_travel.push(JointTravel {
            joint: 2,
            min: -100,
            max: 100,
        });
        config.servo.joint_travel.push(JointTravel {
            joint: 2,
            min: -200,
            max: 200,
        });
        assert!(config.validate().is_err());
    }

    /// 单关节覆盖生效，其余关节用全局限位
    #[test]
    fn test_joint_travel_overrides() {
        let mut config = BoardConfig::default();
        config.servo.joint_travel.push(JointTravel {
            joint: 7,
            min: -1000,
            max: 1000,
        });
        config.validate().unwrap();

        let bounds = config.joint_travel_bounds();
        assert_eq!(bounds[7], (-1000, 1000));
        assert_eq!(bounds[0], (SERVO_ABS_MIN, SERVO_ABS_MAX));
    }

    /// TOML 序列化往返后配置不变
    #[test]
    fn test_toml_round_trip() {
        let config = BoardConfig::default();
        let text = config.to_toml_string().unwrap();
        let parsed = BoardConfig::from_toml_str(&text).unwrap();
        assert_eq!(parsed, config);
    }

    /// 空字符串给出全默认配置；局部覆盖只改指定字段
    #[test]
    fn test_partial_toml_overrides() {
        let config = BoardConfig::from_toml_str("").unwrap();
        assert_eq!(config, BoardConfig::default());

        let config = BoardConfig::from_toml_str(
            "[timing]\ncontrol_period_ms = 20\n\n[snapshot]\nstale_after_ms = 100\n",
        )
        .unwrap();
        assert_eq!(config.timing.control_period_ms, 20);
        assert_eq!(config.timing.host_period_ms, 5);
        assert_eq!(config.snapshot.stale_after_ms, 100);
        assert_eq!(
            config.orchestrator_settings().stale_after,
            Some(Duration::from_millis(100))
        );
    }

    /// 非法 TOML 报配置错误而不是 panic
    #[test]
    fn test_malformed_toml_rejected() {
        let err = BoardConfig::from_toml_str("joint_map = 3").unwrap_err();
        assert!(matches!(err, DriverError::Config(_)));
    }

    /// 文件加载：不存在的路径报 IO 错误；写出再读回一致
    #[test]
    fn test_from_toml_file() {
        let err = BoardConfig::from_toml_file("/nonexistent/manus.toml").unwrap_err();
        assert!(matches!(err, DriverError::Io(_)));

        let path = std::env::temp_dir().join(format!("manus-config-{}.toml", std::process::id()));
        std::fs::write(&path, BoardConfig::default().to_toml_string().unwrap()).unwrap();
        let loaded = BoardConfig::from_toml_file(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(loaded, BoardConfig::default());
    }

    /// 0 表示永不过期
    #[test]
    fn test_zero_stale_means_never() {
        let config = BoardConfig::default();
        assert_eq!(config.orchestrator_settings().stale_after, None);
    }
}
