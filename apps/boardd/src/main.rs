//! # manusd
//!
//! manus 关节板控制守护进程。
//!
//! ## 仿真模式（无硬件）
//!
//! ```bash
//! # 启动板卡 + 内置仿真世界，主机链路监听 TCP
//! manusd run --mock --listen 127.0.0.1:9400
//! ```
//!
//! ## 硬件模式（Linux）
//!
//! ```bash
//! # 传感网络接 SocketCAN；舵机协议库未接线的构建里舵机总线走回环端口
//! manusd run --can can0
//! ```
//!
//! ## 配置
//!
//! ```bash
//! manusd default-config > manus.toml   # 打印内置参考平台配置
//! manusd run --mock --config manus.toml
//! ```

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use manus_can::MockCanAdapter;
use manus_driver::{Board, BoardConfig};
use manus_servo::MockServoPort;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{info, warn};

mod sim;
mod tcp;

use sim::SimWorld;
use tcp::TcpHostPort;

/// manusd - manus 关节板控制守护进程
#[derive(Parser, Debug)]
#[command(name = "manusd")]
#[command(about = "Control daemon for the manus joint board", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// 启动板卡控制回路
    Run(RunArgs),

    /// 打印内置参考平台配置（TOML）
    DefaultConfig,
}

#[derive(Args, Debug)]
struct RunArgs {
    /// 配置文件路径（缺省使用内置参考平台配置）
    #[arg(long)]
    config: Option<PathBuf>,

    /// 使用内置仿真硬件运行（无需任何设备）
    #[arg(long, conflicts_with = "can")]
    mock: bool,

    /// 传感网络使用的 SocketCAN 接口，例如 can0（仅 Linux；
    /// 本构建未接线舵机协议库，舵机总线走回环端口）
    #[arg(long)]
    can: Option<String>,

    /// 主机链路的 TCP 监听地址
    #[arg(long, default_value = "127.0.0.1:9400")]
    listen: String,

    /// 日志级别（RUST_LOG 环境变量优先）
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run(args) => {
            init_tracing(&args.log_level);
            run(args)
        }
        Commands::DefaultConfig => {
            let text = BoardConfig::default()
                .to_toml_string()
                .context("failed to render default config")?;
            print!("{}", text);
            Ok(())
        }
    }
}

fn init_tracing(level: &str) {
    use tracing_subscriber::EnvFilter;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.to_string()));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn load_config(path: Option<&PathBuf>) -> Result<BoardConfig> {
    match path {
        Some(path) => {
            let config = BoardConfig::from_toml_file(path)
                .with_context(|| format!("failed to load config from {}", path.display()))?;
            info!("Config loaded from {}", path.display());
            Ok(config)
        }
        None => {
            info!("Using built-in reference platform config");
            Ok(BoardConfig::default())
        }
    }
}

fn run(args: RunArgs) -> Result<()> {
    let config = load_config(args.config.as_ref())?;

    let host_port = TcpHostPort::bind(&args.listen)
        .with_context(|| format!("failed to bind host link on {}", args.listen))?;
    info!("Host link listening on {}", args.listen);

    // 每条总线一个回环舵机端口；仿真/测试句柄在装配前取出
    let mut servo_handles = Vec::new();
    let servo_ports: Vec<MockServoPort> = (0..manus_protocol::BUS_COUNT)
        .map(|_| {
            let port = MockServoPort::new();
            servo_handles.push(port.handle());
            port
        })
        .collect();
    for entry in &config.joint_map {
        servo_handles[entry.bus].set_position(entry.id, 0);
    }

    if args.mock {
        let can = MockCanAdapter::new();
        let can_handle = can.handle();

        let board = Board::new(can, servo_ports, host_port, config.clone())
            .context("failed to start board")?;
        let sim = SimWorld::spawn(can_handle, servo_handles, &config)
            .context("failed to start simulation world")?;
        info!("Simulation world attached (encoders track the simulated servos)");

        supervise(board);
        sim.stop();
        return Ok(());
    }

    if let Some(interface) = args.can {
        #[cfg(target_os = "linux")]
        {
            let can = manus_can::SocketCanAdapter::new(interface.as_str())
                .with_context(|| format!("failed to open CAN interface {}", interface))?;
            warn!(
                "Actuator transport library is not wired in this build; \
                servo buses run on loopback ports"
            );

            let board = Board::new(can, servo_ports, host_port, config)
                .context("failed to start board")?;
            supervise(board);
            return Ok(());
        }
        #[cfg(not(target_os = "linux"))]
        {
            let _ = interface;
            bail!("--can requires SocketCAN, which is only available on Linux");
        }
    }

    bail!("choose a transport: --mock for simulated hardware, or --can IFACE");
}

/// 守护主循环：等退出信号，周期性汇报指标，最后限时关停板卡
fn supervise(mut board: Board) {
    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = shutdown.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        flag.store(true, Ordering::SeqCst);
    }) {
        warn!("Failed to install Ctrl-C handler: {}", e);
    }

    const REPORT_INTERVAL: Duration = Duration::from_secs(10);
    let mut last_report = Instant::now();
    let mut last = board.metrics();

    while !shutdown.load(Ordering::SeqCst) {
        if !board.is_running() {
            warn!("Board stopped on its own (fatal IO error), exiting");
            break;
        }
        std::thread::sleep(Duration::from_millis(100));

        if last_report.elapsed() >= REPORT_INTERVAL {
            let now = board.metrics();
            info!(
                "cycles {} (+{}), deadline misses {}, snapshots {}, stale cycles {}, \
                servo read failures {}, host packets {}, host commands {}",
                now.cycles,
                now.cycles - last.cycles,
                now.deadline_misses,
                now.snapshots_published,
                now.stale_cycles,
                now.servo_read_failures,
                now.host_packets_sent,
                now.host_commands,
            );
            last = now;
            last_report = Instant::now();
        }
    }

    info!("Shutting down");
    board.shutdown();
    let metrics = board.metrics();
    info!(
        "Final: {} cycles, {} deadline misses, {} snapshots",
        metrics.cycles, metrics.deadline_misses, metrics.snapshots_published
    );
}
