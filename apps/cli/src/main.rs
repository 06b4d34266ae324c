//! # Luban CLI
//!
//! 机械臂监督层的操作工具。
//!
//! ```bash
//! # 单臂归位
//! luban-cli --config fleet.toml home --arm left
//!
//! # 全部臂并行归位
//! luban-cli --config fleet.toml home --all --parallel
//!
//! # 查询当前位置 / 订阅遥测 / 急停
//! luban-cli --config fleet.toml position --arm left
//! luban-cli --config fleet.toml monitor --arm left
//! luban-cli --config fleet.toml stop
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use luban_supervisor::{ArmOptions, FleetConfig, PortRegistry};
use std::path::PathBuf;
use std::sync::Arc;

mod commands;

/// Luban CLI - 机械臂操作工具
#[derive(Parser, Debug)]
#[command(name = "luban-cli")]
#[command(about = "Command-line operator tool for Luban arm supervision", long_about = None)]
#[command(version)]
struct Cli {
    /// 机队配置文件（TOML）
    #[arg(short, long, default_value = "fleet.toml")]
    config: PathBuf,

    /// 日志级别（RUST_LOG 环境变量优先）
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// 归位：单臂或全部，串行或并行
    Home {
        /// 臂名（与 --all 二选一）
        #[arg(long)]
        arm: Option<String>,

        /// 归位全部臂
        #[arg(long)]
        all: bool,

        /// 并行归位（默认串行）
        #[arg(long)]
        parallel: bool,

        /// 覆盖配置中的归位速度
        #[arg(long)]
        velocity: Option<u16>,
    },

    /// 查询当前关节位置
    Position {
        #[arg(long)]
        arm: String,
    },

    /// 订阅遥测并打印快照
    Monitor {
        #[arg(long)]
        arm: String,

        /// 监视时长（秒），0 = 直到 Ctrl+C
        #[arg(long, default_value_t = 0)]
        seconds: u64,
    },

    /// 急停（单臂或全部）
    Stop {
        #[arg(long)]
        arm: Option<String>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    let text = std::fs::read_to_string(&cli.config)
        .with_context(|| format!("reading config {}", cli.config.display()))?;
    let fleet = FleetConfig::from_toml_str(&text)
        .with_context(|| format!("parsing config {}", cli.config.display()))?;

    let registry = Arc::new(PortRegistry::feetech(ArmOptions::default()));

    let result = match cli.command {
        Commands::Home {
            arm,
            all,
            parallel,
            velocity,
        } => commands::home(&registry, &fleet, arm, all, parallel, velocity),
        Commands::Position { arm } => commands::position(&registry, &fleet, &arm),
        Commands::Monitor { arm, seconds } => commands::monitor(&registry, &fleet, &arm, seconds),
        Commands::Stop { arm } => commands::stop(&registry, &fleet, arm),
    };

    // 退出前统一拆除，释放端口
    registry.disconnect_all();
    result
}

fn init_tracing(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
