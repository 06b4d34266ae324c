//! 子命令实现

use anyhow::{Context, Result, bail};
use crossbeam_channel::RecvTimeoutError;
use luban_bus::FeetechBus;
use luban_supervisor::{
    ArmConfig, FleetConfig, MotionOrchestrator, OrchestratorEvent, PortRegistry, RunMode,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

type Registry = Arc<PortRegistry<FeetechBus>>;

fn find_arm<'a>(fleet: &'a FleetConfig, name: &str) -> Result<&'a ArmConfig> {
    fleet
        .arm(name)
        .with_context(|| format!("arm '{name}' not found in config"))
}

/// 安装 Ctrl+C 标志（每次进程只装一次）
fn interrupt_flag() -> Result<Arc<AtomicBool>> {
    let flag = Arc::new(AtomicBool::new(false));
    let flag_for_handler = flag.clone();
    ctrlc::set_handler(move || {
        flag_for_handler.store(true, Ordering::SeqCst);
    })
    .context("installing Ctrl+C handler")?;
    Ok(flag)
}

/// `home`：驱动编排器归位，转发事件到终端
pub fn home(
    registry: &Registry,
    fleet: &FleetConfig,
    arm: Option<String>,
    all: bool,
    parallel: bool,
    velocity: Option<u16>,
) -> Result<()> {
    let indexes: Vec<usize> = match (&arm, all) {
        (Some(name), false) => {
            let index = fleet
                .arms
                .iter()
                .position(|a| &a.name == name)
                .with_context(|| format!("arm '{name}' not found in config"))?;
            vec![index]
        },
        (None, true) => Vec::new(), // 空 = 全部
        _ => bail!("specify exactly one of --arm <name> or --all"),
    };
    let mode = if parallel {
        RunMode::Parallel
    } else {
        RunMode::Sequential
    };

    let (mut orchestrator, events) = MotionOrchestrator::new(registry.clone(), fleet.arms.clone());
    if !orchestrator.start(mode, &indexes, velocity) {
        bail!("orchestrator rejected the request (busy or invalid selection)");
    }

    let interrupted = interrupt_flag()?;
    let mut cancelling = false;
    loop {
        if interrupted.load(Ordering::SeqCst) && !cancelling {
            eprintln!("⚠️  中断：取消归位并急停...");
            orchestrator.cancel_all();
            registry.emergency_stop_all();
            cancelling = true;
        }

        match events.recv_timeout(Duration::from_millis(100)) {
            Ok(OrchestratorEvent::ArmStarted { arm, .. }) => {
                println!("▶️  {arm}: homing started");
            },
            Ok(OrchestratorEvent::Progress { arm, message, .. }) => {
                tracing::debug!(arm = %arm, message = %message, "progress");
            },
            Ok(OrchestratorEvent::ArmFinished {
                arm,
                success,
                message,
                ..
            }) => {
                let mark = if success { "✅" } else { "❌" };
                println!("{mark} {arm}: {message}");
            },
            Ok(OrchestratorEvent::Finished { success }) => {
                orchestrator.wait(Duration::from_secs(5));
                if success {
                    println!("✅ 归位完成");
                    return Ok(());
                }
                bail!("homing finished with failures");
            },
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => bail!("orchestrator event channel closed"),
        }
    }
}

/// `position`：一次性读取并打印关节位置
pub fn position(registry: &Registry, fleet: &FleetConfig, arm: &str) -> Result<()> {
    let config = find_arm(fleet, arm)?;
    let handle = registry.get_handle(config);
    handle
        .connect()
        .with_context(|| format!("connecting {}", config.port))?;

    println!("📊 {arm} 关节位置:");
    let positions = handle.read_positions();
    for (joint, pos) in config.joints.iter().zip(positions) {
        match pos {
            Some(p) => println!("  {:<16} {p}", joint.name),
            None => println!("  {:<16} <unreadable>", joint.name),
        }
    }
    Ok(())
}

/// `monitor`：订阅遥测快照打印，直到 Ctrl+C 或时限
pub fn monitor(registry: &Registry, fleet: &FleetConfig, arm: &str, seconds: u64) -> Result<()> {
    let config = find_arm(fleet, arm)?;
    let handle = registry.get_handle(config);
    handle
        .connect()
        .with_context(|| format!("connecting {}", config.port))?;

    let joint_names: Vec<String> = config.joints.iter().map(|j| j.name.clone()).collect();
    let subscription = handle.subscribe(move |snapshot| {
        let cells: Vec<String> = snapshot
            .readings
            .iter()
            .zip(&joint_names)
            .map(|(reading, name)| match reading {
                Some(r) => format!("{name}={} ({}°C)", r.position, r.temperature),
                None => format!("{name}=--"),
            })
            .collect();
        println!("[{}] {}", snapshot.arm, cells.join("  "));
    });

    println!("👀 monitoring {arm}, Ctrl+C to stop");
    let interrupted = interrupt_flag()?;
    let deadline = (seconds > 0).then(|| Instant::now() + Duration::from_secs(seconds));
    while !interrupted.load(Ordering::SeqCst) {
        if let Some(deadline) = deadline
            && Instant::now() >= deadline
        {
            break;
        }
        std::thread::sleep(Duration::from_millis(50));
    }

    handle.unsubscribe(subscription);
    Ok(())
}

/// `stop`：急停单臂或全部臂
pub fn stop(registry: &Registry, fleet: &FleetConfig, arm: Option<String>) -> Result<()> {
    let targets: Vec<&ArmConfig> = match &arm {
        Some(name) => vec![find_arm(fleet, name)?],
        None => fleet.arms.iter().collect(),
    };

    for config in &targets {
        let handle = registry.get_handle(config);
        if let Err(e) = handle.connect() {
            eprintln!("⚠️  {}: {e}", config.name);
        }
    }
    registry.emergency_stop_all();
    println!("🛑 emergency stop issued to {} arm(s)", targets.len());
    Ok(())
}
