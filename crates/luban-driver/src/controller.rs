//! 运动控制器
//!
//! 对一条总线上的全部关节下发位置命令，并用混合式算法确认物理到位：
//! 按最大行程估计运动时间，先无条件睡过估计值的 80%（省掉大块运动
//! 期间的无谓轮询），再在剩余窗口内以固定间隔轮询，直到
//! `max_error <= tolerance` **且** 连续两次轮询之间位姿稳定。
//!
//! 纯固定延迟要么超配（浪费节拍）要么欠配（慢速运动误报失败）；
//! 从 t=0 开始纯轮询又会在可预测的大块运动阶段挤占本就紧张的串行
//! 链路。二八分摊把两边的代价都压下来。
//!
//! 验证超时是**软失败**：命令本身已正确下发，只是到位未获确认。
//! 调用方若需要硬保证，检查 [`MotionReport::final_positions`]。

use crate::error::{ConnectError, MotionError};
use crate::health::{HealthConfig, JointHealth};
use crate::resilient::{ResilienceStats, ResilientTransport};
use crate::retry::RetryPolicy;
use luban_bus::{BusError, JointDescriptor, Pose, Register, ServoId, Transport};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// 协作式取消令牌
///
/// 只在验证轮询的间隙检查，绝不打断进行中的串行写入
/// （避免把某个关节留在半条命令上）。
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }
}

/// 一次运动请求；下发后不可变
#[derive(Debug, Clone)]
pub struct MotionRequest {
    /// 目标位姿（长度必须等于关节数）
    pub target: Pose,
    /// 目标速度，下发前夹取到 1..=4000
    pub velocity: u16,
    /// 到位容差（编码器刻度）
    pub tolerance: u16,
    /// 验证轮询窗口的显式上限；`None` 时按行程估计推导
    pub timeout: Option<Duration>,
}

impl MotionRequest {
    pub fn new(target: Pose, velocity: u16, tolerance: u16) -> Self {
        Self {
            target,
            velocity,
            tolerance,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// 一次运动调用的结果
///
/// `verified == false && timed_out == true` 即软失败：命令已发出，
/// 到位未确认。
#[derive(Debug, Clone)]
pub struct MotionReport {
    /// 到位已确认（误差 ≤ 容差且位姿稳定）
    pub verified: bool,
    /// 验证窗口耗尽仍未确认
    pub timed_out: bool,
    /// 被协作式取消
    pub cancelled: bool,
    /// 最后一次轮询的最大误差（全部关节读数失败时为 None）
    pub max_error: Option<u32>,
    /// 最后一次读到的各关节位置（fire-and-forget 时为空）
    pub final_positions: Vec<Option<i32>>,
    pub elapsed: Duration,
}

impl MotionReport {
    fn unverified() -> Self {
        Self {
            verified: false,
            timed_out: false,
            cancelled: false,
            max_error: None,
            final_positions: Vec::new(),
            elapsed: Duration::ZERO,
        }
    }
}

/// 到位验证参数
///
/// 80% 先睡比例和加速度时间补偿来自实机标定，是调参而非正确性契约，
/// 因此全部保持可配置。
#[derive(Debug, Clone)]
pub struct VerifyConfig {
    /// 行程估计中无条件睡眠的比例
    pub sleep_fraction: f64,
    /// 轮询间隔
    pub poll_interval: Duration,
    /// 加速度为 0 时的最大时间补偿（加速度越大补偿越小）
    pub accel_bonus_max: Duration,
    /// 轮询窗口下限
    pub min_poll_window: Duration,
    /// 行程估计上限
    pub max_travel_estimate: Duration,
    /// 连续两次轮询间允许的位姿抖动（刻度）
    pub stability_jitter: u32,
    /// 判定收敛所需的连续达标轮询次数
    pub stable_polls: u32,
    /// 当前位置完全不可读时的行程假定值（刻度）
    pub fallback_distance: u32,
}

impl Default for VerifyConfig {
    fn default() -> Self {
        Self {
            sleep_fraction: 0.8,
            poll_interval: Duration::from_millis(50),
            accel_bonus_max: Duration::from_secs(1),
            min_poll_window: Duration::from_secs(2),
            max_travel_estimate: Duration::from_secs(30),
            stability_jitter: 4,
            stable_polls: 2,
            fallback_distance: 1024,
        }
    }
}

/// 速度到加速度的派生：`min(velocity * 255 / 4000, 255)`
pub(crate) fn acceleration_for(velocity: u16) -> u8 {
    (u32::from(velocity) * 255 / 4000).min(255) as u8
}

/// 单条总线的运动控制器
///
/// 一个实例对应一个物理端口；并发所有权由上层 `PortRegistry` 保证，
/// 本层假设调用已经串行化。
pub struct MotionController<B: Transport> {
    port_label: String,
    joints: Vec<JointDescriptor>,
    opener: Box<dyn FnMut() -> Result<B, BusError> + Send>,
    bus: Option<ResilientTransport<B>>,
    verify: VerifyConfig,
    retry: RetryPolicy,
    health_config: HealthConfig,
    default_tolerance: u16,
}

impl<B: Transport> MotionController<B> {
    /// 创建控制器
    ///
    /// # 参数
    ///
    /// - `port_label`: 端口标识（日志与错误信息用）
    /// - `joints`: 关节顺序即 `Pose` 的位置顺序
    /// - `default_tolerance`: `set_positions` 使用的到位容差
    /// - `opener`: 打开底层总线的工厂，`connect()` 时调用
    pub fn new(
        port_label: impl Into<String>,
        joints: Vec<JointDescriptor>,
        default_tolerance: u16,
        opener: impl FnMut() -> Result<B, BusError> + Send + 'static,
    ) -> Self {
        Self {
            port_label: port_label.into(),
            joints,
            opener: Box::new(opener),
            bus: None,
            verify: VerifyConfig::default(),
            retry: RetryPolicy::default(),
            health_config: HealthConfig::default(),
            default_tolerance,
        }
    }

    pub fn with_verify_config(mut self, verify: VerifyConfig) -> Self {
        self.verify = verify;
        self
    }

    pub fn with_resilience(mut self, retry: RetryPolicy, health: HealthConfig) -> Self {
        self.retry = retry;
        self.health_config = health;
        self
    }

    pub fn port_label(&self) -> &str {
        &self.port_label
    }

    pub fn joints(&self) -> &[JointDescriptor] {
        &self.joints
    }

    pub fn joint_count(&self) -> usize {
        self.joints.len()
    }

    pub fn is_connected(&self) -> bool {
        self.bus.is_some()
    }

    /// 打开底层传输
    ///
    /// 幂等：已连接时直接返回 `Ok`。这是唯一向调用方抛硬错误的路径。
    pub fn connect(&mut self) -> Result<(), ConnectError> {
        if self.bus.is_some() {
            return Ok(());
        }
        let raw = (self.opener)().map_err(|e| ConnectError::Open {
            port: self.port_label.clone(),
            source: e,
        })?;
        self.bus = Some(ResilientTransport::with_policies(
            raw,
            self.retry.clone(),
            self.health_config.clone(),
        ));
        info!(port = %self.port_label, "transport connected");
        Ok(())
    }

    pub fn disconnect(&mut self) {
        if let Some(mut bus) = self.bus.take() {
            bus.disconnect();
            info!(port = %self.port_label, "transport disconnected");
        }
    }

    /// 逐关节读当前位置
    ///
    /// 单关节失败不构成整体错误：成功过的关节回退到最近好值，
    /// 从未成功或已熔断的关节为 `None`。
    pub fn read_positions(&mut self) -> Vec<Option<i32>> {
        let Some(bus) = self.bus.as_mut() else {
            return vec![None; self.joints.len()];
        };
        self.joints
            .iter()
            .map(|j| bus.read_or_fallback(Register::PresentPosition, j.id))
            .collect()
    }

    /// 弹性层统计快照（未连接时为 None）
    pub fn resilience_stats(&self) -> Option<ResilienceStats> {
        self.bus.as_ref().map(|b| b.stats())
    }

    pub fn joint_health(&self, id: ServoId) -> Option<&JointHealth> {
        self.bus.as_ref().and_then(|b| b.health(id))
    }

    /// 下发目标位姿
    ///
    /// # 参数
    ///
    /// - `wait`: 为 true 时运行到位验证；否则发完即返回
    /// - `keep_connection`: 本次调用自行打开传输时，结束后是否保持连接
    ///
    /// # 错误
    ///
    /// 只有位姿长度不符和（本调用内的）连接失败返回 `Err`；
    /// 验证超时是软失败，见 [`MotionReport`]。
    pub fn set_positions(
        &mut self,
        target: &Pose,
        velocity: u16,
        wait: bool,
        keep_connection: bool,
    ) -> Result<MotionReport, MotionError> {
        let request = MotionRequest::new(target.clone(), velocity, self.default_tolerance);
        self.execute(&request, &CancelToken::new(), wait, keep_connection, &mut |_| {})
    }

    /// `set_positions` 的完整形态：显式请求 + 取消令牌 + 进度回调
    ///
    /// 后台任务（MotionJob）走这条路径。
    pub fn execute(
        &mut self,
        request: &MotionRequest,
        cancel: &CancelToken,
        wait: bool,
        keep_connection: bool,
        progress: &mut dyn FnMut(String),
    ) -> Result<MotionReport, MotionError> {
        if request.target.len() != self.joints.len() {
            return Err(MotionError::PoseLength {
                expected: self.joints.len(),
                actual: request.target.len(),
            });
        }

        let opened_here = self.bus.is_none();
        self.connect()?;
        let started = Instant::now();

        let velocity = request.velocity.clamp(1, 4000);
        let accel = acceleration_for(velocity);

        // 尽力读当前位置估算最大行程；完全读不到就用假定值
        let current = self.read_positions();
        let max_distance = current
            .iter()
            .enumerate()
            .filter_map(|(i, pos)| pos.map(|p| (request.target[i] - p).unsigned_abs()))
            .max()
            .unwrap_or(self.verify.fallback_distance);

        progress(format!(
            "issuing move to {} joints (velocity {velocity}, accel {accel}, distance {max_distance})",
            self.joints.len()
        ));
        self.issue_commands(&request.target, velocity, accel);

        let mut report = if wait {
            self.verify_arrival(request, velocity, accel, max_distance, cancel, progress)
        } else {
            MotionReport::unverified()
        };
        report.elapsed = started.elapsed();

        if opened_here && !keep_connection {
            self.disconnect();
        }
        Ok(report)
    }

    /// 急停：逐关节卸力，尽力而为
    ///
    /// 单次直写（无重试），吞掉单关节错误，绝不等待验证。
    pub fn emergency_stop(&mut self) {
        let Some(bus) = self.bus.as_mut() else {
            warn!(port = %self.port_label, "emergency stop requested while disconnected");
            return;
        };
        for joint in &self.joints {
            if let Err(e) = bus.write_direct(Register::TorqueEnable, joint.id, 0) {
                warn!(joint = %joint.name, error = %e, "torque disable failed");
            }
        }
        info!(port = %self.port_label, "emergency stop issued");
    }

    /// 逐关节下发：扭矩使能 → 速度/加速度 → 目标位置，顺序固定
    ///
    /// 验证开始前保证全部写入已经完成。单关节失败只跳过该关节。
    fn issue_commands(&mut self, target: &Pose, velocity: u16, accel: u8) {
        let Some(bus) = self.bus.as_mut() else {
            return;
        };
        for (i, joint) in self.joints.iter().enumerate() {
            if let Err(e) = bus.write(Register::TorqueEnable, joint.id, 1) {
                warn!(joint = %joint.name, error = %e, "torque enable failed, joint skipped");
                continue;
            }
            if let Err(e) = bus.write(Register::GoalVelocity, joint.id, i32::from(velocity)) {
                warn!(joint = %joint.name, error = %e, "velocity write failed");
            }
            if let Err(e) = bus.write(Register::Acceleration, joint.id, i32::from(accel)) {
                warn!(joint = %joint.name, error = %e, "acceleration write failed");
            }
            if let Err(e) = bus.write(Register::GoalPosition, joint.id, target[i]) {
                warn!(joint = %joint.name, error = %e, "goal position write failed");
            }
        }
    }

    /// 混合式到位验证：先睡过行程估计的大头，再轮询剩余窗口
    fn verify_arrival(
        &mut self,
        request: &MotionRequest,
        velocity: u16,
        accel: u8,
        max_distance: u32,
        cancel: &CancelToken,
        progress: &mut dyn FnMut(String),
    ) -> MotionReport {
        let cfg = self.verify.clone();

        // 行程估计：距离/速度 + 加速度补偿（加速度越小，爬坡越慢，补偿越多）
        let travel = Duration::from_secs_f64(f64::from(max_distance) / f64::from(velocity));
        let bonus = cfg.accel_bonus_max.mul_f64(1.0 - f64::from(accel) / 255.0);
        let estimate = (travel + bonus).min(cfg.max_travel_estimate);

        let bulk = estimate.mul_f64(cfg.sleep_fraction);
        let window = request
            .timeout
            .unwrap_or_else(|| estimate.mul_f64(0.5).max(cfg.min_poll_window));

        progress(format!(
            "travel estimate {:.2}s, sleeping {:.2}s before polling (window {:.2}s)",
            estimate.as_secs_f64(),
            bulk.as_secs_f64(),
            window.as_secs_f64()
        ));

        if !sleep_cancellable(bulk, cfg.poll_interval, cancel) {
            return self.cancelled_report();
        }

        let deadline = Instant::now() + window;
        let tolerance = u32::from(request.tolerance);
        let mut previous: Option<Vec<Option<i32>>> = None;
        let mut streak = 0u32;
        let mut last_error: Option<u32> = None;
        let mut last_positions: Vec<Option<i32>> = Vec::new();

        loop {
            if cancel.is_cancelled() {
                return self.cancelled_report();
            }

            let positions = self.read_positions();
            let max_error = max_error_of(&positions, &request.target);
            let stable = previous
                .as_ref()
                .map(|prev| pose_jitter(prev, &positions) <= cfg.stability_jitter)
                .unwrap_or(false);

            match max_error {
                Some(err) if err <= tolerance => {
                    // 接近还不够：位姿还得在连续轮询间停稳
                    if stable || cfg.stable_polls <= 1 {
                        streak += 1;
                    } else {
                        streak = 1;
                    }
                    if streak >= cfg.stable_polls {
                        debug!(port = %self.port_label, max_error = err, "arrival verified");
                        return MotionReport {
                            verified: true,
                            timed_out: false,
                            cancelled: false,
                            max_error,
                            final_positions: positions,
                            elapsed: Duration::ZERO,
                        };
                    }
                },
                _ => streak = 0,
            }

            last_error = max_error;
            last_positions = positions.clone();
            previous = Some(positions);

            if Instant::now() >= deadline {
                // 软失败：命令已发出，到位未确认
                warn!(
                    port = %self.port_label,
                    max_error = ?last_error,
                    window_s = window.as_secs_f64(),
                    "position verification timed out, arrival unconfirmed"
                );
                progress("verification window elapsed, arrival unconfirmed".to_string());
                return MotionReport {
                    verified: false,
                    timed_out: true,
                    cancelled: false,
                    max_error: last_error,
                    final_positions: last_positions,
                    elapsed: Duration::ZERO,
                };
            }

            if !sleep_cancellable(cfg.poll_interval, cfg.poll_interval, cancel) {
                return self.cancelled_report();
            }
        }
    }

    fn cancelled_report(&mut self) -> MotionReport {
        debug!(port = %self.port_label, "motion cancelled between polls");
        let positions = self.read_positions();
        MotionReport {
            verified: false,
            timed_out: false,
            cancelled: true,
            max_error: None,
            final_positions: positions,
            elapsed: Duration::ZERO,
        }
    }
}

/// 可取消的分段睡眠；返回 false 表示被取消
fn sleep_cancellable(total: Duration, chunk: Duration, cancel: &CancelToken) -> bool {
    let deadline = Instant::now() + total;
    loop {
        if cancel.is_cancelled() {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        std::thread::sleep((deadline - now).min(chunk));
    }
}

/// 可读关节上的最大绝对误差；全部不可读时为 None
fn max_error_of(positions: &[Option<i32>], target: &Pose) -> Option<u32> {
    positions
        .iter()
        .enumerate()
        .filter_map(|(i, pos)| pos.map(|p| (target[i] - p).unsigned_abs()))
        .max()
}

/// 连续两次轮询间的最大位姿变化；不可比的关节忽略
fn pose_jitter(prev: &[Option<i32>], current: &[Option<i32>]) -> u32 {
    prev.iter()
        .zip(current.iter())
        .filter_map(|(a, b)| match (a, b) {
            (Some(a), Some(b)) => Some((a - b).unsigned_abs()),
            _ => None,
        })
        .max()
        .unwrap_or(u32::MAX)
}
