//! 端口注册表与臂句柄
//!
//! 一个物理串口最多只有一个活着的 [`MotionController`]，由
//! [`PortRegistry::get_handle`] 统一发放：首次请求时创建，之后所有
//! 调用方拿到同一个句柄。这是防止同一串口被独立打开两次的唯一机制，
//! 调用方自己永远不负责仲裁。
//!
//! 句柄内的总线访问以**单次事务**为粒度加锁（[`SharedBus`]）：
//! 命令下发和后台遥测采样绝不会在一笔总线事务中途互相插入。
//!
//! 首次连接成功后启动采样线程（默认 5 Hz），整臂快照推送给全部
//! 订阅者；订阅者不持有端口，也弄不坏别的订阅者。

use crate::config::ArmConfig;
use crate::telemetry::{JointReading, SubscriberId, SubscriberSet, TelemetrySnapshot};
use crate::thread_util::JoinTimeout;
use arc_swap::ArcSwapOption;
use luban_bus::{BusError, JointDescriptor, Pose, Register, ServoId, Transport};
use luban_driver::{
    CancelToken, ConnectError, HealthConfig, MotionController, MotionError, MotionReport,
    MotionRequest, ResilienceStats, RetryPolicy, VerifyConfig,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// 遥测采样参数
#[derive(Debug, Clone)]
pub struct SamplerConfig {
    /// 采样周期（默认 200ms，即 5 Hz）
    pub interval: Duration,
    pub enabled: bool,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(200),
            enabled: true,
        }
    }
}

/// 句柄创建参数（注册表级别统一配置）
#[derive(Debug, Clone, Default)]
pub struct ArmOptions {
    pub verify: VerifyConfig,
    pub retry: RetryPolicy,
    pub health: HealthConfig,
    pub sampler: SamplerConfig,
}

/// 事务粒度互斥的共享总线
///
/// 命令路径与采样线程各持一个克隆，每次 `read`/`write` 单独加锁，
/// 两边在事务间自然交错，事务中途绝不互相打断。
pub struct SharedBus<B: Transport> {
    inner: Arc<Mutex<Option<B>>>,
}

impl<B: Transport> Clone for SharedBus<B> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<B: Transport> SharedBus<B> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(None)),
        }
    }

    pub fn install(&self, bus: B) {
        *self.inner.lock() = Some(bus);
    }

    pub fn is_connected(&self) -> bool {
        self.inner.lock().is_some()
    }
}

impl<B: Transport> Default for SharedBus<B> {
    fn default() -> Self {
        Self::new()
    }
}

impl<B: Transport> Transport for SharedBus<B> {
    fn read(&mut self, reg: Register, id: ServoId) -> Result<i32, BusError> {
        match self.inner.lock().as_mut() {
            Some(bus) => bus.read(reg, id),
            None => Err(BusError::NotConnected),
        }
    }

    fn write(&mut self, reg: Register, id: ServoId, value: i32) -> Result<(), BusError> {
        match self.inner.lock().as_mut() {
            Some(bus) => bus.write(reg, id, value),
            None => Err(BusError::NotConnected),
        }
    }

    fn disconnect(&mut self) {
        if let Some(mut bus) = self.inner.lock().take() {
            bus.disconnect();
        }
    }
}

struct SamplerWorker {
    handle: JoinHandle<()>,
    shutdown: Arc<AtomicBool>,
}

/// 一条臂的共享句柄
///
/// 注册表保证同一端口全进程只有一个未退休的实例。
pub struct ArmHandle<B: Transport + Send + 'static> {
    name: String,
    port: String,
    joints: Vec<JointDescriptor>,
    controller: Mutex<MotionController<SharedBus<B>>>,
    shared: SharedBus<B>,
    subscribers: SubscriberSet,
    last_snapshot: ArcSwapOption<TelemetrySnapshot>,
    sampler: Mutex<Option<SamplerWorker>>,
    sampler_config: SamplerConfig,
    closed: AtomicBool,
}

impl<B: Transport + Send + 'static> ArmHandle<B> {
    pub(crate) fn new(
        config: &ArmConfig,
        options: &ArmOptions,
        mut open_bus: impl FnMut() -> Result<B, BusError> + Send + 'static,
    ) -> Arc<Self> {
        let shared = SharedBus::new();
        let shared_for_opener = shared.clone();
        let opener = move || {
            if !shared_for_opener.is_connected() {
                shared_for_opener.install(open_bus()?);
            }
            Ok(shared_for_opener.clone())
        };

        let controller = MotionController::new(
            config.port.clone(),
            config.joint_descriptors(),
            config.position_tolerance,
            opener,
        )
        .with_verify_config(options.verify.clone())
        .with_resilience(options.retry.clone(), options.health.clone());

        Arc::new(Self {
            name: config.name.clone(),
            port: config.port.clone(),
            joints: config.joint_descriptors(),
            controller: Mutex::new(controller),
            shared,
            subscribers: SubscriberSet::new(),
            last_snapshot: ArcSwapOption::empty(),
            sampler: Mutex::new(None),
            sampler_config: options.sampler.clone(),
            closed: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn port(&self) -> &str {
        &self.port
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn is_connected(&self) -> bool {
        self.shared.is_connected()
    }

    /// 打开传输并启动遥测采样
    ///
    /// 幂等。这是唯一向调用方抛硬错误的路径。
    pub fn connect(self: &Arc<Self>) -> Result<(), ConnectError> {
        self.controller.lock().connect()?;
        self.start_sampler();
        Ok(())
    }

    /// 停采样、放传输、把句柄标记为退休
    ///
    /// 之后对同一端口的 `get_handle` 会创建全新实例。
    pub fn disconnect(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.stop_sampler();
        self.controller.lock().disconnect();
        info!(arm = %self.name, port = %self.port, "arm handle retired");
    }

    pub fn read_positions(&self) -> Vec<Option<i32>> {
        self.controller.lock().read_positions()
    }

    /// 下发目标位姿（保持连接，供交互式调用方使用）
    pub fn set_positions(
        &self,
        target: &Pose,
        velocity: u16,
        wait: bool,
    ) -> Result<MotionReport, MotionError> {
        self.controller.lock().set_positions(target, velocity, wait, true)
    }

    /// 完整形态：带取消令牌和进度回调（MotionJob 走这条路径）
    pub fn execute(
        &self,
        request: &MotionRequest,
        cancel: &CancelToken,
        progress: &mut dyn FnMut(String),
    ) -> Result<MotionReport, MotionError> {
        self.controller.lock().execute(request, cancel, true, true, progress)
    }

    /// 急停：逐关节卸力
    ///
    /// 不经过控制器锁：运动占锁期间急停也必须立即落到总线。
    pub fn emergency_stop(&self) {
        if !self.shared.is_connected() {
            warn!(arm = %self.name, "emergency stop requested while disconnected");
            return;
        }
        let mut bus = self.shared.clone();
        for joint in &self.joints {
            if let Err(e) = bus.write(Register::TorqueEnable, joint.id, 0) {
                warn!(arm = %self.name, joint = %joint.name, error = %e, "torque disable failed");
            }
        }
        info!(arm = %self.name, "emergency stop issued");
    }

    /// 订阅遥测快照
    pub fn subscribe(
        &self,
        callback: impl Fn(&TelemetrySnapshot) + Send + Sync + 'static,
    ) -> SubscriberId {
        self.subscribers.subscribe(callback)
    }

    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        self.subscribers.unsubscribe(id)
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// 最近一次采样快照（尚未采样过为 None）
    pub fn last_telemetry(&self) -> Option<Arc<TelemetrySnapshot>> {
        self.last_snapshot.load_full()
    }

    pub fn resilience_stats(&self) -> Option<ResilienceStats> {
        self.controller.lock().resilience_stats()
    }

    fn start_sampler(self: &Arc<Self>) {
        if !self.sampler_config.enabled {
            return;
        }
        let mut slot = self.sampler.lock();
        if slot.is_some() {
            return;
        }

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_for_thread = shutdown.clone();
        let weak = Arc::downgrade(self);
        let interval = self.sampler_config.interval;
        let handle = std::thread::spawn(move || {
            sampler_loop(weak, interval, shutdown_for_thread);
        });

        *slot = Some(SamplerWorker { handle, shutdown });
        debug!(arm = %self.name, interval_ms = self.sampler_config.interval.as_millis() as u64, "telemetry sampler started");
    }

    fn stop_sampler(&self) {
        let worker = self.sampler.lock().take();
        if let Some(worker) = worker {
            worker.shutdown.store(true, Ordering::Relaxed);
            if worker.handle.join_timeout(Duration::from_secs(2)).is_err() {
                warn!(arm = %self.name, "sampler thread did not stop in time");
            }
        }
    }

    /// 读一份整臂快照；单关节任一寄存器失败即记 `None`
    fn sample(&self) -> TelemetrySnapshot {
        let mut bus = self.shared.clone();
        let readings = self.joints.iter().map(|j| read_joint(&mut bus, j.id)).collect();
        TelemetrySnapshot {
            arm: self.name.clone(),
            readings,
            taken_at: Instant::now(),
        }
    }
}

/// 采样线程主体
///
/// 持弱引用：句柄被丢弃后线程自行退出，不会把句柄钉在内存里。
fn sampler_loop<B: Transport + Send + 'static>(
    handle: Weak<ArmHandle<B>>,
    interval: Duration,
    shutdown: Arc<AtomicBool>,
) {
    while !shutdown.load(Ordering::Relaxed) {
        let started = Instant::now();

        let Some(arm) = handle.upgrade() else { break };
        if arm.is_closed() {
            break;
        }
        let snapshot = arm.sample();
        arm.last_snapshot.store(Some(Arc::new(snapshot.clone())));
        arm.subscribers.publish(&snapshot);
        drop(arm);

        let elapsed = started.elapsed();
        if elapsed < interval {
            spin_sleep::sleep(interval - elapsed);
        }
    }
}

/// 采样单个关节的全部寄存器
fn read_joint<B: Transport>(bus: &mut SharedBus<B>, id: ServoId) -> Option<JointReading> {
    Some(JointReading {
        position: bus.read(Register::PresentPosition, id).ok()?,
        goal: bus.read(Register::GoalPosition, id).ok()?,
        velocity: bus.read(Register::PresentVelocity, id).ok()?,
        load: bus.read(Register::PresentLoad, id).ok()?,
        temperature: bus.read(Register::PresentTemperature, id).ok()?,
        current: bus.read(Register::PresentCurrent, id).ok()?,
        voltage: bus.read(Register::PresentVoltage, id).ok()?,
        moving: bus.read(Register::Moving, id).ok()? != 0,
    })
}

/// 端口注册表：单一所有权仲裁
pub struct PortRegistry<B: Transport + Send + 'static> {
    handles: Mutex<HashMap<String, Arc<ArmHandle<B>>>>,
    factory: Arc<dyn Fn(&ArmConfig) -> Result<B, BusError> + Send + Sync>,
    options: ArmOptions,
}

impl<B: Transport + Send + 'static> PortRegistry<B> {
    /// 创建注册表
    ///
    /// # 参数
    ///
    /// - `factory`: 底层总线工厂，句柄首次 `connect()` 时按臂配置调用
    pub fn new(
        options: ArmOptions,
        factory: impl Fn(&ArmConfig) -> Result<B, BusError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            handles: Mutex::new(HashMap::new()),
            factory: Arc::new(factory),
            options,
        }
    }

    /// 获取端口的唯一句柄；不存在或已退休时创建
    pub fn get_handle(&self, config: &ArmConfig) -> Arc<ArmHandle<B>> {
        let mut handles = self.handles.lock();
        if let Some(existing) = handles.get(&config.port)
            && !existing.is_closed()
        {
            return existing.clone();
        }

        let factory = self.factory.clone();
        let cfg = config.clone();
        let handle = ArmHandle::new(config, &self.options, move || factory(&cfg));
        handles.insert(config.port.clone(), handle.clone());
        debug!(arm = %config.name, port = %config.port, "motion controller handle created");
        handle
    }

    /// 退休一个端口的句柄（停采样、放传输）
    pub fn disconnect(&self, port: &str) {
        let handle = self.handles.lock().remove(port);
        if let Some(handle) = handle {
            handle.disconnect();
        }
    }

    /// 退休全部句柄（进程关闭路径）
    pub fn disconnect_all(&self) {
        let handles: Vec<_> = self.handles.lock().drain().map(|(_, h)| h).collect();
        for handle in handles {
            handle.disconnect();
        }
    }

    /// 急停扇出到每个活着的句柄，单臂失败互不影响
    pub fn emergency_stop_all(&self) {
        let handles: Vec<_> = self.handles.lock().values().cloned().collect();
        for handle in handles {
            handle.emergency_stop();
        }
    }

    pub fn live_ports(&self) -> Vec<String> {
        self.handles.lock().keys().cloned().collect()
    }
}

impl PortRegistry<luban_bus::FeetechBus> {
    /// 真实硬件注册表：按臂配置打开 Feetech 串口
    pub fn feetech(options: ArmOptions) -> Self {
        Self::new(options, |cfg: &ArmConfig| {
            luban_bus::FeetechBus::open(&cfg.port, cfg.baud_rate)
        })
    }
}
