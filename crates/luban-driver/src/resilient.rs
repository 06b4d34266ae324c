//! 弹性传输包装器
//!
//! 持有任意内层 [`Transport`]，自身同样实现 [`Transport`]（组合而非
//! 运行时替换）。每次调用：
//!
//! 1. 熔断决策（跳过 / 探测 / 正常）；
//! 2. 瞬态错误按 [`RetryPolicy`] 重试，指数退避；
//! 3. 致命错误不重试，记账后原样返回；
//! 4. 任意一次成功把该关节的失败计数清零（健康 → 失败中 → 已恢复）。
//!
//! 单个坏关节绝不会中止对健康关节的命令：上层拿到的是逐关节的
//! `Result`/`Option`，而不是整臂失败。

use crate::health::{AccessDecision, HealthConfig, HealthTracker, JointHealth};
use crate::retry::RetryPolicy;
use luban_bus::{BusError, Register, ServoId, Transport};
use std::collections::HashMap;
use tracing::{debug, info, warn};

/// 只读统计快照
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResilienceStats {
    /// 累计发出的重试次数
    pub total_retries: u64,
    /// 失败→成功 的恢复次数
    pub recoveries: u64,
    /// 当前熔断中的关节数
    pub open_circuits: usize,
}

/// 弹性传输
pub struct ResilientTransport<B: Transport> {
    inner: B,
    policy: RetryPolicy,
    health: HealthTracker,
    /// 每个 (寄存器, 关节) 的最近一次成功读数
    fallback: HashMap<(Register, ServoId), i32>,
    total_retries: u64,
    recoveries: u64,
}

impl<B: Transport> ResilientTransport<B> {
    pub fn new(inner: B) -> Self {
        Self::with_policies(inner, RetryPolicy::default(), HealthConfig::default())
    }

    pub fn with_policies(inner: B, policy: RetryPolicy, health: HealthConfig) -> Self {
        Self {
            inner,
            policy,
            health: HealthTracker::new(health),
            fallback: HashMap::new(),
            total_retries: 0,
            recoveries: 0,
        }
    }

    pub fn stats(&self) -> ResilienceStats {
        ResilienceStats {
            total_retries: self.total_retries,
            recoveries: self.recoveries,
            open_circuits: self.health.open_circuits(),
        }
    }

    pub fn health(&self, id: ServoId) -> Option<&JointHealth> {
        self.health.get(id)
    }

    pub fn is_circuit_open(&self, id: ServoId) -> bool {
        self.health.is_circuit_open(id)
    }

    /// 读寄存器，失败时回退到最近一次成功读数
    ///
    /// # 返回值
    ///
    /// - `Some(value)`: 本次读数，或（仍低于熔断阈值时）最近的已知好值
    /// - `None`: 该关节从未成功过，或已熔断
    pub fn read_or_fallback(&mut self, reg: Register, id: ServoId) -> Option<i32> {
        match Transport::read(self, reg, id) {
            Ok(value) => Some(value),
            Err(_) if self.health.is_circuit_open(id) => None,
            Err(_) => self.fallback.get(&(reg, id)).copied(),
        }
    }

    /// 单次直写：不重试、不熔断决策
    ///
    /// 急停路径专用，保证不被退避延迟阻塞。
    pub fn write_direct(&mut self, reg: Register, id: ServoId, value: i32) -> Result<(), BusError> {
        self.inner.write(reg, id, value)
    }

    fn record_success(&mut self, id: ServoId) {
        if self.health.on_success(id) {
            self.recoveries += 1;
            info!(servo = id, "joint recovered");
        }
    }

    fn record_failure(&mut self, id: ServoId, error: &BusError) {
        if self.health.on_failure(id, error.kind()) {
            warn!(servo = id, error = %error, "circuit opened after repeated failures");
        }
    }

    /// 统一的调用路径：熔断决策 → 重试循环 → 健康记账
    fn run<T>(
        &mut self,
        id: ServoId,
        mut op: impl FnMut(&mut B) -> Result<T, BusError>,
    ) -> Result<T, BusError> {
        match self.health.decide(id) {
            AccessDecision::Skip => return Err(BusError::CircuitOpen(id)),
            AccessDecision::Probe => {
                debug!(servo = id, "probing circuit-open joint");
                return match op(&mut self.inner) {
                    Ok(value) => {
                        self.record_success(id);
                        Ok(value)
                    },
                    Err(e) => {
                        self.record_failure(id, &e);
                        Err(e)
                    },
                };
            },
            AccessDecision::Allow => {},
        }

        let mut attempt = 0u32;
        loop {
            match op(&mut self.inner) {
                Ok(value) => {
                    self.record_success(id);
                    return Ok(value);
                },
                Err(e) if e.is_transient() && attempt < self.policy.max_retries => {
                    // 每次失败的尝试都计入健康账本：成功才清零
                    self.record_failure(id, &e);
                    attempt += 1;
                    self.total_retries += 1;
                    let delay = self.policy.delay_for_attempt(attempt);
                    debug!(
                        servo = id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "transient bus error, retrying"
                    );
                    std::thread::sleep(delay);
                },
                Err(e) => {
                    self.record_failure(id, &e);
                    return Err(e);
                },
            }
        }
    }
}

impl<B: Transport> Transport for ResilientTransport<B> {
    fn read(&mut self, reg: Register, id: ServoId) -> Result<i32, BusError> {
        let value = self.run(id, |bus| bus.read(reg, id))?;
        self.fallback.insert((reg, id), value);
        Ok(value)
    }

    fn write(&mut self, reg: Register, id: ServoId, value: i32) -> Result<(), BusError> {
        self.run(id, |bus| bus.write(reg, id, value))
    }

    fn disconnect(&mut self) {
        self.inner.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use luban_bus::mock::{FaultKind, MockBus};
    use std::time::Duration;

    /// 测试用：退避缩短到微秒级
    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            initial_delay: Duration::from_micros(200),
            backoff_factor: 1.5,
            max_delay: Duration::from_millis(2),
        }
    }

    fn fast_health(threshold: u32) -> HealthConfig {
        HealthConfig {
            circuit_threshold: threshold,
            probe_interval: Duration::from_millis(30),
        }
    }

    fn resilient(mock: &MockBus, threshold: u32) -> ResilientTransport<MockBus> {
        ResilientTransport::with_policies(mock.clone(), fast_policy(5), fast_health(threshold))
    }

    /// 不重试的变体：一次调用恰好一次失败记账
    fn resilient_no_retry(mock: &MockBus, threshold: u32) -> ResilientTransport<MockBus> {
        ResilientTransport::with_policies(mock.clone(), fast_policy(0), fast_health(threshold))
    }

    /// 测试瞬态错误被重试吸收：每第 3 次读失败，20 次调用零硬错误
    #[test]
    fn test_transient_errors_absorbed() {
        let mock = MockBus::new(&[1]);
        mock.set_position(1, 1500);
        mock.fail_every_nth_read(3, FaultKind::Voltage);

        let mut bus = resilient(&mock, 10);
        for _ in 0..20 {
            let value = bus.read(Register::PresentPosition, 1).unwrap();
            assert_eq!(value, 1500);
        }
        assert!(bus.stats().total_retries > 0);
        assert!(bus.stats().recoveries > 0);
        assert_eq!(bus.stats().open_circuits, 0);
    }

    /// 测试致命错误不重试、立即返回
    #[test]
    fn test_fatal_error_no_retry() {
        let mock = MockBus::new(&[1]);
        mock.queue_failures(1, FaultKind::Protocol);

        let mut bus = resilient(&mock, 10);
        let reads_before = mock.reads();
        assert!(bus.read(Register::PresentPosition, 1).is_err());
        // 只访问了一次（无重试）
        assert_eq!(mock.reads(), reads_before + 1);
        assert_eq!(bus.stats().total_retries, 0);
    }

    /// 测试从未成功的关节永远返回 None
    #[test]
    fn test_never_succeeded_returns_none() {
        let mock = MockBus::new(&[1]);
        mock.kill_servo(1);

        let mut bus = resilient(&mock, 3);
        for _ in 0..6 {
            assert_eq!(bus.read_or_fallback(Register::PresentPosition, 1), None);
        }
    }

    /// 测试已知好值回退：成功过的关节在熔断前返回最近好值
    #[test]
    fn test_fallback_to_last_known_good() {
        let mock = MockBus::new(&[1]);
        mock.set_position(1, 2345);

        let mut bus = resilient_no_retry(&mock, 3);
        assert_eq!(bus.read_or_fallback(Register::PresentPosition, 1), Some(2345));

        mock.kill_servo(1);
        // 失败 1、2 次：回退到已知好值
        assert_eq!(bus.read_or_fallback(Register::PresentPosition, 1), Some(2345));
        assert_eq!(bus.read_or_fallback(Register::PresentPosition, 1), Some(2345));
        // 第 3 次失败触发熔断：之后返回 None
        assert_eq!(bus.read_or_fallback(Register::PresentPosition, 1), None);
        assert_eq!(bus.read_or_fallback(Register::PresentPosition, 1), None);
        assert_eq!(bus.stats().open_circuits, 1);
    }

    /// 测试熔断中跳过总线访问、探测窗口恢复
    #[test]
    fn test_circuit_probe_and_recovery() {
        let mock = MockBus::new(&[1]);
        mock.set_position(1, 1000);
        let mut bus = resilient_no_retry(&mock, 2);

        mock.kill_servo(1);
        for _ in 0..2 {
            let _ = bus.read(Register::PresentPosition, 1);
        }
        assert!(bus.is_circuit_open(1));

        // 熔断中：立即返回 CircuitOpen，不触碰总线
        let reads_before = mock.reads();
        assert!(matches!(
            bus.read(Register::PresentPosition, 1),
            Err(BusError::CircuitOpen(1))
        ));
        assert_eq!(mock.reads(), reads_before);

        // 探测间隔过后，关节已复活：单次探测成功，熔断闭合
        mock.revive_servo(1);
        std::thread::sleep(Duration::from_millis(35));
        assert_eq!(bus.read(Register::PresentPosition, 1).unwrap(), 1000);
        assert!(!bus.is_circuit_open(1));
        assert_eq!(bus.stats().recoveries, 1);
        assert!(bus.health(1).unwrap().recovered);
    }

    /// 测试坏关节不影响好关节
    #[test]
    fn test_bad_joint_does_not_block_good_joint() {
        let mock = MockBus::new(&[1, 2]);
        mock.set_position(2, 999);
        mock.kill_servo(1);

        let mut bus = resilient_no_retry(&mock, 2);
        let _ = bus.read(Register::PresentPosition, 1);
        let _ = bus.read(Register::PresentPosition, 1);
        assert!(bus.is_circuit_open(1));

        assert_eq!(bus.read(Register::PresentPosition, 2).unwrap(), 999);
        assert_eq!(bus.read_or_fallback(Register::PresentPosition, 2), Some(999));
    }

    /// 测试重试耗尽后瞬态错误原样返回并记账
    #[test]
    fn test_retry_exhaustion() {
        let mock = MockBus::new(&[1]);
        // 队列里足够多的瞬态故障，超过 1 + max_retries 次
        mock.queue_failures(10, FaultKind::PortBusy);

        let mut bus = resilient(&mock, 10);
        let err = bus.read(Register::PresentPosition, 1).unwrap_err();
        assert!(matches!(err, BusError::PortBusy(_)));
        assert_eq!(bus.stats().total_retries, 5);
        // 1 次初始尝试 + 5 次重试，每次失败都记账
        assert_eq!(bus.health(1).unwrap().consecutive_failures, 6);
    }

    /// 测试 write_direct 不重试
    #[test]
    fn test_write_direct_single_attempt() {
        let mock = MockBus::new(&[1]);
        mock.queue_failures(1, FaultKind::PortBusy);

        let mut bus = resilient(&mock, 10);
        assert!(bus.write_direct(Register::TorqueEnable, 1, 0).is_err());
        assert_eq!(bus.stats().total_retries, 0);
        // 第二次直写成功
        assert!(bus.write_direct(Register::TorqueEnable, 1, 0).is_ok());
    }
}
