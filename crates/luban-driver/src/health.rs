//! 关节健康记账与熔断
//!
//! 健康状态只由 [`ResilientTransport`](crate::ResilientTransport) 持有和
//! 修改，其他组件一律只读。状态机只有一条转换路径：
//! 健康 → 失败中 → 已恢复（任意一次成功即清零失败计数）。
//!
//! 连续失败达到阈值后关节进入熔断：常规调用直接跳过，按固定间隔
//! 放行单次探测，既不浪费重试预算，又能发现重新接上的关节。

use luban_bus::{BusErrorKind, ServoId};
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// 单个关节的健康状态
#[derive(Debug, Clone)]
pub struct JointHealth {
    /// 连续失败次数（成功即清零）
    pub consecutive_failures: u32,
    /// 最近一次失败的分类
    pub last_error: Option<BusErrorKind>,
    /// 最近一次访问（成功或失败）的时刻
    pub last_attempt: Instant,
    /// 是否经历过 失败→成功 的恢复
    pub recovered: bool,
}

impl JointHealth {
    fn new() -> Self {
        Self {
            consecutive_failures: 0,
            last_error: None,
            last_attempt: Instant::now(),
            recovered: false,
        }
    }
}

/// 熔断参数
#[derive(Debug, Clone)]
pub struct HealthConfig {
    /// 熔断阈值（连续失败次数）
    pub circuit_threshold: u32,
    /// 熔断后的探测间隔
    pub probe_interval: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            circuit_threshold: 10,
            probe_interval: Duration::from_secs(1),
        }
    }
}

/// 一次访问前的决策
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessDecision {
    /// 正常访问（允许重试）
    Allow,
    /// 熔断中，放行单次探测（不重试）
    Probe,
    /// 熔断中且未到探测时间，本次跳过
    Skip,
}

/// 全部关节的健康账本
pub struct HealthTracker {
    config: HealthConfig,
    joints: HashMap<ServoId, JointHealth>,
}

impl HealthTracker {
    pub fn new(config: HealthConfig) -> Self {
        Self {
            config,
            joints: HashMap::new(),
        }
    }

    /// 访问前决策：正常 / 探测 / 跳过
    pub fn decide(&mut self, id: ServoId) -> AccessDecision {
        let probe_interval = self.config.probe_interval;
        let threshold = self.config.circuit_threshold;
        let health = self.joints.entry(id).or_insert_with(JointHealth::new);

        if health.consecutive_failures < threshold {
            AccessDecision::Allow
        } else if health.last_attempt.elapsed() >= probe_interval {
            AccessDecision::Probe
        } else {
            AccessDecision::Skip
        }
    }

    /// 记一次成功；返回是否构成一次恢复（失败计数从非零清零）
    pub fn on_success(&mut self, id: ServoId) -> bool {
        let health = self.joints.entry(id).or_insert_with(JointHealth::new);
        health.last_attempt = Instant::now();
        if health.consecutive_failures > 0 {
            health.consecutive_failures = 0;
            health.last_error = None;
            health.recovered = true;
            true
        } else {
            false
        }
    }

    /// 记一次失败；返回熔断是否由本次失败触发
    pub fn on_failure(&mut self, id: ServoId, kind: BusErrorKind) -> bool {
        let threshold = self.config.circuit_threshold;
        let health = self.joints.entry(id).or_insert_with(JointHealth::new);
        health.last_attempt = Instant::now();
        health.consecutive_failures += 1;
        health.last_error = Some(kind);
        health.consecutive_failures == threshold
    }

    pub fn is_circuit_open(&self, id: ServoId) -> bool {
        self.joints
            .get(&id)
            .map(|h| h.consecutive_failures >= self.config.circuit_threshold)
            .unwrap_or(false)
    }

    pub fn get(&self, id: ServoId) -> Option<&JointHealth> {
        self.joints.get(&id)
    }

    /// 当前处于熔断状态的关节数
    pub fn open_circuits(&self) -> usize {
        self.joints
            .values()
            .filter(|h| h.consecutive_failures >= self.config.circuit_threshold)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> HealthTracker {
        HealthTracker::new(HealthConfig {
            circuit_threshold: 3,
            probe_interval: Duration::from_millis(30),
        })
    }

    /// 测试连续失败达到阈值后熔断
    #[test]
    fn test_circuit_opens_at_threshold() {
        let mut t = tracker();
        assert_eq!(t.decide(1), AccessDecision::Allow);

        assert!(!t.on_failure(1, BusErrorKind::Timeout));
        assert!(!t.on_failure(1, BusErrorKind::Timeout));
        assert!(!t.is_circuit_open(1));

        // 第 3 次失败触发熔断
        assert!(t.on_failure(1, BusErrorKind::Timeout));
        assert!(t.is_circuit_open(1));
        assert_eq!(t.open_circuits(), 1);
        assert_eq!(t.decide(1), AccessDecision::Skip);
    }

    /// 测试熔断后按间隔放行探测
    #[test]
    fn test_probe_after_interval() {
        let mut t = tracker();
        for _ in 0..3 {
            t.on_failure(1, BusErrorKind::Timeout);
        }
        assert_eq!(t.decide(1), AccessDecision::Skip);

        std::thread::sleep(Duration::from_millis(35));
        assert_eq!(t.decide(1), AccessDecision::Probe);

        // 探测失败后重新计时
        t.on_failure(1, BusErrorKind::Timeout);
        assert_eq!(t.decide(1), AccessDecision::Skip);
    }

    /// 测试成功清零并标记恢复
    #[test]
    fn test_recovery() {
        let mut t = tracker();
        t.on_failure(1, BusErrorKind::Voltage);

        assert!(t.on_success(1));
        let health = t.get(1).unwrap();
        assert_eq!(health.consecutive_failures, 0);
        assert!(health.recovered);
        assert!(health.last_error.is_none());

        // 已经健康时的成功不算恢复
        assert!(!t.on_success(1));
    }

    /// 测试熔断中的成功探测闭合熔断
    #[test]
    fn test_probe_success_closes_circuit() {
        let mut t = tracker();
        for _ in 0..3 {
            t.on_failure(1, BusErrorKind::Timeout);
        }
        assert!(t.is_circuit_open(1));

        assert!(t.on_success(1));
        assert!(!t.is_circuit_open(1));
        assert_eq!(t.decide(1), AccessDecision::Allow);
        assert_eq!(t.open_circuits(), 0);
    }

    /// 测试关节之间互不影响
    #[test]
    fn test_per_joint_isolation() {
        let mut t = tracker();
        for _ in 0..3 {
            t.on_failure(1, BusErrorKind::Timeout);
        }
        assert!(t.is_circuit_open(1));
        assert!(!t.is_circuit_open(2));
        assert_eq!(t.decide(2), AccessDecision::Allow);
    }
}
