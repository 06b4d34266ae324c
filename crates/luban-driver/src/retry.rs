//! 重试退避策略
//!
//! 退避序列是确定性的（无抖动），便于离线推演和测试：
//! 默认参数下为 50, 75, 112.5, 168.75, 253.125 ms，上限 500 ms。

use std::time::Duration;

/// 瞬态错误重试策略
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// 单次调用内的最大重试次数
    pub max_retries: u32,
    /// 首次重试前的延迟
    pub initial_delay: Duration,
    /// 每次重试延迟的放大倍率
    pub backoff_factor: f64,
    /// 延迟上限
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_delay: Duration::from_millis(50),
            backoff_factor: 1.5,
            max_delay: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    /// 第 `attempt` 次重试前的延迟（`attempt` 从 1 开始）
    ///
    /// 纯函数：`initial_delay * factor^(attempt-1)`，封顶 `max_delay`。
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = self.backoff_factor.powi(attempt.saturating_sub(1) as i32);
        self.initial_delay.mul_f64(factor).min(self.max_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 测试默认退避序列：50, 75, 112.5, 168.75, 253.125 ms
    #[test]
    fn test_default_backoff_sequence() {
        let policy = RetryPolicy::default();
        let expected_ms = [50.0, 75.0, 112.5, 168.75, 253.125];

        for (i, &expected) in expected_ms.iter().enumerate() {
            let delay = policy.delay_for_attempt(i as u32 + 1);
            let actual = delay.as_secs_f64() * 1000.0;
            assert!(
                (actual - expected).abs() < 1e-6,
                "attempt {}: expected {}ms, got {}ms",
                i + 1,
                expected,
                actual
            );
        }
    }

    /// 测试延迟封顶
    #[test]
    fn test_backoff_cap() {
        let policy = RetryPolicy::default();
        // 1.5^9 * 50ms ≈ 1.92s，应被封顶到 500ms
        assert_eq!(policy.delay_for_attempt(10), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(100), Duration::from_millis(500));
    }

    /// 测试 attempt 0 与 1 同值（防御饱和减法）
    #[test]
    fn test_attempt_zero() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for_attempt(0), policy.delay_for_attempt(1));
    }
}
