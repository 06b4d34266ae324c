//! 遥测快照与订阅者扇出
//!
//! 快照是整份替换的（不做增量合并）：每个采样周期产生一份新的
//! `TelemetrySnapshot`，旧的直接被覆盖。单个关节本周期读失败时
//! 对应项为 `None`，下个周期自然刷新。
//!
//! 订阅回调的失败被隔离：一个 panic 的消费者只会被记日志，
//! 不会影响其他订阅者，也不会中断采样线程。

use parking_lot::Mutex;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::warn;

/// 单关节的一次完整读数
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JointReading {
    pub position: i32,
    pub goal: i32,
    pub velocity: i32,
    pub load: i32,
    pub temperature: i32,
    pub current: i32,
    pub voltage: i32,
    pub moving: bool,
}

/// 一个采样周期的全臂快照
#[derive(Debug, Clone)]
pub struct TelemetrySnapshot {
    /// 臂名
    pub arm: String,
    /// 逐关节读数；`None` = 本周期该关节读取失败
    pub readings: Vec<Option<JointReading>>,
    pub taken_at: Instant,
}

/// 订阅凭据，退订时使用
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

type Callback = Arc<dyn Fn(&TelemetrySnapshot) + Send + Sync>;

/// 订阅者集合
pub(crate) struct SubscriberSet {
    next_id: AtomicU64,
    subscribers: Mutex<Vec<(SubscriberId, Callback)>>,
}

impl SubscriberSet {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    pub fn subscribe(&self, callback: impl Fn(&TelemetrySnapshot) + Send + Sync + 'static) -> SubscriberId {
        let id = SubscriberId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscribers.lock().push((id, Arc::new(callback)));
        id
    }

    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        let mut subscribers = self.subscribers.lock();
        let before = subscribers.len();
        subscribers.retain(|(sid, _)| *sid != id);
        subscribers.len() != before
    }

    pub fn len(&self) -> usize {
        self.subscribers.lock().len()
    }

    /// 推送快照给全部订阅者；回调 panic 被隔离
    ///
    /// 先克隆出回调列表再调用，回调内部可以安全地退订自己。
    pub fn publish(&self, snapshot: &TelemetrySnapshot) {
        let subscribers: Vec<(SubscriberId, Callback)> = self.subscribers.lock().clone();
        for (id, callback) in subscribers {
            if catch_unwind(AssertUnwindSafe(|| callback(snapshot))).is_err() {
                warn!(subscriber = id.0, arm = %snapshot.arm, "telemetry subscriber panicked, isolated");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot() -> TelemetrySnapshot {
        TelemetrySnapshot {
            arm: "left".to_string(),
            readings: vec![None],
            taken_at: Instant::now(),
        }
    }

    /// 测试订阅/退订
    #[test]
    fn test_subscribe_unsubscribe() {
        let set = SubscriberSet::new();
        let count = Arc::new(AtomicU64::new(0));

        let c = count.clone();
        let id = set.subscribe(move |_| {
            c.fetch_add(1, Ordering::Relaxed);
        });
        assert_eq!(set.len(), 1);

        set.publish(&snapshot());
        assert_eq!(count.load(Ordering::Relaxed), 1);

        assert!(set.unsubscribe(id));
        assert!(!set.unsubscribe(id));
        set.publish(&snapshot());
        assert_eq!(count.load(Ordering::Relaxed), 1);
    }

    /// 测试 panic 的订阅者不影响其他订阅者
    #[test]
    fn test_panicking_subscriber_isolated() {
        let set = SubscriberSet::new();
        let count = Arc::new(AtomicU64::new(0));

        set.subscribe(|_| panic!("bad consumer"));
        let c = count.clone();
        set.subscribe(move |_| {
            c.fetch_add(1, Ordering::Relaxed);
        });

        set.publish(&snapshot());
        set.publish(&snapshot());
        assert_eq!(count.load(Ordering::Relaxed), 2);
        // panic 的订阅者仍在列表里，下个周期继续被隔离
        assert_eq!(set.len(), 2);
    }

    /// 测试回调内退订自己不死锁
    #[test]
    fn test_unsubscribe_from_callback() {
        let set = Arc::new(SubscriberSet::new());
        let slot: Arc<Mutex<Option<SubscriberId>>> = Arc::new(Mutex::new(None));

        let set_clone = set.clone();
        let slot_clone = slot.clone();
        let id = set.subscribe(move |_| {
            if let Some(id) = *slot_clone.lock() {
                set_clone.unsubscribe(id);
            }
        });
        *slot.lock() = Some(id);

        set.publish(&snapshot());
        assert_eq!(set.len(), 0);
    }
}
