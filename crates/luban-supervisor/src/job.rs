//! 可取消的运动任务
//!
//! 一个任务 = 一条臂 + 一个运动请求 + 一个工作线程。进度与终态
//! 通过显式 channel 上报：行进中发 `Progress`，结束时发**恰好一次**
//! `Finished`。取消是协作式的，在验证轮询的间隙生效，绝不打断
//! 进行中的串行写入。
//!
//! 状态只沿 `Pending → Running → (Succeeded | Failed | Cancelled)`
//! 推进一次。验证超时不算任务失败：命令已正确下发，终态消息会注明
//! 到位未确认。

use crate::registry::ArmHandle;
use crate::thread_util::JoinTimeout;
use crossbeam_channel::Sender;
use luban_bus::Transport;
use luban_driver::{CancelToken, MotionRequest};
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, warn};

pub type JobId = u64;

/// 任务状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

/// 任务上报的事件
#[derive(Debug, Clone)]
pub enum JobEvent {
    /// 行进中的进度描述
    Progress {
        job: JobId,
        arm: String,
        message: String,
    },
    /// 终态信号，每个任务恰好一次
    Finished {
        job: JobId,
        arm: String,
        success: bool,
        message: String,
    },
}

/// 后台运动任务
pub struct MotionJob<B: Transport + Send + 'static> {
    id: JobId,
    arm_name: String,
    status: Arc<Mutex<JobStatus>>,
    cancel: CancelToken,
    worker: Option<JoinHandle<()>>,
    _marker: std::marker::PhantomData<fn() -> B>,
}

impl<B: Transport + Send + 'static> MotionJob<B> {
    /// 创建任务并立即启动工作线程
    pub fn spawn(
        id: JobId,
        arm: Arc<ArmHandle<B>>,
        request: MotionRequest,
        events: Sender<JobEvent>,
    ) -> Self {
        let status = Arc::new(Mutex::new(JobStatus::Pending));
        let cancel = CancelToken::new();
        let arm_name = arm.name().to_string();

        let status_for_worker = status.clone();
        let cancel_for_worker = cancel.clone();
        let worker = std::thread::spawn(move || {
            run_job(id, arm, request, events, status_for_worker, cancel_for_worker);
        });

        Self {
            id,
            arm_name,
            status,
            cancel,
            worker: Some(worker),
            _marker: std::marker::PhantomData,
        }
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn arm_name(&self) -> &str {
        &self.arm_name
    }

    pub fn status(&self) -> JobStatus {
        *self.status.lock()
    }

    /// 请求协作式取消（在轮询间隙生效）
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// 工作线程是否已经退出（无论是否发过终态信号）
    pub fn is_worker_finished(&self) -> bool {
        self.worker.as_ref().map(|h| h.is_finished()).unwrap_or(true)
    }

    /// 有界回收工作线程；超时则放弃等待
    pub fn join(&mut self, timeout: Duration) -> JobStatus {
        if let Some(handle) = self.worker.take()
            && handle.join_timeout(timeout).is_err()
        {
            warn!(job = self.id, arm = %self.arm_name, "job worker did not stop in time");
        }
        self.status()
    }
}

impl<B: Transport + Send + 'static> Drop for MotionJob<B> {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.worker.take() {
            let _ = handle.join_timeout(Duration::from_secs(2));
        }
    }
}

fn run_job<B: Transport + Send + 'static>(
    id: JobId,
    arm: Arc<ArmHandle<B>>,
    request: MotionRequest,
    events: Sender<JobEvent>,
    status: Arc<Mutex<JobStatus>>,
    cancel: CancelToken,
) {
    *status.lock() = JobStatus::Running;
    let arm_name = arm.name().to_string();
    debug!(job = id, arm = %arm_name, "motion job started");

    let events_for_progress = events.clone();
    let name_for_progress = arm_name.clone();
    let result = arm.execute(&request, &cancel, &mut |message| {
        let _ = events_for_progress.send(JobEvent::Progress {
            job: id,
            arm: name_for_progress.clone(),
            message,
        });
    });

    let (final_status, success, message) = match result {
        Err(e) => (JobStatus::Failed, false, format!("motion failed: {e}")),
        Ok(report) if report.cancelled => {
            (JobStatus::Cancelled, false, "cancelled before arrival".to_string())
        },
        Ok(report) if report.verified => (
            JobStatus::Succeeded,
            true,
            format!("arrived within tolerance in {:.2}s", report.elapsed.as_secs_f64()),
        ),
        Ok(report) if report.timed_out => (
            JobStatus::Succeeded,
            true,
            "command issued, arrival unconfirmed".to_string(),
        ),
        Ok(_) => (JobStatus::Succeeded, true, "command issued".to_string()),
    };

    *status.lock() = final_status;
    let _ = events.send(JobEvent::Finished {
        job: id,
        arm: arm_name,
        success,
        message,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ArmConfig, JointConfig};
    use crate::registry::{ArmOptions, PortRegistry, SamplerConfig};
    use luban_bus::mock::MockBus;
    use luban_driver::{HealthConfig, RetryPolicy, VerifyConfig};

    fn arm_config() -> ArmConfig {
        ArmConfig {
            name: "left".to_string(),
            port: "mock0".to_string(),
            baud_rate: 1_000_000,
            joints: vec![JointConfig {
                name: "base".to_string(),
                id: 1,
            }],
            home_positions: vec![2048],
            home_velocity: 4000,
            position_tolerance: 10,
        }
    }

    fn fast_options() -> ArmOptions {
        ArmOptions {
            verify: VerifyConfig {
                sleep_fraction: 0.5,
                poll_interval: Duration::from_millis(2),
                accel_bonus_max: Duration::ZERO,
                min_poll_window: Duration::from_secs(5),
                max_travel_estimate: Duration::from_secs(2),
                stability_jitter: 4,
                stable_polls: 2,
                fallback_distance: 1024,
            },
            retry: RetryPolicy {
                max_retries: 2,
                initial_delay: Duration::from_micros(200),
                backoff_factor: 1.5,
                max_delay: Duration::from_millis(2),
            },
            health: HealthConfig::default(),
            sampler: SamplerConfig {
                interval: Duration::from_millis(50),
                enabled: false,
            },
        }
    }

    /// 测试任务正常完成：恰好一次 Finished，状态 Succeeded
    #[test]
    fn test_job_success_terminal_once() {
        let mock = MockBus::new(&[1]);
        let mock_for_factory = mock.clone();
        let registry = PortRegistry::new(fast_options(), move |_| Ok(mock_for_factory.clone()));
        let handle = registry.get_handle(&arm_config());

        let (tx, rx) = crossbeam_channel::unbounded();
        let request = MotionRequest::new(luban_bus::Pose::new(vec![2100]), 4000, 10);
        let mut job = MotionJob::spawn(7, handle, request, tx);

        let mut finished = 0;
        loop {
            match rx.recv_timeout(Duration::from_secs(5)).expect("event") {
                JobEvent::Progress { job, .. } => assert_eq!(job, 7),
                JobEvent::Finished { job: jid, success, .. } => {
                    assert_eq!(jid, 7);
                    assert!(success);
                    finished += 1;
                    break;
                },
            }
        }
        assert_eq!(job.join(Duration::from_secs(2)), JobStatus::Succeeded);
        assert!(job.status().is_terminal());
        assert_eq!(finished, 1);
        // 终态后通道里不再有事件
        assert!(rx.try_recv().is_err());
        assert_eq!(mock.position(1), Some(2100));
    }

    /// 测试取消路径：任务以 Cancelled 终态结束
    #[test]
    fn test_job_cancellation() {
        let mock = MockBus::new(&[1]);
        mock.set_settle(Duration::from_secs(30));
        let mock_for_factory = mock.clone();
        let registry = PortRegistry::new(fast_options(), move |_| Ok(mock_for_factory.clone()));
        let handle = registry.get_handle(&arm_config());

        let (tx, rx) = crossbeam_channel::unbounded();
        let request = MotionRequest::new(luban_bus::Pose::new(vec![3000]), 4000, 10);
        let mut job = MotionJob::spawn(1, handle, request, tx);

        std::thread::sleep(Duration::from_millis(30));
        job.cancel();

        let status = job.join(Duration::from_secs(5));
        assert_eq!(status, JobStatus::Cancelled);

        let finished: Vec<JobEvent> = rx
            .try_iter()
            .filter(|e| matches!(e, JobEvent::Finished { .. }))
            .collect();
        assert_eq!(finished.len(), 1);
        assert!(matches!(
            finished[0],
            JobEvent::Finished { success: false, .. }
        ));
    }

    /// 测试连接失败：任务以 Failed 终态结束
    #[test]
    fn test_job_connect_failure() {
        let registry: PortRegistry<MockBus> = PortRegistry::new(fast_options(), |_| {
            Err(luban_bus::BusError::Io(std::io::Error::other("no device")))
        });
        let handle = registry.get_handle(&arm_config());

        let (tx, rx) = crossbeam_channel::unbounded();
        let request = MotionRequest::new(luban_bus::Pose::new(vec![2100]), 600, 10);
        let mut job = MotionJob::spawn(2, handle, request, tx);

        assert_eq!(job.join(Duration::from_secs(5)), JobStatus::Failed);
        let finished: Vec<JobEvent> = rx
            .try_iter()
            .filter(|e| matches!(e, JobEvent::Finished { .. }))
            .collect();
        assert_eq!(finished.len(), 1);
        assert!(matches!(
            finished[0],
            JobEvent::Finished { success: false, .. }
        ));
    }
}
