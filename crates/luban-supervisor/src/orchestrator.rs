//! 运动编排器
//!
//! 状态机：`Idle → Queued → Running → Finished`。
//!
//! 两种调度模式：
//! - **串行**：同一时刻只有一个任务的工作线程活着；前面的失败不会
//!   中止队列（除非显式取消），聚合结果 = 所有任务成败的 AND；
//! - **并行**：全部任务同时启动，共享 pending 计数在每个终态信号上
//!   递减，归零时恰好触发一次聚合 `Finished`。
//!
//! 两种模式共同保证：每个 `ArmStarted` 配对恰好一个 `ArmFinished`；
//! 线程句柄一律带超时 join 后才丢弃。

use crate::config::ArmConfig;
use crate::job::{JobEvent, JobId, MotionJob};
use crate::registry::PortRegistry;
use crate::thread_util::JoinTimeout;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use luban_bus::Transport;
use luban_driver::{CancelToken, MotionRequest};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{info, warn};

/// 调度模式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Sequential,
    Parallel,
}

/// 编排器状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorState {
    Idle,
    Queued,
    Running,
    Finished,
}

/// 编排器上报的事件
#[derive(Debug, Clone)]
pub enum OrchestratorEvent {
    ArmStarted {
        index: usize,
        arm: String,
    },
    Progress {
        index: usize,
        arm: String,
        message: String,
    },
    ArmFinished {
        index: usize,
        arm: String,
        success: bool,
        message: String,
    },
    /// 聚合终态，每轮恰好一次
    Finished {
        success: bool,
    },
}

struct QueuedMotion {
    index: usize,
    config: ArmConfig,
    request: MotionRequest,
}

/// 多臂归位编排器
pub struct MotionOrchestrator<B: Transport + Send + 'static> {
    registry: Arc<PortRegistry<B>>,
    arms: Vec<ArmConfig>,
    state: Arc<Mutex<OrchestratorState>>,
    events_tx: Sender<OrchestratorEvent>,
    cancel: CancelToken,
    runner: Option<JoinHandle<()>>,
}

impl<B: Transport + Send + 'static> MotionOrchestrator<B> {
    /// 创建编排器；返回事件接收端
    pub fn new(
        registry: Arc<PortRegistry<B>>,
        arms: Vec<ArmConfig>,
    ) -> (Self, Receiver<OrchestratorEvent>) {
        let (events_tx, events_rx) = crossbeam_channel::unbounded();
        (
            Self {
                registry,
                arms,
                state: Arc::new(Mutex::new(OrchestratorState::Idle)),
                events_tx,
                cancel: CancelToken::new(),
                runner: None,
            },
            events_rx,
        )
    }

    pub fn state(&self) -> OrchestratorState {
        *self.state.lock()
    }

    /// 启动一轮归位
    ///
    /// # 参数
    ///
    /// - `arm_indexes`: 选中的臂（配置顺序下标）；空 = 全部
    /// - `velocity_override`: 覆盖各臂配置的归位速度
    ///
    /// # 返回值
    ///
    /// 上一轮未结束、选择为空或下标越界时返回 `false`。
    pub fn start(
        &mut self,
        mode: RunMode,
        arm_indexes: &[usize],
        velocity_override: Option<u16>,
    ) -> bool {
        {
            let state = self.state.lock();
            if matches!(*state, OrchestratorState::Queued | OrchestratorState::Running) {
                warn!("orchestrator busy, start ignored");
                return false;
            }
        }
        // 回收上一轮 runner
        if let Some(handle) = self.runner.take() {
            let _ = handle.join_timeout(Duration::from_secs(2));
        }

        let indexes: Vec<usize> = if arm_indexes.is_empty() {
            (0..self.arms.len()).collect()
        } else {
            arm_indexes.to_vec()
        };

        let mut queue = Vec::with_capacity(indexes.len());
        for &index in &indexes {
            let Some(config) = self.arms.get(index) else {
                warn!(index, "arm index out of range, start rejected");
                return false;
            };
            let velocity = velocity_override.unwrap_or(config.home_velocity);
            let request =
                MotionRequest::new(config.home_pose(), velocity, config.position_tolerance);
            queue.push(QueuedMotion {
                index,
                config: config.clone(),
                request,
            });
        }
        if queue.is_empty() {
            warn!("no arms selected, nothing to do");
            return false;
        }

        self.cancel = CancelToken::new();
        *self.state.lock() = OrchestratorState::Queued;
        info!(arms = queue.len(), ?mode, "homing run queued");

        let registry = self.registry.clone();
        let events = self.events_tx.clone();
        let state = self.state.clone();
        let cancel = self.cancel.clone();
        let handle = std::thread::spawn(move || {
            *state.lock() = OrchestratorState::Running;
            let success = match mode {
                RunMode::Sequential => run_sequential(&registry, &queue, &events, &cancel),
                RunMode::Parallel => run_parallel(&registry, queue, &events, &cancel),
            };
            let _ = events.send(OrchestratorEvent::Finished { success });
            *state.lock() = OrchestratorState::Finished;
            info!(success, "homing run finished");
        });
        self.runner = Some(handle);
        true
    }

    /// 协作式取消本轮全部任务
    pub fn cancel_all(&self) {
        self.cancel.cancel();
    }

    /// 等待本轮结束（有界）；返回 runner 是否在时限内退出
    pub fn wait(&mut self, timeout: Duration) -> bool {
        match self.runner.take() {
            Some(handle) => handle.join_timeout(timeout).is_ok(),
            None => true,
        }
    }
}

impl<B: Transport + Send + 'static> Drop for MotionOrchestrator<B> {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.runner.take() {
            let _ = handle.join_timeout(Duration::from_secs(2));
        }
    }
}

/// 串行调度：一次一个任务；失败不提前中止队列
fn run_sequential<B: Transport + Send + 'static>(
    registry: &PortRegistry<B>,
    queue: &[QueuedMotion],
    events: &Sender<OrchestratorEvent>,
    cancel: &CancelToken,
) -> bool {
    let mut all_ok = true;
    for (job_id, item) in queue.iter().enumerate() {
        if cancel.is_cancelled() {
            info!("run cancelled, remaining arms not started");
            all_ok = false;
            break;
        }

        let arm = item.config.name.clone();
        let _ = events.send(OrchestratorEvent::ArmStarted {
            index: item.index,
            arm: arm.clone(),
        });

        let handle = registry.get_handle(&item.config);
        let (job_tx, job_rx) = crossbeam_channel::unbounded();
        let mut job = MotionJob::spawn(job_id as JobId, handle, item.request.clone(), job_tx);

        let success = drive_job(&mut job, &job_rx, item.index, &arm, events, cancel);
        all_ok &= success;
    }
    all_ok
}

/// 跟踪单个任务直到终态；编排器取消联动到任务
fn drive_job<B: Transport + Send + 'static>(
    job: &mut MotionJob<B>,
    job_rx: &Receiver<JobEvent>,
    index: usize,
    arm: &str,
    events: &Sender<OrchestratorEvent>,
    cancel: &CancelToken,
) -> bool {
    let mut cancel_forwarded = false;
    let success = loop {
        match job_rx.recv_timeout(Duration::from_millis(50)) {
            Ok(JobEvent::Progress { message, .. }) => {
                let _ = events.send(OrchestratorEvent::Progress {
                    index,
                    arm: arm.to_string(),
                    message,
                });
            },
            Ok(JobEvent::Finished { success, message, .. }) => {
                let _ = events.send(OrchestratorEvent::ArmFinished {
                    index,
                    arm: arm.to_string(),
                    success,
                    message,
                });
                break success;
            },
            Err(RecvTimeoutError::Timeout) => {
                if cancel.is_cancelled() && !cancel_forwarded {
                    job.cancel();
                    cancel_forwarded = true;
                }
            },
            Err(RecvTimeoutError::Disconnected) => {
                // worker 没发终态信号就退出（panic）；配对保证由这里兜底
                warn!(arm, "job worker exited without terminal signal");
                let _ = events.send(OrchestratorEvent::ArmFinished {
                    index,
                    arm: arm.to_string(),
                    success: false,
                    message: "job worker exited without result".to_string(),
                });
                break false;
            },
        }
    };
    job.join(Duration::from_secs(2));
    success
}

/// 并行调度：全部任务同时启动，pending 计数归零时聚合完成
fn run_parallel<B: Transport + Send + 'static>(
    registry: &PortRegistry<B>,
    queue: Vec<QueuedMotion>,
    events: &Sender<OrchestratorEvent>,
    cancel: &CancelToken,
) -> bool {
    let (job_tx, job_rx) = crossbeam_channel::unbounded();
    let mut jobs: HashMap<JobId, (MotionJob<B>, usize, String)> = HashMap::new();

    for (job_id, item) in queue.into_iter().enumerate() {
        let job_id = job_id as JobId;
        let arm = item.config.name.clone();
        let _ = events.send(OrchestratorEvent::ArmStarted {
            index: item.index,
            arm: arm.clone(),
        });
        let handle = registry.get_handle(&item.config);
        let job = MotionJob::spawn(job_id, handle, item.request, job_tx.clone());
        jobs.insert(job_id, (job, item.index, arm));
    }
    drop(job_tx);

    let mut pending = jobs.len();
    let mut all_ok = true;
    let mut finished: HashSet<JobId> = HashSet::new();
    let mut cancel_forwarded = false;

    while pending > 0 {
        match job_rx.recv_timeout(Duration::from_millis(50)) {
            Ok(JobEvent::Progress { job, message, .. }) => {
                if let Some((_, index, arm)) = jobs.get(&job) {
                    let _ = events.send(OrchestratorEvent::Progress {
                        index: *index,
                        arm: arm.clone(),
                        message,
                    });
                }
            },
            Ok(JobEvent::Finished { job, success, message, .. }) => {
                if finished.insert(job)
                    && let Some((_, index, arm)) = jobs.get(&job)
                {
                    let _ = events.send(OrchestratorEvent::ArmFinished {
                        index: *index,
                        arm: arm.clone(),
                        success,
                        message,
                    });
                    all_ok &= success;
                    pending -= 1;
                }
            },
            Err(RecvTimeoutError::Timeout) => {
                if cancel.is_cancelled() && !cancel_forwarded {
                    for (job, _, _) in jobs.values() {
                        job.cancel();
                    }
                    cancel_forwarded = true;
                }
                // 看护：worker 退出却没发终态信号（panic）
                let mut dead: Vec<(JobId, usize, String)> = Vec::new();
                for (id, (job, index, arm)) in &jobs {
                    if !finished.contains(id) && job.is_worker_finished() && job_rx.is_empty() {
                        dead.push((*id, *index, arm.clone()));
                    }
                }
                for (id, index, arm) in dead {
                    warn!(arm = %arm, "job worker exited without terminal signal");
                    let _ = events.send(OrchestratorEvent::ArmFinished {
                        index,
                        arm,
                        success: false,
                        message: "job worker exited without result".to_string(),
                    });
                    finished.insert(id);
                    all_ok = false;
                    pending -= 1;
                }
            },
            Err(RecvTimeoutError::Disconnected) => {
                // 全部 worker 已退出且队列已排空；剩下的都没发终态信号
                for (id, (_, index, arm)) in &jobs {
                    if !finished.contains(id) {
                        let _ = events.send(OrchestratorEvent::ArmFinished {
                            index: *index,
                            arm: arm.clone(),
                            success: false,
                            message: "job worker exited without result".to_string(),
                        });
                    }
                }
                all_ok = false;
                pending = 0;
            },
        }
    }

    for (mut job, _, _) in jobs.into_values() {
        job.join(Duration::from_secs(2));
    }
    all_ok
}
