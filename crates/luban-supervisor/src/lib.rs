//! # Luban 监督层
//!
//! 在驱动层之上提供多臂系统的资源纪律和生命周期管理：
//! - 端口仲裁（[`PortRegistry`]）：一个物理端口只有一个活着的
//!   控制器实例，所有调用方共享同一句柄；
//! - 遥测扇出（[`ArmHandle::subscribe`]）：后台采样线程按固定节拍
//!   读全关节状态快照，推送给所有订阅者，订阅者无需自己开端口；
//! - 运动任务（[`MotionJob`]）：每个任务一个工作线程，协作式取消，
//!   进度与终态通过显式 channel 上报（而非信号槽）；
//! - 编排（[`MotionOrchestrator`]）：串行或并行驱动一组归位任务，
//!   聚合成败，保证 started/finished 事件一一配对、线程句柄
//!   有界回收。
//!
//! 注册表是显式构造、依赖注入的实例：进程启动时创建，关闭时
//! 拆除，不存在隐式全局单例。

pub mod config;
mod job;
mod orchestrator;
mod registry;
pub mod telemetry;
mod thread_util;

pub use config::{ArmConfig, ConfigError, FleetConfig, JointConfig};
pub use job::{JobEvent, JobId, JobStatus, MotionJob};
pub use orchestrator::{
    MotionOrchestrator, OrchestratorEvent, OrchestratorState, RunMode,
};
pub use registry::{ArmHandle, ArmOptions, PortRegistry, SamplerConfig, SharedBus};
pub use telemetry::{JointReading, SubscriberId, TelemetrySnapshot};
