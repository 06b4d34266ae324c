//! # Luban 驱动层
//!
//! 本层把单次总线事务组合成可靠的运动操作：
//! - 弹性传输（[`ResilientTransport`]）：瞬态错误重试 + 指数退避，
//!   按关节记账健康状态，连续失败超限后熔断，定期探测恢复；
//! - 运动控制（[`MotionController`]）：位置命令下发 + 混合式
//!   "先睡后轮询" 到位验证，验证超时为软失败（记日志、不抛错）。
//!
//! # 错误传播策略
//!
//! 只有连接失败和编程错误（位姿长度不符）会作为硬错误越过本层；
//! 其余一切故障被吸收为健康/遥测状态，让部分硬件故障优雅降级，
//! 而不是让整条臂停摆。

mod controller;
mod error;
pub mod health;
pub mod resilient;
pub mod retry;

pub use controller::{
    CancelToken, MotionController, MotionReport, MotionRequest, VerifyConfig,
};
pub use error::{ConnectError, MotionError};
pub use health::{AccessDecision, HealthConfig, HealthTracker, JointHealth};
pub use resilient::{ResilienceStats, ResilientTransport};
pub use retry::RetryPolicy;
