//! # Luban 总线适配层
//!
//! Feetech STS/SCS 串行总线舵机的硬件抽象层，提供统一的寄存器读写接口。
//!
//! 本层只负责单次寄存器事务（组帧、校验、状态包解析）和错误分类；
//! 重试、退避、熔断等弹性策略属于上层 `luban-driver` 的职责。
//!
//! # 错误分类
//!
//! 总线错误通过 [`BusErrorKind`] 做结构化分类，
//! [`BusErrorKind::is_transient`] 是重试策略的唯一判据：
//! 欠压、状态包损坏、端口占用、超时为瞬态错误；
//! 其余（IO、协议、未知关节）为致命错误，不做重试。

use thiserror::Error;

pub mod feetech;
mod registers;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

pub use feetech::FeetechBus;
pub use registers::Register;

/// 总线上的舵机地址（Feetech 协议为 1 字节 ID）
pub type ServoId = u8;

/// 关节描述符：配置层定义的名字 + 总线 ID
///
/// 关节顺序由配置决定，`Pose` 中的位置序列与之一一对应。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JointDescriptor {
    pub name: String,
    pub id: ServoId,
}

impl JointDescriptor {
    pub fn new(name: impl Into<String>, id: ServoId) -> Self {
        Self {
            name: name.into(),
            id,
        }
    }
}

/// 位姿：按关节顺序排列的原始编码器位置（STS 系列为 0–4095）
///
/// 不变量：长度恒等于臂的关节数，由构造方保证。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pose(Vec<i32>);

impl Pose {
    pub fn new(positions: Vec<i32>) -> Self {
        Pose(positions)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_slice(&self) -> &[i32] {
        &self.0
    }

    pub fn iter(&self) -> std::slice::Iter<'_, i32> {
        self.0.iter()
    }
}

impl From<Vec<i32>> for Pose {
    fn from(positions: Vec<i32>) -> Self {
        Pose(positions)
    }
}

impl std::ops::Index<usize> for Pose {
    type Output = i32;

    fn index(&self, index: usize) -> &i32 {
        &self.0[index]
    }
}

/// 总线错误的结构化分类
///
/// 取代按异常消息子串匹配的做法：重试策略只看 [`Self::is_transient`]。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusErrorKind {
    /// 欠压/电压毛刺（状态包错误位 bit0）
    Voltage,
    /// 状态包损坏（校验和错误、帧头错位、长度异常）
    CorruptPacket,
    /// 串口瞬时占用
    PortBusy,
    /// 等待状态包超时
    Timeout,
    /// 底层 IO 错误
    Io,
    /// 协议错误（响应来自错误的 ID、指令不被识别）
    Protocol,
    /// 配置中不存在的关节
    UnknownJoint,
    /// 总线未连接
    NotConnected,
    /// 关节熔断中（连续失败超限后暂停访问）
    CircuitOpen,
}

impl BusErrorKind {
    /// 是否为瞬态错误（可重试）
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            BusErrorKind::Voltage
                | BusErrorKind::CorruptPacket
                | BusErrorKind::PortBusy
                | BusErrorKind::Timeout
        )
    }
}

/// 总线适配层统一错误类型
#[derive(Error, Debug)]
pub enum BusError {
    /// 舵机报告欠压（状态包错误位）
    #[error("Servo {id} reported voltage error (status bits 0x{bits:02X})")]
    Voltage { id: ServoId, bits: u8 },

    /// 状态包损坏
    #[error("Corrupt status packet from servo {id}: {reason}")]
    CorruptPacket { id: ServoId, reason: String },

    /// 串口瞬时占用
    #[error("Serial port busy: {0}")]
    PortBusy(String),

    /// 等待舵机响应超时
    #[error("Timeout waiting for servo {id}")]
    Timeout { id: ServoId },

    /// 底层 IO 错误
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// 协议错误
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// 未知关节
    #[error("Unknown joint id {0}")]
    UnknownJoint(ServoId),

    /// 总线未连接
    #[error("Bus not connected")]
    NotConnected,

    /// 关节熔断中，本次调用未访问总线
    #[error("Servo {0} circuit open, skipping")]
    CircuitOpen(ServoId),
}

impl BusError {
    pub fn kind(&self) -> BusErrorKind {
        match self {
            BusError::Voltage { .. } => BusErrorKind::Voltage,
            BusError::CorruptPacket { .. } => BusErrorKind::CorruptPacket,
            BusError::PortBusy(_) => BusErrorKind::PortBusy,
            BusError::Timeout { .. } => BusErrorKind::Timeout,
            BusError::Io(_) => BusErrorKind::Io,
            BusError::Protocol(_) => BusErrorKind::Protocol,
            BusError::UnknownJoint(_) => BusErrorKind::UnknownJoint,
            BusError::NotConnected => BusErrorKind::NotConnected,
            BusError::CircuitOpen(_) => BusErrorKind::CircuitOpen,
        }
    }

    /// 是否为瞬态错误（可重试）
    pub fn is_transient(&self) -> bool {
        self.kind().is_transient()
    }
}

/// 总线传输接口
///
/// 真实后端（[`FeetechBus`]）和弹性包装器都实现此 trait，
/// 上层通过组合而非运行时替换来叠加行为。
pub trait Transport {
    /// 读单个寄存器，返回已解码的有符号值
    fn read(&mut self, reg: Register, id: ServoId) -> Result<i32, BusError>;

    /// 写单个寄存器
    fn write(&mut self, reg: Register, id: ServoId, value: i32) -> Result<(), BusError>;

    /// 释放底层端口；之后的读写返回 `NotConnected`
    fn disconnect(&mut self);
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 测试错误分类：瞬态 vs 致命
    #[test]
    fn test_error_kind_transient() {
        assert!(BusErrorKind::Voltage.is_transient());
        assert!(BusErrorKind::CorruptPacket.is_transient());
        assert!(BusErrorKind::PortBusy.is_transient());
        assert!(BusErrorKind::Timeout.is_transient());

        assert!(!BusErrorKind::Io.is_transient());
        assert!(!BusErrorKind::Protocol.is_transient());
        assert!(!BusErrorKind::UnknownJoint.is_transient());
        assert!(!BusErrorKind::NotConnected.is_transient());
        assert!(!BusErrorKind::CircuitOpen.is_transient());
    }

    /// 测试 BusError 到 BusErrorKind 的映射
    #[test]
    fn test_error_to_kind() {
        let err = BusError::Voltage { id: 3, bits: 0x01 };
        assert_eq!(err.kind(), BusErrorKind::Voltage);
        assert!(err.is_transient());

        let err = BusError::Protocol("bad instruction".to_string());
        assert_eq!(err.kind(), BusErrorKind::Protocol);
        assert!(!err.is_transient());

        let err = BusError::Timeout { id: 1 };
        assert!(err.is_transient());
    }

    /// 测试 Pose 的基本访问
    #[test]
    fn test_pose_basics() {
        let pose = Pose::new(vec![2048, 1024, 3000]);
        assert_eq!(pose.len(), 3);
        assert!(!pose.is_empty());
        assert_eq!(pose[1], 1024);
        assert_eq!(pose.as_slice(), &[2048, 1024, 3000]);

        let from_vec: Pose = vec![1, 2].into();
        assert_eq!(from_vec.len(), 2);
    }

    /// 测试错误 Display 输出包含关键信息
    #[test]
    fn test_error_display() {
        let msg = format!("{}", BusError::Voltage { id: 5, bits: 0x01 });
        assert!(msg.contains("5"));
        assert!(msg.contains("voltage"));

        let msg = format!("{}", BusError::CircuitOpen(2));
        assert!(msg.contains("circuit open"));
    }
}
