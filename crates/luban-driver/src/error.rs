//! 驱动层错误类型定义

use luban_bus::BusError;
use thiserror::Error;

/// 连接失败（硬错误）
///
/// 端口打不开（设备不存在、权限不足）是唯一同步抛给调用方的
/// 连接类错误，调用方必须在下发任何命令前处理。
#[derive(Error, Debug)]
pub enum ConnectError {
    /// 底层端口打开失败
    #[error("Failed to open port {port}: {source}")]
    Open {
        port: String,
        #[source]
        source: BusError,
    },
}

/// 运动命令错误（硬错误）
///
/// 验证超时**不在**此列：它是软失败，体现在
/// [`MotionReport`](crate::MotionReport) 里而非 `Err`。
#[derive(Error, Debug)]
pub enum MotionError {
    /// 位姿长度与关节数不符（编程错误，不重试）
    #[error("Pose has {actual} positions, arm has {expected} joints")]
    PoseLength { expected: usize, actual: usize },

    /// 本次调用内的自动连接失败
    #[error(transparent)]
    Connect(#[from] ConnectError),
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 测试错误 Display 输出
    #[test]
    fn test_motion_error_display() {
        let err = MotionError::PoseLength {
            expected: 6,
            actual: 4,
        };
        let msg = format!("{}", err);
        assert!(msg.contains("4"));
        assert!(msg.contains("6"));
    }

    /// 测试 ConnectError 到 MotionError 的转换保留来源
    #[test]
    fn test_connect_error_conversion() {
        let err = ConnectError::Open {
            port: "/dev/ttyACM0".to_string(),
            source: BusError::NotConnected,
        };
        let motion: MotionError = err.into();
        assert!(format!("{}", motion).contains("/dev/ttyACM0"));
    }
}
