//! Feetech STS 系列控制表寄存器
//!
//! 地址与宽度参照 STS3215 控制表；SCS 系列字节序不同，本层只支持 STS。

use num_enum::{IntoPrimitive, TryFromPrimitive};

/// 控制表中本系统用到的寄存器
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum Register {
    TorqueEnable = 0x28,
    Acceleration = 0x29,
    GoalPosition = 0x2A,
    GoalVelocity = 0x2E,
    PresentPosition = 0x38,
    PresentVelocity = 0x3A,
    PresentLoad = 0x3C,
    PresentVoltage = 0x3E,
    PresentTemperature = 0x3F,
    Moving = 0x42,
    PresentCurrent = 0x45,
}

impl Register {
    /// 控制表地址
    pub const fn address(self) -> u8 {
        self as u8
    }

    /// 寄存器宽度（字节）
    pub const fn width(self) -> usize {
        match self {
            Register::TorqueEnable
            | Register::Acceleration
            | Register::PresentVoltage
            | Register::PresentTemperature
            | Register::Moving => 1,
            Register::GoalPosition
            | Register::GoalVelocity
            | Register::PresentPosition
            | Register::PresentVelocity
            | Register::PresentLoad
            | Register::PresentCurrent => 2,
        }
    }

    /// 该寄存器的 16 位值是否采用符号-幅值编码（bit15 为符号位）
    pub const fn sign_magnitude(self) -> bool {
        matches!(
            self,
            Register::GoalVelocity
                | Register::PresentVelocity
                | Register::PresentLoad
                | Register::PresentCurrent
        )
    }

    /// 控制表中的惯用名
    pub const fn name(self) -> &'static str {
        match self {
            Register::TorqueEnable => "Torque_Enable",
            Register::Acceleration => "Acceleration",
            Register::GoalPosition => "Goal_Position",
            Register::GoalVelocity => "Goal_Velocity",
            Register::PresentPosition => "Present_Position",
            Register::PresentVelocity => "Present_Velocity",
            Register::PresentLoad => "Present_Load",
            Register::PresentVoltage => "Present_Voltage",
            Register::PresentTemperature => "Present_Temperature",
            Register::Moving => "Moving",
            Register::PresentCurrent => "Present_Current",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 测试地址映射与 STS3215 控制表一致
    #[test]
    fn test_register_addresses() {
        assert_eq!(Register::TorqueEnable.address(), 0x28);
        assert_eq!(Register::GoalPosition.address(), 0x2A);
        assert_eq!(Register::PresentPosition.address(), 0x38);
        assert_eq!(Register::Moving.address(), 0x42);
        assert_eq!(Register::PresentCurrent.address(), 0x45);
    }

    /// 测试宽度划分
    #[test]
    fn test_register_widths() {
        assert_eq!(Register::TorqueEnable.width(), 1);
        assert_eq!(Register::PresentTemperature.width(), 1);
        assert_eq!(Register::GoalPosition.width(), 2);
        assert_eq!(Register::PresentLoad.width(), 2);
    }

    /// 测试符号-幅值标记只覆盖速度/负载/电流
    #[test]
    fn test_sign_magnitude_registers() {
        assert!(Register::PresentVelocity.sign_magnitude());
        assert!(Register::PresentLoad.sign_magnitude());
        assert!(Register::PresentCurrent.sign_magnitude());
        assert!(!Register::PresentPosition.sign_magnitude());
        assert!(!Register::GoalPosition.sign_magnitude());
    }
}
