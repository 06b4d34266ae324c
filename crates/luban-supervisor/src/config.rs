//! 臂/机队配置类型
//!
//! 只定义类型、TOML 解析和校验；配置文件的查找、迁移属于调用方。

use luban_bus::{JointDescriptor, Pose, ServoId};
use serde::Deserialize;
use std::collections::HashMap;
use thiserror::Error;

fn default_baud_rate() -> u32 {
    1_000_000
}

fn default_home_velocity() -> u16 {
    600
}

fn default_position_tolerance() -> u16 {
    12
}

/// 单个关节
#[derive(Debug, Clone, Deserialize)]
pub struct JointConfig {
    pub name: String,
    pub id: ServoId,
}

/// 单条臂
///
/// `joints` 的顺序决定 `Pose` 的位置顺序；`home_positions` 与之一一对应。
#[derive(Debug, Clone, Deserialize)]
pub struct ArmConfig {
    pub name: String,
    pub port: String,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    pub joints: Vec<JointConfig>,
    pub home_positions: Vec<i32>,
    #[serde(default = "default_home_velocity")]
    pub home_velocity: u16,
    #[serde(default = "default_position_tolerance")]
    pub position_tolerance: u16,
}

impl ArmConfig {
    pub fn joint_descriptors(&self) -> Vec<JointDescriptor> {
        self.joints
            .iter()
            .map(|j| JointDescriptor::new(j.name.clone(), j.id))
            .collect()
    }

    pub fn home_pose(&self) -> Pose {
        Pose::new(self.home_positions.clone())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.joints.is_empty() {
            return Err(ConfigError::NoJoints {
                arm: self.name.clone(),
            });
        }
        if self.home_positions.len() != self.joints.len() {
            return Err(ConfigError::HomeLength {
                arm: self.name.clone(),
                expected: self.joints.len(),
                actual: self.home_positions.len(),
            });
        }
        let mut seen: HashMap<ServoId, &str> = HashMap::new();
        for joint in &self.joints {
            if seen.insert(joint.id, &joint.name).is_some() {
                return Err(ConfigError::DuplicateServoId {
                    arm: self.name.clone(),
                    id: joint.id,
                });
            }
        }
        Ok(())
    }
}

/// 全部臂
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FleetConfig {
    #[serde(default)]
    pub arms: Vec<ArmConfig>,
}

impl FleetConfig {
    /// 从 TOML 文本解析并校验
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let fleet: FleetConfig = toml::from_str(text)?;
        fleet.validate()?;
        Ok(fleet)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut ports: HashMap<&str, &str> = HashMap::new();
        let mut names: HashMap<&str, ()> = HashMap::new();
        for arm in &self.arms {
            arm.validate()?;
            if names.insert(arm.name.as_str(), ()).is_some() {
                return Err(ConfigError::DuplicateArmName {
                    name: arm.name.clone(),
                });
            }
            if let Some(first) = ports.insert(arm.port.as_str(), arm.name.as_str()) {
                return Err(ConfigError::DuplicatePort {
                    port: arm.port.clone(),
                    first: first.to_string(),
                    second: arm.name.clone(),
                });
            }
        }
        Ok(())
    }

    pub fn arm(&self, name: &str) -> Option<&ArmConfig> {
        self.arms.iter().find(|a| a.name == name)
    }
}

/// 配置错误（致命，不重试）
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Arm {arm} has no joints")]
    NoJoints { arm: String },

    #[error("Arm {arm}: home_positions has {actual} entries, {expected} joints configured")]
    HomeLength {
        arm: String,
        expected: usize,
        actual: usize,
    },

    #[error("Arm {arm}: duplicate servo id {id}")]
    DuplicateServoId { arm: String, id: ServoId },

    #[error("Duplicate arm name {name}")]
    DuplicateArmName { name: String },

    #[error("Port {port} claimed by both {first} and {second}")]
    DuplicatePort {
        port: String,
        first: String,
        second: String,
    },
}
