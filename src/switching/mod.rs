//! 收益计算与切换决策

pub mod engine;
pub mod profitability;

use crate::device::AlgorithmId;
use serde::{Deserialize, Serialize};
use std::fmt;

pub use engine::{Decision, HoldReason, SwitchingConfig, SwitchingEngine};
pub use profitability::{rank_with, ProfitabilityCalculator, RankedAlgorithm};

/// 设备挖矿状态
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceState {
    /// 未启用
    Idle,
    /// 已启用，等待可用的收益排名
    Selecting,
    /// 正在运行
    Running(AlgorithmId),
    /// 正在切换算法
    Switching { from: AlgorithmId, to: AlgorithmId },
    /// 已停止，需要重新启用
    Stopped,
}

impl DeviceState {
    /// 当前 (或即将) 运行的算法
    pub fn algorithm(&self) -> Option<&AlgorithmId> {
        match self {
            DeviceState::Running(algorithm) => Some(algorithm),
            DeviceState::Switching { to, .. } => Some(to),
            _ => None,
        }
    }

    pub fn is_switching(&self) -> bool {
        matches!(self, DeviceState::Switching { .. })
    }

    pub fn is_active(&self) -> bool {
        matches!(self, DeviceState::Running(_) | DeviceState::Switching { .. })
    }
}

impl Default for DeviceState {
    fn default() -> Self {
        DeviceState::Idle
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceState::Idle => write!(f, "Idle"),
            DeviceState::Selecting => write!(f, "Selecting"),
            DeviceState::Running(algorithm) => write!(f, "Running({})", algorithm),
            DeviceState::Switching { from, to } => write!(f, "Switching({}→{})", from, to),
            DeviceState::Stopped => write!(f, "Stopped"),
        }
    }
}
