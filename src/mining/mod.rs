pub mod manager;

use crate::device::AlgorithmId;
use crate::switching::DeviceState;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::SystemTime;
use uuid::Uuid;

pub use manager::MiningManager;

/// 管理器运行状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MiningState {
    /// 未启动
    Stopped,
    /// 正在启动
    Starting,
    /// 运行中
    Running,
    /// 正在停止
    Stopping,
}

/// worker 被判定崩溃的原因
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CrashCause {
    /// 心跳超时
    HeartbeatTimeout,
    /// 进程退出 (心跳通道关闭)
    ProcessExited,
    /// 重启时启动失败
    LaunchFailed,
}

impl fmt::Display for CrashCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CrashCause::HeartbeatTimeout => write!(f, "heartbeat timeout"),
            CrashCause::ProcessExited => write!(f, "process exited"),
            CrashCause::LaunchFailed => write!(f, "launch failed"),
        }
    }
}

/// 对外发布的事件
#[derive(Debug, Clone)]
pub enum MiningEvent {
    /// 设备状态变更
    SessionStateChanged {
        device_id: Uuid,
        old_state: DeviceState,
        new_state: DeviceState,
        timestamp: SystemTime,
    },
    /// 收到 worker 心跳
    HeartbeatReceived {
        device_id: Uuid,
        algorithm: AlgorithmId,
        hashrate: f64,
        smoothed_hashrate: f64,
    },
    /// worker 崩溃，即将自动恢复
    WorkerCrashed {
        device_id: Uuid,
        algorithm: AlgorithmId,
        cause: CrashCause,
        consecutive_failures: u32,
    },
    /// 重启预算耗尽，设备已停止
    WorkerUnrecoverable {
        device_id: Uuid,
        algorithm: AlgorithmId,
        failures: u32,
    },
    /// 新的行情快照
    MarketUpdated { version: u64, algorithms: usize },
    /// 行情拉取失败
    MarketFeedFailed {
        consecutive_failures: u32,
        stale: bool,
        reason: String,
    },
}

impl MiningEvent {
    pub fn device_id(&self) -> Option<Uuid> {
        match self {
            MiningEvent::SessionStateChanged { device_id, .. }
            | MiningEvent::HeartbeatReceived { device_id, .. }
            | MiningEvent::WorkerCrashed { device_id, .. }
            | MiningEvent::WorkerUnrecoverable { device_id, .. } => Some(*device_id),
            MiningEvent::MarketUpdated { .. } | MiningEvent::MarketFeedFailed { .. } => None,
        }
    }
}
