use crate::device::AlgorithmId;
use thiserror::Error;
use uuid::Uuid;

/// 切换引擎错误
///
/// 所有错误都只影响单个设备或单次行情刷新，不会导致整个进程退出。
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MiningError {
    #[error("Market feed unavailable: {reason}")]
    FeedUnavailable { reason: String },

    #[error("Worker launch failed: device {device_id}, algorithm {algorithm}, reason: {reason}")]
    LaunchFailure {
        device_id: Uuid,
        algorithm: AlgorithmId,
        reason: String,
    },

    #[error("Heartbeat timeout: device {device_id}, silent for {silent_ms} ms")]
    HeartbeatTimeout { device_id: Uuid, silent_ms: u64 },

    #[error("Worker unrecoverable: device {device_id}, algorithm {algorithm}, {failures} consecutive failures")]
    WorkerUnrecoverable {
        device_id: Uuid,
        algorithm: AlgorithmId,
        failures: u32,
    },

    #[error("Switch already in progress: device {device_id}")]
    SwitchConflict { device_id: Uuid },

    #[error("Device not found: {device_id}")]
    DeviceNotFound { device_id: Uuid },

    #[error("Device {device_id} cannot run algorithm {algorithm}")]
    UnsupportedAlgorithm {
        device_id: Uuid,
        algorithm: AlgorithmId,
    },

    #[error("Unknown algorithm: {algorithm}")]
    UnknownAlgorithm { algorithm: AlgorithmId },

    #[error("Device disabled: {device_id}")]
    DeviceDisabled { device_id: Uuid },

    #[error("Invalid benchmark: device {device_id}, algorithm {algorithm}, hashrate {hashrate}")]
    InvalidBenchmark {
        device_id: Uuid,
        algorithm: AlgorithmId,
        hashrate: f64,
    },

    #[error("Benchmark failed: device {device_id}, algorithm {algorithm}, reason: {reason}")]
    Benchmark {
        device_id: Uuid,
        algorithm: AlgorithmId,
        reason: String,
    },

    #[error("Worker process error: device {device_id}, error: {error}")]
    Process { device_id: Uuid, error: String },

    #[error("I/O error: {context}, error: {error}")]
    Io { context: String, error: String },

    #[error("Configuration error: {field}, reason: {reason}")]
    Config { field: String, reason: String },
}

/// 错误恢复策略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryStrategy {
    /// 保留旧数据，下个周期重试
    RetryNextInterval,
    /// 指数退避后重启 worker
    RestartWithBackoff,
    /// 设备回到 Idle，下一次 tick 或 enable 时重试
    ReturnToIdle,
    /// 等当前切换完成后由调用方重试
    RetryAfterCompletion,
    /// 需要人工重新启用
    RequireOperator,
    /// 忽略
    Ignore,
}

impl MiningError {
    pub fn recovery_strategy(&self) -> RecoveryStrategy {
        match self {
            MiningError::FeedUnavailable { .. } => RecoveryStrategy::RetryNextInterval,
            MiningError::HeartbeatTimeout { .. } => RecoveryStrategy::RestartWithBackoff,
            MiningError::LaunchFailure { .. } => RecoveryStrategy::ReturnToIdle,
            MiningError::SwitchConflict { .. } => RecoveryStrategy::RetryAfterCompletion,
            MiningError::WorkerUnrecoverable { .. } => RecoveryStrategy::RequireOperator,
            MiningError::Config { .. } => RecoveryStrategy::RequireOperator,
            _ => RecoveryStrategy::Ignore,
        }
    }

    /// 错误所属的设备
    pub fn device_id(&self) -> Option<Uuid> {
        match self {
            MiningError::LaunchFailure { device_id, .. }
            | MiningError::HeartbeatTimeout { device_id, .. }
            | MiningError::WorkerUnrecoverable { device_id, .. }
            | MiningError::SwitchConflict { device_id }
            | MiningError::DeviceNotFound { device_id }
            | MiningError::UnsupportedAlgorithm { device_id, .. }
            | MiningError::DeviceDisabled { device_id }
            | MiningError::InvalidBenchmark { device_id, .. }
            | MiningError::Benchmark { device_id, .. }
            | MiningError::Process { device_id, .. } => Some(*device_id),
            _ => None,
        }
    }

    /// 只有重试预算耗尽才需要让用户看到
    pub fn is_user_visible(&self) -> bool {
        matches!(self.recovery_strategy(), RecoveryStrategy::RequireOperator)
    }
}
