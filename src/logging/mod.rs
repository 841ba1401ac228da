//! 日志系统

use crate::error::MiningError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::{non_blocking, rolling};
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

/// 日志配置
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// 日志级别
    pub level: String,
    /// 日志文件路径，写入 JSON 格式
    pub file_path: Option<String>,
    /// 是否启用彩色输出
    pub colored: bool,
    /// 是否显示线程ID
    pub show_thread_id: bool,
    /// 是否显示目标模块
    pub show_target: bool,
    /// 紧凑输出
    pub compact: bool,
    /// 日志轮转
    pub rotation: LogRotation,
}

/// 日志轮转配置
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogRotation {
    /// 不轮转
    Never,
    /// 每小时轮转
    Hourly,
    /// 每天轮转
    Daily,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file_path: None,
            colored: true,
            show_thread_id: false,
            show_target: false,
            compact: true,
            rotation: LogRotation::Daily,
        }
    }
}

fn parse_level(level: &str) -> tracing::Level {
    match level.to_lowercase().as_str() {
        "trace" => tracing::Level::TRACE,
        "debug" => tracing::Level::DEBUG,
        "warn" => tracing::Level::WARN,
        "error" => tracing::Level::ERROR,
        _ => tracing::Level::INFO,
    }
}

/// 初始化日志系统
///
/// 写文件时返回的 guard 必须保持到进程退出，否则缓冲中的日志会丢失。
pub fn init_logging(config: LogConfig) -> Result<Option<WorkerGuard>, MiningError> {
    let env_filter = EnvFilter::from_default_env().add_directive(parse_level(&config.level).into());
    let registry = tracing_subscriber::registry().with(env_filter);

    // 控制台输出层
    let console_layer = if config.compact {
        fmt::layer()
            .compact()
            .with_ansi(config.colored)
            .with_target(config.show_target)
            .with_thread_ids(config.show_thread_id)
            .boxed()
    } else {
        fmt::layer()
            .with_ansi(config.colored)
            .with_target(config.show_target)
            .with_thread_ids(config.show_thread_id)
            .with_span_events(FmtSpan::CLOSE)
            .boxed()
    };

    let Some(file_path) = config.file_path else {
        registry.with(console_layer).try_init().map_err(init_error)?;
        return Ok(None);
    };

    // 文件输出层
    let file_path = Path::new(&file_path);
    let directory = file_path.parent().unwrap_or(Path::new("."));
    let file_name = file_path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("switchminer.log");

    let (writer, guard) = match config.rotation {
        LogRotation::Never => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(file_path)
                .map_err(|e| MiningError::Io {
                    context: format!("open log file {}", file_path.display()),
                    error: e.to_string(),
                })?;
            non_blocking(file)
        }
        LogRotation::Hourly => non_blocking(rolling::hourly(directory, file_name)),
        LogRotation::Daily => non_blocking(rolling::daily(directory, file_name)),
    };

    let file_layer = fmt::layer()
        .with_writer(writer)
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(true)
        .json();

    registry
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .map_err(init_error)?;

    Ok(Some(guard))
}

fn init_error(error: impl std::fmt::Display) -> MiningError {
    MiningError::Config {
        field: "logging".to_string(),
        reason: error.to_string(),
    }
}

#[macro_export]
macro_rules! device_info {
    ($device_id:expr, $($arg:tt)*) => {
        tracing::info!(target: "device", device_id = %$device_id, $($arg)*)
    };
}

#[macro_export]
macro_rules! device_warn {
    ($device_id:expr, $($arg:tt)*) => {
        tracing::warn!(target: "device", device_id = %$device_id, $($arg)*)
    };
}

#[macro_export]
macro_rules! device_error {
    ($device_id:expr, $($arg:tt)*) => {
        tracing::error!(target: "device", device_id = %$device_id, $($arg)*)
    };
}
