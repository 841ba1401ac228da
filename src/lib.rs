//! SwitchMiner-RS - 收益切换挖矿调度器
//!
//! 为每个本地计算设备 (GPU/CPU) 持续选择收益最高的挖矿算法：
//! - 定时拉取行情，计算 `基准算力 × 单位收益率` 排名
//! - 带阈值和最短驻留时间的切换策略，避免频繁切换
//! - 监督每个设备的外部 worker 进程，心跳超时自动退避重启
//!
//! 入口是 [`MiningManager`]。

pub mod benchmark;
pub mod config;
pub mod device;
pub mod error;
pub mod logging;
pub mod market;
pub mod mining;
pub mod stats;
pub mod switching;
pub mod utils;
pub mod worker;

pub use config::Config;
pub use error::MiningError;
pub use mining::MiningManager;

/// 程序版本
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// 程序名称
pub const NAME: &str = "switchminer-rs";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_name() {
        assert_eq!(NAME, "switchminer-rs");
    }
}
