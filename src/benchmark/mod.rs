//! 基准算力
//!
//! 基准测试本身由外部服务完成，这里只保存结果。

pub mod store;

use crate::device::{AlgorithmId, Device};
use crate::error::MiningError;
use async_trait::async_trait;

pub use store::{BenchmarkEntry, BenchmarkStore, BenchmarkTable};

/// 外部基准测试服务
#[async_trait]
pub trait BenchmarkService: Send + Sync {
    /// 测量设备在该算法下的算力 (H/s)
    async fn measure(&self, device: &Device, algorithm: &AlgorithmId) -> Result<f64, MiningError>;
}
