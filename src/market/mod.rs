//! 行情数据
//!
//! 定时轮询外部收益率数据源，整体替换快照并跟踪过期状态。

pub mod feed;
pub mod http;

use crate::device::AlgorithmId;
use crate::error::MiningError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;

pub use feed::{MarketConfig, MarketDataFeed};
pub use http::HttpMarketSource;

/// 外部行情数据源
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MarketDataSource: Send + Sync {
    /// 拉取每个算法的单位算力收益率
    async fn fetch(&self) -> Result<BTreeMap<AlgorithmId, f64>, MiningError>;
}

/// 行情快照
///
/// 只会整体替换，从不部分更新。`version == 0` 表示还没有成功拉取过。
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MarketSnapshot {
    pub version: u64,
    pub rates: BTreeMap<AlgorithmId, f64>,
    pub fetched_at: Option<DateTime<Utc>>,
}

impl MarketSnapshot {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_populated(&self) -> bool {
        self.version > 0
    }

    pub fn rate(&self, algorithm: &AlgorithmId) -> Option<f64> {
        self.rates.get(algorithm).copied()
    }

    pub fn age(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.fetched_at
            .map(|fetched_at| (now - fetched_at).to_std().unwrap_or(Duration::ZERO))
    }

    /// 快照年龄超过阈值，或从未拉取过
    pub fn is_stale(&self, now: DateTime<Utc>, max_age: Duration) -> bool {
        match self.age(now) {
            Some(age) => age > max_age,
            None => true,
        }
    }
}
