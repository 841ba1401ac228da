use crate::benchmark::{BenchmarkStore, BenchmarkTable};
use crate::device::{AlgorithmId, Device, DeviceRegistry};
use crate::market::MarketSnapshot;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::watch;
use uuid::Uuid;

/// 排名中的一项
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RankedAlgorithm {
    pub algorithm: AlgorithmId,
    /// 预期收益 = 基准算力 × 单位算力收益率
    pub payrate: f64,
}

/// 计算单个设备的收益排名
///
/// 只包含设备能力集内、且有基准和行情的算法；按收益降序，
/// 收益相同按算法 ID 升序。快照从未拉取过时返回空。
pub fn rank_with(
    device: &Device,
    benchmarks: &BenchmarkTable,
    snapshot: &MarketSnapshot,
) -> Vec<RankedAlgorithm> {
    if !snapshot.is_populated() {
        return Vec::new();
    }
    let Some(measured) = benchmarks.get(&device.id) else {
        return Vec::new();
    };

    let mut ranking: Vec<RankedAlgorithm> = device
        .algorithms
        .iter()
        .filter_map(|algorithm| {
            let hashrate = measured.get(algorithm)?.hashrate;
            let rate = snapshot.rate(algorithm)?;
            Some(RankedAlgorithm {
                algorithm: algorithm.clone(),
                payrate: hashrate * rate,
            })
        })
        .collect();

    ranking.sort_by(|a, b| {
        b.payrate
            .total_cmp(&a.payrate)
            .then_with(|| a.algorithm.cmp(&b.algorithm))
    });
    ranking
}

/// 收益计算器
///
/// 不缓存结果，每次决策都按最新的基准表和行情快照重新计算。
pub struct ProfitabilityCalculator {
    registry: Arc<DeviceRegistry>,
    benchmarks: Arc<BenchmarkStore>,
    market: watch::Receiver<Arc<MarketSnapshot>>,
}

impl ProfitabilityCalculator {
    pub fn new(
        registry: Arc<DeviceRegistry>,
        benchmarks: Arc<BenchmarkStore>,
        market: watch::Receiver<Arc<MarketSnapshot>>,
    ) -> Self {
        Self {
            registry,
            benchmarks,
            market,
        }
    }

    /// 设备的收益排名，空表示暂时没有可执行的决策
    pub fn rank(&self, device_id: &Uuid) -> Vec<RankedAlgorithm> {
        let Some(device) = self.registry.get(device_id) else {
            return Vec::new();
        };
        let snapshot = self.snapshot();
        let benchmarks = self.benchmarks.entries();
        rank_with(&device, &benchmarks, &snapshot)
    }

    pub fn payrate(&self, device_id: &Uuid, algorithm: &AlgorithmId) -> Option<f64> {
        self.rank(device_id)
            .into_iter()
            .find(|ranked| &ranked.algorithm == algorithm)
            .map(|ranked| ranked.payrate)
    }

    pub fn snapshot(&self) -> Arc<MarketSnapshot> {
        self.market.borrow().clone()
    }
}
