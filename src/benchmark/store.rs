use crate::device::AlgorithmId;
use crate::error::MiningError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info};
use uuid::Uuid;

/// 单条基准记录
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkEntry {
    /// 算力 (H/s)
    pub hashrate: f64,
    pub measured_at: DateTime<Utc>,
}

/// 设备 -> 算法 -> 基准
pub type BenchmarkTable = HashMap<Uuid, BTreeMap<AlgorithmId, BenchmarkEntry>>;

/// 持久化格式
#[derive(Debug, Serialize, Deserialize)]
struct PersistedBenchmark {
    device_id: Uuid,
    algorithm: AlgorithmId,
    hashrate: f64,
    measured_at: DateTime<Utc>,
}

/// 基准算力存储
///
/// 读者拿到的是不可变的整表版本，写入时复制后整体替换，
/// 决策 tick 永远不会看到写了一半的表。
pub struct BenchmarkStore {
    table: watch::Sender<Arc<BenchmarkTable>>,
}

impl BenchmarkStore {
    pub fn new() -> Self {
        let (table, _) = watch::channel(Arc::new(BenchmarkTable::new()));
        Self { table }
    }

    /// 记录基准，覆盖旧值
    pub fn record(
        &self,
        device_id: Uuid,
        algorithm: AlgorithmId,
        hashrate: f64,
    ) -> Result<(), MiningError> {
        self.record_entry(
            device_id,
            algorithm,
            BenchmarkEntry {
                hashrate,
                measured_at: Utc::now(),
            },
        )
    }

    pub fn record_entry(
        &self,
        device_id: Uuid,
        algorithm: AlgorithmId,
        entry: BenchmarkEntry,
    ) -> Result<(), MiningError> {
        if !entry.hashrate.is_finite() || entry.hashrate < 0.0 {
            return Err(MiningError::InvalidBenchmark {
                device_id,
                algorithm,
                hashrate: entry.hashrate,
            });
        }

        debug!("Benchmark recorded: {} {} = {} H/s", device_id, algorithm, entry.hashrate);
        self.table.send_modify(|table| {
            Arc::make_mut(table)
                .entry(device_id)
                .or_default()
                .insert(algorithm, entry);
        });
        Ok(())
    }

    pub fn lookup(&self, device_id: &Uuid, algorithm: &AlgorithmId) -> Option<f64> {
        self.entry(device_id, algorithm).map(|entry| entry.hashrate)
    }

    pub fn entry(&self, device_id: &Uuid, algorithm: &AlgorithmId) -> Option<BenchmarkEntry> {
        self.table
            .borrow()
            .get(device_id)
            .and_then(|entries| entries.get(algorithm))
            .copied()
    }

    /// 删除一条基准，该算法会从排名中消失直到重新测量
    pub fn remove(&self, device_id: &Uuid, algorithm: &AlgorithmId) -> Option<BenchmarkEntry> {
        let mut removed = None;
        self.table.send_if_modified(|table| {
            let exists = table
                .get(device_id)
                .map_or(false, |entries| entries.contains_key(algorithm));
            if exists {
                let entries = Arc::make_mut(table).entry(*device_id).or_default();
                removed = entries.remove(algorithm);
            }
            exists
        });
        removed
    }

    /// 当前整表版本
    pub fn entries(&self) -> Arc<BenchmarkTable> {
        self.table.borrow().clone()
    }

    pub fn len(&self) -> usize {
        self.table.borrow().values().map(|entries| entries.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 从 JSON 文件加载，文件不存在时返回空表
    pub fn load(path: &Path) -> Result<Self, MiningError> {
        let store = Self::new();
        if !path.exists() {
            info!("📋 基准文件不存在，使用空表: {}", path.display());
            return Ok(store);
        }

        let content = std::fs::read_to_string(path).map_err(|e| MiningError::Io {
            context: format!("read {}", path.display()),
            error: e.to_string(),
        })?;
        let persisted: Vec<PersistedBenchmark> =
            serde_json::from_str(&content).map_err(|e| MiningError::Io {
                context: format!("parse {}", path.display()),
                error: e.to_string(),
            })?;

        for record in persisted {
            store.record_entry(
                record.device_id,
                record.algorithm,
                BenchmarkEntry {
                    hashrate: record.hashrate,
                    measured_at: record.measured_at,
                },
            )?;
        }

        info!("📋 已加载 {} 条基准记录: {}", store.len(), path.display());
        Ok(store)
    }

    pub fn save(&self, path: &Path) -> Result<(), MiningError> {
        let table = self.entries();
        let mut persisted: Vec<PersistedBenchmark> = table
            .iter()
            .flat_map(|(device_id, entries)| {
                entries.iter().map(move |(algorithm, entry)| PersistedBenchmark {
                    device_id: *device_id,
                    algorithm: algorithm.clone(),
                    hashrate: entry.hashrate,
                    measured_at: entry.measured_at,
                })
            })
            .collect();
        persisted.sort_by(|a, b| {
            a.device_id
                .cmp(&b.device_id)
                .then_with(|| a.algorithm.cmp(&b.algorithm))
        });

        let content = serde_json::to_string_pretty(&persisted).map_err(|e| MiningError::Io {
            context: "serialize benchmarks".to_string(),
            error: e.to_string(),
        })?;
        std::fs::write(path, content).map_err(|e| MiningError::Io {
            context: format!("write {}", path.display()),
            error: e.to_string(),
        })?;

        debug!("Saved {} benchmarks to {}", persisted.len(), path.display());
        Ok(())
    }
}

impl Default for BenchmarkStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_lookup() {
        let store = BenchmarkStore::new();
        let device = Uuid::new_v4();
        let algo = AlgorithmId::new("etchash");

        assert!(store.lookup(&device, &algo).is_none());

        store.record(device, algo.clone(), 100.0).unwrap();
        assert_eq!(store.lookup(&device, &algo), Some(100.0));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_last_write_wins() {
        let store = BenchmarkStore::new();
        let device = Uuid::new_v4();
        let algo = AlgorithmId::new("kawpow");

        store.record(device, algo.clone(), 100.0).unwrap();
        store.record(device, algo.clone(), 40.0).unwrap();

        assert_eq!(store.lookup(&device, &algo), Some(40.0));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_rejects_invalid_hashrate() {
        let store = BenchmarkStore::new();
        let device = Uuid::new_v4();

        assert!(store.record(device, AlgorithmId::new("a"), f64::NAN).is_err());
        assert!(store.record(device, AlgorithmId::new("a"), -1.0).is_err());
        assert!(store.is_empty());
    }

    #[test]
    fn test_table_versions_are_immutable() {
        let store = BenchmarkStore::new();
        let device = Uuid::new_v4();
        let algo = AlgorithmId::new("etchash");

        store.record(device, algo.clone(), 10.0).unwrap();
        let before = store.entries();
        store.record(device, algo.clone(), 20.0).unwrap();

        assert_eq!(before[&device][&algo].hashrate, 10.0);
        assert_eq!(store.entries()[&device][&algo].hashrate, 20.0);
    }

    #[test]
    fn test_remove() {
        let store = BenchmarkStore::new();
        let device = Uuid::new_v4();
        let algo = AlgorithmId::new("etchash");

        assert!(store.remove(&device, &algo).is_none());
        store.record(device, algo.clone(), 10.0).unwrap();
        assert_eq!(store.remove(&device, &algo).map(|e| e.hashrate), Some(10.0));
        assert!(store.lookup(&device, &algo).is_none());
    }

    #[test]
    fn test_save_and_load() {
        let path = std::env::temp_dir().join(format!("switchminer-bench-{}.json", Uuid::new_v4()));
        let store = BenchmarkStore::new();
        let device = Uuid::new_v4();
        store.record(device, AlgorithmId::new("etchash"), 31_500_000.0).unwrap();
        store.record(device, AlgorithmId::new("kawpow"), 12_000_000.0).unwrap();

        store.save(&path).unwrap();
        let loaded = BenchmarkStore::load(&path).unwrap();

        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded.lookup(&device, &AlgorithmId::new("kawpow")), Some(12_000_000.0));

        std::fs::remove_file(path).ok();
    }

    #[test]
    fn test_load_missing_file() {
        let path = std::env::temp_dir().join(format!("switchminer-missing-{}.json", Uuid::new_v4()));
        let store = BenchmarkStore::load(&path).unwrap();
        assert!(store.is_empty());
    }
}
