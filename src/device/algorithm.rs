//! 算法启动模板

use super::AlgorithmId;
use crate::error::MiningError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// 启动某个算法 worker 所需的模板
///
/// `args` 中可以使用占位符，由进程启动器在启动时替换。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlgorithmSpec {
    pub id: AlgorithmId,
    pub binary: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
}

impl AlgorithmSpec {
    pub fn new(id: impl Into<AlgorithmId>, binary: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            id: id.into(),
            binary: binary.into(),
            args,
        }
    }
}

/// 已知算法集合
#[derive(Debug, Clone, Default)]
pub struct AlgorithmCatalog {
    specs: HashMap<AlgorithmId, AlgorithmSpec>,
}

impl AlgorithmCatalog {
    pub fn new(specs: impl IntoIterator<Item = AlgorithmSpec>) -> Self {
        Self {
            specs: specs.into_iter().map(|spec| (spec.id.clone(), spec)).collect(),
        }
    }

    pub fn get(&self, algorithm: &AlgorithmId) -> Option<&AlgorithmSpec> {
        self.specs.get(algorithm)
    }

    pub fn require(&self, algorithm: &AlgorithmId) -> Result<&AlgorithmSpec, MiningError> {
        self.specs.get(algorithm).ok_or_else(|| MiningError::UnknownAlgorithm {
            algorithm: algorithm.clone(),
        })
    }

    pub fn contains(&self, algorithm: &AlgorithmId) -> bool {
        self.specs.contains_key(algorithm)
    }

    /// 排序后的算法列表
    pub fn ids(&self) -> Vec<AlgorithmId> {
        let mut ids: Vec<_> = self.specs.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }
}
