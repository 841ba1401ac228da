pub mod algorithm;
pub mod registry;

#[cfg(test)]
mod tests;

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use uuid::Uuid;

pub use algorithm::{AlgorithmCatalog, AlgorithmSpec};
pub use registry::DeviceRegistry;

/// 算法标识
///
/// 按字典序排序，收益相同时用它来打破平局。
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AlgorithmId(String);

impl AlgorithmId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AlgorithmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AlgorithmId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for AlgorithmId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// 设备类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    Cpu,
    Gpu,
    Other,
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceKind::Cpu => write!(f, "CPU"),
            DeviceKind::Gpu => write!(f, "GPU"),
            DeviceKind::Other => write!(f, "OTHER"),
        }
    }
}

/// 计算设备
///
/// 发现后不可变，只在进程退出或设备移除时销毁。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub id: Uuid,
    pub name: String,
    pub kind: DeviceKind,
    pub algorithms: BTreeSet<AlgorithmId>,
}

impl Device {
    pub fn new(
        id: Uuid,
        name: impl Into<String>,
        kind: DeviceKind,
        algorithms: impl IntoIterator<Item = AlgorithmId>,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            kind,
            algorithms: algorithms.into_iter().collect(),
        }
    }

    /// 设备能否运行该算法
    pub fn supports(&self, algorithm: &AlgorithmId) -> bool {
        self.algorithms.contains(algorithm)
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} ({})", self.kind, self.name, self.id)
    }
}
