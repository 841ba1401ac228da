use super::{AlgorithmCatalog, AlgorithmId, Device, DeviceKind};
use crate::error::MiningError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use sysinfo::System;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// 设备配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DevicesConfig {
    /// 是否自动添加本机 CPU
    pub auto_detect_cpu: bool,
    /// CPU 可运行的算法
    #[serde(default)]
    pub cpu_algorithms: Vec<AlgorithmId>,
    #[serde(default)]
    pub entries: Vec<DeviceEntry>,
}

/// 手动声明的设备
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceEntry {
    pub id: Uuid,
    pub name: String,
    pub kind: DeviceKind,
    pub algorithms: Vec<AlgorithmId>,
}

impl Default for DevicesConfig {
    fn default() -> Self {
        Self {
            auto_detect_cpu: true,
            cpu_algorithms: vec![AlgorithmId::new("randomx")],
            entries: Vec::new(),
        }
    }
}

/// 设备注册表
///
/// 进程级状态，启动时枚举一次，之后只读。
#[derive(Debug, Clone, Default)]
pub struct DeviceRegistry {
    devices: BTreeMap<Uuid, Arc<Device>>,
}

impl DeviceRegistry {
    pub fn new(devices: impl IntoIterator<Item = Device>) -> Self {
        Self {
            devices: devices
                .into_iter()
                .map(|device| (device.id, Arc::new(device)))
                .collect(),
        }
    }

    /// 根据配置枚举设备
    pub fn from_config(
        config: &DevicesConfig,
        catalog: &AlgorithmCatalog,
    ) -> Result<Self, MiningError> {
        info!("🔧 枚举设备");

        let mut devices = BTreeMap::new();
        for entry in &config.entries {
            for algorithm in &entry.algorithms {
                if !catalog.contains(algorithm) {
                    return Err(MiningError::UnknownAlgorithm { algorithm: algorithm.clone() });
                }
            }
            let device = Device::new(entry.id, entry.name.clone(), entry.kind, entry.algorithms.iter().cloned());
            if devices.insert(device.id, Arc::new(device)).is_some() {
                return Err(MiningError::Config {
                    field: "devices.entries".to_string(),
                    reason: format!("duplicate device id {}", entry.id),
                });
            }
        }

        if config.auto_detect_cpu {
            let algorithms: Vec<_> = config
                .cpu_algorithms
                .iter()
                .filter(|algorithm| {
                    let known = catalog.contains(algorithm);
                    if !known {
                        warn!("⚠️ CPU 算法 {} 没有启动模板，已忽略", algorithm);
                    }
                    known
                })
                .cloned()
                .collect();

            if algorithms.is_empty() {
                warn!("⚠️ 没有可用的 CPU 算法，跳过 CPU 检测");
            } else {
                let cpu = Self::detect_cpu(&algorithms);
                devices.entry(cpu.id).or_insert_with(|| Arc::new(cpu));
            }
        }

        for device in devices.values() {
            info!("✅ 设备: {} 算法: {:?}", device, device.algorithms);
        }

        Ok(Self { devices })
    }

    /// 检测本机 CPU
    ///
    /// UUID 由 CPU 型号派生，重启后保持不变，已记录的基准数据仍然有效。
    pub fn detect_cpu(algorithms: &[AlgorithmId]) -> Device {
        let mut system = System::new();
        system.refresh_cpu();

        let brand = system
            .cpus()
            .first()
            .map(|cpu| cpu.brand().trim().to_string())
            .filter(|brand| !brand.is_empty())
            .unwrap_or_else(|| "Generic CPU".to_string());
        debug!("检测到 CPU: {} ({} 线程)", brand, num_cpus::get());

        let id = Uuid::new_v5(&Uuid::NAMESPACE_OID, format!("cpu0:{}", brand).as_bytes());
        Device::new(id, format!("CPU0 {}", brand), DeviceKind::Cpu, algorithms.iter().cloned())
    }

    pub fn get(&self, device_id: &Uuid) -> Option<Arc<Device>> {
        self.devices.get(device_id).cloned()
    }

    pub fn require(&self, device_id: &Uuid) -> Result<Arc<Device>, MiningError> {
        self.get(device_id)
            .ok_or(MiningError::DeviceNotFound { device_id: *device_id })
    }

    /// 按 UUID 排序遍历
    pub fn devices(&self) -> impl Iterator<Item = &Arc<Device>> {
        self.devices.values()
    }

    pub fn ids(&self) -> Vec<Uuid> {
        self.devices.keys().copied().collect()
    }

    /// 能运行指定算法的设备
    pub fn capable_of(&self, algorithm: &AlgorithmId) -> Vec<Arc<Device>> {
        self.devices
            .values()
            .filter(|device| device.supports(algorithm))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}
