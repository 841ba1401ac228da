use super::*;
use super::registry::{DeviceEntry, DevicesConfig};
use std::path::PathBuf;

fn catalog() -> AlgorithmCatalog {
    AlgorithmCatalog::new(vec![
        AlgorithmSpec::new("etchash", "/opt/miners/etc", vec!["--algo".to_string(), "{algorithm}".to_string()]),
        AlgorithmSpec::new("kawpow", "/opt/miners/kaw", Vec::new()),
        AlgorithmSpec::new("randomx", "/opt/miners/xmr", Vec::new()),
    ])
}

fn gpu_entry(name: &str, algorithms: &[&str]) -> DeviceEntry {
    DeviceEntry {
        id: Uuid::new_v4(),
        name: name.to_string(),
        kind: DeviceKind::Gpu,
        algorithms: algorithms.iter().map(|a| AlgorithmId::new(*a)).collect(),
    }
}

#[test]
fn test_algorithm_id_ordering() {
    let mut ids = vec![AlgorithmId::new("kawpow"), AlgorithmId::new("etchash"), AlgorithmId::new("autolykos")];
    ids.sort();
    assert_eq!(ids[0].as_str(), "autolykos");
    assert_eq!(ids[2].to_string(), "kawpow");
}

#[test]
fn test_device_capabilities() {
    let device = Device::new(
        Uuid::new_v4(),
        "gpu0",
        DeviceKind::Gpu,
        vec![AlgorithmId::new("etchash"), AlgorithmId::new("kawpow")],
    );

    assert!(device.supports(&AlgorithmId::new("etchash")));
    assert!(!device.supports(&AlgorithmId::new("randomx")));
    assert!(device.to_string().starts_with("GPU gpu0"));
}

#[test]
fn test_catalog_lookup() {
    let catalog = catalog();

    assert_eq!(catalog.len(), 3);
    assert_eq!(catalog.require(&AlgorithmId::new("kawpow")).unwrap().binary, PathBuf::from("/opt/miners/kaw"));
    assert!(matches!(
        catalog.require(&AlgorithmId::new("sha256")),
        Err(crate::error::MiningError::UnknownAlgorithm { .. })
    ));
    assert_eq!(catalog.ids().first().map(|id| id.as_str()), Some("etchash"));
}

#[test]
fn test_registry_from_config() {
    let config = DevicesConfig {
        auto_detect_cpu: false,
        cpu_algorithms: Vec::new(),
        entries: vec![gpu_entry("gpu0", &["etchash", "kawpow"]), gpu_entry("gpu1", &["kawpow"])],
    };

    let registry = DeviceRegistry::from_config(&config, &catalog()).unwrap();
    assert_eq!(registry.len(), 2);
    assert_eq!(registry.capable_of(&AlgorithmId::new("kawpow")).len(), 2);
    assert_eq!(registry.capable_of(&AlgorithmId::new("etchash")).len(), 1);

    let id = config.entries[0].id;
    assert_eq!(registry.require(&id).unwrap().name, "gpu0");
    assert!(registry.get(&Uuid::new_v4()).is_none());
}

#[test]
fn test_registry_rejects_unknown_algorithm() {
    let config = DevicesConfig {
        auto_detect_cpu: false,
        cpu_algorithms: Vec::new(),
        entries: vec![gpu_entry("gpu0", &["sha256"])],
    };

    assert!(DeviceRegistry::from_config(&config, &catalog()).is_err());
}

#[test]
fn test_registry_rejects_duplicate_ids() {
    let entry = gpu_entry("gpu0", &["etchash"]);
    let config = DevicesConfig {
        auto_detect_cpu: false,
        cpu_algorithms: Vec::new(),
        entries: vec![entry.clone(), entry],
    };

    assert!(DeviceRegistry::from_config(&config, &catalog()).is_err());
}

#[test]
fn test_cpu_detection_is_stable() {
    let algorithms = vec![AlgorithmId::new("randomx")];
    let first = DeviceRegistry::detect_cpu(&algorithms);
    let second = DeviceRegistry::detect_cpu(&algorithms);

    assert_eq!(first.id, second.id);
    assert_eq!(first.kind, DeviceKind::Cpu);
    assert!(first.supports(&AlgorithmId::new("randomx")));
}

#[test]
fn test_auto_detected_cpu_skips_unknown_algorithms() {
    let config = DevicesConfig {
        auto_detect_cpu: true,
        cpu_algorithms: vec![AlgorithmId::new("sha256")],
        entries: Vec::new(),
    };

    let registry = DeviceRegistry::from_config(&config, &catalog()).unwrap();
    assert!(registry.is_empty());
}
