//! 集成测试共用的假实现

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use switchminer_rs::benchmark::{BenchmarkService, BenchmarkStore};
use switchminer_rs::config::Config;
use switchminer_rs::device::{AlgorithmId, AlgorithmSpec, Device, DeviceKind, DeviceRegistry};
use switchminer_rs::market::MarketDataSource;
use switchminer_rs::mining::MiningEvent;
use switchminer_rs::worker::{Heartbeat, LaunchRequest, ProcessLauncher, WorkerProcess};
use switchminer_rs::{MiningError, MiningManager};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use uuid::Uuid;

pub fn algo(name: &str) -> AlgorithmId {
    AlgorithmId::new(name)
}

/// 可在测试中修改的行情源
#[derive(Default)]
pub struct StaticMarket {
    rates: Mutex<BTreeMap<AlgorithmId, f64>>,
    offline: AtomicBool,
}

impl StaticMarket {
    pub fn new(rates: &[(&str, f64)]) -> Self {
        let market = Self::default();
        market.set(rates);
        market
    }

    pub fn set(&self, rates: &[(&str, f64)]) {
        *self.rates.lock().unwrap() = rates.iter().map(|(a, r)| (algo(a), *r)).collect();
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }
}

#[async_trait]
impl MarketDataSource for StaticMarket {
    async fn fetch(&self) -> Result<BTreeMap<AlgorithmId, f64>, MiningError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(MiningError::FeedUnavailable {
                reason: "connection refused".to_string(),
            });
        }
        Ok(self.rates.lock().unwrap().clone())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum WorkerMode {
    Healthy,
    Silent,
    /// 启动即失败
    FailLaunch,
}

/// 记录启动历史和存活进程数的假启动器
pub struct FakeLauncher {
    mode: Mutex<WorkerMode>,
    launch_delay: Duration,
    launches: Arc<Mutex<Vec<(Uuid, AlgorithmId)>>>,
    live: Arc<AtomicUsize>,
}

impl FakeLauncher {
    pub fn new(mode: WorkerMode) -> Self {
        Self {
            mode: Mutex::new(mode),
            launch_delay: Duration::ZERO,
            launches: Arc::new(Mutex::new(Vec::new())),
            live: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.launch_delay = delay;
        self
    }

    pub fn set_mode(&self, mode: WorkerMode) {
        *self.mode.lock().unwrap() = mode;
    }

    pub fn launches(&self) -> Vec<(Uuid, AlgorithmId)> {
        self.launches.lock().unwrap().clone()
    }

    pub fn launched_algorithms(&self, device_id: Uuid) -> Vec<AlgorithmId> {
        self.launches()
            .into_iter()
            .filter(|(id, _)| *id == device_id)
            .map(|(_, algorithm)| algorithm)
            .collect()
    }

    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProcessLauncher for FakeLauncher {
    async fn launch(&self, request: &LaunchRequest) -> Result<Box<dyn WorkerProcess>, MiningError> {
        if !self.launch_delay.is_zero() {
            tokio::time::sleep(self.launch_delay).await;
        }
        let mode = *self.mode.lock().unwrap();
        if mode == WorkerMode::FailLaunch {
            return Err(MiningError::LaunchFailure {
                device_id: request.device.id,
                algorithm: request.algorithm.id.clone(),
                reason: "binary missing".to_string(),
            });
        }
        self.launches
            .lock()
            .unwrap()
            .push((request.device.id, request.algorithm.id.clone()));
        self.live.fetch_add(1, Ordering::SeqCst);

        let (sender, receiver) = mpsc::channel(16);
        let pump = match mode {
            WorkerMode::Healthy => tokio::spawn(async move {
                let mut ticker = tokio::time::interval(Duration::from_secs(1));
                loop {
                    ticker.tick().await;
                    if sender.send(Heartbeat::new(1_000_000.0)).await.is_err() {
                        break;
                    }
                }
            }),
            // 持有 sender 但从不发送
            WorkerMode::Silent => tokio::spawn(async move {
                std::future::pending::<()>().await;
                drop(sender);
            }),
            WorkerMode::FailLaunch => unreachable!(),
        };

        Ok(Box::new(FakeWorker {
            pid: self.launches.lock().unwrap().len() as u32,
            alive: true,
            heartbeats: Some(receiver),
            pump,
            live: self.live.clone(),
        }))
    }
}

struct FakeWorker {
    pid: u32,
    alive: bool,
    heartbeats: Option<mpsc::Receiver<Heartbeat>>,
    pump: JoinHandle<()>,
    live: Arc<AtomicUsize>,
}

impl FakeWorker {
    fn exit(&mut self) {
        if self.alive {
            self.alive = false;
            self.pump.abort();
            self.live.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl WorkerProcess for FakeWorker {
    fn id(&self) -> u32 {
        self.pid
    }

    fn take_heartbeats(&mut self) -> Option<mpsc::Receiver<Heartbeat>> {
        self.heartbeats.take()
    }

    async fn signal_terminate(&mut self) -> Result<(), MiningError> {
        self.exit();
        Ok(())
    }

    async fn kill(&mut self) -> Result<(), MiningError> {
        self.exit();
        Ok(())
    }

    async fn wait_exit(&mut self) -> Result<(), MiningError> {
        Ok(())
    }

    fn is_alive(&mut self) -> bool {
        self.alive
    }
}

impl Drop for FakeWorker {
    fn drop(&mut self) {
        self.exit();
    }
}

/// 固定返回一个算力的基准服务
pub struct FixedBenchmark(pub f64);

#[async_trait]
impl BenchmarkService for FixedBenchmark {
    async fn measure(&self, _device: &Device, _algorithm: &AlgorithmId) -> Result<f64, MiningError> {
        Ok(self.0)
    }
}

/// 测试配置: 切换阈值和驻留时间由调用方决定，其余取较短的值
pub fn test_config(threshold: f64, dwell_secs: u64, algorithms: &[&str]) -> Config {
    let mut config = Config::default();
    config.general.benchmarks_file = None;
    config.switching.switch_threshold = threshold;
    config.switching.min_dwell_secs = dwell_secs;
    config.switching.tick_interval_secs = 30;
    config.market.first_snapshot_timeout_secs = 5;
    config.supervisor.heartbeat_timeout_ms = 5_000;
    config.supervisor.grace_period_ms = 500;
    config.supervisor.max_consecutive_failures = 3;
    config.supervisor.backoff_base_ms = 100;
    config.supervisor.backoff_max_ms = 1_000;
    config.stats.enabled = false;
    config.algorithms = algorithms
        .iter()
        .map(|id| AlgorithmSpec::new(*id, format!("/opt/miners/{}", id), vec!["{algorithm}".to_string()]))
        .collect();
    config
}

pub fn gpu(name: &str, algorithms: &[&str]) -> Device {
    Device::new(
        Uuid::new_v4(),
        name,
        DeviceKind::Gpu,
        algorithms.iter().map(|a| algo(a)),
    )
}

/// 测试环境
pub struct Rig {
    pub manager: Arc<MiningManager>,
    pub launcher: Arc<FakeLauncher>,
    pub market: Arc<StaticMarket>,
    pub benchmarks: Arc<BenchmarkStore>,
}

impl Rig {
    pub fn new(config: &Config, devices: Vec<Device>, launcher: FakeLauncher, market: StaticMarket) -> Self {
        Self::build(config, devices, launcher, market, None)
    }

    pub fn build(
        config: &Config,
        devices: Vec<Device>,
        launcher: FakeLauncher,
        market: StaticMarket,
        service: Option<Arc<dyn BenchmarkService>>,
    ) -> Self {
        let registry = Arc::new(DeviceRegistry::new(devices));
        let benchmarks = Arc::new(BenchmarkStore::new());
        let launcher = Arc::new(launcher);
        let market = Arc::new(market);
        let mut manager = MiningManager::new(config, registry, benchmarks.clone(), market.clone(), launcher.clone());
        if let Some(service) = service {
            manager = manager.with_benchmark_service(service);
        }
        let manager = Arc::new(manager);
        Self {
            manager,
            launcher,
            market,
            benchmarks,
        }
    }

    pub fn bench(&self, device: &Device, pairs: &[(&str, f64)]) {
        for (algorithm, hashrate) in pairs {
            self.benchmarks.record(device.id, algo(algorithm), *hashrate).unwrap();
        }
    }
}

pub async fn wait_for_event<F>(receiver: &mut broadcast::Receiver<MiningEvent>, mut predicate: F) -> MiningEvent
where
    F: FnMut(&MiningEvent) -> bool,
{
    loop {
        match receiver.recv().await {
            Ok(event) if predicate(&event) => return event,
            Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
        }
    }
}
