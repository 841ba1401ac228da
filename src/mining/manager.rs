use crate::benchmark::{BenchmarkService, BenchmarkStore};
use crate::config::Config;
use crate::device::{AlgorithmId, DeviceRegistry};
use crate::error::{MiningError, RecoveryStrategy};
use crate::market::{MarketDataFeed, MarketDataSource};
use crate::mining::{MiningEvent, MiningState};
use crate::stats::StatsAggregator;
use crate::switching::{Decision, DeviceState, ProfitabilityCalculator, RankedAlgorithm, SwitchingEngine};
use crate::worker::{ProcessLauncher, WorkerSupervisor};
use futures::future::join_all;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::{broadcast, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// 单个设备的控制项
struct DeviceControl {
    supervisor: Arc<WorkerSupervisor>,
    /// 手动指定的算法，设置后跳过收益策略
    forced: RwLock<Option<AlgorithmId>>,
}

/// 挖矿管理器 - 协调行情、收益计算、切换决策和 worker 监督
pub struct MiningManager {
    registry: Arc<DeviceRegistry>,
    benchmarks: Arc<BenchmarkStore>,
    feed: Arc<MarketDataFeed>,
    calculator: ProfitabilityCalculator,
    engine: SwitchingEngine,
    controls: BTreeMap<Uuid, DeviceControl>,
    stats: Arc<StatsAggregator>,
    benchmark_service: Option<Arc<dyn BenchmarkService>>,
    benchmarks_file: Option<PathBuf>,
    first_snapshot_timeout: Duration,
    /// 事件广播
    event_sender: broadcast::Sender<MiningEvent>,
    state: RwLock<MiningState>,
    /// 决策循环任务句柄
    tick_handle: Mutex<Option<JoinHandle<()>>>,
    shutdown: watch::Sender<bool>,
}

impl MiningManager {
    /// 创建挖矿管理器
    pub fn new(
        config: &Config,
        registry: Arc<DeviceRegistry>,
        benchmarks: Arc<BenchmarkStore>,
        source: Arc<dyn MarketDataSource>,
        launcher: Arc<dyn ProcessLauncher>,
    ) -> Self {
        info!("Creating mining manager for {} devices", registry.len());

        let (event_sender, _) = broadcast::channel(1000);
        let catalog = Arc::new(config.catalog());

        let feed = Arc::new(MarketDataFeed::new(source, config.market.clone(), event_sender.clone()));
        let calculator = ProfitabilityCalculator::new(registry.clone(), benchmarks.clone(), feed.subscribe());

        let controls: BTreeMap<Uuid, DeviceControl> = registry
            .devices()
            .map(|device| {
                let supervisor = Arc::new(WorkerSupervisor::new(
                    device.clone(),
                    catalog.clone(),
                    launcher.clone(),
                    config.pool.clone(),
                    config.supervisor.clone(),
                    event_sender.clone(),
                ));
                (
                    device.id,
                    DeviceControl {
                        supervisor,
                        forced: RwLock::new(None),
                    },
                )
            })
            .collect();

        let stats = Arc::new(StatsAggregator::new(
            controls.values().map(|control| control.supervisor.clone()),
            config.stats.clone(),
        ));
        let (shutdown, _) = watch::channel(false);

        Self {
            registry,
            benchmarks,
            feed,
            calculator,
            engine: SwitchingEngine::new(config.switching.clone()),
            controls,
            stats,
            benchmark_service: None,
            benchmarks_file: config.general.benchmarks_file.clone(),
            first_snapshot_timeout: config.market.first_snapshot_timeout(),
            event_sender,
            state: RwLock::new(MiningState::Stopped),
            tick_handle: Mutex::new(None),
            shutdown,
        }
    }

    /// 接入外部基准测试服务
    pub fn with_benchmark_service(mut self, service: Arc<dyn BenchmarkService>) -> Self {
        self.benchmark_service = Some(service);
        self
    }

    /// 启动行情轮询、统计和决策循环
    pub async fn start(self: &Arc<Self>) -> Result<(), MiningError> {
        {
            let mut state = self.state.write().await;
            if *state != MiningState::Stopped {
                warn!("Mining manager is already running");
                return Ok(());
            }
            *state = MiningState::Starting;
        }
        info!("🚀 Starting mining manager");

        self.feed.start().await;
        self.stats.start(self.event_sender.subscribe()).await;

        let manager = Arc::downgrade(self);
        let tick_interval = self.engine.config().tick_interval();
        self.shutdown.send_replace(false);
        let mut shutdown = self.shutdown.subscribe();
        *self.tick_handle.lock().await = Some(tokio::spawn(async move {
            let mut ticker = interval(tick_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown.changed() => break,
                }
                if *shutdown.borrow() {
                    break;
                }
                let Some(manager) = manager.upgrade() else { break };
                manager.tick().await;
            }
            debug!("Decision loop exited");
        }));

        *self.state.write().await = MiningState::Running;
        info!("✅ Mining manager started, decision tick every {:?}", tick_interval);
        Ok(())
    }

    /// 启用所有设备
    ///
    /// 先在有限时间内等待首个行情快照；超时后仍然启用，设备停留在 Selecting 直到数据到达。
    pub async fn start_all(&self) -> usize {
        if !self.feed.wait_for_first_snapshot(self.first_snapshot_timeout).await {
            warn!("⚠️ 尚无行情数据，设备将在数据到达后开始挖矿");
        }

        let results = join_all(self.controls.keys().map(|device_id| self.enable_device(*device_id))).await;
        let enabled = results.iter().filter(|result| result.is_ok()).count();
        info!("⛏️ 已启用 {}/{} 个设备", enabled, self.controls.len());
        enabled
    }

    /// 禁用所有设备
    pub async fn stop_all(&self) {
        join_all(self.controls.values().map(|control| control.supervisor.disable())).await;
        info!("All devices stopped");
    }

    /// 启用设备并立即做一次决策
    pub async fn enable_device(&self, device_id: Uuid) -> Result<(), MiningError> {
        let control = self.control(&device_id)?;
        control.supervisor.enable().await;

        if let Err(e) = self.tick_device(device_id).await {
            // 下一次 tick 会重试
            warn!("Initial selection for {} failed: {}", device_id, e);
        }
        Ok(())
    }

    /// 禁用设备
    ///
    /// 进行中的切换会先完成，随后立即停止；返回时设备没有存活进程。
    pub async fn disable_device(&self, device_id: Uuid) -> Result<(), MiningError> {
        let control = self.control(&device_id)?;
        control.supervisor.disable().await;
        Ok(())
    }

    /// 手动指定算法，`None` 清除
    pub async fn force_algorithm(
        &self,
        device_id: Uuid,
        algorithm: Option<AlgorithmId>,
    ) -> Result<(), MiningError> {
        let control = self.control(&device_id)?;

        if let Some(algorithm) = &algorithm {
            let device = self.registry.require(&device_id)?;
            if !device.supports(algorithm) {
                return Err(MiningError::UnsupportedAlgorithm {
                    device_id,
                    algorithm: algorithm.clone(),
                });
            }
            info!("📌 {} 手动指定算法 {}", device.name, algorithm);
        } else {
            info!("📌 {} 恢复自动切换", device_id);
        }

        *control.forced.write().await = algorithm.clone();

        if algorithm.is_some() {
            self.tick_device(device_id).await?;
        }
        Ok(())
    }

    /// 对所有设备做一次决策，设备之间并行
    pub async fn tick(&self) {
        let results = join_all(self.controls.keys().map(|device_id| self.tick_device(*device_id))).await;

        for (device_id, result) in self.controls.keys().zip(results) {
            let Err(e) = result else { continue };
            match e.recovery_strategy() {
                RecoveryStrategy::RetryAfterCompletion | RecoveryStrategy::Ignore => {
                    debug!("Tick for {} skipped: {}", device_id, e)
                }
                _ => warn!("⚠️ Tick for {} failed: {}", device_id, e),
            }
        }
    }

    /// 对单个设备做一次决策并执行
    pub async fn tick_device(&self, device_id: Uuid) -> Result<Decision, MiningError> {
        let control = self.control(&device_id)?;
        let supervisor = &control.supervisor;

        // 启动失败回到 Idle 的设备重新参与选择
        supervisor.resume_selection().await;

        let status = supervisor.status().await;
        let ranking = self.calculator.rank(&device_id);
        let forced = control.forced.read().await.clone();

        let decision = match &forced {
            Some(forced) => self.engine.decide_forced(&status.state, forced, &ranking),
            None => self.engine.decide(
                &status.state,
                &ranking,
                status.session.as_ref().map(|session| session.started_at),
                Instant::now(),
            ),
        };

        match &decision {
            Decision::NoAction(reason) => {
                debug!("{}: {} hold ({:?})", supervisor.device().name, status.state, reason);
            }
            Decision::Start { algorithm, payrate } => {
                info!(
                    "⛏️ {} 选择 {} (预期收益 {:.8}{})",
                    supervisor.device().name,
                    algorithm,
                    payrate,
                    if forced.is_some() { ", 手动" } else { "" }
                );
                supervisor.start(algorithm).await?;
            }
            Decision::Switch {
                from,
                to,
                current_payrate,
                best_payrate,
            } => {
                info!(
                    "💱 {} {} ({:.8}) → {} ({:.8})",
                    supervisor.device().name,
                    from,
                    current_payrate,
                    to,
                    best_payrate
                );
                supervisor.switch_to(to).await?;
            }
        }

        Ok(decision)
    }

    /// 重新测量一组 (设备, 算法) 的基准并保存
    pub async fn refresh_benchmark(
        &self,
        device_id: Uuid,
        algorithm: &AlgorithmId,
    ) -> Result<f64, MiningError> {
        let device = self.registry.require(&device_id)?;
        if !device.supports(algorithm) {
            return Err(MiningError::UnsupportedAlgorithm {
                device_id,
                algorithm: algorithm.clone(),
            });
        }
        let service = self.benchmark_service.as_ref().ok_or_else(|| MiningError::Benchmark {
            device_id,
            algorithm: algorithm.clone(),
            reason: "no benchmark service configured".to_string(),
        })?;

        info!("🧪 测量基准: {} / {}", device.name, algorithm);
        let hashrate = service.measure(&device, algorithm).await.map_err(|e| match e {
            MiningError::Benchmark { .. } => e,
            other => MiningError::Benchmark {
                device_id,
                algorithm: algorithm.clone(),
                reason: other.to_string(),
            },
        })?;
        self.benchmarks.record(device_id, algorithm.clone(), hashrate)?;

        if let Some(path) = &self.benchmarks_file {
            if let Err(e) = self.benchmarks.save(path) {
                warn!("⚠️ 保存基准数据失败: {}", e);
            }
        }
        info!(
            "✅ 基准已更新: {} / {} = {}",
            device.name,
            algorithm,
            crate::utils::format_hashrate(hashrate)
        );
        Ok(hashrate)
    }

    /// 停止所有 worker 和后台任务
    ///
    /// 返回时所有 worker 进程都已退出或被强制结束。
    pub async fn shutdown(&self) {
        let old_state = {
            let mut state = self.state.write().await;
            std::mem::replace(&mut *state, MiningState::Stopping)
        };
        info!("🛑 Shutting down mining manager (was {:?})", old_state);

        self.shutdown.send_replace(true);
        if let Some(handle) = self.tick_handle.lock().await.take() {
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    warn!("Decision loop ended abnormally: {}", e);
                }
            }
        }

        self.feed.stop().await;
        self.stop_all().await;
        self.stats.stop().await;

        *self.state.write().await = MiningState::Stopped;
        info!("✅ Mining manager stopped at {:?}", SystemTime::now());
    }

    fn control(&self, device_id: &Uuid) -> Result<&DeviceControl, MiningError> {
        self.controls
            .get(device_id)
            .ok_or(MiningError::DeviceNotFound { device_id: *device_id })
    }

    pub async fn state(&self) -> MiningState {
        *self.state.read().await
    }

    pub async fn device_state(&self, device_id: Uuid) -> Result<DeviceState, MiningError> {
        Ok(self.control(&device_id)?.supervisor.state().await)
    }

    pub async fn forced_algorithm(&self, device_id: Uuid) -> Result<Option<AlgorithmId>, MiningError> {
        Ok(self.control(&device_id)?.forced.read().await.clone())
    }

    pub fn ranking(&self, device_id: &Uuid) -> Vec<RankedAlgorithm> {
        self.calculator.rank(device_id)
    }

    pub fn supervisor(&self, device_id: &Uuid) -> Option<Arc<WorkerSupervisor>> {
        self.controls.get(device_id).map(|control| control.supervisor.clone())
    }

    pub fn stats(&self) -> Arc<StatsAggregator> {
        self.stats.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MiningEvent> {
        self.event_sender.subscribe()
    }

    pub fn market(&self) -> &Arc<MarketDataFeed> {
        &self.feed
    }

    pub fn benchmarks(&self) -> &Arc<BenchmarkStore> {
        &self.benchmarks
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }
}
