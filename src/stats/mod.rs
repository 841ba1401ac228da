//! 运行统计
//!
//! 汇总每个设备的当前算法、平滑算力、会话时长和崩溃次数，并定期输出一行汇总日志。

use crate::device::AlgorithmId;
use crate::market::MarketSnapshot;
use crate::mining::MiningEvent;
use crate::switching::DeviceState;
use crate::utils::format_hashrate;
use crate::worker::WorkerSupervisor;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, info};
use uuid::Uuid;

/// 统计配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsConfig {
    /// 是否定期输出汇总日志
    pub enabled: bool,
    /// 汇总日志间隔 (秒)
    pub log_interval_secs: u64,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            log_interval_secs: 30,
        }
    }
}

impl StatsConfig {
    pub fn log_interval(&self) -> Duration {
        Duration::from_secs(self.log_interval_secs)
    }
}

/// 单个设备的统计视图
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceStatsView {
    pub device_name: String,
    /// 当前算法；切换中为切换前最后一次会话的算法
    pub algorithm: Option<AlgorithmId>,
    /// 平滑算力 (H/s)
    pub hashrate: f64,
    pub session_uptime: Option<Duration>,
    pub state: DeviceState,
    pub switching: bool,
    pub unrecoverable: bool,
    pub crash_count: u64,
}

#[derive(Debug, Default)]
struct EventTally {
    crashes: HashMap<Uuid, u64>,
    unrecoverable: HashSet<Uuid>,
}

/// 统计汇总器
pub struct StatsAggregator {
    supervisors: BTreeMap<Uuid, Arc<WorkerSupervisor>>,
    config: StatsConfig,
    tally: RwLock<EventTally>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl StatsAggregator {
    pub fn new(supervisors: impl IntoIterator<Item = Arc<WorkerSupervisor>>, config: StatsConfig) -> Self {
        Self {
            supervisors: supervisors
                .into_iter()
                .map(|supervisor| (supervisor.device_id(), supervisor))
                .collect(),
            config,
            tally: RwLock::new(EventTally::default()),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// 启动事件消费和定期汇总任务
    pub async fn start(self: &Arc<Self>, mut events: broadcast::Receiver<MiningEvent>) {
        let mut tasks = self.tasks.lock().await;
        if !tasks.is_empty() {
            return;
        }

        let aggregator = Arc::downgrade(self);
        tasks.push(tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        let Some(aggregator) = aggregator.upgrade() else { break };
                        aggregator.record_event(&event).await;
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!("Stats consumer lagged, {} events skipped", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }));

        if self.config.enabled {
            let aggregator = Arc::downgrade(self);
            let log_interval = self.config.log_interval();
            tasks.push(tokio::spawn(async move {
                let mut ticker = interval(log_interval);
                // 第一次 tick 立即返回，跳过
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    let Some(aggregator) = aggregator.upgrade() else { break };
                    aggregator.log_summary().await;
                }
            }));
        }
    }

    pub async fn stop(&self) {
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
    }

    /// 处理一条事件
    pub async fn record_event(&self, event: &MiningEvent) {
        match event {
            MiningEvent::WorkerCrashed { device_id, .. } => {
                *self.tally.write().await.crashes.entry(*device_id).or_insert(0) += 1;
            }
            MiningEvent::WorkerUnrecoverable { device_id, .. } => {
                self.tally.write().await.unrecoverable.insert(*device_id);
            }
            MiningEvent::SessionStateChanged {
                device_id,
                new_state: DeviceState::Selecting,
                ..
            } => {
                // 重新启用
                self.tally.write().await.unrecoverable.remove(device_id);
            }
            _ => {}
        }
    }

    /// 所有设备的统计
    pub async fn snapshot(&self) -> BTreeMap<Uuid, DeviceStatsView> {
        let mut views = BTreeMap::new();
        for device_id in self.supervisors.keys() {
            if let Some(view) = self.device(device_id).await {
                views.insert(*device_id, view);
            }
        }
        views
    }

    pub async fn device(&self, device_id: &Uuid) -> Option<DeviceStatsView> {
        let supervisor = self.supervisors.get(device_id)?;
        let status = supervisor.status().await;
        let tally = self.tally.read().await;

        let switching = status.state.is_switching();
        let session = match (&status.session, switching) {
            (Some(session), _) => Some(session),
            (None, true) => status.last_session.as_ref(),
            (None, false) => None,
        };

        Some(DeviceStatsView {
            device_name: supervisor.device().name.clone(),
            algorithm: session.map(|s| s.algorithm.clone()),
            hashrate: session.map(|s| s.hashrate).unwrap_or(0.0),
            session_uptime: session.map(|s| s.uptime()),
            state: status.state.clone(),
            switching,
            unrecoverable: status.unrecoverable || tally.unrecoverable.contains(device_id),
            crash_count: tally.crashes.get(device_id).copied().unwrap_or(0),
        })
    }

    /// 所有设备平滑算力之和 (H/s)，不同算法的算力直接相加，仅供展示
    pub async fn fleet_hashrate(&self) -> f64 {
        self.snapshot()
            .await
            .values()
            .filter(|view| matches!(view.state, DeviceState::Running(_)))
            .map(|view| view.hashrate)
            .sum()
    }

    /// 按当前行情估算整个机群的收益率
    pub async fn estimated_payrate(&self, snapshot: &MarketSnapshot) -> f64 {
        self.snapshot()
            .await
            .values()
            .filter_map(|view| match &view.state {
                DeviceState::Running(algorithm) => snapshot.rate(algorithm).map(|rate| rate * view.hashrate),
                _ => None,
            })
            .sum()
    }

    async fn log_summary(&self) {
        let views = self.snapshot().await;
        let running = views
            .values()
            .filter(|view| matches!(view.state, DeviceState::Running(_)))
            .count();
        let total: f64 = views
            .values()
            .filter(|view| matches!(view.state, DeviceState::Running(_)))
            .map(|view| view.hashrate)
            .sum();

        info!(
            "📊 {}/{} 设备运行中 | 总算力 {}",
            running,
            views.len(),
            format_hashrate(total)
        );
        for view in views.values() {
            match &view.algorithm {
                Some(algorithm) => debug!(
                    "  {} [{}] {} {}",
                    view.device_name,
                    view.state,
                    algorithm,
                    format_hashrate(view.hashrate)
                ),
                None => debug!("  {} [{}]", view.device_name, view.state),
            }
        }
    }
}
