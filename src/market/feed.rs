use super::{MarketDataSource, MarketSnapshot};
use crate::error::MiningError;
use crate::mining::MiningEvent;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

/// 行情配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketConfig {
    /// 行情接口地址
    pub source_url: String,
    /// 收益率所在的 JSON 字段，为空表示根对象
    #[serde(default)]
    pub rates_field: Option<String>,
    /// 轮询间隔 (秒)
    pub poll_interval_secs: u64,
    /// 单次请求超时 (秒)
    pub request_timeout_secs: u64,
    /// 快照最大年龄 (秒)
    pub max_snapshot_age_secs: u64,
    /// 连续失败多少次后直接视为过期
    pub max_consecutive_failures: u32,
    /// 启动挖矿前等待首个快照的时间 (秒)
    pub first_snapshot_timeout_secs: u64,
}

impl Default for MarketConfig {
    fn default() -> Self {
        Self {
            source_url: "https://api.example.com/v2/mining/profitability".to_string(),
            rates_field: Some("algorithms".to_string()),
            poll_interval_secs: 60,
            request_timeout_secs: 10,
            max_snapshot_age_secs: 300,
            max_consecutive_failures: 3,
            first_snapshot_timeout_secs: 10,
        }
    }
}

impl MarketConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn max_snapshot_age(&self) -> Duration {
        Duration::from_secs(self.max_snapshot_age_secs)
    }

    pub fn first_snapshot_timeout(&self) -> Duration {
        Duration::from_secs(self.first_snapshot_timeout_secs)
    }
}

/// 行情轮询器
pub struct MarketDataFeed {
    source: Arc<dyn MarketDataSource>,
    config: MarketConfig,
    /// 当前快照，整体替换
    snapshot: watch::Sender<Arc<MarketSnapshot>>,
    consecutive_failures: AtomicU32,
    events: broadcast::Sender<MiningEvent>,
    poll_handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl MarketDataFeed {
    pub fn new(
        source: Arc<dyn MarketDataSource>,
        config: MarketConfig,
        events: broadcast::Sender<MiningEvent>,
    ) -> Self {
        let (snapshot, _) = watch::channel(Arc::new(MarketSnapshot::empty()));
        Self {
            source,
            config,
            snapshot,
            consecutive_failures: AtomicU32::new(0),
            events,
            poll_handle: Mutex::new(None),
        }
    }

    /// 拉取一次行情
    ///
    /// 成功时整体替换快照；失败时保留旧快照并累计连续失败次数。
    pub async fn poll(&self) -> Result<Arc<MarketSnapshot>, MiningError> {
        match self.source.fetch().await {
            Ok(rates) => {
                let rates: std::collections::BTreeMap<_, _> = rates
                    .into_iter()
                    .filter(|(algorithm, rate)| {
                        let valid = rate.is_finite() && *rate >= 0.0;
                        if !valid {
                            debug!("Ignoring invalid rate for {}: {}", algorithm, rate);
                        }
                        valid
                    })
                    .collect();
                let algorithms = rates.len();

                let mut published = None;
                self.snapshot.send_modify(|current| {
                    let next = Arc::new(MarketSnapshot {
                        version: current.version + 1,
                        rates,
                        fetched_at: Some(Utc::now()),
                    });
                    published = Some(next.clone());
                    *current = next;
                });
                let snapshot = published.unwrap_or_else(|| self.current_snapshot());

                let previous_failures = self.consecutive_failures.swap(0, Ordering::AcqRel);
                if previous_failures > 0 {
                    info!("✅ 行情恢复，之前连续失败 {} 次", previous_failures);
                }
                debug!("Market snapshot v{} with {} algorithms", snapshot.version, algorithms);

                let _ = self.events.send(MiningEvent::MarketUpdated {
                    version: snapshot.version,
                    algorithms,
                });
                Ok(snapshot)
            }
            Err(e) => {
                let failures = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
                let stale = self.is_stale();
                let reason = match &e {
                    MiningError::FeedUnavailable { reason } => reason.clone(),
                    other => other.to_string(),
                };

                if failures >= self.config.max_consecutive_failures {
                    warn!("⚠️ 行情连续失败 {} 次，快照已视为过期: {}", failures, reason);
                } else {
                    warn!("Market poll failed ({}): {}", failures, reason);
                }

                let _ = self.events.send(MiningEvent::MarketFeedFailed {
                    consecutive_failures: failures,
                    stale,
                    reason: reason.clone(),
                });
                Err(MiningError::FeedUnavailable { reason })
            }
        }
    }

    /// 当前快照，不阻塞
    pub fn current_snapshot(&self) -> Arc<MarketSnapshot> {
        self.snapshot.borrow().clone()
    }

    /// 订阅快照变化
    pub fn subscribe(&self) -> watch::Receiver<Arc<MarketSnapshot>> {
        self.snapshot.subscribe()
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Acquire)
    }

    /// 连续失败达到上限，或快照年龄超过阈值
    pub fn is_stale(&self) -> bool {
        self.consecutive_failures() >= self.config.max_consecutive_failures
            || self
                .current_snapshot()
                .is_stale(Utc::now(), self.config.max_snapshot_age())
    }

    /// 等待首个成功快照，超时返回 false
    pub async fn wait_for_first_snapshot(&self, timeout: Duration) -> bool {
        let mut receiver = self.snapshot.subscribe();
        let outcome = tokio::time::timeout(timeout, receiver.wait_for(|snapshot| snapshot.is_populated()))
            .await
            .map(|ready| ready.is_ok());

        match outcome {
            Ok(ready) => ready,
            Err(_) => {
                warn!("⚠️ 等待行情数据超时 ({:?})", timeout);
                false
            }
        }
    }

    /// 启动定时轮询
    pub async fn start(self: &Arc<Self>) {
        let mut handle = self.poll_handle.lock().await;
        if handle.is_some() {
            debug!("Market feed already running");
            return;
        }

        let feed = Arc::downgrade(self);
        let poll_interval = self.config.poll_interval();
        *handle = Some(tokio::spawn(async move {
            let mut ticker = interval(poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                let Some(feed) = feed.upgrade() else { break };
                // 失败已在 poll 中记录
                let _ = feed.poll().await;
            }
        }));

        info!("📈 行情轮询已启动，间隔 {:?}", poll_interval);
    }

    /// 停止定时轮询
    pub async fn stop(&self) {
        if let Some(handle) = self.poll_handle.lock().await.take() {
            handle.abort();
            info!("Market feed stopped");
        }
    }
}
