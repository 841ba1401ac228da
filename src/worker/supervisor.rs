//! 单设备 worker 监督
//!
//! 每个设备一个 `WorkerSupervisor`。生命周期操作 (启动、停止、切换、崩溃恢复)
//! 全部在设备级的 `lifecycle` 锁内串行执行，保证同一设备最多一个存活进程。

use super::launcher::{Heartbeat, LaunchRequest, PoolSettings, ProcessLauncher, WorkerProcess};
use crate::device::{AlgorithmCatalog, AlgorithmId, Device};
use crate::error::MiningError;
use crate::mining::{CrashCause, MiningEvent};
use crate::switching::DeviceState;
use crate::{device_error, device_info, device_warn};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime};
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, error};
use uuid::Uuid;

/// 监督配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SupervisorConfig {
    /// 心跳超时 (毫秒)
    pub heartbeat_timeout_ms: u64,
    /// 优雅退出等待时间 (毫秒)
    pub grace_period_ms: u64,
    /// 连续失败多少次后放弃重启
    pub max_consecutive_failures: u32,
    /// 退避基数 (毫秒)
    pub backoff_base_ms: u64,
    /// 退避上限 (毫秒)
    pub backoff_max_ms: u64,
    /// 算力 EMA 平滑系数 (0, 1]
    pub hashrate_smoothing: f64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout_ms: 60_000,
            grace_period_ms: 5_000,
            max_consecutive_failures: 5,
            backoff_base_ms: 2_000,
            backoff_max_ms: 60_000,
            hashrate_smoothing: 0.3,
        }
    }
}

impl SupervisorConfig {
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    /// 第 n 次连续失败后的重启等待: `min(base * 2^(n-1), max)`
    pub fn backoff(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(32);
        let delay = self.backoff_base_ms.saturating_mul(1u64 << exponent);
        Duration::from_millis(delay.min(self.backoff_max_ms))
    }
}

/// 一次挖矿会话
#[derive(Debug, Clone, PartialEq)]
pub struct MiningSession {
    pub algorithm: AlgorithmId,
    pub worker_id: u32,
    pub started_at: Instant,
    pub last_heartbeat: Option<Instant>,
    /// 平滑后的算力 (H/s)
    pub hashrate: f64,
    pub heartbeats: u64,
}

impl MiningSession {
    fn new(algorithm: AlgorithmId, worker_id: u32) -> Self {
        Self {
            algorithm,
            worker_id,
            started_at: Instant::now(),
            last_heartbeat: None,
            hashrate: 0.0,
            heartbeats: 0,
        }
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    fn record(&mut self, heartbeat: &Heartbeat, smoothing: f64) {
        self.hashrate = if self.heartbeats == 0 {
            heartbeat.hashrate
        } else {
            smoothing * heartbeat.hashrate + (1.0 - smoothing) * self.hashrate
        };
        self.heartbeats += 1;
        self.last_heartbeat = Some(heartbeat.at);
    }
}

/// 对外可见的监督状态
#[derive(Debug, Clone, Default)]
pub struct SupervisorStatus {
    pub state: DeviceState,
    pub session: Option<MiningSession>,
    /// 最近一次结束的会话，停止后仍可用于统计
    pub last_session: Option<MiningSession>,
    pub consecutive_failures: u32,
    pub unrecoverable: bool,
}

#[derive(Default)]
struct Lifecycle {
    worker: Option<Box<dyn WorkerProcess>>,
    monitor: Option<JoinHandle<()>>,
    /// 每次更换或撤下 worker 递增，旧监控任务据此退出
    generation: u64,
}

/// 切换/启动的进行中标记，drop 时释放
struct InFlightGuard<'a>(&'a AtomicBool);

impl<'a> InFlightGuard<'a> {
    fn acquire(flag: &'a AtomicBool, device_id: Uuid) -> Result<Self, MiningError> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| Self(flag))
            .map_err(|_| MiningError::SwitchConflict { device_id })
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// 单设备 worker 监督者
pub struct WorkerSupervisor {
    device: Arc<Device>,
    catalog: Arc<AlgorithmCatalog>,
    launcher: Arc<dyn ProcessLauncher>,
    pool: PoolSettings,
    config: SupervisorConfig,
    status: RwLock<SupervisorStatus>,
    lifecycle: Mutex<Lifecycle>,
    switch_in_flight: AtomicBool,
    /// 为 false 时拒绝任何启动，包括崩溃后的自动重启
    accepting: AtomicBool,
    events: broadcast::Sender<MiningEvent>,
}

impl WorkerSupervisor {
    pub fn new(
        device: Arc<Device>,
        catalog: Arc<AlgorithmCatalog>,
        launcher: Arc<dyn ProcessLauncher>,
        pool: PoolSettings,
        config: SupervisorConfig,
        events: broadcast::Sender<MiningEvent>,
    ) -> Self {
        Self {
            device,
            catalog,
            launcher,
            pool,
            config,
            status: RwLock::new(SupervisorStatus::default()),
            lifecycle: Mutex::new(Lifecycle::default()),
            switch_in_flight: AtomicBool::new(false),
            accepting: AtomicBool::new(false),
            events,
        }
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    pub fn device_id(&self) -> Uuid {
        self.device.id
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }

    pub async fn state(&self) -> DeviceState {
        self.status.read().await.state.clone()
    }

    pub async fn session(&self) -> Option<MiningSession> {
        self.status.read().await.session.clone()
    }

    pub async fn status(&self) -> SupervisorStatus {
        self.status.read().await.clone()
    }

    /// 当前是否有存活的 worker 进程
    pub async fn has_live_worker(&self) -> bool {
        let mut lifecycle = self.lifecycle.lock().await;
        match lifecycle.worker.as_mut() {
            Some(worker) => worker.is_alive(),
            None => false,
        }
    }

    /// 启用设备，清除不可恢复标记
    pub async fn enable(&self) {
        let _lifecycle = self.lifecycle.lock().await;
        self.accepting.store(true, Ordering::Release);

        let mut status = self.status.write().await;
        status.unrecoverable = false;
        status.consecutive_failures = 0;
        if status.state == DeviceState::Stopped {
            self.set_state(&mut status, DeviceState::Idle);
        }
        if status.state == DeviceState::Idle {
            self.set_state(&mut status, DeviceState::Selecting);
        }
        device_info!(self.device.id, "🔌 设备已启用: {}", self.device);
    }

    /// 启动失败回到 Idle 的设备重新进入选择，未启用时不做任何事
    pub async fn resume_selection(&self) -> bool {
        if !self.is_accepting() {
            return false;
        }
        let mut status = self.status.write().await;
        if status.state != DeviceState::Idle {
            return false;
        }
        self.set_state(&mut status, DeviceState::Selecting);
        true
    }

    /// 禁用设备并停止 worker
    ///
    /// 先关闭启动入口再等待生命周期锁，进行中的切换会先完成再被停止。
    /// 与 `enable` 按获得锁的顺序生效，启动入口和最终状态保持一致。
    pub async fn disable(&self) {
        self.accepting.store(false, Ordering::Release);
        let mut lifecycle = self.lifecycle.lock().await;
        self.accepting.store(false, Ordering::Release);
        self.stop_locked(&mut lifecycle).await;
        device_info!(self.device.id, "设备已禁用: {}", self.device);
    }

    /// 以指定算法启动
    ///
    /// 已在运行同一算法时不做任何事；在运行其他算法时等价于切换。
    pub async fn start(self: &Arc<Self>, algorithm: &AlgorithmId) -> Result<(), MiningError> {
        self.check_startable(algorithm)?;
        let _in_flight = InFlightGuard::acquire(&self.switch_in_flight, self.device.id)?;

        let mut lifecycle = self.lifecycle.lock().await;
        self.check_startable(algorithm)?;

        let running = self.status.read().await.session.as_ref().map(|s| s.algorithm.clone());
        if running.as_ref() == Some(algorithm) && lifecycle.worker.is_some() {
            debug!("{} already running {}", self.device, algorithm);
            return Ok(());
        }
        if lifecycle.worker.is_some() || lifecycle.monitor.is_some() {
            self.shutdown_worker(&mut lifecycle).await;
        }

        self.start_locked(&mut lifecycle, algorithm).await
    }

    /// 停止 worker 并释放会话
    ///
    /// 先请求优雅退出，`grace_period` 后强制结束。总是成功。
    pub async fn stop(&self) {
        let mut lifecycle = self.lifecycle.lock().await;
        self.stop_locked(&mut lifecycle).await;
    }

    async fn stop_locked(&self, lifecycle: &mut Lifecycle) {
        self.shutdown_worker(lifecycle).await;

        let mut status = self.status.write().await;
        if let Some(session) = status.session.take() {
            status.last_session = Some(session);
        }
        self.set_state(&mut status, DeviceState::Stopped);
    }

    /// 切换到另一个算法
    ///
    /// 同一设备同时只允许一次切换，重复请求直接返回 `SwitchConflict`。
    pub async fn switch_to(self: &Arc<Self>, algorithm: &AlgorithmId) -> Result<(), MiningError> {
        self.check_startable(algorithm)?;
        let _in_flight = InFlightGuard::acquire(&self.switch_in_flight, self.device.id)?;

        let mut lifecycle = self.lifecycle.lock().await;
        self.check_startable(algorithm)?;

        let current = self.status.read().await.session.as_ref().map(|s| s.algorithm.clone());
        let Some(from) = current else {
            return self.start_locked(&mut lifecycle, algorithm).await;
        };
        if &from == algorithm && lifecycle.worker.is_some() {
            return Ok(());
        }

        device_info!(self.device.id, "🔄 切换算法: {} → {} ({})", from, algorithm, self.device.name);
        {
            let mut status = self.status.write().await;
            self.set_state(
                &mut status,
                DeviceState::Switching {
                    from: from.clone(),
                    to: algorithm.clone(),
                },
            );
        }

        self.shutdown_worker(&mut lifecycle).await;
        {
            let mut status = self.status.write().await;
            if let Some(session) = status.session.take() {
                status.last_session = Some(session);
            }
        }

        self.start_locked(&mut lifecycle, algorithm).await
    }

    fn check_startable(&self, algorithm: &AlgorithmId) -> Result<(), MiningError> {
        if !self.device.supports(algorithm) {
            return Err(MiningError::UnsupportedAlgorithm {
                device_id: self.device.id,
                algorithm: algorithm.clone(),
            });
        }
        if !self.is_accepting() {
            return Err(MiningError::DeviceDisabled {
                device_id: self.device.id,
            });
        }
        Ok(())
    }

    async fn start_locked(
        self: &Arc<Self>,
        lifecycle: &mut Lifecycle,
        algorithm: &AlgorithmId,
    ) -> Result<(), MiningError> {
        match self.launch_worker(lifecycle, algorithm).await {
            Ok((worker_id, heartbeats)) => {
                {
                    let mut status = self.status.write().await;
                    status.session = Some(MiningSession::new(algorithm.clone(), worker_id));
                    status.consecutive_failures = 0;
                    self.set_state(&mut status, DeviceState::Running(algorithm.clone()));
                }
                lifecycle.monitor = Some(tokio::spawn(Self::monitor(
                    Arc::downgrade(self),
                    heartbeats,
                    lifecycle.generation,
                )));

                device_info!(
                    self.device.id,
                    "✅ {} 开始运行 {} (pid {})",
                    self.device.name,
                    algorithm,
                    worker_id
                );
                Ok(())
            }
            Err(e) => {
                device_warn!(self.device.id, "❌ 启动失败: {}", e);
                let mut status = self.status.write().await;
                if let Some(session) = status.session.take() {
                    status.last_session = Some(session);
                }
                self.set_state(&mut status, DeviceState::Idle);
                Err(e)
            }
        }
    }

    /// 启动进程并登记到生命周期，返回进程号和心跳通道
    async fn launch_worker(
        &self,
        lifecycle: &mut Lifecycle,
        algorithm: &AlgorithmId,
    ) -> Result<(u32, mpsc::Receiver<Heartbeat>), MiningError> {
        let launch_failure = |reason: String| MiningError::LaunchFailure {
            device_id: self.device.id,
            algorithm: algorithm.clone(),
            reason,
        };

        let spec = self
            .catalog
            .require(algorithm)
            .map_err(|e| launch_failure(e.to_string()))?;
        let request = LaunchRequest {
            device: self.device.clone(),
            algorithm: spec.clone(),
            pool: self.pool.clone(),
        };

        let mut worker = self.launcher.launch(&request).await.map_err(|e| match e {
            MiningError::LaunchFailure { .. } => e,
            other => launch_failure(other.to_string()),
        })?;

        let Some(heartbeats) = worker.take_heartbeats() else {
            self.terminate(worker).await;
            return Err(launch_failure("worker has no heartbeat channel".to_string()));
        };

        let worker_id = worker.id();
        lifecycle.generation += 1;
        lifecycle.worker = Some(worker);
        Ok((worker_id, heartbeats))
    }

    /// 撤下监控任务和 worker
    async fn shutdown_worker(&self, lifecycle: &mut Lifecycle) {
        if let Some(monitor) = lifecycle.monitor.take() {
            monitor.abort();
        }
        lifecycle.generation += 1;
        if let Some(worker) = lifecycle.worker.take() {
            self.terminate(worker).await;
        }
    }

    /// 优雅结束进程，超时后强制结束
    async fn terminate(&self, mut worker: Box<dyn WorkerProcess>) {
        let pid = worker.id();
        let grace_period = self.config.grace_period();

        let graceful = match worker.signal_terminate().await {
            Ok(()) => matches!(timeout(grace_period, worker.wait_exit()).await, Ok(Ok(()))),
            Err(e) => {
                debug!("SIGTERM to pid {} failed: {}", pid, e);
                false
            }
        };

        if graceful {
            debug!("Worker pid {} exited gracefully", pid);
            return;
        }

        device_warn!(self.device.id, "⚠️ worker pid {} 未在 {:?} 内退出，强制结束", pid, grace_period);
        if let Err(e) = worker.kill().await {
            debug!("Kill pid {} failed: {}", pid, e);
        }
        if timeout(grace_period, worker.wait_exit()).await.is_err() {
            error!("Worker pid {} did not exit after kill", pid);
        }
    }

    /// 心跳监控任务
    async fn monitor(
        supervisor: Weak<Self>,
        mut heartbeats: mpsc::Receiver<Heartbeat>,
        mut generation: u64,
    ) {
        let Some(heartbeat_timeout) = supervisor.upgrade().map(|s| s.config.heartbeat_timeout()) else {
            return;
        };

        loop {
            let outcome = timeout(heartbeat_timeout, heartbeats.recv()).await;
            let Some(this) = supervisor.upgrade() else { return };

            let cause = match outcome {
                Ok(Some(heartbeat)) => {
                    this.on_heartbeat(&heartbeat).await;
                    continue;
                }
                Ok(None) => CrashCause::ProcessExited,
                Err(_) => {
                    let error = MiningError::HeartbeatTimeout {
                        device_id: this.device.id,
                        silent_ms: heartbeat_timeout.as_millis() as u64,
                    };
                    device_warn!(this.device.id, "💔 {}", error);
                    CrashCause::HeartbeatTimeout
                }
            };

            match this.recover(generation, cause).await {
                Some((next_generation, next_heartbeats)) => {
                    generation = next_generation;
                    heartbeats = next_heartbeats;
                }
                None => return,
            }
        }
    }

    async fn on_heartbeat(&self, heartbeat: &Heartbeat) {
        let mut status = self.status.write().await;
        let smoothing = self.config.hashrate_smoothing;
        let Some(session) = status.session.as_mut() else {
            return;
        };
        session.record(heartbeat, smoothing);
        let algorithm = session.algorithm.clone();
        let smoothed = session.hashrate;
        status.consecutive_failures = 0;
        drop(status);

        let _ = self.events.send(MiningEvent::HeartbeatReceived {
            device_id: self.device.id,
            algorithm,
            hashrate: heartbeat.hashrate,
            smoothed_hashrate: smoothed,
        });
    }

    /// 崩溃恢复: 清理旧进程，退避后以同一算法重启
    ///
    /// 返回新的 generation 和心跳通道；返回 `None` 表示监控任务应退出。
    async fn recover(
        &self,
        generation: u64,
        cause: CrashCause,
    ) -> Option<(u64, mpsc::Receiver<Heartbeat>)> {
        let algorithm = self.status.read().await.session.as_ref()?.algorithm.clone();
        let mut failures = self.record_failure(&algorithm, cause).await;

        {
            let mut lifecycle = self.lifecycle.lock().await;
            if lifecycle.generation != generation || !self.is_accepting() {
                return None;
            }
            // 监控句柄属于当前任务，只撤下进程
            if let Some(worker) = lifecycle.worker.take() {
                self.terminate(worker).await;
            }
            if failures >= self.config.max_consecutive_failures {
                lifecycle.monitor.take();
                lifecycle.generation += 1;
                self.give_up(&algorithm, failures).await;
                return None;
            }
        }

        loop {
            let backoff = self.config.backoff(failures);
            device_info!(
                self.device.id,
                "🔁 {} 后重启 {} (连续失败 {} 次)",
                humanize(backoff),
                algorithm,
                failures
            );
            sleep(backoff).await;

            let mut lifecycle = self.lifecycle.lock().await;
            if lifecycle.generation != generation || !self.is_accepting() {
                return None;
            }

            match self.launch_worker(&mut lifecycle, &algorithm).await {
                Ok((worker_id, heartbeats)) => {
                    let mut status = self.status.write().await;
                    if let Some(session) = status.session.as_mut() {
                        session.worker_id = worker_id;
                        session.last_heartbeat = None;
                    }
                    device_info!(self.device.id, "✅ {} 已重启 (pid {})", algorithm, worker_id);
                    return Some((lifecycle.generation, heartbeats));
                }
                Err(e) => {
                    device_warn!(self.device.id, "❌ 重启失败: {}", e);
                    failures = self.record_failure(&algorithm, CrashCause::LaunchFailed).await;
                    if failures >= self.config.max_consecutive_failures {
                        lifecycle.monitor.take();
                        lifecycle.generation += 1;
                        self.give_up(&algorithm, failures).await;
                        return None;
                    }
                }
            }
        }
    }

    async fn record_failure(&self, algorithm: &AlgorithmId, cause: CrashCause) -> u32 {
        let failures = {
            let mut status = self.status.write().await;
            status.consecutive_failures += 1;
            status.consecutive_failures
        };

        device_warn!(self.device.id, "💥 worker 崩溃 ({}): {} 连续第 {} 次", cause, algorithm, failures);
        let _ = self.events.send(MiningEvent::WorkerCrashed {
            device_id: self.device.id,
            algorithm: algorithm.clone(),
            cause,
            consecutive_failures: failures,
        });
        failures
    }

    /// 重启预算耗尽，停止设备直到重新启用
    async fn give_up(&self, algorithm: &AlgorithmId, failures: u32) {
        self.accepting.store(false, Ordering::Release);

        {
            let mut status = self.status.write().await;
            status.unrecoverable = true;
            if let Some(session) = status.session.take() {
                status.last_session = Some(session);
            }
            self.set_state(&mut status, DeviceState::Stopped);
        }

        let error = MiningError::WorkerUnrecoverable {
            device_id: self.device.id,
            algorithm: algorithm.clone(),
            failures,
        };
        device_error!(self.device.id, "🛑 {}，需要重新启用设备", error);
        let _ = self.events.send(MiningEvent::WorkerUnrecoverable {
            device_id: self.device.id,
            algorithm: algorithm.clone(),
            failures,
        });
    }

    fn set_state(&self, status: &mut SupervisorStatus, new_state: DeviceState) {
        if status.state == new_state {
            return;
        }
        let old_state = std::mem::replace(&mut status.state, new_state.clone());
        debug!("{}: {} → {}", self.device.name, old_state, new_state);
        let _ = self.events.send(MiningEvent::SessionStateChanged {
            device_id: self.device.id,
            old_state,
            new_state,
            timestamp: SystemTime::now(),
        });
    }
}

fn humanize(duration: Duration) -> String {
    if duration.as_millis() < 1000 {
        format!("{}ms", duration.as_millis())
    } else {
        format!("{:.1}s", duration.as_secs_f64())
    }
}
