use crate::device::{AlgorithmId, AlgorithmSpec, Device};
use crate::error::MiningError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::time::Instant;
use tokio::sync::mpsc;

/// 矿池与钱包设置，启动 worker 时只读使用
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolSettings {
    /// 矿池地址模板，可使用 `{algorithm}` 和 `{region}`
    pub stratum_url: String,
    pub wallet_address: String,
    pub worker_name: String,
    /// 服务区域
    pub region: String,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            stratum_url: "stratum+tcp://{algorithm}.{region}.pool.example.com:3333".to_string(),
            wallet_address: "bc1qexampleaddress0000000000000000000000".to_string(),
            worker_name: "rig1".to_string(),
            region: "eu".to_string(),
        }
    }
}

impl PoolSettings {
    pub fn stratum_url_for(&self, algorithm: &AlgorithmId) -> String {
        self.stratum_url
            .replace("{algorithm}", algorithm.as_str())
            .replace("{region}", &self.region)
    }

    /// 矿池用户名: `<钱包>.<矿工名>`
    pub fn username(&self) -> String {
        format!("{}.{}", self.wallet_address, self.worker_name)
    }
}

/// worker 心跳
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Heartbeat {
    /// 瞬时算力 (H/s)
    pub hashrate: f64,
    pub at: Instant,
}

impl Heartbeat {
    pub fn new(hashrate: f64) -> Self {
        Self {
            hashrate,
            at: Instant::now(),
        }
    }
}

/// 启动请求
#[derive(Debug, Clone)]
pub struct LaunchRequest {
    pub device: Arc<Device>,
    pub algorithm: AlgorithmSpec,
    pub pool: PoolSettings,
}

/// 一个正在运行的 worker 进程
#[async_trait]
pub trait WorkerProcess: Send {
    /// 进程标识
    fn id(&self) -> u32;

    /// 取走心跳通道，只能取一次；通道关闭表示进程已退出
    fn take_heartbeats(&mut self) -> Option<mpsc::Receiver<Heartbeat>>;

    /// 请求优雅退出
    async fn signal_terminate(&mut self) -> Result<(), MiningError>;

    /// 强制结束
    async fn kill(&mut self) -> Result<(), MiningError>;

    /// 等待进程退出
    async fn wait_exit(&mut self) -> Result<(), MiningError>;

    /// 进程是否仍在运行
    fn is_alive(&mut self) -> bool;
}

/// 进程启动器
#[async_trait]
pub trait ProcessLauncher: Send + Sync {
    async fn launch(&self, request: &LaunchRequest) -> Result<Box<dyn WorkerProcess>, MiningError>;
}
