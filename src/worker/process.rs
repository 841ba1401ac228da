//! 基于 tokio::process 的 worker 启动器

use super::launcher::{Heartbeat, LaunchRequest, ProcessLauncher, WorkerProcess};
use crate::error::MiningError;
use crate::utils::extract_hashrate;
use async_trait::async_trait;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};
use uuid::Uuid;

const HEARTBEAT_CHANNEL_CAPACITY: usize = 64;

/// 按算法模板启动外部挖矿程序
///
/// 参数模板中的占位符:
/// `{algorithm}` `{device}` `{device_name}` `{pool}` `{user}` `{worker}` `{region}` `{threads}`
#[derive(Debug, Clone)]
pub struct CommandLauncher {
    threads: usize,
}

impl CommandLauncher {
    pub fn new() -> Self {
        Self::with_threads(num_cpus::get())
    }

    pub fn with_threads(threads: usize) -> Self {
        Self {
            threads: threads.max(1),
        }
    }

    /// 展开参数模板
    pub fn render_args(&self, request: &LaunchRequest) -> Vec<String> {
        let algorithm = &request.algorithm.id;
        let pool_url = request.pool.stratum_url_for(algorithm);
        let user = request.pool.username();
        let device_id = request.device.id.to_string();
        let threads = self.threads.to_string();

        request
            .algorithm
            .args
            .iter()
            .map(|arg| {
                arg.replace("{algorithm}", algorithm.as_str())
                    .replace("{device_name}", &request.device.name)
                    .replace("{device}", &device_id)
                    .replace("{pool}", &pool_url)
                    .replace("{user}", &user)
                    .replace("{worker}", &request.pool.worker_name)
                    .replace("{region}", &request.pool.region)
                    .replace("{threads}", &threads)
            })
            .collect()
    }
}

impl Default for CommandLauncher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProcessLauncher for CommandLauncher {
    async fn launch(&self, request: &LaunchRequest) -> Result<Box<dyn WorkerProcess>, MiningError> {
        let device_id = request.device.id;
        let algorithm = request.algorithm.id.clone();
        let launch_failure = |reason: String| MiningError::LaunchFailure {
            device_id,
            algorithm: algorithm.clone(),
            reason,
        };

        let args = self.render_args(request);
        debug!(
            "Spawning {} {:?} for {}",
            request.algorithm.binary.display(),
            args,
            request.device
        );

        let mut child = Command::new(&request.algorithm.binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| launch_failure(format!("spawn {}: {}", request.algorithm.binary.display(), e)))?;

        let pid = child
            .id()
            .ok_or_else(|| launch_failure("process exited before it could be tracked".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| launch_failure("stdout not captured".to_string()))?;

        let (sender, receiver) = mpsc::channel(HEARTBEAT_CHANNEL_CAPACITY);
        let reader = tokio::spawn(async move {
            let mut reader = BufReader::new(stdout);
            let mut buf = Vec::new();
            loop {
                buf.clear();
                match reader.read_until(b'\n', &mut buf).await {
                    Ok(0) => break,
                    Ok(_) => {}
                    Err(e) => {
                        debug!(pid, "stdout read failed: {}", e);
                        break;
                    }
                }
                // 非 UTF-8 输出按有损方式解码，不影响心跳
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim_end_matches(['\r', '\n']);
                match extract_hashrate(line) {
                    Some(hashrate) => {
                        if sender.send(Heartbeat::new(hashrate)).await.is_err() {
                            break;
                        }
                    }
                    None => trace!(pid, "{}", line),
                }
            }
            // sender 在此释放，监控端据此判断进程已退出
        });

        Ok(Box::new(ChildWorker {
            device_id,
            pid,
            child,
            heartbeats: Some(receiver),
            reader,
        }))
    }
}

/// 一个外部挖矿进程
struct ChildWorker {
    device_id: Uuid,
    pid: u32,
    child: Child,
    heartbeats: Option<mpsc::Receiver<Heartbeat>>,
    reader: JoinHandle<()>,
}

impl ChildWorker {
    fn process_error(&self, error: impl std::fmt::Display) -> MiningError {
        MiningError::Process {
            device_id: self.device_id,
            error: format!("pid {}: {}", self.pid, error),
        }
    }
}

#[async_trait]
impl WorkerProcess for ChildWorker {
    fn id(&self) -> u32 {
        self.pid
    }

    fn take_heartbeats(&mut self) -> Option<mpsc::Receiver<Heartbeat>> {
        self.heartbeats.take()
    }

    #[cfg(unix)]
    async fn signal_terminate(&mut self) -> Result<(), MiningError> {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        kill(Pid::from_raw(self.pid as i32), Signal::SIGTERM).map_err(|e| self.process_error(e))
    }

    #[cfg(not(unix))]
    async fn signal_terminate(&mut self) -> Result<(), MiningError> {
        self.child.start_kill().map_err(|e| self.process_error(e))
    }

    async fn kill(&mut self) -> Result<(), MiningError> {
        match self.child.kill().await {
            Ok(()) => Ok(()),
            Err(e) => Err(self.process_error(e)),
        }
    }

    async fn wait_exit(&mut self) -> Result<(), MiningError> {
        match self.child.wait().await {
            Ok(status) => {
                debug!("Worker pid {} exited with {}", self.pid, status);
                Ok(())
            }
            Err(e) => Err(self.process_error(e)),
        }
    }

    fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }
}

impl Drop for ChildWorker {
    fn drop(&mut self) {
        self.reader.abort();
    }
}
