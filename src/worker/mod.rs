//! worker 进程启动与监督

pub mod launcher;
pub mod process;
pub mod supervisor;


pub use launcher::{Heartbeat, LaunchRequest, PoolSettings, ProcessLauncher, WorkerProcess};
pub use process::CommandLauncher;
pub use supervisor::{MiningSession, SupervisorConfig, SupervisorStatus, WorkerSupervisor};
