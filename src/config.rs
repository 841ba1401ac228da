use anyhow::{Context, Result};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use crate::device::registry::DevicesConfig;
use crate::device::{AlgorithmCatalog, AlgorithmSpec};
use crate::logging::{LogConfig, LogRotation};
use crate::market::MarketConfig;
use crate::stats::StatsConfig;
use crate::switching::SwitchingConfig;
use crate::worker::{PoolSettings, SupervisorConfig};


#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "switchminer.toml")]
    pub config: String,

    /// Enable debug mode
    #[arg(short, long)]
    pub debug: bool,

    /// Log level, overrides the configuration file
    #[arg(long)]
    pub log_level: Option<String>,

    /// Print the current profitability ranking and exit without starting workers
    #[arg(long)]
    pub dry_run: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub market: MarketConfig,
    #[serde(default)]
    pub switching: SwitchingConfig,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    #[serde(default)]
    pub stats: StatsConfig,
    #[serde(default)]
    pub pool: PoolSettings,
    #[serde(default)]
    pub devices: DevicesConfig,
    #[serde(default)]
    pub algorithms: Vec<AlgorithmSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneralConfig {
    pub log_level: String,
    #[serde(default)]
    pub log_file: Option<String>,
    pub log_rotation: LogRotation,
    /// 基准数据文件，为空表示不持久化
    #[serde(default)]
    pub benchmarks_file: Option<PathBuf>,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_file: None,
            log_rotation: LogRotation::Daily,
            benchmarks_file: Some(PathBuf::from("benchmarks.json")),
        }
    }
}

fn template(binary: &str, args: &[&str]) -> (String, Vec<String>) {
    (binary.to_string(), args.iter().map(|arg| arg.to_string()).collect())
}

impl Default for Config {
    fn default() -> Self {
        let gpu_args = ["--algo", "{algorithm}", "--pool", "{pool}", "--user", "{user}", "--devices", "{device_name}"];
        let algorithms = [
            ("etchash", template("miners/gminer", &gpu_args)),
            ("kawpow", template("miners/gminer", &gpu_args)),
            ("autolykos2", template("miners/gminer", &gpu_args)),
            (
                "randomx",
                template("miners/xmrig", &["-a", "rx/0", "-o", "{pool}", "-u", "{user}", "-t", "{threads}"]),
            ),
        ]
        .into_iter()
        .map(|(id, (binary, args))| AlgorithmSpec::new(id, binary, args))
        .collect();

        Self {
            general: GeneralConfig::default(),
            market: MarketConfig::default(),
            switching: SwitchingConfig::default(),
            supervisor: SupervisorConfig::default(),
            stats: StatsConfig::default(),
            pool: PoolSettings::default(),
            devices: DevicesConfig::default(),
            algorithms,
        }
    }
}

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let config_content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path))?;

        let config: Config = toml::from_str(&config_content)
            .with_context(|| format!("Failed to parse config file: {}", path))?;

        config.validate()
            .with_context(|| format!("Invalid config file: {}", path))?;

        Ok(config)
    }

    pub fn save(&self, path: &str) -> Result<()> {
        let config_content = toml::to_string_pretty(self)
            .context("Failed to serialize config")?;

        std::fs::write(path, config_content)
            .with_context(|| format!("Failed to write config file: {}", path))?;

        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        // 验证行情配置
        let url = url::Url::parse(&self.market.source_url)
            .with_context(|| format!("Invalid market source URL: {}", self.market.source_url))?;
        if !matches!(url.scheme(), "http" | "https") {
            anyhow::bail!("Market source URL must use http or https, got {}", url.scheme());
        }
        if self.market.poll_interval_secs == 0 {
            anyhow::bail!("Market poll interval must be greater than 0");
        }
        if self.market.request_timeout_secs == 0 {
            anyhow::bail!("Market request timeout must be greater than 0");
        }
        if self.market.max_consecutive_failures == 0 {
            anyhow::bail!("Market max consecutive failures must be greater than 0");
        }

        // 验证切换策略
        if self.switching.tick_interval_secs == 0 {
            anyhow::bail!("Switching tick interval must be greater than 0");
        }
        if !self.switching.switch_threshold.is_finite() || self.switching.switch_threshold < 0.0 {
            anyhow::bail!("Switch threshold {} must be a non-negative number", self.switching.switch_threshold);
        }

        // 验证监督配置
        if self.supervisor.heartbeat_timeout_ms == 0 {
            anyhow::bail!("Heartbeat timeout must be greater than 0");
        }
        if self.supervisor.max_consecutive_failures == 0 {
            anyhow::bail!("Supervisor max consecutive failures must be at least 1");
        }
        if self.supervisor.backoff_base_ms > self.supervisor.backoff_max_ms {
            anyhow::bail!("Backoff base {} ms exceeds backoff max {} ms",
                self.supervisor.backoff_base_ms, self.supervisor.backoff_max_ms);
        }
        let smoothing = self.supervisor.hashrate_smoothing;
        if !(smoothing > 0.0 && smoothing <= 1.0) {
            anyhow::bail!("Hashrate smoothing {} must be in (0, 1]", smoothing);
        }

        if self.stats.enabled && self.stats.log_interval_secs == 0 {
            anyhow::bail!("Stats log interval must be greater than 0");
        }

        // 验证矿池配置
        if self.pool.stratum_url.trim().is_empty() {
            anyhow::bail!("Pool stratum URL must be set");
        }
        if self.pool.wallet_address.trim().is_empty() {
            anyhow::bail!("Wallet address must be set");
        }
        if self.pool.worker_name.trim().is_empty() {
            anyhow::bail!("Worker name must be set");
        }

        // 验证算法模板
        if self.algorithms.is_empty() {
            anyhow::bail!("At least one algorithm must be configured");
        }
        let mut seen = HashSet::new();
        for spec in &self.algorithms {
            if !seen.insert(&spec.id) {
                anyhow::bail!("Algorithm {} is configured more than once", spec.id);
            }
            if spec.binary.as_os_str().is_empty() {
                anyhow::bail!("Algorithm {} has no worker binary", spec.id);
            }
        }

        // 验证设备配置
        let mut device_ids = HashSet::new();
        for entry in &self.devices.entries {
            if !device_ids.insert(entry.id) {
                anyhow::bail!("Device {} is configured more than once", entry.id);
            }
            if entry.algorithms.is_empty() {
                anyhow::bail!("Device {} has no algorithms", entry.name);
            }
            if let Some(unknown) = entry.algorithms.iter().find(|algorithm| !seen.contains(algorithm)) {
                anyhow::bail!("Device {} references unknown algorithm {}", entry.name, unknown);
            }
        }

        Ok(())
    }

    /// 检查配置是否有效
    pub fn is_valid(&self) -> bool {
        self.validate().is_ok()
    }

    /// 算法启动模板
    pub fn catalog(&self) -> AlgorithmCatalog {
        AlgorithmCatalog::new(self.algorithms.iter().cloned())
    }

    /// 日志配置，命令行参数优先
    pub fn log_config(&self, args: &Args) -> LogConfig {
        let level = if args.debug {
            "debug".to_string()
        } else {
            args.log_level.clone().unwrap_or_else(|| self.general.log_level.clone())
        };

        LogConfig {
            level,
            file_path: self.general.log_file.clone(),
            rotation: self.general.log_rotation,
            ..LogConfig::default()
        }
    }
}
