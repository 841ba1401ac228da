use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use switchminer_rs::benchmark::BenchmarkStore;
use switchminer_rs::config::{Args, Config};
use switchminer_rs::device::DeviceRegistry;
use switchminer_rs::logging::init_logging;
use switchminer_rs::market::HttpMarketSource;
use switchminer_rs::utils::format_hashrate;
use switchminer_rs::worker::CommandLauncher;
use switchminer_rs::MiningManager;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // 解析命令行参数
    let args = Args::parse();

    // 加载配置
    let config = Config::load(&args.config)?;

    // 初始化日志系统，guard 保持到进程退出
    let _log_guard = init_logging(config.log_config(&args)).context("Failed to initialize logging")?;

    info!("🚀 Starting {} v{}", switchminer_rs::NAME, switchminer_rs::VERSION);
    info!("📋 Configuration loaded from: {}", args.config);

    let catalog = config.catalog();
    let registry = Arc::new(DeviceRegistry::from_config(&config.devices, &catalog)?);
    if registry.is_empty() {
        warn!("⚠️ No devices configured, nothing to mine with");
    }

    let benchmarks = Arc::new(match &config.general.benchmarks_file {
        Some(path) => BenchmarkStore::load(path)?,
        None => BenchmarkStore::new(),
    });

    let source = Arc::new(HttpMarketSource::new(
        &config.market.source_url,
        config.market.request_timeout(),
        config.market.rates_field.clone(),
    )?);
    let launcher = Arc::new(CommandLauncher::new());

    let manager = Arc::new(MiningManager::new(
        &config,
        registry.clone(),
        benchmarks.clone(),
        source,
        launcher,
    ));

    if args.dry_run {
        return print_rankings(&manager).await;
    }

    manager.start().await?;
    let enabled = manager.start_all().await;
    info!("✅ Mining started on {} devices", enabled);

    wait_for_shutdown_signal().await;
    info!("🛑 Received shutdown signal");

    manager.shutdown().await;

    if let Some(path) = &config.general.benchmarks_file {
        if let Err(e) = benchmarks.save(path) {
            error!("Failed to save benchmarks: {}", e);
        }
    }
    info!("👋 Mining stopped gracefully");
    Ok(())
}

/// 拉取一次行情并打印每个设备的收益排名
async fn print_rankings(manager: &MiningManager) -> Result<()> {
    let snapshot = manager.market().poll().await.context("Failed to fetch market data")?;
    println!("Market snapshot v{} ({} algorithms)", snapshot.version, snapshot.rates.len());

    for device in manager.registry().devices() {
        println!("\n{}", device);
        let ranking = manager.ranking(&device.id);
        if ranking.is_empty() {
            println!("  (no benchmarked algorithm with market data)");
            continue;
        }
        for (position, ranked) in ranking.iter().enumerate() {
            let hashrate = manager
                .benchmarks()
                .lookup(&device.id, &ranked.algorithm)
                .unwrap_or(0.0);
            println!(
                "  {}. {:<12} {:>14}  payrate {:.8}",
                position + 1,
                ranked.algorithm.as_str(),
                format_hashrate(hashrate),
                ranked.payrate
            );
        }
    }
    Ok(())
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                }
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
