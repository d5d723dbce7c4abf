use anyhow::{Context, Result};
use clap::Parser;
use scint_server::buffer::LimitedBudget;
use scint_server::{Collaborators, Server, ServerConfig};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "scint-server", about = "实时电离层闪烁监测服务器")]
struct Args {
    /// 配置文件（.toml 或 .json）
    #[arg(short, long, default_value = "config/scint-server.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = ServerConfig::load(&args.config)?;

    // 初始化日志 - RUST_LOG 优先，否则使用配置文件中的级别
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level)),
        )
        .with_target(false)
        .init();

    info!("🛰  Scint server starting...");
    info!("✓ Configuration loaded from {}", args.config.display());

    let mut collab = Collaborators::default();
    if let Some(limit) = config.memory_limit_bytes {
        info!("  Memory limit: {} bytes", limit);
        collab = collab.with_budget(Arc::new(LimitedBudget::new(limit)));
    }

    let server = Arc::new(Server::new(collab));
    server.init().context("server init failed")?;
    server.start(&config.start).context("server start failed")?;
    info!("✅ Scint server running, press Ctrl+C to stop");

    // 周期输出数据流状态
    let interval_secs = config.status_interval_secs.max(1);
    let status_server = Arc::clone(&server);
    let status_task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
        loop {
            ticker.tick().await;
            let stats = status_server.statistics();
            info!(
                "cycles={} overruns={} frames={:?} passes={} status: {}",
                stats.cycles,
                stats.overruns,
                stats.frames,
                stats.passes,
                status_server.stream_status().summary
            );
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");
    status_task.abort();

    let stop_server = Arc::clone(&server);
    let stop_commands = config.stop_commands.clone();
    tokio::task::spawn_blocking(move || {
        if let Err(e) = stop_server.stop(&stop_commands) {
            warn!("stop failed: {}", e);
        }
        stop_server.free()
    })
    .await??;

    info!("✓ Scint server stopped");
    Ok(())
}
