mod config;
mod generator;
mod replay;
mod sink;

use anyhow::{bail, Result};
use chrono::Utc;
use clap::Parser;
use generator::SkyGenerator;
use replay::CaptureReader;
use sink::Sink;
use tokio::time::{interval, Duration};
use tracing::{debug, info};

/// 回放时每个间隔发送的字节数
const REPLAY_CHUNK: usize = 4096;

#[tokio::main]
async fn main() -> Result<()> {
    // 初始化日志 - 使用环境变量 RUST_LOG 控制级别
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    info!("🛰  Receiver simulator starting...");

    let config = config::Config::parse();
    config.validate()?;
    info!("✓ Configuration loaded");
    info!("  Interval: {} ms", config.interval_ms);

    let mut sink = match (&config.listen, &config.output) {
        (Some(addr), _) => Sink::tcp(*addr).await?,
        (None, Some(path)) => Sink::file(path).await?,
        (None, None) => bail!("no output configured"),
    };

    info!("✅ Receiver simulator ready!");
    info!("   Press Ctrl+C to stop");

    tokio::select! {
        result = run(&config, &mut sink) => result?,
        _ = tokio::signal::ctrl_c() => info!("Shutting down..."),
    }
    sink.flush().await?;
    info!("✓ Receiver simulator stopped");
    Ok(())
}

async fn run(config: &config::Config, sink: &mut Sink) -> Result<()> {
    match &config.replay_dir {
        Some(dir) => replay(config, dir, sink).await,
        None => synthesize(config, sink).await,
    }
}

async fn synthesize(config: &config::Config, sink: &mut Sink) -> Result<()> {
    info!("  Satellites: {}", config.sats);
    info!("  Scintillation: {:.2}", config.scintillation);

    let mut generator = SkyGenerator::new(
        config.sats,
        config.scintillation,
        config.samples,
        config.interval_ms,
        config.seed,
    );
    let origin = Utc::now();
    let mut ticker = interval(Duration::from_millis(config.interval_ms));

    loop {
        ticker.tick().await;
        let n = generator.epoch();
        if config.epochs > 0 && n >= config.epochs {
            info!("✓ Sent {} epoch(s)", n);
            return Ok(());
        }
        let time = generator.epoch_time(origin, n);
        let frames = generator.next_frames(time)?;
        debug!("epoch {}: {} bytes", n, frames.len());
        sink.send(frames).await?;
    }
}

async fn replay(config: &config::Config, dir: &std::path::Path, sink: &mut Sink) -> Result<()> {
    let captures = replay::scan_captures(dir)?;
    info!("✓ Found {} capture(s)", captures.len());

    if captures.is_empty() {
        info!("⚠️  No captures found in {:?}", dir);
        info!("   Please add .bin files to the replay directory");
        return Ok(());
    }

    let mut ticker = interval(Duration::from_millis(config.interval_ms));
    for capture in captures {
        info!("▶ Replaying {} ({} bytes)", capture.name, capture.size);
        let mut reader = CaptureReader::open(&capture.path, REPLAY_CHUNK).await?;
        while let Some(chunk) = reader.read_chunk().await? {
            ticker.tick().await;
            sink.send(chunk).await?;
        }
    }
    info!("✓ Replay finished");
    Ok(())
}
