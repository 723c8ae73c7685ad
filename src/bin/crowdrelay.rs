//! crowdrelay - 録画されたライブ配信イベントをリレーエンジンに流し、
//! 結果をWebSocketで配信する。

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crowdrelay::api::WebSocketServer;
use crowdrelay::config::{AppConfig, ConfigManager};
use crowdrelay::io::{replay_into, EventSource, NdjsonFileSource, ReaderSource};
use crowdrelay::logging;
use crowdrelay::relay::{RelayEngine, TierSnapshot};

/// Live-stream gift relay with dedup and tiered leaderboards.
#[derive(Parser, Debug)]
#[command(name = "crowdrelay")]
#[command(about = "Relay live-stream events to WebSocket subscribers", long_about = None)]
struct Args {
    /// Streamer handle used as the session key
    #[arg(short, long)]
    session: String,

    /// NDJSON file with recorded events (reads stdin when omitted)
    #[arg(short, long)]
    input: Option<PathBuf>,

    /// Path to config.toml (defaults to the XDG config directory)
    #[arg(short, long, env = "CROWDRELAY_CONFIG")]
    config: Option<PathBuf>,

    /// Preferred WebSocket port (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Log level (overrides config, RUST_LOG takes precedence)
    #[arg(long)]
    log_level: Option<String>,

    /// Delay between replayed events in milliseconds
    #[arg(long, default_value_t = 0)]
    replay_delay_ms: u64,

    /// Exit as soon as the input is exhausted instead of waiting for Ctrl+C
    #[arg(long)]
    exit_on_end: bool,

    /// Write the effective configuration to the config path and exit
    #[arg(long)]
    write_config: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config_manager = match &args.config {
        Some(path) => ConfigManager::with_path(path)?,
        None => ConfigManager::new()?,
    };

    // ログ初期化前なのでエラーは後で出力する
    let (mut config, load_error) = match config_manager.load_config() {
        Ok(config) => (config, None),
        Err(e) => (AppConfig::default(), Some(e)),
    };
    if let Some(port) = args.port {
        config.server.port = port;
    }

    let _log_guard = logging::init_logging(&config.log, args.log_level.as_deref())?;

    if let Some(e) = load_error {
        warn!("設定読み込みエラー、デフォルト設定を使用: {:#}", e);
    }

    if args.write_config {
        config_manager.save_config(&config)?;
        return Ok(());
    }

    info!("🎬 Starting crowdrelay for session '{}'", args.session);
    info!(
        strategy = %config.engine.dedup.strategy,
        window_ms = config.engine.dedup.window_ms,
        spotlight = config.engine.tiers.spotlight_capacity,
        threshold = config.engine.tiers.qualifying_threshold,
        "⚙️ Engine configuration"
    );

    let snapshot = TierSnapshot::default();
    let server = Arc::new(
        WebSocketServer::from_config(&config.server).with_tier_snapshot(Arc::clone(&snapshot)),
    );
    server.start().await?;

    let (relay, engine_task) =
        RelayEngine::spawn_with_snapshot(config.engine.clone(), server.clone(), snapshot);
    relay.connect(&args.session).await?;

    let delay = Duration::from_millis(args.replay_delay_ms);
    let mut source: Box<dyn EventSource> = match &args.input {
        Some(path) => Box::new(
            NdjsonFileSource::open(path)
                .await
                .with_context(|| format!("Failed to open input: {}", path.display()))?
                .with_delay(delay),
        ),
        None => Box::new(ReaderSource::stdin().with_delay(delay)),
    };

    tokio::select! {
        result = replay_into(source.as_mut(), &relay, &args.session) => {
            let summary = result?;
            info!(
                "📊 Replayed {} events ({} messages broadcast, {} lines skipped)",
                summary.events_submitted, summary.messages_broadcast, summary.lines_skipped
            );
            if !args.exit_on_end {
                info!("⏳ Input finished, serving until Ctrl+C");
                tokio::signal::ctrl_c().await?;
                info!("🛑 終了シグナルを受信しました");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("🛑 終了シグナルを受信しました");
        }
    }

    if let Some(stats) = relay.stats(&args.session).await? {
        info!(
            events = stats.events_processed,
            gifts = stats.gifts_accepted,
            duplicates = stats.duplicates_dropped,
            malformed = stats.malformed_dropped,
            "📈 Session statistics"
        );
    }

    relay.shutdown().await?;
    engine_task.await?;
    server.stop().await;

    info!("👋 crowdrelay shutting down");
    Ok(())
}
