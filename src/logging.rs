//! ログ初期化
//!
//! コンソールにはコンパクト形式、ファイル出力が有効な場合は日次ローテーションの
//! ファイルにも書き出す。`RUST_LOG` が設定されていればそれを優先する。

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::time::LocalTime;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::config::{ConfigManager, LogConfig};

/// ロギングを初期化
///
/// 返された `WorkerGuard` はプロセス終了まで保持すること（dropするとファイル出力が止まる）。
pub fn init_logging(
    config: &LogConfig,
    level_override: Option<&str>,
) -> Result<Option<WorkerGuard>> {
    let level = level_override.unwrap_or(&config.log_level);
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .with_context(|| format!("Invalid log level: {}", level))?;

    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact();

    let (file_layer, guard) = if config.enable_file_logging {
        let log_dir = resolve_log_dir(config)?;
        if config.auto_cleanup_enabled {
            // ローテーションで今日のファイルが1つ増えるので、その分を空けておく
            let keep = (config.max_log_files as usize).saturating_sub(1);
            cleanup_old_logs(&log_dir, &config.log_file_prefix, keep)?;
        }

        let appender = tracing_appender::rolling::daily(&log_dir, &config.log_file_prefix);
        let (writer, guard) = tracing_appender::non_blocking(appender);
        let layer = tracing_subscriber::fmt::layer()
            .json()
            .with_timer(LocalTime::rfc_3339())
            .with_ansi(false)
            .with_writer(writer);
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()?;

    if config.enable_file_logging {
        info!("📝 File logging enabled (prefix: {})", config.log_file_prefix);
    }

    Ok(guard)
}

/// ログディレクトリを決定して作成
fn resolve_log_dir(config: &LogConfig) -> Result<PathBuf> {
    let log_dir = match &config.log_dir {
        Some(dir) => dir.clone(),
        None => ConfigManager::default_log_dir().context("Failed to determine log directory")?,
    };

    fs::create_dir_all(&log_dir)
        .with_context(|| format!("Failed to create log directory: {}", log_dir.display()))?;
    Ok(log_dir)
}

/// ログファイル名のglobパターン
pub fn log_filename_pattern(log_dir: &Path, prefix: &str) -> String {
    format!("{}/{}*", glob::Pattern::escape(&log_dir.to_string_lossy()), prefix)
}

/// 古いログファイルを削除し、削除した数を返す
///
/// 日次ローテーションのファイル名は `prefix.YYYY-MM-DD` なので、名前順が日付順になる。
pub fn cleanup_old_logs(log_dir: &Path, prefix: &str, keep: usize) -> Result<usize> {
    let pattern = log_filename_pattern(log_dir, prefix);
    let mut files: Vec<PathBuf> = glob::glob(&pattern)
        .with_context(|| format!("Invalid log file pattern: {}", pattern))?
        .filter_map(|entry| entry.ok())
        .filter(|path| path.is_file())
        .collect();

    if files.len() <= keep {
        return Ok(0);
    }

    files.sort();
    let excess = files.len() - keep;
    let mut removed = 0;

    for path in files.into_iter().take(excess) {
        match fs::remove_file(&path) {
            Ok(()) => {
                debug!("🗑️ Removed old log file: {}", path.display());
                removed += 1;
            }
            Err(e) => warn!("Failed to remove old log file {}: {}", path.display(), e),
        }
    }

    Ok(removed)
}
