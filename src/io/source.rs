//! イベントソース
//!
//! 録画されたNDJSONストリーム（ファイル・標準入力）やメモリ上のイベント列を
//! 同じインターフェースでリレーエンジンへ流し込む。

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::path::Path;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader, Lines};
use tracing::{debug, info, warn};

use super::ndjson::parse_event_line;
use crate::error::{RelayError, RelayResult};
use crate::models::RawEvent;
use crate::relay::RelayHandle;

/// 生イベントの供給元
#[async_trait]
pub trait EventSource: Send {
    /// 次のイベント。終端なら `None`
    async fn next_event(&mut self) -> Option<RelayResult<RawEvent>>;

    /// ログ用の名前
    fn name(&self) -> &str;
}

/// 行単位のNDJSONリーダー
pub struct ReaderSource<R> {
    lines: Lines<BufReader<R>>,
    line_number: usize,
    delay: Option<Duration>,
    name: String,
}

/// NDJSONファイルからのソース
pub type NdjsonFileSource = ReaderSource<tokio::fs::File>;

impl<R: AsyncRead + Unpin + Send> ReaderSource<R> {
    pub fn new(reader: R, name: impl Into<String>) -> Self {
        Self {
            lines: BufReader::new(reader).lines(),
            line_number: 0,
            delay: None,
            name: name.into(),
        }
    }

    /// イベントごとに待機を入れる（録画の再生速度調整）
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = (!delay.is_zero()).then_some(delay);
        self
    }
}

impl ReaderSource<tokio::fs::File> {
    pub async fn open(path: impl AsRef<Path>) -> RelayResult<Self> {
        let path = path.as_ref();
        let file = tokio::fs::File::open(path).await?;
        Ok(Self::new(file, path.display().to_string()))
    }
}

impl ReaderSource<tokio::io::Stdin> {
    pub fn stdin() -> Self {
        Self::new(tokio::io::stdin(), "stdin")
    }
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send> EventSource for ReaderSource<R> {
    async fn next_event(&mut self) -> Option<RelayResult<RawEvent>> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        loop {
            let line = match self.lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => return None,
                Err(e) => return Some(Err(e.into())),
            };
            self.line_number += 1;

            match parse_event_line(&line, self.line_number) {
                Ok(None) => continue,
                Ok(Some(event)) => return Some(Ok(event)),
                Err(e) => return Some(Err(e)),
            }
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// メモリ上のイベント列
#[derive(Debug, Default)]
pub struct VecSource {
    events: VecDeque<RawEvent>,
}

impl VecSource {
    pub fn new(events: impl IntoIterator<Item = RawEvent>) -> Self {
        Self {
            events: events.into_iter().collect(),
        }
    }
}

#[async_trait]
impl EventSource for VecSource {
    async fn next_event(&mut self) -> Option<RelayResult<RawEvent>> {
        self.events.pop_front().map(Ok)
    }

    fn name(&self) -> &str {
        "memory"
    }
}

/// 再生結果
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplaySummary {
    pub events_submitted: usize,
    pub messages_broadcast: usize,
    pub lines_skipped: usize,
}

/// 録画時刻を再生時の到着時刻へ写す
///
/// 最初のタイムスタンプ付きイベントを再生開始時刻に合わせ、以降は録画上の
/// 間隔を保つ。タイムスタンプのないイベントは現在時刻。到着時刻は逆行しない。
#[derive(Debug, Default)]
pub struct ReplayClock {
    origin: Option<(DateTime<Utc>, DateTime<Utc>)>,
    last: Option<DateTime<Utc>>,
}

impl ReplayClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// `event` の到着時刻。`now` は再生側の現在時刻
    pub fn received_at(&mut self, event: &RawEvent, now: DateTime<Utc>) -> DateTime<Utc> {
        let recorded = event
            .payload
            .timestamp
            .and_then(DateTime::from_timestamp_millis);

        let at = match recorded {
            Some(recorded) => {
                let (first_recorded, started) = *self.origin.get_or_insert((recorded, now));
                started + (recorded - first_recorded)
            }
            None => now,
        };

        let at = self.last.map_or(at, |last| at.max(last));
        self.last = Some(at);
        at
    }
}

/// ソースのイベントをすべてセッションへ投入する
///
/// 到着時刻は [`ReplayClock`] で録画上の間隔を再現する。解析できない行は
/// 警告を出して読み飛ばす。セッションが配信終了などで閉じた場合はそこで
/// 再生を終える。
pub async fn replay_into(
    source: &mut dyn EventSource,
    relay: &RelayHandle,
    session: &str,
) -> RelayResult<ReplaySummary> {
    let mut summary = ReplaySummary::default();
    let mut clock = ReplayClock::new();
    info!("▶️ Replaying events from {} into '{}'", source.name(), session);

    while let Some(next) = source.next_event().await {
        let event = match next {
            Ok(event) => event,
            Err(e @ RelayError::Json { .. }) => {
                warn!(source = %source.name(), error = %e, "⚠️ Skipping unreadable line");
                summary.lines_skipped += 1;
                continue;
            }
            Err(e) => return Err(e),
        };

        let received_at = clock.received_at(&event, Utc::now());
        match relay.submit_at(session, event, received_at).await {
            Ok(sent) => {
                summary.events_submitted += 1;
                summary.messages_broadcast += sent;
            }
            Err(RelayError::SessionNotFound { .. }) => {
                debug!("Session '{}' closed, stopping replay", session);
                break;
            }
            Err(e) => return Err(e),
        }
    }

    info!(
        events = summary.events_submitted,
        broadcast = summary.messages_broadcast,
        skipped = summary.lines_skipped,
        "⏹️ Replay finished"
    );
    Ok(summary)
}
