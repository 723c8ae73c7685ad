//! リレーエンジン
//!
//! セッションレジストリを単一のタスクが所有し、コマンド（接続・切断・イベント投入）と
//! 保持期間スイープを `select!` で1つずつ処理する。状態を書き換えるのはこのタスクだけなので、
//! イベント処理とスイープが交互に割り込むことはない。
//!
//! 処理結果の [`OutboundMessage`] は [`Broadcaster`] に渡される。配信は投げっぱなしで、
//! 購読者の遅延がイベント処理を止めることはない。

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::ops::ControlFlow;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::analytics::retention::{RetentionSweeper, SweepReport};
use crate::analytics::tiers::TierAssignment;
use crate::config::EngineConfig;
use crate::error::{RelayError, RelayResult};
use crate::models::{OutboundMessage, RawEvent};
use crate::session::{SessionRegistry, SessionStats};

/// コマンドキューの長さ
const COMMAND_BUFFER: usize = 1024;

/// セッションごとの最新ティア（WebSocketサーバーの `GetTiers` が参照する）
pub type TierSnapshot = Arc<RwLock<HashMap<String, TierAssignment>>>;

/// 配信先
#[async_trait]
pub trait Broadcaster: Send + Sync {
    async fn broadcast(&self, session: &str, message: &OutboundMessage);
}

/// 配信されたメッセージをメモリに記録するだけのBroadcaster
#[derive(Debug, Default)]
pub struct RecordingBroadcaster {
    messages: Mutex<Vec<(String, OutboundMessage)>>,
}

impl RecordingBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    /// 記録済みメッセージのコピー
    pub fn messages(&self) -> Vec<(String, OutboundMessage)> {
        self.messages.lock().clone()
    }

    /// ワイヤー上のイベント名の列
    pub fn event_names(&self) -> Vec<&'static str> {
        self.messages
            .lock()
            .iter()
            .map(|(_, message)| message.event_name())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.messages.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.lock().is_empty()
    }

    pub fn clear(&self) {
        self.messages.lock().clear();
    }
}

#[async_trait]
impl Broadcaster for RecordingBroadcaster {
    async fn broadcast(&self, session: &str, message: &OutboundMessage) {
        self.messages
            .lock()
            .push((session.to_string(), message.clone()));
    }
}

enum Command {
    Connect {
        handle: String,
        reply: oneshot::Sender<RelayResult<()>>,
    },
    Disconnect {
        handle: String,
        reply: oneshot::Sender<RelayResult<()>>,
    },
    Submit {
        handle: String,
        event: RawEvent,
        received_at: DateTime<Utc>,
        reply: oneshot::Sender<RelayResult<usize>>,
    },
    Stats {
        handle: String,
        reply: oneshot::Sender<Option<SessionStats>>,
    },
    Sweep {
        now: DateTime<Utc>,
        reply: oneshot::Sender<SweepReport>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// リレーエンジンへの窓口（クローン可能）
#[derive(Clone)]
pub struct RelayHandle {
    commands: mpsc::Sender<Command>,
    snapshot: TierSnapshot,
}

impl RelayHandle {
    /// セッションを開始する（`Connecting → Live` まで進める）
    pub async fn connect(&self, handle: &str) -> RelayResult<()> {
        self.request(|reply| Command::Connect {
            handle: handle.to_string(),
            reply,
        })
        .await?
    }

    /// 手動切断。セッション状態はすべて破棄される
    pub async fn disconnect(&self, handle: &str) -> RelayResult<()> {
        self.request(|reply| Command::Disconnect {
            handle: handle.to_string(),
            reply,
        })
        .await?
    }

    /// 生イベントを投入し、配信したメッセージ数を返す
    pub async fn submit(&self, handle: &str, event: RawEvent) -> RelayResult<usize> {
        self.submit_at(handle, event, Utc::now()).await
    }

    /// 到着時刻を指定してイベントを投入（録画イベントの再生用）
    pub async fn submit_at(
        &self,
        handle: &str,
        event: RawEvent,
        received_at: DateTime<Utc>,
    ) -> RelayResult<usize> {
        self.request(|reply| Command::Submit {
            handle: handle.to_string(),
            event,
            received_at,
            reply,
        })
        .await?
    }

    /// セッションの最新ティア
    pub fn snapshot(&self, handle: &str) -> Option<TierAssignment> {
        self.snapshot.read().get(handle).cloned()
    }

    /// WebSocketサーバーと共有するスナップショット
    pub fn tier_snapshot(&self) -> TierSnapshot {
        Arc::clone(&self.snapshot)
    }

    /// セッション統計
    pub async fn stats(&self, handle: &str) -> RelayResult<Option<SessionStats>> {
        self.request(|reply| Command::Stats {
            handle: handle.to_string(),
            reply,
        })
        .await
    }

    /// タイマーを待たずにスイープを実行
    pub async fn sweep_now(&self, now: DateTime<Utc>) -> RelayResult<SweepReport> {
        self.request(|reply| Command::Sweep { now, reply }).await
    }

    /// 全セッションを切断してエンジンを停止
    pub async fn shutdown(&self) -> RelayResult<()> {
        self.request(|reply| Command::Shutdown { reply }).await
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> RelayResult<T> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(build(reply))
            .await
            .map_err(|_| RelayError::EngineStopped)?;
        response.await.map_err(|_| RelayError::EngineStopped)
    }
}

/// セッションレジストリを所有するタスク本体
pub struct RelayEngine {
    registry: SessionRegistry,
    sweeper: RetentionSweeper,
    broadcaster: Arc<dyn Broadcaster>,
    snapshot: TierSnapshot,
    commands: mpsc::Receiver<Command>,
}

impl RelayEngine {
    /// エンジンを起動し、窓口とタスクのハンドルを返す
    pub fn spawn(
        config: EngineConfig,
        broadcaster: Arc<dyn Broadcaster>,
    ) -> (RelayHandle, JoinHandle<()>) {
        Self::spawn_with_snapshot(config, broadcaster, TierSnapshot::default())
    }

    /// 既存のスナップショット（WebSocketサーバーと共有済みのもの）を使って起動
    pub fn spawn_with_snapshot(
        config: EngineConfig,
        broadcaster: Arc<dyn Broadcaster>,
        snapshot: TierSnapshot,
    ) -> (RelayHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(COMMAND_BUFFER);

        let engine = Self {
            sweeper: RetentionSweeper::new(config.retention.clone()),
            registry: SessionRegistry::new(config),
            broadcaster,
            snapshot: Arc::clone(&snapshot),
            commands: rx,
        };

        let task = tokio::spawn(engine.run());
        let handle = RelayHandle {
            commands: tx,
            snapshot,
        };
        (handle, task)
    }

    async fn run(mut self) {
        let mut ticker = self.sweeper.interval();
        info!(
            "🚀 Relay engine started (sweep every {}s)",
            self.sweeper.config().sweep_interval_secs
        );

        loop {
            tokio::select! {
                command = self.commands.recv() => {
                    let Some(command) = command else {
                        // 全ハンドルがdropされた
                        self.disconnect_all();
                        break;
                    };
                    if self.dispatch(command).await.is_break() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    self.sweep(Utc::now()).await;
                }
            }
        }

        info!("🛑 Relay engine stopped");
    }

    async fn dispatch(&mut self, command: Command) -> ControlFlow<()> {
        match command {
            Command::Connect { handle, reply } => {
                let result = self.connect(&handle);
                let _ = reply.send(result);
            }
            Command::Disconnect { handle, reply } => {
                let result = self.registry.disconnect(&handle);
                if let Err(e) = &result {
                    debug!("Disconnect ignored: {}", e);
                }
                self.snapshot.write().remove(&handle);
                let _ = reply.send(result);
            }
            Command::Submit {
                handle,
                event,
                received_at,
                reply,
            } => {
                let result = self.submit(&handle, event, received_at).await;
                let _ = reply.send(result);
            }
            Command::Stats { handle, reply } => {
                let stats = self.registry.get(&handle).map(|s| s.stats());
                let _ = reply.send(stats);
            }
            Command::Sweep { now, reply } => {
                let report = self.sweep(now).await;
                let _ = reply.send(report);
            }
            Command::Shutdown { reply } => {
                self.disconnect_all();
                let _ = reply.send(());
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    fn connect(&mut self, handle: &str) -> RelayResult<()> {
        self.registry.connect(handle)?;
        self.registry.mark_live(handle, Utc::now())?;
        self.snapshot
            .write()
            .insert(handle.to_string(), TierAssignment::default());
        Ok(())
    }

    async fn submit(
        &mut self,
        handle: &str,
        event: RawEvent,
        received_at: DateTime<Utc>,
    ) -> RelayResult<usize> {
        let messages = self.registry.handle_raw(handle, event, received_at)?;

        {
            let mut snapshot = self.snapshot.write();
            if self.registry.get(handle).is_none() {
                snapshot.remove(handle);
            } else if let Some(tiers) = latest_tiers(&messages) {
                snapshot.insert(handle.to_string(), tiers.clone());
            }
        }

        for message in &messages {
            self.broadcaster.broadcast(handle, message).await;
        }
        Ok(messages.len())
    }

    async fn sweep(&mut self, now: DateTime<Utc>) -> SweepReport {
        let mut total = SweepReport::default();

        for (handle, report, update) in self.registry.sweep_all(now) {
            total += report;
            if let Some(message) = update {
                if let OutboundMessage::TierUpdate(tiers) = &message {
                    self.snapshot.write().insert(handle.clone(), tiers.clone());
                }
                self.broadcaster.broadcast(&handle, &message).await;
            }
        }

        if total.total() > 0 {
            info!(
                dedup_keys = total.dedup_keys,
                dedup_uuids = total.dedup_uuids,
                ledger_entries = total.ledger_entries,
                activity_records = total.activity_records,
                "🧹 Retention sweep removed {} entries",
                total.total()
            );
        }
        total
    }

    fn disconnect_all(&mut self) {
        for handle in self.registry.handles() {
            if let Err(e) = self.registry.disconnect(&handle) {
                warn!("Failed to disconnect '{}' on shutdown: {}", handle, e);
            }
        }
        self.snapshot.write().clear();
    }
}

fn latest_tiers(messages: &[OutboundMessage]) -> Option<&TierAssignment> {
    messages.iter().rev().find_map(|message| match message {
        OutboundMessage::TierUpdate(tiers) => Some(tiers),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analytics::tiers::Tier;
    use chrono::Duration;
    use serde_json::json;

    fn raw(value: serde_json::Value) -> RawEvent {
        serde_json::from_value(value).unwrap()
    }

    fn rose(user: &str, value: u64, repeat: u32) -> RawEvent {
        raw(json!({
            "event": "gift",
            "nickname": user,
            "userId": user,
            "giftId": 5655,
            "giftName": "Rose",
            "diamondCount": value,
            "repeatCount": repeat
        }))
    }

    fn start() -> (RelayHandle, Arc<RecordingBroadcaster>) {
        let recorder = Arc::new(RecordingBroadcaster::new());
        let (relay, _task) = RelayEngine::spawn(EngineConfig::default(), recorder.clone());
        (relay, recorder)
    }

    #[tokio::test]
    async fn test_submit_broadcasts_and_publishes_snapshot() {
        let (relay, recorder) = start();
        relay.connect("dj_night").await.unwrap();
        assert_eq!(relay.snapshot("dj_night"), Some(TierAssignment::default()));

        let t0 = Utc::now();
        let sent = relay.submit_at("dj_night", rose("alice", 1, 50), t0).await.unwrap();
        assert_eq!(sent, 2);

        let dup = relay
            .submit_at("dj_night", rose("alice", 1, 50), t0 + Duration::seconds(2))
            .await
            .unwrap();
        assert_eq!(dup, 0);

        relay
            .submit_at("dj_night", rose("alice", 10, 10), t0 + Duration::seconds(12))
            .await
            .unwrap();

        assert_eq!(
            recorder.event_names(),
            vec!["gift-broadcast", "tier-update", "gift-broadcast", "tier-update"]
        );
        let tiers = relay.snapshot("dj_night").unwrap();
        assert_eq!(tiers.tier_of("alice"), Some(Tier::Spotlight));

        let stats = relay.stats("dj_night").await.unwrap().unwrap();
        assert_eq!(stats.gifts_accepted, 2);
        assert_eq!(stats.duplicates_dropped, 1);
    }

    #[tokio::test]
    async fn test_unknown_session_is_not_fatal() {
        let (relay, recorder) = start();

        let err = relay.submit("nobody", rose("alice", 1, 1)).await.unwrap_err();
        assert!(matches!(err, RelayError::SessionNotFound { .. }));
        assert!(err.is_recoverable());

        let err = relay.disconnect("nobody").await.unwrap_err();
        assert!(matches!(err, RelayError::SessionNotFound { .. }));
        assert!(recorder.is_empty());

        // エンジンは動き続ける
        relay.connect("dj_night").await.unwrap();
    }

    #[tokio::test]
    async fn test_stream_end_removes_session() {
        let (relay, recorder) = start();
        relay.connect("dj_night").await.unwrap();
        relay.submit("dj_night", rose("alice", 100, 1)).await.unwrap();

        relay
            .submit("dj_night", raw(json!({"event": "streamEnd"})))
            .await
            .unwrap();

        assert_eq!(recorder.event_names().last(), Some(&"stream-end"));
        assert!(relay.snapshot("dj_night").is_none());
        assert!(relay.stats("dj_night").await.unwrap().is_none());

        // 再接続すると空の状態から始まる
        relay.connect("dj_night").await.unwrap();
        relay.submit("dj_night", rose("alice", 1, 1)).await.unwrap();
        let tiers = relay.snapshot("dj_night").unwrap();
        assert_eq!(tiers.participant[0].total_value, 1);
    }

    #[tokio::test]
    async fn test_sweep_now_evicts_and_broadcasts() {
        let (relay, recorder) = start();
        relay.connect("dj_night").await.unwrap();

        let t0 = Utc::now();
        relay.submit_at("dj_night", rose("alice", 100, 1), t0).await.unwrap();
        recorder.clear();

        let report = relay.sweep_now(t0 + Duration::minutes(6)).await.unwrap();
        assert_eq!(report.ledger_entries, 1);
        assert_eq!(recorder.event_names(), vec!["tier-update"]);
        assert!(relay.snapshot("dj_night").unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_stops_engine() {
        let recorder = Arc::new(RecordingBroadcaster::new());
        let (relay, task) = RelayEngine::spawn(EngineConfig::default(), recorder);
        relay.connect("dj_night").await.unwrap();

        relay.shutdown().await.unwrap();
        task.await.unwrap();

        assert!(relay.snapshot("dj_night").is_none());
        assert!(matches!(
            relay.connect("dj_night").await,
            Err(RelayError::EngineStopped)
        ));
    }
}
