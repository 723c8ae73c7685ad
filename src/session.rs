//! 配信セッション
//!
//! 1配信（ストリーマー）ごとの状態をまとめたコンテキスト。
//! 重複排除・台帳・アクティビティログ・ティアはすべてセッションに属し、
//! `Live` に入るとき、および `Live` を離れるときに必ず破棄される。
//!
//! 状態遷移: `Disconnected → Connecting → Live → (StreamEnd | Error | ManualDisconnect) → Disconnected`

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, info, warn};

use crate::analytics::activity::{ActivityLog, ActivityRecord, ActivityType};
use crate::analytics::dedup::{DedupDecision, GiftDeduplicator};
use crate::analytics::ledger::AccumulationLedger;
use crate::analytics::retention::{RetentionSweeper, SweepReport};
use crate::analytics::tiers::{classify, TierAssignment};
use crate::config::EngineConfig;
use crate::error::{RelayError, RelayResult};
use crate::models::{CanonicalEvent, EventKind, GiftDetails, Inbound, OutboundMessage, RawEvent};
use crate::normalizer::normalize;

/// セッション状態
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, derive_more::Display)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Live,
}

/// `Live` を離れた理由
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, derive_more::Display)]
pub enum EndReason {
    StreamEnd,
    Error,
    ManualDisconnect,
}

/// セッション統計
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStats {
    pub events_processed: u64,
    pub gifts_accepted: u64,
    pub duplicates_dropped: u64,
    pub malformed_dropped: u64,
}

/// 1配信分のコンテキスト
#[derive(Debug)]
pub struct SessionContext {
    handle: String,
    state: SessionState,
    config: EngineConfig,
    dedup: GiftDeduplicator,
    ledger: AccumulationLedger,
    activity: ActivityLog,
    sweeper: RetentionSweeper,
    tiers: TierAssignment,
    stats: SessionStats,
    live_since: Option<DateTime<Utc>>,
}

impl SessionContext {
    pub fn new(handle: impl Into<String>, config: EngineConfig) -> Self {
        Self {
            handle: handle.into(),
            state: SessionState::Disconnected,
            dedup: GiftDeduplicator::new(config.dedup.clone()),
            ledger: AccumulationLedger::new(),
            activity: ActivityLog::new(config.activity_capacity),
            sweeper: RetentionSweeper::new(config.retention.clone()),
            tiers: TierAssignment::default(),
            stats: SessionStats::default(),
            live_since: None,
            config,
        }
    }

    pub fn handle(&self) -> &str {
        &self.handle
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_live(&self) -> bool {
        self.state == SessionState::Live
    }

    pub fn live_since(&self) -> Option<DateTime<Utc>> {
        self.live_since
    }

    pub fn ledger(&self) -> &AccumulationLedger {
        &self.ledger
    }

    pub fn activity(&self) -> &ActivityLog {
        &self.activity
    }

    pub fn dedup(&self) -> &GiftDeduplicator {
        &self.dedup
    }

    pub fn tiers(&self) -> &TierAssignment {
        &self.tiers
    }

    pub fn stats(&self) -> SessionStats {
        self.stats
    }

    /// `Disconnected → Connecting`
    pub fn begin_connecting(&mut self) -> RelayResult<()> {
        self.transition(SessionState::Connecting)
    }

    /// `Connecting → Live`。セッション状態はここで初期化される
    pub fn go_live(&mut self, now: DateTime<Utc>) -> RelayResult<()> {
        self.transition(SessionState::Live)?;
        self.reset();
        self.live_since = Some(now);
        info!("🔴 Session '{}' is live", self.handle);
        Ok(())
    }

    /// `Connecting | Live → Disconnected`。セッション状態をすべて破棄する
    pub fn end(&mut self, reason: EndReason) -> RelayResult<()> {
        self.transition(SessionState::Disconnected)?;
        info!(
            session = %self.handle,
            reason = %reason,
            gifts_accepted = self.stats.gifts_accepted,
            duplicates_dropped = self.stats.duplicates_dropped,
            "⏹️ Session ended"
        );
        self.reset();
        self.live_since = None;
        Ok(())
    }

    fn transition(&mut self, to: SessionState) -> RelayResult<()> {
        let allowed = matches!(
            (self.state, to),
            (SessionState::Disconnected, SessionState::Connecting)
                | (SessionState::Connecting, SessionState::Live)
                | (SessionState::Connecting, SessionState::Disconnected)
                | (SessionState::Live, SessionState::Disconnected)
        );
        if !allowed {
            return Err(RelayError::InvalidTransition {
                from: self.state,
                to,
            });
        }
        debug!("🔄 Session '{}': {} → {}", self.handle, self.state, to);
        self.state = to;
        Ok(())
    }

    fn reset(&mut self) {
        self.dedup.clear();
        self.ledger.clear();
        self.activity.clear();
        self.tiers = TierAssignment::default();
        self.stats = SessionStats::default();
    }

    /// 生イベントを正規化して処理。不正なイベントはログのみで破棄
    pub fn handle_raw(&mut self, raw: RawEvent, now: DateTime<Utc>) -> Vec<OutboundMessage> {
        match normalize(raw, now) {
            Ok(inbound) => self.handle_event(inbound, now),
            Err(e) => {
                self.stats.malformed_dropped += 1;
                warn!(session = %self.handle, error = %e, "⚠️ Dropping malformed event");
                Vec::new()
            }
        }
    }

    /// 正規化済みイベントを処理し、配信するメッセージを返す
    pub fn handle_event(&mut self, inbound: Inbound, now: DateTime<Utc>) -> Vec<OutboundMessage> {
        if !self.is_live() {
            warn!(
                session = %self.handle,
                state = %self.state,
                "Dropping event for session that is not live"
            );
            return Vec::new();
        }

        self.stats.events_processed += 1;

        let event = match inbound {
            Inbound::Event(event) => event,
            Inbound::UpstreamError { message } => {
                warn!(session = %self.handle, error = %message, "❌ Upstream connection error");
                let out = vec![OutboundMessage::RelayError { message }];
                if let Err(e) = self.end(EndReason::Error) {
                    warn!(session = %self.handle, error = %e, "Failed to end session");
                }
                return out;
            }
        };

        let CanonicalEvent {
            display_name,
            user_id,
            occurred_at,
            kind,
        } = event;

        match kind {
            EventKind::Chat { message } => {
                self.record_activity(&user_id, &display_name, ActivityType::Chat, now);
                let mut out = vec![OutboundMessage::ChatBroadcast {
                    username: display_name,
                    user_id,
                    message,
                }];
                out.extend(self.refresh_tiers());
                out
            }
            EventKind::Like { like_count } => {
                self.record_activity(&user_id, &display_name, ActivityType::Like, now);
                let mut out = vec![OutboundMessage::LikeBroadcast {
                    username: display_name,
                    likes: like_count,
                }];
                out.extend(self.refresh_tiers());
                out
            }
            EventKind::Member { member_type } => vec![OutboundMessage::MemberBroadcast {
                username: display_name,
                member_type,
            }],
            EventKind::Gift(gift) => {
                self.handle_gift(user_id, display_name, gift, occurred_at, now)
            }
            EventKind::StreamEnd => {
                let out = vec![OutboundMessage::StreamEnd {
                    session: self.handle.clone(),
                }];
                if let Err(e) = self.end(EndReason::StreamEnd) {
                    warn!(session = %self.handle, error = %e, "Failed to end session");
                }
                out
            }
        }
    }

    fn handle_gift(
        &mut self,
        user_id: String,
        display_name: String,
        gift: GiftDetails,
        occurred_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Vec<OutboundMessage> {
        match self.dedup.check(&user_id, &gift, now) {
            DedupDecision::Accepted => {}
            DedupDecision::DuplicateContent { since_last_ms } => {
                self.stats.duplicates_dropped += 1;
                debug!(
                    nickname = %display_name,
                    gift_name = %gift.gift_name,
                    time_since_last_gift = since_last_ms,
                    "Skipping duplicate gift"
                );
                return Vec::new();
            }
            DedupDecision::DuplicateIdentity => {
                self.stats.duplicates_dropped += 1;
                debug!(
                    nickname = %display_name,
                    uuid = ?gift.event_uuid,
                    "Skipping already processed gift"
                );
                return Vec::new();
            }
        }

        let applied = self.ledger.apply_gift(
            &user_id,
            &display_name,
            gift.unit_value,
            gift.repeat_count,
            now,
        );
        self.stats.gifts_accepted += 1;

        info!(
            nickname = %display_name,
            gift_name = %gift.gift_name,
            diamonds = gift.unit_value,
            repeat_count = gift.repeat_count,
            total_value = applied.entry.total_value,
            "🎁 Processing gift"
        );

        let mut out = vec![OutboundMessage::GiftBroadcast {
            username: display_name,
            user_id,
            gift_id: gift.gift_id,
            gift_name: gift.gift_name,
            diamonds: gift.unit_value,
            repeat_count: gift.repeat_count,
            total_value: applied.entry.total_value,
            timestamp: occurred_at.timestamp_millis(),
            uuid: gift
                .event_uuid
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            time_since_last_gift_ms: applied.time_since_last_gift_ms,
        }];
        out.extend(self.refresh_tiers());
        out
    }

    fn record_activity(
        &mut self,
        user_id: &str,
        display_name: &str,
        activity_type: ActivityType,
        now: DateTime<Utc>,
    ) {
        self.activity.record(ActivityRecord {
            user_id: user_id.to_string(),
            display_name: display_name.to_string(),
            activity_type,
            occurred_at: now,
        });
        self.ledger.touch(user_id, now);
    }

    /// ティアを再計算し、変化があれば `tier-update` を返す
    fn refresh_tiers(&mut self) -> Option<OutboundMessage> {
        let tiers = classify(self.ledger.entries(), self.activity.recent(), &self.config.tiers);
        if tiers == self.tiers {
            return None;
        }
        self.tiers = tiers;
        Some(OutboundMessage::TierUpdate(self.tiers.clone()))
    }

    /// 保持期間スイープ。ランキングに影響した場合は `tier-update` も返す
    pub fn sweep(&mut self, now: DateTime<Utc>) -> (SweepReport, Option<OutboundMessage>) {
        let report = self
            .sweeper
            .sweep(&mut self.dedup, &mut self.ledger, &mut self.activity, now);

        if report.total() > 0 {
            debug!(session = %self.handle, ?report, "🧹 Retention sweep");
        }

        let update = if report.affects_ranking() {
            self.refresh_tiers()
        } else {
            None
        };
        (report, update)
    }
}

/// ストリーマーごとのセッション管理
#[derive(Debug, Default)]
pub struct SessionRegistry {
    config: EngineConfig,
    sessions: HashMap<String, SessionContext>,
}

impl SessionRegistry {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            sessions: HashMap::new(),
        }
    }

    /// セッションを登録して `Connecting` にする
    pub fn connect(&mut self, handle: &str) -> RelayResult<()> {
        if self.sessions.contains_key(handle) {
            return Err(RelayError::AlreadyConnected {
                handle: handle.to_string(),
            });
        }

        let mut session = SessionContext::new(handle, self.config.clone());
        session.begin_connecting()?;
        self.sessions.insert(handle.to_string(), session);
        info!("🔌 Connecting session '{}'", handle);
        Ok(())
    }

    /// `Connecting → Live`
    pub fn mark_live(&mut self, handle: &str, now: DateTime<Utc>) -> RelayResult<()> {
        self.get_mut(handle)?.go_live(now)
    }

    /// 手動切断。セッションは破棄される
    pub fn disconnect(&mut self, handle: &str) -> RelayResult<()> {
        let mut session = self
            .sessions
            .remove(handle)
            .ok_or_else(|| RelayError::session_not_found(handle))?;
        session.end(EndReason::ManualDisconnect)
    }

    /// イベントを該当セッションへ渡す。配信終了・エラーで切断されたセッションは登録解除する
    pub fn handle_raw(
        &mut self,
        handle: &str,
        raw: RawEvent,
        now: DateTime<Utc>,
    ) -> RelayResult<Vec<OutboundMessage>> {
        let session = self.get_mut(handle)?;
        let out = session.handle_raw(raw, now);

        if session.state() == SessionState::Disconnected {
            self.sessions.remove(handle);
        }
        Ok(out)
    }

    /// 全セッションをスイープ
    pub fn sweep_all(
        &mut self,
        now: DateTime<Utc>,
    ) -> Vec<(String, SweepReport, Option<OutboundMessage>)> {
        self.sessions
            .values_mut()
            .filter(|s| s.is_live())
            .map(|s| {
                let (report, update) = s.sweep(now);
                (s.handle().to_string(), report, update)
            })
            .collect()
    }

    pub fn get(&self, handle: &str) -> Option<&SessionContext> {
        self.sessions.get(handle)
    }

    fn get_mut(&mut self, handle: &str) -> RelayResult<&mut SessionContext> {
        self.sessions
            .get_mut(handle)
            .ok_or_else(|| RelayError::session_not_found(handle))
    }

    pub fn handles(&self) -> Vec<String> {
        let mut handles: Vec<_> = self.sessions.keys().cloned().collect();
        handles.sort();
        handles
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
