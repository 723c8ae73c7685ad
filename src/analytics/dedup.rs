//! ギフト重複排除
//!
//! 同じギフトイベントが短時間に複数回配信されることがあるため、2つの方式で抑止する。
//!
//! - `ContentWindow`: `(user_id, gift_id, gift_name)` が直近 `window_ms` 以内に見えていれば重複
//! - `Identity`: イベントUUIDが既に処理済みなら重複（UUID集合は `uuid_ttl_secs` で期限切れ）
//! - `Both`: 上記を順に適用
//!
//! 状態が更新されるのは受理時のみ。内容キーは `key_ttl_secs` までスイープで残るが、
//! 時間窓を過ぎたキーは参照時点で重複判定に使われない。

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::models::GiftDetails;

/// 重複排除方式
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default, derive_more::Display,
)]
#[serde(rename_all = "kebab-case")]
pub enum DedupStrategy {
    #[default]
    #[display("content-window")]
    ContentWindow,
    #[display("identity")]
    Identity,
    #[display("both")]
    Both,
}

impl DedupStrategy {
    fn uses_content(self) -> bool {
        matches!(self, DedupStrategy::ContentWindow | DedupStrategy::Both)
    }

    fn uses_identity(self) -> bool {
        matches!(self, DedupStrategy::Identity | DedupStrategy::Both)
    }
}

/// 重複排除設定
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DedupConfig {
    pub strategy: DedupStrategy,
    /// 同一内容を重複とみなす時間窓（ミリ秒）
    pub window_ms: u64,
    /// 内容キーの保持期間（秒）
    pub key_ttl_secs: u64,
    /// 処理済みUUIDの保持期間（秒）
    pub uuid_ttl_secs: u64,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            strategy: DedupStrategy::ContentWindow,
            window_ms: 5_000,
            key_ttl_secs: 300,
            uuid_ttl_secs: 300,
        }
    }
}

impl DedupConfig {
    pub fn window(&self) -> Duration {
        Duration::milliseconds(self.window_ms.min(i64::MAX as u64) as i64)
    }

    /// 内容キーの保持期間。時間窓より短くはならない
    pub fn key_ttl(&self) -> Duration {
        Duration::seconds(self.key_ttl_secs.min(i64::MAX as u64 / 1000) as i64).max(self.window())
    }

    pub fn uuid_ttl(&self) -> Duration {
        Duration::seconds(self.uuid_ttl_secs.min(i64::MAX as u64 / 1000) as i64)
    }
}

/// 内容ベースの重複キー
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DedupKey {
    pub user_id: String,
    pub gift_id: String,
    pub gift_name: String,
}

impl DedupKey {
    pub fn new(user_id: &str, gift: &GiftDetails) -> Self {
        Self {
            user_id: user_id.to_string(),
            gift_id: gift.gift_id.clone(),
            gift_name: gift.gift_name.clone(),
        }
    }
}

/// 判定結果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DedupDecision {
    Accepted,
    /// 時間窓内の同一内容
    DuplicateContent { since_last_ms: i64 },
    /// 処理済みUUID
    DuplicateIdentity,
}

impl DedupDecision {
    pub fn is_accepted(&self) -> bool {
        matches!(self, DedupDecision::Accepted)
    }
}

/// ギフト重複排除器
#[derive(Debug, Clone, Default)]
pub struct GiftDeduplicator {
    config: DedupConfig,
    /// キー → 最後に受理した時刻
    last_seen: HashMap<DedupKey, DateTime<Utc>>,
    /// UUID → 最初に受理した時刻
    processed_uuids: HashMap<String, DateTime<Utc>>,
}

impl GiftDeduplicator {
    pub fn new(config: DedupConfig) -> Self {
        Self {
            config,
            last_seen: HashMap::new(),
            processed_uuids: HashMap::new(),
        }
    }

    pub fn config(&self) -> &DedupConfig {
        &self.config
    }

    /// 受理すべきかどうか
    pub fn should_accept(&mut self, user_id: &str, gift: &GiftDetails, now: DateTime<Utc>) -> bool {
        self.check(user_id, gift, now).is_accepted()
    }

    /// 判定して、受理した場合のみ状態を記録
    pub fn check(
        &mut self,
        user_id: &str,
        gift: &GiftDetails,
        now: DateTime<Utc>,
    ) -> DedupDecision {
        let strategy = self.config.strategy;
        let key = DedupKey::new(user_id, gift);

        if strategy.uses_content() {
            if let Some(last) = self.last_seen.get(&key) {
                let since_last = now - *last;
                if since_last < self.config.window() {
                    return DedupDecision::DuplicateContent {
                        since_last_ms: since_last.num_milliseconds(),
                    };
                }
            }
        }

        let uuid = gift.event_uuid.as_deref().filter(|_| strategy.uses_identity());
        if let Some(uuid) = uuid {
            if self.processed_uuids.contains_key(uuid) {
                return DedupDecision::DuplicateIdentity;
            }
        }

        if strategy.uses_content() {
            self.last_seen.insert(key, now);
        }
        if let Some(uuid) = uuid {
            self.processed_uuids.insert(uuid.to_string(), now);
        }

        DedupDecision::Accepted
    }

    /// 期限切れエントリを削除し、削除件数（内容キー, UUID）を返す
    pub fn remove_expired(&mut self, now: DateTime<Utc>) -> (usize, usize) {
        let key_ttl = self.config.key_ttl();
        let uuid_ttl = self.config.uuid_ttl();

        let before_keys = self.last_seen.len();
        self.last_seen.retain(|_, seen| now - *seen < key_ttl);

        let before_uuids = self.processed_uuids.len();
        self.processed_uuids.retain(|_, seen| now - *seen < uuid_ttl);

        (
            before_keys - self.last_seen.len(),
            before_uuids - self.processed_uuids.len(),
        )
    }

    pub fn tracked_keys(&self) -> usize {
        self.last_seen.len()
    }

    pub fn tracked_uuids(&self) -> usize {
        self.processed_uuids.len()
    }

    pub fn clear(&mut self) {
        self.last_seen.clear();
        self.processed_uuids.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rose(uuid: Option<&str>) -> GiftDetails {
        GiftDetails {
            gift_id: "g1".to_string(),
            gift_name: "Rose".to_string(),
            unit_value: 1,
            repeat_count: 50,
            event_uuid: uuid.map(str::to_string),
        }
    }

    fn dedup(strategy: DedupStrategy) -> GiftDeduplicator {
        GiftDeduplicator::new(DedupConfig {
            strategy,
            ..DedupConfig::default()
        })
    }

    #[test]
    fn test_content_window_rejects_within_window() {
        let mut d = dedup(DedupStrategy::ContentWindow);
        let t0 = Utc::now();

        assert!(d.should_accept("u1", &rose(None), t0));
        assert_eq!(
            d.check("u1", &rose(None), t0 + Duration::seconds(2)),
            DedupDecision::DuplicateContent {
                since_last_ms: 2_000
            }
        );
        // 境界ちょうどは受理
        assert!(d.should_accept("u1", &rose(None), t0 + Duration::milliseconds(5_000)));
    }

    #[test]
    fn test_rejection_does_not_extend_window() {
        let mut d = dedup(DedupStrategy::ContentWindow);
        let t0 = Utc::now();

        assert!(d.should_accept("u1", &rose(None), t0));
        assert!(!d.should_accept("u1", &rose(None), t0 + Duration::seconds(4)));
        // 拒否時に時刻を更新していなければ、t0から5秒後に受理される
        assert!(d.should_accept("u1", &rose(None), t0 + Duration::seconds(6)));
    }

    #[test]
    fn test_content_key_distinguishes_users_and_gifts() {
        let mut d = dedup(DedupStrategy::ContentWindow);
        let t0 = Utc::now();

        assert!(d.should_accept("u1", &rose(None), t0));
        assert!(d.should_accept("u2", &rose(None), t0));

        let lion = GiftDetails {
            gift_id: "g2".to_string(),
            gift_name: "Lion".to_string(),
            ..rose(None)
        };
        assert!(d.should_accept("u1", &lion, t0));
        assert_eq!(d.tracked_keys(), 3);
    }

    #[test]
    fn test_identity_strategy() {
        let mut d = dedup(DedupStrategy::Identity);
        let t0 = Utc::now();

        assert!(d.should_accept("u1", &rose(Some("a")), t0));
        assert_eq!(
            d.check("u1", &rose(Some("a")), t0 + Duration::minutes(1)),
            DedupDecision::DuplicateIdentity
        );
        // 内容が同じでもUUIDが違えば受理
        assert!(d.should_accept("u1", &rose(Some("b")), t0));
        // UUIDなしは識別ステージを通過
        assert!(d.should_accept("u1", &rose(None), t0));
        assert!(d.should_accept("u1", &rose(None), t0));
        assert_eq!(d.tracked_keys(), 0);
    }

    #[test]
    fn test_both_strategy_records_only_on_full_acceptance() {
        let mut d = dedup(DedupStrategy::Both);
        let t0 = Utc::now();

        assert!(d.should_accept("u1", &rose(Some("a")), t0));
        // 内容ステージで拒否された場合、UUID "b" は記録されない
        assert!(!d.should_accept("u1", &rose(Some("b")), t0 + Duration::seconds(1)));
        assert_eq!(d.tracked_uuids(), 1);

        // 時間窓外でもUUIDが処理済みなら拒否
        assert_eq!(
            d.check("u1", &rose(Some("a")), t0 + Duration::seconds(10)),
            DedupDecision::DuplicateIdentity
        );
        assert!(d.should_accept("u1", &rose(Some("b")), t0 + Duration::seconds(10)));
    }

    #[test]
    fn test_remove_expired() {
        let mut d = dedup(DedupStrategy::Both);
        let t0 = Utc::now();

        d.should_accept("u1", &rose(Some("a")), t0);
        d.should_accept("u2", &rose(Some("b")), t0 + Duration::minutes(2));

        // 時間窓を過ぎても保持期間内なら残る
        assert_eq!(d.remove_expired(t0 + Duration::seconds(6)), (0, 0));

        let (keys, uuids) = d.remove_expired(t0 + Duration::minutes(6));
        assert_eq!((keys, uuids), (1, 1));
        assert_eq!(d.tracked_keys(), 1);

        let (keys, uuids) = d.remove_expired(t0 + Duration::minutes(10));
        assert_eq!((keys, uuids), (1, 1));
        assert_eq!(d.tracked_uuids(), 0);

        // 期限切れ後は同じUUIDを再受理できる
        assert!(d.should_accept("u1", &rose(Some("a")), t0 + Duration::minutes(10)));
    }

    #[test]
    fn test_key_ttl_never_shorter_than_window() {
        let config = DedupConfig {
            window_ms: 10_000,
            key_ttl_secs: 1,
            ..DedupConfig::default()
        };
        assert_eq!(config.key_ttl(), Duration::seconds(10));
    }

    #[test]
    fn test_strategy_serialization() {
        let json = serde_json::to_string(&DedupStrategy::ContentWindow).unwrap();
        assert_eq!(json, r#""content-window""#);
        assert_eq!(DedupStrategy::Both.to_string(), "both");
    }
}
