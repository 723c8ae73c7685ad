//! 表示ティア分類
//!
//! 台帳と最近のアクティビティから、3段の表示列を毎回作り直す。
//!
//! 1. `total_value >= qualifying_threshold` のユーザーを累計の降順（同値は最新アクティビティ順）に並べる
//! 2. 先頭 `spotlight_capacity` 人が Spotlight、残りが Supporter
//! 3. 閾値未満の台帳ユーザーとアクティビティのみのユーザーが Participant（上限あり）
//!
//! 境界でのヒステリシスはない。追い抜かれたユーザーはそのまま Supporter に落ちる。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashSet;

use super::activity::ActivityRecord;
use super::ledger::LedgerEntry;

/// ティア
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, derive_more::Display,
)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Spotlight,
    Supporter,
    Participant,
}

/// ティア分類設定
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TierConfig {
    /// Spotlightの定員
    pub spotlight_capacity: usize,
    /// Spotlight/Supporterに入るための最低累計
    pub qualifying_threshold: u64,
    /// Participantの表示上限
    pub participant_capacity: usize,
}

impl Default for TierConfig {
    fn default() -> Self {
        Self {
            spotlight_capacity: 10,
            qualifying_threshold: 100,
            participant_capacity: 24,
        }
    }
}

/// ティア内の1ユーザー
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TierMember {
    pub user_id: String,
    pub display_name: String,
    pub total_value: u64,
    pub last_activity_at: DateTime<Utc>,
}

impl From<&LedgerEntry> for TierMember {
    fn from(entry: &LedgerEntry) -> Self {
        Self {
            user_id: entry.user_id.clone(),
            display_name: entry.display_name.clone(),
            total_value: entry.total_value,
            last_activity_at: entry.last_activity_at,
        }
    }
}

impl From<&ActivityRecord> for TierMember {
    fn from(record: &ActivityRecord) -> Self {
        Self {
            user_id: record.user_id.clone(),
            display_name: record.display_name.clone(),
            total_value: 0,
            last_activity_at: record.occurred_at,
        }
    }
}

/// 分類結果
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct TierAssignment {
    pub spotlight: Vec<TierMember>,
    pub supporter: Vec<TierMember>,
    pub participant: Vec<TierMember>,
}

impl TierAssignment {
    /// ユーザーが属するティア
    pub fn tier_of(&self, user_id: &str) -> Option<Tier> {
        let contains = |members: &[TierMember]| members.iter().any(|m| m.user_id == user_id);

        if contains(&self.spotlight) {
            Some(Tier::Spotlight)
        } else if contains(&self.supporter) {
            Some(Tier::Supporter)
        } else if contains(&self.participant) {
            Some(Tier::Participant)
        } else {
            None
        }
    }

    pub fn total_members(&self) -> usize {
        self.spotlight.len() + self.supporter.len() + self.participant.len()
    }

    pub fn is_empty(&self) -> bool {
        self.total_members() == 0
    }
}

/// 累計の降順、同値なら最新アクティビティ順、最後にIDで安定化
fn rank(a: &LedgerEntry, b: &LedgerEntry) -> Ordering {
    b.total_value
        .cmp(&a.total_value)
        .then_with(|| b.last_activity_at.cmp(&a.last_activity_at))
        .then_with(|| a.user_id.cmp(&b.user_id))
}

/// ティア分類
///
/// `activity` は新しい順で渡すこと。
pub fn classify<'a>(
    ledger: impl IntoIterator<Item = &'a LedgerEntry>,
    activity: impl IntoIterator<Item = &'a ActivityRecord>,
    config: &TierConfig,
) -> TierAssignment {
    let (mut qualifying, mut below): (Vec<&LedgerEntry>, Vec<&LedgerEntry>) = ledger
        .into_iter()
        .partition(|entry| entry.total_value >= config.qualifying_threshold);

    qualifying.sort_by(|a, b| rank(a, b));
    below.sort_by(|a, b| rank(a, b));

    let split = config.spotlight_capacity.min(qualifying.len());
    let spotlight = qualifying[..split].iter().map(|e| TierMember::from(*e)).collect();
    let supporter = qualifying[split..].iter().map(|e| TierMember::from(*e)).collect();

    let mut seen: HashSet<&str> = qualifying.iter().map(|e| e.user_id.as_str()).collect();
    let mut participant: Vec<TierMember> = Vec::new();

    for entry in below {
        if participant.len() >= config.participant_capacity {
            break;
        }
        seen.insert(entry.user_id.as_str());
        participant.push(TierMember::from(entry));
    }

    for record in activity {
        if participant.len() >= config.participant_capacity {
            break;
        }
        if seen.insert(record.user_id.as_str()) {
            participant.push(TierMember::from(record));
        }
    }

    TierAssignment {
        spotlight,
        supporter,
        participant,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analytics::activity::ActivityType;
    use chrono::Duration;

    fn entry(user: &str, total: u64, at: DateTime<Utc>) -> LedgerEntry {
        LedgerEntry {
            user_id: user.to_string(),
            display_name: user.to_uppercase(),
            total_value: total,
            gift_count: 1,
            last_activity_at: at,
        }
    }

    fn chat(user: &str, at: DateTime<Utc>) -> ActivityRecord {
        ActivityRecord {
            user_id: user.to_string(),
            display_name: user.to_string(),
            activity_type: ActivityType::Chat,
            occurred_at: at,
        }
    }

    #[test]
    fn test_qualification_boundary() {
        let now = Utc::now();
        let ledger = vec![entry("u99", 99, now), entry("u100", 100, now)];

        let tiers = classify(&ledger, std::iter::empty(), &TierConfig::default());
        assert_eq!(tiers.tier_of("u100"), Some(Tier::Spotlight));
        assert_eq!(tiers.tier_of("u99"), Some(Tier::Participant));
    }

    #[test]
    fn test_spotlight_capacity_and_overflow_demotion() {
        let now = Utc::now();
        let ledger: Vec<_> = (0..15)
            .map(|i| entry(&format!("u{:02}", i), 100 + i * 10, now))
            .collect();

        let tiers = classify(&ledger, std::iter::empty(), &TierConfig::default());
        assert_eq!(tiers.spotlight.len(), 10);
        assert_eq!(tiers.supporter.len(), 5);
        assert_eq!(tiers.spotlight[0].user_id, "u14");

        let min_spotlight = tiers.spotlight.iter().map(|m| m.total_value).min().unwrap();
        let max_supporter = tiers.supporter.iter().map(|m| m.total_value).max().unwrap();
        assert!(min_spotlight >= max_supporter);
    }

    #[test]
    fn test_ties_broken_by_recency() {
        let t0 = Utc::now();
        let ledger = vec![
            entry("early", 500, t0),
            entry("late", 500, t0 + Duration::seconds(30)),
        ];

        let config = TierConfig {
            spotlight_capacity: 1,
            ..TierConfig::default()
        };
        let tiers = classify(&ledger, std::iter::empty(), &config);
        assert_eq!(tiers.spotlight[0].user_id, "late");
        assert_eq!(tiers.supporter[0].user_id, "early");
    }

    #[test]
    fn test_overtaken_user_is_demoted() {
        let now = Utc::now();
        let config = TierConfig {
            spotlight_capacity: 1,
            ..TierConfig::default()
        };

        let mut ledger = vec![entry("a", 200, now), entry("b", 150, now)];
        let tiers = classify(&ledger, std::iter::empty(), &config);
        assert_eq!(tiers.tier_of("a"), Some(Tier::Spotlight));

        ledger[1].total_value = 201;
        let tiers = classify(&ledger, std::iter::empty(), &config);
        assert_eq!(tiers.tier_of("a"), Some(Tier::Supporter));
        assert_eq!(tiers.tier_of("b"), Some(Tier::Spotlight));
    }

    #[test]
    fn test_participants_from_ledger_and_activity() {
        let t0 = Utc::now();
        let ledger = vec![entry("whale", 1000, t0), entry("small", 20, t0)];
        let activity = vec![
            chat("chatter2", t0 + Duration::seconds(2)),
            chat("whale", t0 + Duration::seconds(1)),
            chat("chatter2", t0 + Duration::seconds(1)),
            chat("chatter1", t0),
        ];

        let tiers = classify(&ledger, &activity, &TierConfig::default());
        let names: Vec<_> = tiers.participant.iter().map(|m| m.user_id.as_str()).collect();
        assert_eq!(names, vec!["small", "chatter2", "chatter1"]);
        assert_eq!(tiers.tier_of("whale"), Some(Tier::Spotlight));
        assert_eq!(tiers.total_members(), 4);
    }

    #[test]
    fn test_participant_capacity() {
        let t0 = Utc::now();
        let activity: Vec<_> = (0..40)
            .map(|i| chat(&format!("c{}", i), t0 - Duration::seconds(i)))
            .collect();

        let tiers = classify(std::iter::empty(), &activity, &TierConfig::default());
        assert_eq!(tiers.participant.len(), 24);
        assert_eq!(tiers.participant[0].user_id, "c0");
    }

    #[test]
    fn test_empty_inputs() {
        let tiers = classify(std::iter::empty(), std::iter::empty(), &TierConfig::default());
        assert!(tiers.is_empty());
        assert_eq!(tiers.tier_of("anyone"), None);
    }
}
