//! 保持期間に基づく定期クリーンアップ
//!
//! 重複排除キー・台帳・アクティビティログから古いエントリを削除する。
//! 実行はリレーエンジンのタスク内で行われ、イベント処理と並行しない。

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::activity::ActivityLog;
use super::dedup::GiftDeduplicator;
use super::ledger::AccumulationLedger;

/// 保持設定
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetentionConfig {
    /// 台帳・アクティビティを古いとみなすまでの秒数
    pub stale_after_secs: u64,
    /// スイープ間隔（秒）
    pub sweep_interval_secs: u64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            stale_after_secs: 300,
            sweep_interval_secs: 300,
        }
    }
}

impl RetentionConfig {
    pub fn stale_after(&self) -> Duration {
        Duration::seconds(self.stale_after_secs.min(i64::MAX as u64 / 1000) as i64)
    }

    pub fn sweep_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

/// 1回のスイープで削除した件数
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    pub dedup_keys: usize,
    pub dedup_uuids: usize,
    pub ledger_entries: usize,
    pub activity_records: usize,
}

impl SweepReport {
    pub fn total(&self) -> usize {
        self.dedup_keys + self.dedup_uuids + self.ledger_entries + self.activity_records
    }

    /// 台帳かアクティビティが変わった場合はティアの再計算が必要
    pub fn affects_ranking(&self) -> bool {
        self.ledger_entries > 0 || self.activity_records > 0
    }
}

impl std::ops::AddAssign for SweepReport {
    fn add_assign(&mut self, other: Self) {
        self.dedup_keys += other.dedup_keys;
        self.dedup_uuids += other.dedup_uuids;
        self.ledger_entries += other.ledger_entries;
        self.activity_records += other.activity_records;
    }
}

/// 保持期間スイーパー
#[derive(Debug, Clone, Default)]
pub struct RetentionSweeper {
    config: RetentionConfig,
}

impl RetentionSweeper {
    pub fn new(config: RetentionConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetentionConfig {
        &self.config
    }

    /// 古いエントリを削除
    pub fn sweep(
        &self,
        dedup: &mut GiftDeduplicator,
        ledger: &mut AccumulationLedger,
        activity: &mut ActivityLog,
        now: DateTime<Utc>,
    ) -> SweepReport {
        let cutoff = now - self.config.stale_after();
        let (dedup_keys, dedup_uuids) = dedup.remove_expired(now);

        SweepReport {
            dedup_keys,
            dedup_uuids,
            ledger_entries: ledger.remove_stale(cutoff),
            activity_records: activity.remove_older_than(cutoff),
        }
    }

    /// スイープ用タイマー
    ///
    /// 最初のtickは1間隔後。処理が遅れた場合は溜まったtickを捨てる。
    pub fn interval(&self) -> tokio::time::Interval {
        let period = self.config.sweep_interval();
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        interval
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analytics::activity::{ActivityRecord, ActivityType};
    use crate::analytics::dedup::DedupConfig;
    use crate::models::GiftDetails;

    #[test]
    fn test_sweep_removes_only_stale_entries() {
        let sweeper = RetentionSweeper::default();
        let mut dedup = GiftDeduplicator::new(DedupConfig::default());
        let mut ledger = AccumulationLedger::new();
        let mut activity = ActivityLog::default();
        let t0 = Utc::now();

        let gift = GiftDetails {
            gift_id: "g1".to_string(),
            gift_name: "Rose".to_string(),
            unit_value: 1,
            repeat_count: 1,
            event_uuid: None,
        };
        dedup.should_accept("old", &gift, t0);
        ledger.apply_gift("old", "Old", 100, 1, t0);
        ledger.apply_gift("fresh", "Fresh", 100, 1, t0 + Duration::minutes(4));
        activity.record(ActivityRecord {
            user_id: "chatter".to_string(),
            display_name: "Chatter".to_string(),
            activity_type: ActivityType::Chat,
            occurred_at: t0,
        });

        let report = sweeper.sweep(
            &mut dedup,
            &mut ledger,
            &mut activity,
            t0 + Duration::minutes(6),
        );

        assert_eq!(
            report,
            SweepReport {
                dedup_keys: 1,
                dedup_uuids: 0,
                ledger_entries: 1,
                activity_records: 1,
            }
        );
        assert!(report.affects_ranking());
        assert_eq!(report.total(), 3);
        assert!(ledger.get("old").is_none());
        assert!(ledger.get("fresh").is_some());
        assert!(activity.is_empty());
    }

    #[test]
    fn test_empty_sweep() {
        let sweeper = RetentionSweeper::default();
        let report = sweeper.sweep(
            &mut GiftDeduplicator::default(),
            &mut AccumulationLedger::new(),
            &mut ActivityLog::default(),
            Utc::now(),
        );
        assert_eq!(report, SweepReport::default());
        assert!(!report.affects_ranking());
    }

    #[test]
    fn test_report_accumulates() {
        let mut total = SweepReport::default();
        total += SweepReport {
            dedup_keys: 1,
            ledger_entries: 2,
            ..SweepReport::default()
        };
        total += SweepReport {
            activity_records: 3,
            ..SweepReport::default()
        };
        assert_eq!(total.total(), 6);
    }

    #[tokio::test]
    async fn test_interval_first_tick_is_delayed() {
        let sweeper = RetentionSweeper::new(RetentionConfig {
            stale_after_secs: 300,
            sweep_interval_secs: 60,
        });
        let mut interval = sweeper.interval();
        let ticked =
            tokio::time::timeout(std::time::Duration::from_millis(50), interval.tick()).await;
        assert!(ticked.is_err());
    }
}
