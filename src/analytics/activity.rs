use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// アクティビティ種別
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ActivityType {
    Chat,
    Like,
}

/// 最近のチャット・Like 1件
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActivityRecord {
    pub user_id: String,
    pub display_name: String,
    pub activity_type: ActivityType,
    pub occurred_at: DateTime<Utc>,
}

/// 上限付きのアクティビティログ
///
/// 内部では新しいものを先頭に保持する。Likeは1件ごとに別の行になる。
#[derive(Debug, Clone)]
pub struct ActivityLog {
    capacity: usize,
    records: VecDeque<ActivityRecord>,
}

impl Default for ActivityLog {
    fn default() -> Self {
        Self::new(100)
    }
}

impl ActivityLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            records: VecDeque::new(),
        }
    }

    /// 記録を追加し、上限を超えた古い記録を捨てる
    pub fn record(&mut self, record: ActivityRecord) {
        self.records.push_front(record);
        self.records.truncate(self.capacity);
    }

    /// 新しい順
    pub fn recent(&self) -> impl Iterator<Item = &ActivityRecord> {
        self.records.iter()
    }

    /// `cutoff` より古い記録を削除し、削除件数を返す
    pub fn remove_older_than(&mut self, cutoff: DateTime<Utc>) -> usize {
        let before = self.records.len();
        self.records.retain(|r| r.occurred_at >= cutoff);
        before - self.records.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }
}
