use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// ユーザーごとの累計エントリ
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LedgerEntry {
    /// ユーザーID
    pub user_id: String,
    /// 表示名（最新のものに更新される）
    pub display_name: String,
    /// 累計ダイヤ数（削除以外で減少しない）
    pub total_value: u64,
    /// 受理したギフト件数
    pub gift_count: u64,
    /// 最終アクティビティ時刻
    pub last_activity_at: DateTime<Utc>,
}

/// `apply_gift` の結果
#[derive(Debug, Clone, PartialEq)]
pub struct GiftApplied {
    /// 更新後のエントリ
    pub entry: LedgerEntry,
    /// 今回加算した値
    pub gift_total: u64,
    /// 前回のアクティビティからの経過ミリ秒（初回は0）
    pub time_since_last_gift_ms: i64,
}

/// 累計台帳
///
/// 重複排除は行わない。同じギフトを2回適用すれば2回加算される。
#[derive(Debug, Clone, Default)]
pub struct AccumulationLedger {
    entries: HashMap<String, LedgerEntry>,
}

impl AccumulationLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// ギフトを加算
    pub fn apply_gift(
        &mut self,
        user_id: &str,
        display_name: &str,
        unit_value: u64,
        repeat_count: u32,
        now: DateTime<Utc>,
    ) -> GiftApplied {
        let gift_total = unit_value.saturating_mul(u64::from(repeat_count.max(1)));

        if let Some(entry) = self.entries.get_mut(user_id) {
            let since_last = (now - entry.last_activity_at).num_milliseconds().max(0);

            entry.total_value = entry.total_value.saturating_add(gift_total);
            entry.gift_count += 1;
            entry.last_activity_at = now;
            if !display_name.is_empty() {
                entry.display_name = display_name.to_string();
            }

            GiftApplied {
                entry: entry.clone(),
                gift_total,
                time_since_last_gift_ms: since_last,
            }
        } else {
            let entry = LedgerEntry {
                user_id: user_id.to_string(),
                display_name: display_name.to_string(),
                total_value: gift_total,
                gift_count: 1,
                last_activity_at: now,
            };
            self.entries.insert(user_id.to_string(), entry.clone());

            GiftApplied {
                entry,
                gift_total,
                time_since_last_gift_ms: 0,
            }
        }
    }

    /// チャット・Likeによる最終アクティビティ更新（既存エントリのみ）
    pub fn touch(&mut self, user_id: &str, now: DateTime<Utc>) -> bool {
        match self.entries.get_mut(user_id) {
            Some(entry) => {
                if now > entry.last_activity_at {
                    entry.last_activity_at = now;
                }
                true
            }
            None => false,
        }
    }

    /// `cutoff` より古いエントリを削除し、削除件数を返す
    pub fn remove_stale(&mut self, cutoff: DateTime<Utc>) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.last_activity_at >= cutoff);
        before - self.entries.len()
    }

    pub fn get(&self, user_id: &str) -> Option<&LedgerEntry> {
        self.entries.get(user_id)
    }

    pub fn entries(&self) -> impl Iterator<Item = &LedgerEntry> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
