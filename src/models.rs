use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::analytics::tiers::TierAssignment;

/// ライブ配信クライアントから届く生イベント
///
/// `event` はコールバック名（`chat`, `gift`, `like`, `member`, `error`, `streamEnd`）。
/// ペイロードは型が緩いため、検証と変換は normalizer が行う。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct RawEvent {
    pub event: String,
    #[serde(flatten)]
    pub payload: RawPayload,
}

/// 生イベントのペイロード（全フィールド任意）
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct RawPayload {
    #[serde(default, alias = "nickname", skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unique_id: Option<String>,
    /// 文字列・数値のどちらでも届く
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gift_id: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gift_name: Option<String>,
    #[serde(default, alias = "diamondCount", skip_serializing_if = "Option::is_none")]
    pub unit_value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repeat_count: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub like_count: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub member_type: Option<Value>,
    #[serde(default, alias = "comment", skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, alias = "uuid", skip_serializing_if = "Option::is_none")]
    pub event_uuid: Option<String>,
    /// Unixミリ秒
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RawEvent {
    pub fn new(event: impl Into<String>, payload: RawPayload) -> Self {
        Self {
            event: event.into(),
            payload,
        }
    }
}

/// 正規化済みイベント
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CanonicalEvent {
    pub display_name: String,
    /// Like/Memberでは表示名から合成される場合がある
    pub user_id: String,
    pub occurred_at: DateTime<Utc>,
    pub kind: EventKind,
}

/// イベント種別
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum EventKind {
    Chat { message: String },
    Like { like_count: u64 },
    Gift(GiftDetails),
    Member { member_type: String },
    StreamEnd,
}

/// ギフト固有の情報
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct GiftDetails {
    pub gift_id: String,
    pub gift_name: String,
    /// 1個あたりのダイヤ数
    pub unit_value: u64,
    /// 常に1以上
    pub repeat_count: u32,
    pub event_uuid: Option<String>,
}

impl GiftDetails {
    /// `unit_value × max(1, repeat_count)`
    pub fn total_value(&self) -> u64 {
        self.unit_value
            .saturating_mul(u64::from(self.repeat_count.max(1)))
    }
}

/// normalizerの出力
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Event(CanonicalEvent),
    /// 上流クライアントが報告したエラー
    UpstreamError { message: String },
}

/// 購読者へ配信するメッセージ
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum OutboundMessage {
    ChatBroadcast {
        username: String,
        user_id: String,
        message: String,
    },
    GiftBroadcast {
        username: String,
        user_id: String,
        gift_id: String,
        gift_name: String,
        diamonds: u64,
        repeat_count: u32,
        /// このユーザーの累計ダイヤ数
        total_value: u64,
        timestamp: i64,
        uuid: String,
        time_since_last_gift_ms: i64,
    },
    LikeBroadcast {
        username: String,
        likes: u64,
    },
    MemberBroadcast {
        username: String,
        member_type: String,
    },
    TierUpdate(TierAssignment),
    StreamEnd {
        session: String,
    },
    RelayError {
        message: String,
    },
}

impl OutboundMessage {
    /// ワイヤー上のイベント名
    pub fn event_name(&self) -> &'static str {
        match self {
            OutboundMessage::ChatBroadcast { .. } => "chat-broadcast",
            OutboundMessage::GiftBroadcast { .. } => "gift-broadcast",
            OutboundMessage::LikeBroadcast { .. } => "like-broadcast",
            OutboundMessage::MemberBroadcast { .. } => "member-broadcast",
            OutboundMessage::TierUpdate(_) => "tier-update",
            OutboundMessage::StreamEnd { .. } => "stream-end",
            OutboundMessage::RelayError { .. } => "relay-error",
        }
    }
}
