//! 生イベントを `CanonicalEvent` へ正規化する
//!
//! 必須フィールドが欠けたイベントは `RelayError::MalformedEvent` として拒否する（fail closed）。
//! Like/Member はユーザーIDが付かないことがあるため、表示名とイベント種別から決定的に合成する。

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::error::{RelayError, RelayResult};
use crate::models::{CanonicalEvent, EventKind, GiftDetails, Inbound, RawEvent, RawPayload};

/// 生イベントを正規化
pub fn normalize(raw: RawEvent, now: DateTime<Utc>) -> RelayResult<Inbound> {
    let RawEvent { event, payload } = raw;

    match event.as_str() {
        "error" => Ok(Inbound::UpstreamError {
            message: payload
                .error
                .or(payload.message)
                .unwrap_or_else(|| "unknown upstream error".to_string()),
        }),
        "streamEnd" | "stream-end" => Ok(Inbound::Event(CanonicalEvent {
            display_name: display_name(&payload).unwrap_or_default(),
            user_id: String::new(),
            occurred_at: occurred_at(&payload, now),
            kind: EventKind::StreamEnd,
        })),
        "chat" => {
            let display_name = require_display_name(&payload, "chat")?;
            let user_id = require_id(payload.user_id.as_ref(), "userId", "chat")?;
            Ok(Inbound::Event(CanonicalEvent {
                display_name,
                user_id,
                occurred_at: occurred_at(&payload, now),
                kind: EventKind::Chat {
                    message: payload.message.clone().unwrap_or_default(),
                },
            }))
        }
        "gift" => {
            let display_name = require_display_name(&payload, "gift")?;
            let user_id = require_id(payload.user_id.as_ref(), "userId", "gift")?;
            let gift_id = require_id(payload.gift_id.as_ref(), "giftId", "gift")?;
            let gift_name = payload
                .gift_name
                .as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .ok_or_else(|| RelayError::malformed("giftName", "gift"))?;
            let unit_value = coerce_count(payload.unit_value.as_ref(), "unitValue", "gift")?
                .unwrap_or(0);
            let repeat_count = coerce_count(payload.repeat_count.as_ref(), "repeatCount", "gift")?
                .map(|n| u32::try_from(n).unwrap_or(u32::MAX))
                .filter(|n| *n > 0)
                .unwrap_or(1);

            Ok(Inbound::Event(CanonicalEvent {
                display_name,
                user_id,
                occurred_at: occurred_at(&payload, now),
                kind: EventKind::Gift(GiftDetails {
                    gift_id,
                    gift_name,
                    unit_value,
                    repeat_count,
                    event_uuid: payload.event_uuid.clone().filter(|u| !u.is_empty()),
                }),
            }))
        }
        "like" => {
            let display_name = require_display_name(&payload, "like")?;
            let user_id = coerce_id(payload.user_id.as_ref())
                .unwrap_or_else(|| synthesize_user_id("like", &display_name));
            let like_count =
                coerce_count(payload.like_count.as_ref(), "likeCount", "like")?.unwrap_or(1);
            Ok(Inbound::Event(CanonicalEvent {
                display_name,
                user_id,
                occurred_at: occurred_at(&payload, now),
                kind: EventKind::Like { like_count },
            }))
        }
        "member" => {
            let display_name = require_display_name(&payload, "member")?;
            let user_id = coerce_id(payload.user_id.as_ref())
                .unwrap_or_else(|| synthesize_user_id("member", &display_name));
            let member_type = coerce_id(payload.member_type.as_ref()).unwrap_or_default();
            Ok(Inbound::Event(CanonicalEvent {
                display_name,
                user_id,
                occurred_at: occurred_at(&payload, now),
                kind: EventKind::Member { member_type },
            }))
        }
        other => Err(RelayError::UnknownEvent {
            event: other.to_string(),
        }),
    }
}

/// Like/Member用のユーザーID合成
///
/// タイムスタンプを含めないため、同じユーザーの連続Likeは同一参加者にまとまる。
pub fn synthesize_user_id(kind: &str, display_name: &str) -> String {
    format!("{}:{}", kind, display_name)
}

fn display_name(payload: &RawPayload) -> Option<String> {
    payload
        .display_name
        .as_deref()
        .or(payload.unique_id.as_deref())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn require_display_name(payload: &RawPayload, event: &str) -> RelayResult<String> {
    display_name(payload).ok_or_else(|| RelayError::malformed("displayName", event))
}

fn require_id(value: Option<&Value>, field: &str, event: &str) -> RelayResult<String> {
    coerce_id(value).ok_or_else(|| RelayError::malformed(field, event))
}

/// 文字列または数値を識別子文字列へ変換
fn coerce_id(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) => {
            let trimmed = s.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// 非負整数へ変換。負数や数値以外は不正扱い
fn coerce_count(value: Option<&Value>, field: &str, event: &str) -> RelayResult<Option<u64>> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n
            .as_u64()
            .map(Some)
            .ok_or_else(|| RelayError::malformed(field, event)),
        Some(Value::String(s)) => s
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|_| RelayError::malformed(field, event)),
        Some(_) => Err(RelayError::malformed(field, event)),
    }
}

fn occurred_at(payload: &RawPayload, now: DateTime<Utc>) -> DateTime<Utc> {
    payload
        .timestamp
        .and_then(DateTime::from_timestamp_millis)
        .unwrap_or(now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw(value: serde_json::Value) -> RawEvent {
        serde_json::from_value(value).unwrap()
    }

    fn event(inbound: Inbound) -> CanonicalEvent {
        match inbound {
            Inbound::Event(e) => e,
            other => panic!("expected event, got {:?}", other),
        }
    }

    #[test]
    fn test_gift_normalization() {
        let now = Utc::now();
        let e = event(
            normalize(
                raw(json!({
                    "event": "gift",
                    "nickname": "Alice",
                    "userId": 42,
                    "giftId": 5655,
                    "giftName": "Rose",
                    "diamondCount": 1,
                    "repeatCount": 50
                })),
                now,
            )
            .unwrap(),
        );

        assert_eq!(e.display_name, "Alice");
        assert_eq!(e.user_id, "42");
        assert_eq!(e.occurred_at, now);
        match e.kind {
            EventKind::Gift(gift) => {
                assert_eq!(gift.gift_id, "5655");
                assert_eq!(gift.unit_value, 1);
                assert_eq!(gift.repeat_count, 50);
                assert_eq!(gift.total_value(), 50);
            }
            other => panic!("expected gift, got {:?}", other),
        }
    }

    #[test]
    fn test_repeat_count_defaults_to_one() {
        let now = Utc::now();
        for repeat in [json!(null), json!(0)] {
            let e = event(
                normalize(
                    raw(json!({
                        "event": "gift",
                        "nickname": "Alice",
                        "userId": "u1",
                        "giftId": "g1",
                        "giftName": "Rose",
                        "diamondCount": 5,
                        "repeatCount": repeat
                    })),
                    now,
                )
                .unwrap(),
            );
            match e.kind {
                EventKind::Gift(gift) => assert_eq!(gift.repeat_count, 1),
                other => panic!("expected gift, got {:?}", other),
            }
        }
    }

    #[test]
    fn test_missing_fields_fail_closed() {
        let now = Utc::now();

        let err = normalize(raw(json!({"event": "chat", "userId": "u1"})), now).unwrap_err();
        assert!(
            matches!(err, RelayError::MalformedEvent { ref field, .. } if field == "displayName")
        );

        let err = normalize(raw(json!({"event": "chat", "nickname": "A"})), now).unwrap_err();
        assert!(
            matches!(err, RelayError::MalformedEvent { ref field, .. } if field == "userId")
        );

        let err = normalize(
            raw(json!({"event": "gift", "nickname": "A", "userId": "u1", "giftName": "Rose"})),
            now,
        )
        .unwrap_err();
        assert!(
            matches!(err, RelayError::MalformedEvent { ref field, .. } if field == "giftId")
        );

        let err = normalize(raw(json!({"event": "like", "nickname": "   "})), now).unwrap_err();
        assert!(matches!(err, RelayError::MalformedEvent { .. }));
    }

    #[test]
    fn test_negative_value_rejected() {
        let err = normalize(
            raw(json!({
                "event": "gift",
                "nickname": "A",
                "userId": "u1",
                "giftId": "g1",
                "giftName": "Rose",
                "diamondCount": -5
            })),
            Utc::now(),
        )
        .unwrap_err();
        assert!(
            matches!(err, RelayError::MalformedEvent { ref field, .. } if field == "unitValue")
        );
    }

    #[test]
    fn test_like_and_member_ids_are_synthesized_deterministically() {
        let first = event(
            normalize(raw(json!({"event": "like", "nickname": "Bob", "likeCount": 3})), Utc::now())
                .unwrap(),
        );
        let second = event(
            normalize(
                raw(json!({"event": "like", "nickname": "Bob", "timestamp": 1_700_000_000_000i64})),
                Utc::now(),
            )
            .unwrap(),
        );
        assert_eq!(first.user_id, "like:Bob");
        assert_eq!(first.user_id, second.user_id);
        assert_eq!(first.kind, EventKind::Like { like_count: 3 });
        assert_eq!(second.kind, EventKind::Like { like_count: 1 });

        let member = event(
            normalize(
                raw(json!({"event": "member", "nickname": "Bob", "memberType": 1})),
                Utc::now(),
            )
            .unwrap(),
        );
        assert_eq!(member.user_id, "member:Bob");
        assert_eq!(
            member.kind,
            EventKind::Member {
                member_type: "1".to_string()
            }
        );
    }

    #[test]
    fn test_provided_like_user_id_is_kept() {
        let e = event(
            normalize(raw(json!({"event": "like", "nickname": "Bob", "userId": "u9"})), Utc::now())
                .unwrap(),
        );
        assert_eq!(e.user_id, "u9");
    }

    #[test]
    fn test_payload_timestamp_is_used() {
        let e = event(
            normalize(
                raw(json!({
                    "event": "chat",
                    "nickname": "A",
                    "userId": "u1",
                    "comment": "hi",
                    "timestamp": 1_700_000_000_000i64
                })),
                Utc::now(),
            )
            .unwrap(),
        );
        assert_eq!(e.occurred_at.timestamp_millis(), 1_700_000_000_000);
        assert_eq!(
            e.kind,
            EventKind::Chat {
                message: "hi".to_string()
            }
        );
    }

    #[test]
    fn test_error_and_stream_end() {
        let now = Utc::now();
        let err = normalize(raw(json!({"event": "error", "error": "socket closed"})), now).unwrap();
        assert_eq!(
            err,
            Inbound::UpstreamError {
                message: "socket closed".to_string()
            }
        );

        let end = event(normalize(raw(json!({"event": "streamEnd"})), now).unwrap());
        assert_eq!(end.kind, EventKind::StreamEnd);
    }

    #[test]
    fn test_unknown_event() {
        let err =
            normalize(raw(json!({"event": "share", "nickname": "A"})), Utc::now()).unwrap_err();
        assert!(matches!(err, RelayError::UnknownEvent { .. }));
    }
}
