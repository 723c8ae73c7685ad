//! NDJSON (Newline Delimited JSON) line processing utilities.
//!
//! Recorded event streams carry one raw event per line, either bare or wrapped
//! in a [`TimestampedEntry`] by recorders that capture arrival time.

use serde::{Deserialize, Serialize};

use crate::error::{RelayError, RelayResult};
use crate::models::RawEvent;

/// Generic entry in an NDJSON file with timestamp and data.
///
/// Recorders that capture arrival time wrap each event this way.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimestampedEntry<T> {
    /// Unix timestamp (milliseconds) when the entry was received
    pub timestamp: i64,
    /// The actual data payload
    pub data: T,
}

impl TimestampedEntry<RawEvent> {
    /// Unwrap the event, falling back to the recorded arrival time when the
    /// payload has no timestamp of its own.
    pub fn into_event(self) -> RawEvent {
        let mut event = self.data;
        event.payload.timestamp.get_or_insert(self.timestamp);
        event
    }
}

/// One line of a recorded stream
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RecordedLine {
    Timestamped(TimestampedEntry<RawEvent>),
    Bare(RawEvent),
}

/// Parse a single NDJSON line.
///
/// Blank lines yield `Ok(None)`. `line_number` is 1-based and only used for
/// error reporting.
pub fn parse_event_line(line: &str, line_number: usize) -> RelayResult<Option<RawEvent>> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }

    let recorded: RecordedLine =
        serde_json::from_str(trimmed).map_err(|source| RelayError::Json {
            line: line_number,
            source,
        })?;

    let event = match recorded {
        RecordedLine::Timestamped(entry) => entry.into_event(),
        RecordedLine::Bare(event) => event,
    };

    if event.event.trim().is_empty() {
        return Err(RelayError::malformed("event", "recorded"));
    }

    Ok(Some(event))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_event_line() {
        assert!(parse_event_line("   ", 1).unwrap().is_none());
        let event = parse_event_line(r#"{"event":"member","nickname":"Dan"}"#, 2)
            .unwrap()
            .unwrap();
        assert_eq!(event.event, "member");
        assert_eq!(event.payload.timestamp, None);
    }

    #[test]
    fn test_json_error_reports_line() {
        match parse_event_line("{", 7) {
            Err(err @ RelayError::Json { line: 7, .. }) => {
                assert!(err.to_string().contains("line 7"));
            }
            other => panic!("expected JSON error on line 7, got {:?}", other),
        }
        assert!(matches!(
            parse_event_line(r#"{"comment":"no event name"}"#, 2),
            Err(RelayError::Json { line: 2, .. })
        ));
    }

    #[test]
    fn test_blank_event_name_rejected() {
        assert!(matches!(
            parse_event_line(r#"{"event":" "}"#, 1),
            Err(RelayError::MalformedEvent { .. })
        ));
    }

    #[test]
    fn test_timestamped_entry_supplies_missing_timestamp() {
        let event = parse_event_line(
            r#"{"timestamp":1700000000000,"data":{"event":"like","nickname":"Bob","likeCount":3}}"#,
            1,
        )
        .unwrap()
        .unwrap();

        assert_eq!(event.event, "like");
        assert_eq!(event.payload.timestamp, Some(1_700_000_000_000));
    }

    #[test]
    fn test_payload_timestamp_wins_over_entry_timestamp() {
        let event = parse_event_line(
            r#"{"timestamp":1700000009999,"data":{"event":"chat","nickname":"A","timestamp":1700000000000}}"#,
            1,
        )
        .unwrap()
        .unwrap();

        assert_eq!(event.payload.timestamp, Some(1_700_000_000_000));
    }
}
