//! Telemetry codec for detection payloads published by the trackside device.
//!
//! Payloads are JSON objects with `state`, `rounds`, `relay` and
//! `timestamp`. Decoding validates each field individually so a rejected
//! message names the field at fault.

use chrono::{DateTime, NaiveDateTime};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::models::DetectionEvent;

const FIELD_STATE: &str = "state";
const FIELD_ROUNDS: &str = "rounds";
const FIELD_RELAY: &str = "relay";
const FIELD_TIMESTAMP: &str = "timestamp";

/// Reasons a payload cannot be turned into a [`DetectionEvent`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("malformed payload: {0}")]
    MalformedPayload(String),
    /// A required field is absent or has the wrong shape.
    #[error("missing or invalid field '{0}'")]
    MissingField(&'static str),
}

/// Decode a raw message body into an unsaved detection event.
pub fn decode(raw: &[u8]) -> Result<DetectionEvent, DecodeError> {
    let value: Value = serde_json::from_slice(raw)
        .map_err(|e| DecodeError::MalformedPayload(e.to_string()))?;

    let Value::Object(fields) = value else {
        return Err(DecodeError::MalformedPayload(
            "expected a JSON object".to_string(),
        ));
    };

    let state = field_str(&fields, FIELD_STATE)?;
    if state.trim().is_empty() {
        return Err(DecodeError::MissingField(FIELD_STATE));
    }

    let rounds = fields
        .get(FIELD_ROUNDS)
        .and_then(Value::as_u64)
        .and_then(|n| i32::try_from(n).ok())
        .and_then(|n| u32::try_from(n).ok())
        .ok_or(DecodeError::MissingField(FIELD_ROUNDS))?;

    let relay = field_str(&fields, FIELD_RELAY)?;

    let observed_at = parse_timestamp(field_str(&fields, FIELD_TIMESTAMP)?)
        .ok_or(DecodeError::MissingField(FIELD_TIMESTAMP))?;

    Ok(DetectionEvent::new(state, rounds, relay, observed_at))
}

/// Encode an event into the payload shape accepted by [`decode`].
pub fn encode(event: &DetectionEvent) -> Vec<u8> {
    let payload = serde_json::json!({
        FIELD_STATE: event.state,
        FIELD_ROUNDS: event.rounds,
        FIELD_RELAY: event.relay,
        FIELD_TIMESTAMP: event.observed_at.format("%Y-%m-%dT%H:%M:%S%.f").to_string(),
    });
    payload.to_string().into_bytes()
}

fn field_str<'a>(fields: &'a Map<String, Value>, name: &'static str) -> Result<&'a str, DecodeError> {
    fields
        .get(name)
        .and_then(Value::as_str)
        .ok_or(DecodeError::MissingField(name))
}

/// Device clocks send local time; an offset, when present, is dropped.
fn parse_timestamp(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    raw.parse::<NaiveDateTime>()
        .ok()
        .or_else(|| NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f").ok())
        .or_else(|| NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M").ok())
        .or_else(|| NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M").ok())
        .or_else(|| {
            DateTime::parse_from_rfc3339(raw)
                .ok()
                .map(|dt| dt.naive_local())
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use serde_json::json;

    fn sample() -> DetectionEvent {
        let observed = NaiveDate::from_ymd_opt(2024, 3, 9)
            .unwrap()
            .and_hms_milli_opt(17, 5, 42, 250)
            .unwrap();
        DetectionEvent::new("approaching", 12, "activated", observed)
    }

    fn payload_without(field: &str) -> Vec<u8> {
        let mut value = json!({
            "state": "clear",
            "rounds": 4,
            "relay": "not_activated",
            "timestamp": "2024-03-09T17:05:42"
        });
        value.as_object_mut().unwrap().remove(field);
        value.to_string().into_bytes()
    }

    #[test]
    fn encode_then_decode_preserves_event() {
        let event = sample();
        assert_eq!(decode(&encode(&event)).unwrap(), event);
    }

    #[test]
    fn each_missing_field_is_named() {
        for field in [FIELD_STATE, FIELD_ROUNDS, FIELD_RELAY, FIELD_TIMESTAMP] {
            assert_eq!(
                decode(&payload_without(field)),
                Err(DecodeError::MissingField(field)),
                "dropping {field}"
            );
        }
    }

    #[test]
    fn wrong_shapes_count_as_missing() {
        let cases = [
            (json!({"state": "", "rounds": 1, "relay": "activated", "timestamp": "2024-03-09T17:05:42"}), FIELD_STATE),
            (json!({"state": "clear", "rounds": -1, "relay": "activated", "timestamp": "2024-03-09T17:05:42"}), FIELD_ROUNDS),
            (json!({"state": "clear", "rounds": 1.5, "relay": "activated", "timestamp": "2024-03-09T17:05:42"}), FIELD_ROUNDS),
            (json!({"state": "clear", "rounds": 1, "relay": 3, "timestamp": "2024-03-09T17:05:42"}), FIELD_RELAY),
            (json!({"state": "clear", "rounds": 1, "relay": "activated", "timestamp": "yesterday"}), FIELD_TIMESTAMP),
        ];

        for (payload, field) in cases {
            assert_eq!(
                decode(payload.to_string().as_bytes()),
                Err(DecodeError::MissingField(field))
            );
        }
    }

    #[test]
    fn rounds_beyond_storable_range_are_rejected() {
        for rounds in [2_147_483_648u64, 3_000_000_000] {
            let payload = json!({
                "state": "clear",
                "rounds": rounds,
                "relay": "activated",
                "timestamp": "2024-03-09T17:05:42"
            });
            assert_eq!(
                decode(payload.to_string().as_bytes()),
                Err(DecodeError::MissingField(FIELD_ROUNDS))
            );
        }

        let payload = json!({
            "state": "clear",
            "rounds": i32::MAX,
            "relay": "activated",
            "timestamp": "2024-03-09T17:05:42"
        });
        assert_eq!(
            decode(payload.to_string().as_bytes()).unwrap().rounds,
            i32::MAX as u32
        );
    }

    #[test]
    fn minute_precision_timestamps_are_accepted() {
        for raw in ["2024-03-09T17:05", "2024-03-09 17:05"] {
            let payload = json!({
                "state": "clear",
                "rounds": 1,
                "relay": "activated",
                "timestamp": raw
            });
            let event = decode(payload.to_string().as_bytes()).unwrap();
            assert_eq!(event.observed_at.to_string(), "2024-03-09 17:05:00", "parsing {raw}");
        }
    }

    #[test]
    fn non_object_payloads_are_malformed() {
        assert!(matches!(decode(b"not json"), Err(DecodeError::MalformedPayload(_))));
        assert!(matches!(decode(b"[1,2,3]"), Err(DecodeError::MalformedPayload(_))));
        assert!(matches!(decode(&[0xff, 0xfe]), Err(DecodeError::MalformedPayload(_))));
    }

    #[test]
    fn offset_timestamps_keep_local_wall_clock() {
        let payload = json!({
            "state": "clear",
            "rounds": 2,
            "relay": "activated",
            "timestamp": "2024-03-09T17:05:42+02:00"
        });

        let event = decode(payload.to_string().as_bytes()).unwrap();
        assert_eq!(event.observed_at.to_string(), "2024-03-09 17:05:42");
        assert!(event.id.is_none());
        assert!(event.recorded_at.is_none());
    }
}
