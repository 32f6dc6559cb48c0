//! Cross-field consistency checks on a typed payload.
//!
//! Runs after [`validate_message`](super::validate_message); rules here are
//! about fields agreeing with each other and with the clock, not about shape.

use chrono::{DateTime, Utc};
use serde_json::Value;

use super::schema::{check_range, is_truthy, AlertLevel, TypedPayload};
use super::PayloadError;

pub fn check_integrity(payload: &TypedPayload, now: DateTime<Utc>) -> Result<(), PayloadError> {
    match payload {
        TypedPayload::Notification {
            timestamp,
            expires_at,
            ..
        } => {
            if let Some(ts) = timestamp {
                match ts.as_str() {
                    Some(s) if is_utc_timestamp(s) => {}
                    _ => return Err(PayloadError::BadTimestamp("timestamp")),
                }
            }
            if let Some(expires) = expires_at {
                let expires = parse_instant(expires).ok_or(PayloadError::BadTimestamp("expiresAt"))?;
                if expires <= now {
                    return Err(PayloadError::Expired);
                }
            }
            Ok(())
        }
        TypedPayload::Alert { level, action, .. } => {
            if *level == AlertLevel::Critical && action.is_none() {
                return Err(PayloadError::MissingAction);
            }
            Ok(())
        }
        TypedPayload::Update | TypedPayload::Command { .. } => Ok(()),
        TypedPayload::Call {
            room_number,
            priority,
            ..
        } => {
            if let Some(number) = room_number {
                if !is_numeric(number) {
                    return Err(PayloadError::WrongType {
                        field: "roomNumber",
                        expected: "numeric",
                    });
                }
            }
            if let Some(priority) = priority {
                match priority.as_str() {
                    Some("low" | "normal" | "high" | "emergency") => {}
                    _ => {
                        return Err(PayloadError::NotAllowed {
                            field: "priority",
                            value: priority.to_string().chars().take(50).collect(),
                        })
                    }
                }
            }
            Ok(())
        }
        TypedPayload::Config { settings } => {
            for (key, value) in settings {
                match key.as_str() {
                    "volume" | "brightness" | "timeout" => check_range(key, value, 0.0, 100.0)?,
                    "theme" => match value.as_str() {
                        Some("light" | "dark" | "auto" | "custom") => {}
                        _ => {
                            return Err(PayloadError::NotAllowed {
                                field: "theme",
                                value: value.to_string().chars().take(50).collect(),
                            })
                        }
                    },
                    _ => {}
                }
            }
            Ok(())
        }
    }
}

/// `YYYY-MM-DDTHH:MM:SS` with optional `.mmm`, terminated by `Z`.
fn is_utc_timestamp(s: &str) -> bool {
    let bytes = s.as_bytes();
    let digits = |range: std::ops::Range<usize>| bytes[range].iter().all(u8::is_ascii_digit);

    let base_ok = bytes.len() >= 20
        && digits(0..4)
        && bytes[4] == b'-'
        && digits(5..7)
        && bytes[7] == b'-'
        && digits(8..10)
        && bytes[10] == b'T'
        && digits(11..13)
        && bytes[13] == b':'
        && digits(14..16)
        && bytes[16] == b':'
        && digits(17..19);
    if !base_ok {
        return false;
    }

    match bytes.len() {
        20 => bytes[19] == b'Z',
        24 => digits(20..23) && bytes[23] == b'Z',
        _ => false,
    }
}

/// RFC 3339 strings or epoch milliseconds.
fn parse_instant(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .and_then(DateTime::from_timestamp_millis),
        _ => None,
    }
}

fn is_numeric(value: &Value) -> bool {
    match value {
        Value::Number(_) | Value::Bool(_) => true,
        Value::String(s) => s.trim().is_empty() || s.trim().parse::<f64>().is_ok(),
        _ => !is_truthy(value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    fn notification(timestamp: Option<Value>, expires_at: Option<Value>) -> TypedPayload {
        TypedPayload::Notification {
            title: "t".to_string(),
            body: None,
            timestamp,
            expires_at,
        }
    }

    #[test]
    fn expiration_must_be_in_the_future() {
        let now = Utc::now();
        let future = (now + Duration::minutes(5)).to_rfc3339();
        let past = (now - Duration::minutes(5)).to_rfc3339();

        assert!(check_integrity(&notification(None, Some(json!(future))), now).is_ok());
        assert_eq!(
            check_integrity(&notification(None, Some(json!(past))), now),
            Err(PayloadError::Expired)
        );
        assert_eq!(
            check_integrity(&notification(None, Some(json!(now.to_rfc3339()))), now),
            Err(PayloadError::Expired)
        );
        assert_eq!(
            check_integrity(&notification(None, Some(json!("soon"))), now),
            Err(PayloadError::BadTimestamp("expiresAt"))
        );

        let millis = (now + Duration::minutes(1)).timestamp_millis();
        assert!(check_integrity(&notification(None, Some(json!(millis))), now).is_ok());
    }

    #[test]
    fn timestamp_format() {
        let now = Utc::now();
        for good in ["2024-05-01T10:00:00Z", "2024-05-01T10:00:00.123Z"] {
            assert!(check_integrity(&notification(Some(json!(good)), None), now).is_ok(), "{}", good);
        }
        for bad in ["2024-05-01 10:00:00", "2024-05-01T10:00:00+01:00", "yesterday"] {
            assert!(check_integrity(&notification(Some(json!(bad)), None), now).is_err(), "{}", bad);
        }
        assert!(check_integrity(&notification(Some(json!(12)), None), now).is_err());
    }

    #[test]
    fn critical_alert_needs_action() {
        let now = Utc::now();
        let alert = |level, action| TypedPayload::Alert {
            level,
            message: "m".to_string(),
            action,
        };

        assert!(check_integrity(&alert(AlertLevel::Warning, None), now).is_ok());
        assert_eq!(
            check_integrity(&alert(AlertLevel::Critical, None), now),
            Err(PayloadError::MissingAction)
        );
        assert!(check_integrity(&alert(AlertLevel::Critical, Some(json!("evacuate"))), now).is_ok());
    }

    #[test]
    fn call_room_number_and_priority() {
        let now = Utc::now();
        let call = |room_number, priority| TypedPayload::Call {
            room: "r".to_string(),
            name: "n".to_string(),
            room_number,
            priority,
        };

        assert!(check_integrity(&call(Some(json!("12")), Some(json!("high"))), now).is_ok());
        assert!(check_integrity(&call(Some(json!(7)), None), now).is_ok());
        assert!(check_integrity(&call(Some(json!("B12")), None), now).is_err());
        assert!(check_integrity(&call(None, Some(json!("urgent"))), now).is_err());
    }

    #[test]
    fn config_numeric_settings_capped_at_hundred() {
        let now = Utc::now();
        let config = |settings: Value| TypedPayload::Config {
            settings: settings.as_object().unwrap().clone(),
        };

        assert!(check_integrity(&config(json!({ "volume": 100, "theme": "auto" })), now).is_ok());
        assert!(check_integrity(&config(json!({ "timeout": 120 })), now).is_err());
        assert!(check_integrity(&config(json!({ "theme": "neon" })), now).is_err());
    }
}
