//! Shape checks for `register` and `send` data.
//!
//! Both entry points take already-sanitized JSON. String lengths are counted
//! in characters. Empty strings count as missing.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::PayloadError;

pub const MAX_CLIENT_ID_CHARS: usize = 50;
pub const MAX_CLIENT_TYPE_CHARS: usize = 20;
pub const MAX_TARGETS: usize = 20;

/// Kind of endpoint a connection registers as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientKind {
    Tv,
    Panel,
    Admin,
}

impl ClientKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClientKind::Tv => "tv",
            ClientKind::Panel => "panel",
            ClientKind::Admin => "admin",
        }
    }
}

impl fmt::Display for ClientKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ClientKind {
    type Err = PayloadError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tv" => Ok(ClientKind::Tv),
            "panel" => Ok(ClientKind::Panel),
            "admin" => Ok(ClientKind::Admin),
            other => Err(not_allowed("type", other)),
        }
    }
}

/// A validated `register` request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub kind: ClientKind,
    pub id: String,
}

pub fn validate_registration(data: &Value) -> Result<Registration, PayloadError> {
    let obj = data.as_object().ok_or(PayloadError::NotAnObject("registration"))?;

    let kind_str = required_str(obj, "type")?;
    let id = required_str(obj, "id")?;

    let kind = kind_str.parse::<ClientKind>()?;
    if kind_str.chars().count() > MAX_CLIENT_TYPE_CHARS {
        return Err(PayloadError::TooLong {
            field: "type",
            max: MAX_CLIENT_TYPE_CHARS,
        });
    }
    if id.chars().count() > MAX_CLIENT_ID_CHARS {
        return Err(PayloadError::TooLong {
            field: "id",
            max: MAX_CLIENT_ID_CHARS,
        });
    }

    Ok(Registration {
        kind,
        id: id.to_string(),
    })
}

/// Message kinds accepted by `send`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PayloadKind {
    Notification,
    Alert,
    Update,
    Call,
    Command,
    Config,
}

impl PayloadKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PayloadKind::Notification => "notification",
            PayloadKind::Alert => "alert",
            PayloadKind::Update => "update",
            PayloadKind::Call => "call",
            PayloadKind::Command => "command",
            PayloadKind::Config => "config",
        }
    }
}

impl FromStr for PayloadKind {
    type Err = PayloadError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "notification" => Ok(PayloadKind::Notification),
            "alert" => Ok(PayloadKind::Alert),
            "update" => Ok(PayloadKind::Update),
            "call" => Ok(PayloadKind::Call),
            "command" => Ok(PayloadKind::Command),
            "config" => Ok(PayloadKind::Config),
            other => Err(not_allowed("payload.type", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertLevel {
    Info,
    Warning,
    Error,
    Critical,
}

impl FromStr for AlertLevel {
    type Err = PayloadError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "info" => Ok(AlertLevel::Info),
            "warning" => Ok(AlertLevel::Warning),
            "error" => Ok(AlertLevel::Error),
            "critical" => Ok(AlertLevel::Critical),
            other => Err(not_allowed("level", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandAction {
    Refresh,
    Restart,
    Update,
    Clear,
}

impl FromStr for CommandAction {
    type Err = PayloadError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "refresh" => Ok(CommandAction::Refresh),
            "restart" => Ok(CommandAction::Restart),
            "update" => Ok(CommandAction::Update),
            "clear" => Ok(CommandAction::Clear),
            other => Err(not_allowed("action", other)),
        }
    }
}

/// Typed view of a message payload, one variant per kind.
#[derive(Debug, Clone, PartialEq)]
pub enum TypedPayload {
    Notification {
        title: String,
        body: Option<String>,
        timestamp: Option<Value>,
        expires_at: Option<Value>,
    },
    Alert {
        level: AlertLevel,
        message: String,
        action: Option<Value>,
    },
    Update,
    Call {
        room: String,
        name: String,
        room_number: Option<Value>,
        priority: Option<Value>,
    },
    Command {
        action: CommandAction,
    },
    Config {
        settings: Map<String, Value>,
    },
}

impl TypedPayload {
    pub fn kind(&self) -> PayloadKind {
        match self {
            TypedPayload::Notification { .. } => PayloadKind::Notification,
            TypedPayload::Alert { .. } => PayloadKind::Alert,
            TypedPayload::Update => PayloadKind::Update,
            TypedPayload::Call { .. } => PayloadKind::Call,
            TypedPayload::Command { .. } => PayloadKind::Command,
            TypedPayload::Config { .. } => PayloadKind::Config,
        }
    }
}

/// A validated `send` request.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    /// Target client ids in caller order.
    pub targets: Vec<String>,
    /// Sanitized payload, forwarded verbatim.
    pub payload: Value,
    pub typed: TypedPayload,
}

pub fn validate_message(data: &Value, max_payload_bytes: usize) -> Result<OutboundMessage, PayloadError> {
    let obj = data.as_object().ok_or(PayloadError::NotAnObject("message"))?;

    let targets = parse_targets(obj.get("target"))?;

    let payload = match obj.get("payload") {
        Some(value) if is_truthy(value) => value,
        _ => return Err(PayloadError::MissingField("payload")),
    };
    let fields = payload.as_object().ok_or(PayloadError::NotAnObject("payload"))?;

    let kind = required_str(fields, "type")?.parse::<PayloadKind>()?;
    let typed = parse_typed(kind, fields)?;

    let size = serde_json::to_vec(payload).map(|bytes| bytes.len()).unwrap_or(usize::MAX);
    if size > max_payload_bytes {
        return Err(PayloadError::TooLarge {
            size,
            limit: max_payload_bytes,
        });
    }

    Ok(OutboundMessage {
        targets,
        payload: payload.clone(),
        typed,
    })
}

fn parse_targets(target: Option<&Value>) -> Result<Vec<String>, PayloadError> {
    match target {
        Some(Value::Array(items)) => {
            if items.is_empty() || items.len() > MAX_TARGETS {
                return Err(PayloadError::TargetCount {
                    count: items.len(),
                    max: MAX_TARGETS,
                });
            }
            items
                .iter()
                .map(|item| match item {
                    Value::String(s) if s.chars().count() <= MAX_CLIENT_ID_CHARS => Ok(s.clone()),
                    Value::String(_) => Err(PayloadError::TooLong {
                        field: "target",
                        max: MAX_CLIENT_ID_CHARS,
                    }),
                    _ => Err(PayloadError::WrongType {
                        field: "target",
                        expected: "a list of strings",
                    }),
                })
                .collect()
        }
        Some(Value::String(s)) if !s.is_empty() => {
            if s.chars().count() > MAX_CLIENT_ID_CHARS {
                return Err(PayloadError::TooLong {
                    field: "target",
                    max: MAX_CLIENT_ID_CHARS,
                });
            }
            Ok(vec![s.clone()])
        }
        Some(value) if is_truthy(value) => Err(PayloadError::WrongType {
            field: "target",
            expected: "a string or a list of strings",
        }),
        _ => Err(PayloadError::MissingField("target")),
    }
}

fn parse_typed(kind: PayloadKind, fields: &Map<String, Value>) -> Result<TypedPayload, PayloadError> {
    match kind {
        PayloadKind::Notification => {
            let title = bounded_str(fields, "title", 100)?;
            let body = match fields.get("body") {
                Some(value) if is_truthy(value) => {
                    let body = value.as_str().ok_or(PayloadError::WrongType {
                        field: "body",
                        expected: "a string",
                    })?;
                    check_len("body", body, 500)?;
                    Some(body.to_string())
                }
                _ => None,
            };
            Ok(TypedPayload::Notification {
                title,
                body,
                timestamp: truthy_field(fields, "timestamp"),
                expires_at: truthy_field(fields, "expiresAt"),
            })
        }
        PayloadKind::Alert => {
            let level = required_str(fields, "level")?.parse::<AlertLevel>()?;
            let message = bounded_str(fields, "message", 200)?;
            Ok(TypedPayload::Alert {
                level,
                message,
                action: truthy_field(fields, "action"),
            })
        }
        PayloadKind::Update => Ok(TypedPayload::Update),
        PayloadKind::Call => Ok(TypedPayload::Call {
            room: bounded_str(fields, "room", 50)?,
            name: bounded_str(fields, "name", 100)?,
            room_number: truthy_field(fields, "roomNumber"),
            priority: truthy_field(fields, "priority"),
        }),
        PayloadKind::Command => {
            let action = required_str(fields, "action")?.parse::<CommandAction>()?;
            Ok(TypedPayload::Command { action })
        }
        PayloadKind::Config => {
            let settings = match fields.get("settings") {
                Some(Value::Object(settings)) => settings,
                Some(value) if is_truthy(value) => {
                    return Err(PayloadError::NotAnObject("settings"));
                }
                _ => return Err(PayloadError::MissingField("settings")),
            };
            for (key, value) in settings {
                check_setting(key, value)?;
            }
            Ok(TypedPayload::Config {
                settings: settings.clone(),
            })
        }
    }
}

fn check_setting(key: &str, value: &Value) -> Result<(), PayloadError> {
    match key {
        "volume" => check_range(key, value, 0.0, 100.0),
        "timeout" => check_range(key, value, 0.0, 3600.0),
        "theme" => match value.as_str() {
            Some("light" | "dark" | "auto") => Ok(()),
            _ => Err(not_allowed("theme", &value.to_string())),
        },
        "display" => {
            if value.is_object() {
                Ok(())
            } else {
                Err(PayloadError::NotAnObject("display"))
            }
        }
        other => Err(PayloadError::UnknownSetting(other.to_string())),
    }
}

pub(crate) fn check_range(key: &str, value: &Value, min: f64, max: f64) -> Result<(), PayloadError> {
    match value.as_f64() {
        Some(n) if n >= min && n <= max => Ok(()),
        _ => Err(PayloadError::OutOfRange {
            field: key.to_string(),
            min,
            max,
        }),
    }
}

/// JavaScript-style truthiness, which decides presence for optional fields.
pub(crate) fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0 && !f.is_nan()),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

fn truthy_field(fields: &Map<String, Value>, key: &str) -> Option<Value> {
    fields.get(key).filter(|value| is_truthy(value)).cloned()
}

fn required_str<'a>(fields: &'a Map<String, Value>, key: &'static str) -> Result<&'a str, PayloadError> {
    match fields.get(key) {
        Some(Value::String(s)) if !s.is_empty() => Ok(s),
        Some(value) if is_truthy(value) => Err(PayloadError::WrongType {
            field: key,
            expected: "a string",
        }),
        _ => Err(PayloadError::MissingField(key)),
    }
}

fn bounded_str(fields: &Map<String, Value>, key: &'static str, max: usize) -> Result<String, PayloadError> {
    let value = required_str(fields, key)?;
    check_len(key, value, max)?;
    Ok(value.to_string())
}

fn check_len(field: &'static str, value: &str, max: usize) -> Result<(), PayloadError> {
    if value.chars().count() > max {
        Err(PayloadError::TooLong { field, max })
    } else {
        Ok(())
    }
}

fn not_allowed(field: &'static str, value: &str) -> PayloadError {
    PayloadError::NotAllowed {
        field,
        value: value.chars().take(MAX_CLIENT_ID_CHARS).collect(),
    }
}
