//! Wire frames exchanged over the chat WebSocket.
//!
//! Inbound frames are untyped JSON objects; their kind is decided by which
//! keys are present, in a fixed priority order (see [`InboundFrame::from_value`]).

use serde_json::Value;

/// A classified inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundFrame {
    /// Carries `unread_count`. `count` is the count as the server wrote it
    /// when it is positive, and `None` (badge hidden) otherwise.
    UnreadCount { count: Option<String> },
    /// Carries a truthy `typing` flag.
    Typing { username: String },
    /// Anything else: a chat message to render.
    ChatMessage {
        username: String,
        message: Option<String>,
    },
}

impl InboundFrame {
    /// Unread-count frame for a whole number.
    pub fn unread(count: u64) -> Self {
        InboundFrame::UnreadCount {
            count: (count > 0).then(|| count.to_string()),
        }
    }

    /// Classify a parsed JSON value.
    ///
    /// Rules, first match wins:
    /// 1. `unread_count` key present (any value) → [`InboundFrame::UnreadCount`]
    /// 2. `typing` is truthy → [`InboundFrame::Typing`]
    /// 3. otherwise → [`InboundFrame::ChatMessage`]
    ///
    /// Returns `None` for JSON that is not an object.
    pub fn from_value(value: &Value) -> Option<Self> {
        let obj = value.as_object()?;

        if let Some(raw) = obj.get("unread_count") {
            return Some(InboundFrame::UnreadCount {
                count: count_of(raw),
            });
        }

        let username = obj.get("username").and_then(text_of).unwrap_or_default();

        if obj.get("typing").is_some_and(is_truthy) {
            return Some(InboundFrame::Typing { username });
        }

        let message = obj
            .get("message")
            .filter(|v| is_truthy(v))
            .and_then(text_of);
        Some(InboundFrame::ChatMessage { username, message })
    }
}

/// Parse one text frame. Malformed JSON and non-object JSON yield `None`.
pub fn parse_frame(text: &str) -> Option<InboundFrame> {
    let value: Value = serde_json::from_str(text).ok()?;
    InboundFrame::from_value(&value)
}

/// Truthiness as the chat server's browser clients see it.
fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0 && !f.is_nan()),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Scalar JSON rendered as display text.
fn text_of(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Badge text for a positive number or numeric string, kept as written
/// (`2.9` stays `2.9`). Zero, negatives and non-numeric values give `None`.
fn count_of(value: &Value) -> Option<String> {
    let (number, text) = match value {
        Value::Number(n) => (n.as_f64()?, n.to_string()),
        Value::String(s) => {
            let trimmed = s.trim();
            (trimmed.parse::<f64>().ok()?, trimmed.to_string())
        }
        _ => return None,
    };
    (number.is_finite() && number > 0.0).then_some(text)
}

/// A frame the client sends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundFrame {
    TypingNotice,
    ChatMessageSend { message: String },
}

impl OutboundFrame {
    /// JSON text for the wire: `{"typing":true}` or `{"message":"..."}`.
    pub fn to_json(&self) -> String {
        let value = match self {
            OutboundFrame::TypingNotice => serde_json::json!({ "typing": true }),
            OutboundFrame::ChatMessageSend { message } => {
                serde_json::json!({ "message": message })
            }
        };
        value.to_string()
    }
}
