//! Decoding of provider (WhatsApp gateway) message payloads into [`Message`]s.
//!
//! The gateway is inconsistent about field names across endpoints and
//! versions, so every accessor tries a fixed list of spellings.

use serde_json::Value;

use crate::stage::model::Message;

/// Keys that may hold the message list in an envelope object.
const LIST_KEYS: [&str; 4] = ["items", "messages", "data", "results"];

impl Message {
    /// Build a message from one provider JSON object. Missing fields degrade
    /// to customer-authored, no text, timestamp 0.
    pub fn from_provider(value: &Value) -> Self {
        Self {
            author_is_tenant: from_me(value),
            text: extract_text(value),
            timestamp: extract_timestamp(value),
        }
    }
}

/// Decode a whole payload: a bare array, or an envelope holding one.
pub fn messages_from_payload(payload: &Value) -> Vec<Message> {
    let list = match payload {
        Value::Array(items) => Some(items),
        Value::Object(map) => LIST_KEYS
            .iter()
            .find_map(|k| map.get(*k).and_then(Value::as_array)),
        _ => None,
    };

    list.map(|items| {
        items
            .iter()
            .filter(|v| v.is_object())
            .map(Message::from_provider)
            .collect()
    })
    .unwrap_or_default()
}

/// Epoch seconds (10 digits) are scaled to milliseconds; anything else passes through.
pub fn normalize_timestamp(ts: i64) -> i64 {
    if (1_000_000_000..10_000_000_000).contains(&ts) {
        ts * 1000
    } else {
        ts
    }
}

fn from_me(value: &Value) -> bool {
    ["fromMe", "fromme", "from_me"]
        .iter()
        .any(|k| value.get(*k).is_some_and(truthy))
}

fn truthy(v: &Value) -> bool {
    match v {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
        Value::Null => false,
    }
}

fn extract_text(value: &Value) -> Option<String> {
    let inner = value.get("message");
    let candidates = [
        value.get("text"),
        value.get("caption"),
        value.get("body"),
        inner.and_then(|m| m.get("text")),
        inner.and_then(|m| m.get("conversation")),
        inner
            .and_then(|m| m.get("extendedTextMessage"))
            .and_then(|m| m.get("text")),
    ];

    candidates
        .into_iter()
        .flatten()
        .filter_map(Value::as_str)
        .find(|s| !s.is_empty())
        .map(str::to_string)
}

fn extract_timestamp(value: &Value) -> i64 {
    let raw = ["messageTimestamp", "timestamp"]
        .iter()
        .filter_map(|k| value.get(*k))
        .find_map(|v| match v {
            Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
            Value::String(s) => s.trim().parse::<i64>().ok(),
            _ => None,
        });

    raw.map(normalize_timestamp).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn reads_flat_message() {
        let m = Message::from_provider(&json!({
            "fromMe": true,
            "text": "vou te passar para o comercial",
            "messageTimestamp": 1_700_000_000_123_i64
        }));
        assert!(m.author_is_tenant);
        assert_eq!(m.text.as_deref(), Some("vou te passar para o comercial"));
        assert_eq!(m.timestamp, 1_700_000_000_123);
    }

    #[test]
    fn author_spellings() {
        assert!(Message::from_provider(&json!({"fromme": 1})).author_is_tenant);
        assert!(Message::from_provider(&json!({"from_me": "true"})).author_is_tenant);
        assert!(!Message::from_provider(&json!({"fromMe": false})).author_is_tenant);
        assert!(!Message::from_provider(&json!({})).author_is_tenant);
    }

    #[test]
    fn text_fallback_chain() {
        let caption = Message::from_provider(&json!({"text": "", "caption": "foto"}));
        assert_eq!(caption.text.as_deref(), Some("foto"));

        let nested = Message::from_provider(&json!({"message": {"conversation": "oi"}}));
        assert_eq!(nested.text.as_deref(), Some("oi"));

        let extended = Message::from_provider(&json!({
            "message": {"extendedTextMessage": {"text": "link aqui"}}
        }));
        assert_eq!(extended.text.as_deref(), Some("link aqui"));

        let none = Message::from_provider(&json!({"text": 42}));
        assert_eq!(none.text, None);
    }

    #[test]
    fn seconds_are_scaled_to_millis() {
        assert_eq!(normalize_timestamp(1_700_000_000), 1_700_000_000_000);
        assert_eq!(normalize_timestamp(1_700_000_000_000), 1_700_000_000_000);
        assert_eq!(normalize_timestamp(42), 42);

        let m = Message::from_provider(&json!({"timestamp": "1700000000"}));
        assert_eq!(m.timestamp, 1_700_000_000_000);
    }

    #[test]
    fn payload_shapes() {
        let arr = json!([{"text": "a"}, {"text": "b"}]);
        assert_eq!(messages_from_payload(&arr).len(), 2);

        let env = json!({"items": [{"text": "a"}]});
        assert_eq!(messages_from_payload(&env).len(), 1);

        let data = json!({"data": [{"text": "a"}, "junk", {"text": "c"}]});
        assert_eq!(messages_from_payload(&data).len(), 2);

        assert!(messages_from_payload(&json!({"other": []})).is_empty());
        assert!(messages_from_payload(&json!("nope")).is_empty());
    }
}
