//! The wire envelope.
//!
//! Every frame exchanged with the server is a single flat JSON object:
//! `{ "type"?: string, "topic"?: string, ...payload }`. `type` and `topic`
//! are lifted into named fields; everything else rides along as an opaque
//! payload map.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A single JSON text frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Message kind, serialized as the `type` field. Inbound frames carrying
    /// a kind are additionally dispatched to kind-specific handlers.
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    /// Topic the frame addresses, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    /// Remaining payload fields, passed through untouched.
    #[serde(flatten)]
    pub data: Map<String, Value>,
}

impl Envelope {
    /// Control message requesting delivery for a topic.
    pub fn subscribe(topic: impl Into<String>) -> Self {
        Self {
            kind: Some("subscribe".to_string()),
            topic: Some(topic.into()),
            data: Map::new(),
        }
    }

    /// Control message ending delivery for a topic.
    pub fn unsubscribe(topic: impl Into<String>) -> Self {
        Self {
            kind: Some("unsubscribe".to_string()),
            topic: Some(topic.into()),
            data: Map::new(),
        }
    }

    /// Application message of a given kind.
    pub fn message(kind: impl Into<String>, data: Map<String, Value>) -> Self {
        Self {
            kind: Some(kind.into()),
            topic: None,
            data,
        }
    }

    /// Parse an inbound text frame.
    ///
    /// Anything that is not a JSON object fails here; callers log and drop.
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Serialize for transmission.
    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

impl From<Value> for Envelope {
    /// Wrap a bare JSON value. Objects become the payload directly, with
    /// `type`/`topic` string fields lifted out; any other value is carried
    /// under a `data` key.
    fn from(value: Value) -> Self {
        let mut data = match value {
            Value::Object(map) => map,
            other => {
                let mut map = Map::new();
                map.insert("data".to_string(), other);
                map
            }
        };

        let kind = match data.remove("type") {
            Some(Value::String(s)) => Some(s),
            Some(other) => {
                data.insert("type".to_string(), other);
                None
            }
            None => None,
        };
        let topic = match data.remove("topic") {
            Some(Value::String(s)) => Some(s),
            Some(other) => {
                data.insert("topic".to_string(), other);
                None
            }
            None => None,
        };

        Self { kind, topic, data }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_subscribe_wire_format() {
        let text = Envelope::subscribe("alerts").to_text().unwrap();
        assert_eq!(text, r#"{"type":"subscribe","topic":"alerts"}"#);
    }

    #[test]
    fn test_unsubscribe_wire_format() {
        let text = Envelope::unsubscribe("t").to_text().unwrap();
        assert_eq!(text, r#"{"type":"unsubscribe","topic":"t"}"#);
    }

    #[test]
    fn test_message_wire_format() {
        let mut data = Map::new();
        data.insert("text".to_string(), json!("hi"));
        let env = Envelope::message("chat", data);
        assert!(env.topic.is_none());
        assert_eq!(env.to_text().unwrap(), r#"{"type":"chat","text":"hi"}"#);
    }

    #[test]
    fn test_parse_full_envelope() {
        let env = Envelope::parse(r#"{"type":"tick","topic":"metrics","value":42}"#).unwrap();
        assert_eq!(env.kind.as_deref(), Some("tick"));
        assert_eq!(env.topic.as_deref(), Some("metrics"));
        assert_eq!(env.data.get("value"), Some(&json!(42)));
    }

    #[test]
    fn test_parse_without_type_or_topic() {
        let env = Envelope::parse(r#"{"hello":1}"#).unwrap();
        assert!(env.kind.is_none());
        assert!(env.topic.is_none());
        assert_eq!(env.to_text().unwrap(), r#"{"hello":1}"#);
    }

    #[test]
    fn test_parse_rejects_non_object() {
        assert!(Envelope::parse("42").is_err());
        assert!(Envelope::parse("not json at all").is_err());
        assert!(Envelope::parse(r#"["a","b"]"#).is_err());
    }

    #[test]
    fn test_from_value_lifts_type_and_topic() {
        let env = Envelope::from(json!({"type":"alert","topic":"ops","severity":"high"}));
        assert_eq!(env.kind.as_deref(), Some("alert"));
        assert_eq!(env.topic.as_deref(), Some("ops"));
        assert_eq!(env.data.get("severity"), Some(&json!("high")));
    }

    #[test]
    fn test_from_value_keeps_non_string_type_in_payload() {
        let env = Envelope::from(json!({"type":7,"x":1}));
        assert!(env.kind.is_none());
        assert_eq!(env.data.get("type"), Some(&json!(7)));
    }

    #[test]
    fn test_from_value_wraps_scalars() {
        let env = Envelope::from(json!("ping"));
        assert_eq!(env.data.get("data"), Some(&json!("ping")));
    }
}
