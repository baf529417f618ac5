//! Wire protocol message types.
//!
//! Every unit exchanged between Neuron peers is a flat JSON object with the
//! fields `type`, `in`, `out`, `self`, `data` and `signature`. The field
//! names are part of the compatibility surface and must not change.
//!
//! Stream transports carry each message as a frame: a 4-byte big-endian
//! length header followed by the JSON body.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Role tag sent in the `self` field by nodes.
pub const NODE_ROLE: &str = "node";

/// Maximum single frame size (16 MB).
pub const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

/// The `type` of a wire message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    /// Opens an exchange and challenges the responder.
    Open,
    /// Authenticated request carrying an application payload.
    Request,
    /// Reply to an `open` or a `request`.
    Response,
    /// Missing or unrecognised type; never answered.
    #[default]
    Unknown,
}

impl MessageType {
    fn parse(raw: &str) -> Self {
        match raw {
            "open" => MessageType::Open,
            "request" => MessageType::Request,
            "response" => MessageType::Response,
            _ => MessageType::Unknown,
        }
    }
}

/// A wire protocol message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Message type.
    #[serde(rename = "type", default, deserialize_with = "type_lenient")]
    pub kind: MessageType,
    /// Correlation id this message answers.
    #[serde(
        rename = "in",
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "string_lenient"
    )]
    pub in_id: Option<String>,
    /// Correlation id the sender expects to see echoed back.
    #[serde(
        rename = "out",
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "string_lenient"
    )]
    pub out_id: Option<String>,
    /// Role tag of the sender (`"node"`).
    #[serde(
        rename = "self",
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "string_lenient"
    )]
    pub role: Option<String>,
    /// Opaque application payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Base64 signature over the nonce this message answers.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "string_lenient"
    )]
    pub signature: Option<String>,
}

/// Accept any JSON value; anything but a string becomes `None`.
fn string_lenient<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::String(s) => Some(s),
        _ => None,
    })
}

fn type_lenient<'de, D>(deserializer: D) -> Result<MessageType, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::String(s) => MessageType::parse(&s),
        _ => MessageType::Unknown,
    })
}

impl Message {
    /// `{type: open, self: node, out}` — first leg of a handshake.
    pub fn open(out_id: &str) -> Self {
        Self {
            kind: MessageType::Open,
            out_id: Some(out_id.to_string()),
            role: Some(NODE_ROLE.to_string()),
            ..Default::default()
        }
    }

    /// Responder's answer to an `open`: signs the client's challenge and
    /// issues its own.
    pub fn open_reply(in_id: &str, out_id: &str, signature: String) -> Self {
        Self {
            kind: MessageType::Response,
            in_id: Some(in_id.to_string()),
            out_id: Some(out_id.to_string()),
            signature: Some(signature),
            ..Default::default()
        }
    }

    /// Authenticated request answering the responder's challenge `in_id`.
    pub fn request(in_id: &str, out_id: &str, data: Value, signature: String) -> Self {
        Self {
            kind: MessageType::Request,
            in_id: Some(in_id.to_string()),
            out_id: Some(out_id.to_string()),
            role: Some(NODE_ROLE.to_string()),
            data: Some(data),
            signature: Some(signature),
        }
    }

    /// Final response to a request.
    pub fn response(in_id: &str, data: Value, signature: String) -> Self {
        Self {
            kind: MessageType::Response,
            in_id: Some(in_id.to_string()),
            data: Some(data),
            signature: Some(signature),
            ..Default::default()
        }
    }

    /// Interpret an inbound transport unit.
    ///
    /// Returns `None` for anything that is not protocol traffic: non-objects
    /// and objects carrying neither `in` nor `out` as a string.
    pub fn from_value(value: Value) -> Option<Self> {
        if !value.is_object() {
            return None;
        }
        let msg: Message = serde_json::from_value(value).ok()?;
        if msg.in_id.is_none() && msg.out_id.is_none() {
            return None;
        }
        Some(msg)
    }

    /// Serialize to a JSON value for the transport.
    pub fn to_value(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(self)
    }

    /// Whether the `self` tag identifies a node.
    pub fn from_node(&self) -> bool {
        self.role.as_deref() == Some(NODE_ROLE)
    }
}

/// Encode a JSON value to a frame (4-byte big-endian length + JSON).
pub fn encode_frame(value: &Value) -> Result<Vec<u8>, serde_json::Error> {
    let json = serde_json::to_vec(value)?;
    let len = json.len() as u32;
    let mut bytes = Vec::with_capacity(4 + json.len());
    bytes.extend_from_slice(&len.to_be_bytes());
    bytes.extend_from_slice(&json);
    Ok(bytes)
}

/// Decode the length prefix from a 4-byte header.
pub fn decode_length(header: &[u8; 4]) -> u32 {
    u32::from_be_bytes(*header)
}

/// Parse a frame body.
pub fn decode_frame(body: &[u8]) -> Result<Value, serde_json::Error> {
    serde_json::from_slice(body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_open_wire_shape() {
        let value = Message::open("c1").to_value().unwrap();
        assert_eq!(value, json!({"type": "open", "out": "c1", "self": "node"}));
    }

    #[test]
    fn test_request_wire_shape() {
        let msg = Message::request("s1", "c2", json!({"op": "ping"}), "sig".to_string());
        let value = msg.to_value().unwrap();
        assert_eq!(value["type"], "request");
        assert_eq!(value["in"], "s1");
        assert_eq!(value["out"], "c2");
        assert_eq!(value["self"], "node");
        assert_eq!(value["data"]["op"], "ping");
        assert_eq!(value["signature"], "sig");
    }

    #[test]
    fn test_from_value_drops_noise() {
        assert!(Message::from_value(json!("hello")).is_none());
        assert!(Message::from_value(json!(42)).is_none());
        assert!(Message::from_value(json!([1, 2, 3])).is_none());
        assert!(Message::from_value(json!({"type": "open"})).is_none());
        // Wrong-typed correlation fields count as missing.
        assert!(Message::from_value(json!({"type": "response", "in": 7})).is_none());
    }

    #[test]
    fn test_from_value_lenient_fields() {
        let msg = Message::from_value(json!({
            "type": 12,
            "in": "abc",
            "signature": false,
            "self": null,
        }))
        .unwrap();
        assert_eq!(msg.kind, MessageType::Unknown);
        assert_eq!(msg.in_id.as_deref(), Some("abc"));
        assert!(msg.signature.is_none());
        assert!(!msg.from_node());
    }

    #[test]
    fn test_from_value_unknown_type() {
        let msg = Message::from_value(json!({"type": "gossip", "out": "x"})).unwrap();
        assert_eq!(msg.kind, MessageType::Unknown);
    }

    #[test]
    fn test_response_parses() {
        let msg = Message::from_value(json!({
            "type": "response",
            "in": "c2",
            "data": {"pong": true},
            "signature": "c2sig",
        }))
        .unwrap();
        assert_eq!(msg.kind, MessageType::Response);
        assert_eq!(msg.data, Some(json!({"pong": true})));
        assert_eq!(msg.signature.as_deref(), Some("c2sig"));
        assert!(msg.out_id.is_none());
    }

    #[test]
    fn test_frame_length_prefix() {
        let value = Message::open("c1").to_value().unwrap();
        let bytes = encode_frame(&value).unwrap();
        let len = decode_length(&[bytes[0], bytes[1], bytes[2], bytes[3]]);
        assert_eq!(len as usize, bytes.len() - 4);
        let decoded = decode_frame(&bytes[4..]).unwrap();
        assert_eq!(decoded["out"], "c1");
    }
}
