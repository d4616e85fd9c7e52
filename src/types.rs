//! AMQP 0-9-1 wire vocabulary.
//!
//! This module holds the small, purely-data pieces shared by the codec, the
//! connection state machine, and the broker state: the field-table value
//! type, frame type tags, the class/method id tables, and the ordered
//! `basic`-class content-header properties.
//!
//! # Field values
//!
//! ```rust
//! use mock_amqp_broker::types::FieldValue;
//!
//! let v = FieldValue::LongString("hello".to_string());
//! assert_eq!(v.as_str(), Some("hello"));
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One entry's value in an AMQP field-table or field-array.
///
/// Tag bytes on the wire follow the AMQP 0-9-1 field-value table, with the
/// RabbitMQ deviation that `s` decodes as `ShortInt` (a signed 16-bit
/// integer) rather than a short string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    LongString(String),
    ShortInt(i16),
    Boolean(bool),
    ShortShortInt(i8),
    ShortShortUint(u8),
    ShortUint(u16),
    LongInt(i32),
    LongUint(u32),
    LongLongInt(i64),
    LongLongUint(u64),
    Float(f32),
    Double(f64),
    Decimal { scale: u8, value: u32 },
    FieldTable(FieldTable),
    FieldArray(Vec<FieldValue>),
    Timestamp(u64),
    Void,
    Binary(Vec<u8>),
}

/// An AMQP field-table: an ordered map from shortstr key to tagged value.
/// `Vec` instead of `HashMap` preserves insertion order, which RabbitMQ
/// clients sometimes rely on when round-tripping headers.
pub type FieldTable = Vec<(String, FieldValue)>;

impl FieldValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::LongString(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            FieldValue::Boolean(b) => Some(*b),
            _ => None,
        }
    }
}

/// Look up a key in a field-table (linear scan; tables are small).
pub fn field_table_get<'a>(table: &'a FieldTable, key: &str) -> Option<&'a FieldValue> {
    table.iter().find(|(k, _)| k == key).map(|(_, v)| v)
}

/// AMQP frame type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    Method = 1,
    Header = 2,
    Body = 3,
    Heartbeat = 8,
}

impl FrameType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(FrameType::Method),
            2 => Some(FrameType::Header),
            3 => Some(FrameType::Body),
            8 => Some(FrameType::Heartbeat),
            _ => None,
        }
    }
}

/// Frame end sentinel byte.
pub const FRAME_END: u8 = 0xCE;

/// The 8-byte AMQP 0-9-1 protocol header a well-behaved client sends first.
pub const PROTOCOL_HEADER: [u8; 8] = [0x41, 0x4D, 0x51, 0x50, 0x00, 0x00, 0x09, 0x01];

/// Class ids.
pub mod class_id {
    pub const CONNECTION: u16 = 10;
    pub const CHANNEL: u16 = 20;
    pub const EXCHANGE: u16 = 40;
    pub const QUEUE: u16 = 50;
    pub const BASIC: u16 = 60;
}

/// Method ids, scoped by class.
pub mod method_id {
    pub const CONNECTION_START: u16 = 10;
    pub const CONNECTION_START_OK: u16 = 11;
    pub const CONNECTION_TUNE: u16 = 30;
    pub const CONNECTION_TUNE_OK: u16 = 31;
    pub const CONNECTION_OPEN: u16 = 40;
    pub const CONNECTION_OPEN_OK: u16 = 41;
    pub const CONNECTION_CLOSE: u16 = 50;
    pub const CONNECTION_CLOSE_OK: u16 = 51;

    pub const CHANNEL_OPEN: u16 = 10;
    pub const CHANNEL_OPEN_OK: u16 = 11;
    pub const CHANNEL_CLOSE: u16 = 40;
    pub const CHANNEL_CLOSE_OK: u16 = 41;

    pub const EXCHANGE_DECLARE: u16 = 10;
    pub const EXCHANGE_DECLARE_OK: u16 = 11;

    pub const QUEUE_DECLARE: u16 = 10;
    pub const QUEUE_DECLARE_OK: u16 = 11;
    pub const QUEUE_BIND: u16 = 20;
    pub const QUEUE_BIND_OK: u16 = 21;

    pub const BASIC_QOS: u16 = 10;
    pub const BASIC_QOS_OK: u16 = 11;
    pub const BASIC_CONSUME: u16 = 20;
    pub const BASIC_CONSUME_OK: u16 = 21;
    pub const BASIC_CANCEL: u16 = 30;
    pub const BASIC_CANCEL_OK: u16 = 31;
    pub const BASIC_PUBLISH: u16 = 40;
    pub const BASIC_DELIVER: u16 = 60;
    pub const BASIC_ACK: u16 = 80;
    pub const BASIC_NACK: u16 = 120;
}

/// Combine a class id and a method id the way the wire does: `class << 16 | method`.
pub const fn method_key(class: u16, method: u16) -> u32 {
    ((class as u32) << 16) | (method as u32)
}

/// Recognized incoming method ids, named for readability at call sites.
pub mod incoming {
    use super::{class_id, method_id, method_key};

    pub const CONNECTION_START_OK: u32 = method_key(class_id::CONNECTION, method_id::CONNECTION_START_OK);
    pub const CONNECTION_TUNE_OK: u32 = method_key(class_id::CONNECTION, method_id::CONNECTION_TUNE_OK);
    pub const CONNECTION_OPEN: u32 = method_key(class_id::CONNECTION, method_id::CONNECTION_OPEN);
    pub const CONNECTION_CLOSE: u32 = method_key(class_id::CONNECTION, method_id::CONNECTION_CLOSE);
    pub const CHANNEL_OPEN: u32 = method_key(class_id::CHANNEL, method_id::CHANNEL_OPEN);
    pub const CHANNEL_CLOSE: u32 = method_key(class_id::CHANNEL, method_id::CHANNEL_CLOSE);
    pub const BASIC_QOS: u32 = method_key(class_id::BASIC, method_id::BASIC_QOS);
    pub const BASIC_CONSUME: u32 = method_key(class_id::BASIC, method_id::BASIC_CONSUME);
    pub const BASIC_PUBLISH: u32 = method_key(class_id::BASIC, method_id::BASIC_PUBLISH);
    pub const BASIC_ACK: u32 = method_key(class_id::BASIC, method_id::BASIC_ACK);
    pub const BASIC_NACK: u32 = method_key(class_id::BASIC, method_id::BASIC_NACK);
    pub const BASIC_CANCEL: u32 = method_key(class_id::BASIC, method_id::BASIC_CANCEL);
    pub const EXCHANGE_DECLARE: u32 = method_key(class_id::EXCHANGE, method_id::EXCHANGE_DECLARE);
    pub const QUEUE_DECLARE: u32 = method_key(class_id::QUEUE, method_id::QUEUE_DECLARE);
    pub const QUEUE_BIND: u32 = method_key(class_id::QUEUE, method_id::QUEUE_BIND);
}

/// The `basic` class content-header properties, in the fixed bitfield order
/// (highest-order bit first): content_type, content_encoding,
/// application_headers, delivery_mode, priority, correlation_id, reply_to,
/// expiration, message_id, timestamp, type, user_id, app_id, cluster_id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BasicProperties {
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    pub application_headers: Option<FieldTable>,
    pub delivery_mode: Option<u8>,
    pub priority: Option<u8>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub expiration: Option<String>,
    pub message_id: Option<String>,
    pub timestamp: Option<u64>,
    pub kind: Option<String>,
    pub user_id: Option<String>,
    pub app_id: Option<String>,
    pub cluster_id: Option<String>,
}

/// Render a single field-table value as JSON, for surfacing application
/// headers on the HTTP introspection routes.
fn field_value_to_json(value: &FieldValue) -> serde_json::Value {
    match value {
        FieldValue::LongString(s) => serde_json::Value::String(s.clone()),
        FieldValue::Boolean(b) => serde_json::Value::Bool(*b),
        FieldValue::ShortInt(v) => serde_json::json!(v),
        FieldValue::ShortShortInt(v) => serde_json::json!(v),
        FieldValue::ShortShortUint(v) => serde_json::json!(v),
        FieldValue::ShortUint(v) => serde_json::json!(v),
        FieldValue::LongInt(v) => serde_json::json!(v),
        FieldValue::LongUint(v) => serde_json::json!(v),
        FieldValue::LongLongInt(v) => serde_json::json!(v),
        FieldValue::LongLongUint(v) => serde_json::json!(v),
        FieldValue::Float(v) => serde_json::json!(v),
        FieldValue::Double(v) => serde_json::json!(v),
        FieldValue::Timestamp(v) => serde_json::json!(v),
        FieldValue::FieldArray(values) => {
            serde_json::Value::Array(values.iter().map(field_value_to_json).collect())
        }
        FieldValue::FieldTable(table) => {
            let mut nested = serde_json::Map::new();
            for (k, v) in table {
                nested.insert(k.clone(), field_value_to_json(v));
            }
            serde_json::Value::Object(nested)
        }
        FieldValue::Binary(bytes) => {
            serde_json::Value::String(String::from_utf8_lossy(bytes).into_owned())
        }
        FieldValue::Decimal { .. } | FieldValue::Void => serde_json::Value::Null,
    }
}

impl BasicProperties {
    /// Render the properties as a JSON-friendly map, the shape the HTTP
    /// introspection surface hands back. Application headers are spread
    /// into top-level keys of the returned map rather than nested under an
    /// `application_headers` key, matching the flat `headers` dict the
    /// original fixture hands back to a test harness.
    pub fn to_json_map(&self) -> HashMap<String, serde_json::Value> {
        let mut map = HashMap::new();
        macro_rules! put {
            ($name:literal, $field:expr) => {
                if let Some(v) = &$field {
                    map.insert($name.to_string(), serde_json::to_value(v).unwrap());
                }
            };
        }
        put!("content_type", self.content_type);
        put!("content_encoding", self.content_encoding);
        put!("delivery_mode", self.delivery_mode);
        put!("priority", self.priority);
        put!("correlation_id", self.correlation_id);
        put!("reply_to", self.reply_to);
        put!("expiration", self.expiration);
        put!("message_id", self.message_id);
        put!("timestamp", self.timestamp);
        put!("type", self.kind);
        put!("user_id", self.user_id);
        put!("app_id", self.app_id);
        put!("cluster_id", self.cluster_id);
        if let Some(headers) = &self.application_headers {
            for (k, v) in headers {
                map.insert(k.clone(), field_value_to_json(v));
            }
        }
        map
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_type_round_trips_known_values() {
        assert_eq!(FrameType::from_u8(1), Some(FrameType::Method));
        assert_eq!(FrameType::from_u8(2), Some(FrameType::Header));
        assert_eq!(FrameType::from_u8(3), Some(FrameType::Body));
        assert_eq!(FrameType::from_u8(8), Some(FrameType::Heartbeat));
        assert_eq!(FrameType::from_u8(99), None);
    }

    #[test]
    fn method_key_packs_class_and_method() {
        assert_eq!(incoming::CONNECTION_START_OK, 0x000A000B);
        assert_eq!(incoming::CONNECTION_TUNE_OK, 0x000A001F);
        assert_eq!(incoming::CONNECTION_OPEN, 0x000A0028);
        assert_eq!(incoming::CONNECTION_CLOSE, 0x000A0032);
        assert_eq!(incoming::CHANNEL_OPEN, 0x0014000A);
        assert_eq!(incoming::CHANNEL_CLOSE, 0x00140028);
        assert_eq!(incoming::BASIC_QOS, 0x003C000A);
        assert_eq!(incoming::BASIC_CONSUME, 0x003C0014);
        assert_eq!(incoming::BASIC_PUBLISH, 0x003C0028);
        assert_eq!(incoming::BASIC_ACK, 0x003C0050);
        assert_eq!(incoming::BASIC_NACK, 0x003C0078);
        assert_eq!(incoming::BASIC_CANCEL, 0x003C001E);
        assert_eq!(incoming::EXCHANGE_DECLARE, 0x0028000A);
        assert_eq!(incoming::QUEUE_DECLARE, 0x0032000A);
        assert_eq!(incoming::QUEUE_BIND, 0x00320014);
    }

    #[test]
    fn field_value_as_str_only_matches_long_string() {
        assert_eq!(FieldValue::LongString("x".into()).as_str(), Some("x"));
        assert_eq!(FieldValue::ShortInt(5).as_str(), None);
    }

    #[test]
    fn field_table_get_finds_existing_key() {
        let table: FieldTable = vec![("LOGIN".to_string(), FieldValue::LongString("guest".to_string()))];
        assert_eq!(field_table_get(&table, "LOGIN").and_then(|v| v.as_str()), Some("guest"));
        assert!(field_table_get(&table, "PASSWORD").is_none());
    }

    #[test]
    fn basic_properties_to_json_map_only_includes_set_fields() {
        let props = BasicProperties {
            content_type: Some("text/plain".to_string()),
            ..Default::default()
        };
        let map = props.to_json_map();
        assert_eq!(map.len(), 1);
        assert_eq!(map.get("content_type").unwrap(), "text/plain");
    }
}
