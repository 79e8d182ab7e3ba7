use std::collections::LinkedList;

use coap_lite::{CoapOption, MessageClass, Packet, ResponseType};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::codec::{ContentFormatLabel, Payload};
use crate::transport::TransportError;

/// One outbound request as handed over by the host.  Unknown fields are carried in `extra` and
/// echoed back on every [`OutputMessage`] produced for this invocation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Invocation {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub destination: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Payload>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observe: Option<bool>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Invocation {
    pub fn to(destination: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            destination: Some(destination.into()),
            path: Some(path.into()),
            ..Default::default()
        }
    }

    pub fn for_url(url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            ..Default::default()
        }
    }

    pub fn method(mut self, method: impl Into<String>) -> Self {
        self.method = Some(method.into());
        self
    }

    pub fn payload(mut self, payload: impl Into<Payload>) -> Self {
        self.payload = Some(payload.into());
        self
    }
}

/// Result of one response (or transport failure) for an [`Invocation`].
#[derive(Debug, Clone, PartialEq)]
pub struct OutputMessage {
    pub invocation: Invocation,
    pub payload: Payload,
    pub headers: ResponseHeaders,
    pub status_code: ResponseType,
}

impl OutputMessage {
    /// Synthetic message emitted for any transport failure, whatever the underlying cause.
    pub fn transport_failure(invocation: Invocation, error: &TransportError) -> Self {
        Self {
            invocation,
            payload: Payload::Value(json!({
                "description": "timeout",
                "code": error.to_string(),
            })),
            headers: ResponseHeaders::default(),
            status_code: ResponseType::GatewayTimeout,
        }
    }

    /// Status in the familiar three digit form, `class * 100 + detail` (e.g. 205, 404, 504).
    pub fn status_number(&self) -> u16 {
        let code = u8::from(MessageClass::Response(self.status_code));
        u16::from(code >> 5) * 100 + u16::from(code & 0x1f)
    }

    /// Flattened JSON view: the invocation's fields with `payload`, `headers` and `statusCode`
    /// overlaid.
    pub fn to_json(&self) -> Value {
        let mut map = match serde_json::to_value(&self.invocation) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        };
        map.insert("payload".to_string(), self.payload.to_value());
        map.insert(
            "headers".to_string(),
            serde_json::to_value(&self.headers).unwrap_or(Value::Null),
        );
        map.insert("statusCode".to_string(), Value::from(self.status_number()));
        Value::Object(map)
    }
}

/// The response options a host typically cares about.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseHeaders {
    #[serde(rename = "Content-Format")]
    pub content_format: ContentFormatLabel,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observe: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_age: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub etag: Option<Vec<u8>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location_path: Option<String>,
}

impl ResponseHeaders {
    pub fn from_packet(packet: &Packet) -> Self {
        let content_format = packet
            .get_first_option(CoapOption::ContentFormat)
            .map(|value| ContentFormatLabel::from_number(decode_uint(value) as usize))
            .unwrap_or_default();
        let observe = packet.get_observe_value().and_then(Result::ok);
        let max_age = packet
            .get_first_option(CoapOption::MaxAge)
            .map(|value| decode_uint(value));
        let etag = packet.get_first_option(CoapOption::ETag).cloned();
        let location_path = packet
            .get_option(CoapOption::LocationPath)
            .map(join_segments);
        Self {
            content_format,
            observe,
            max_age,
            etag,
            location_path,
        }
    }
}

fn decode_uint(value: &[u8]) -> u32 {
    value
        .iter()
        .take(4)
        .fold(0u32, |acc, byte| (acc << 8) | u32::from(*byte))
}

fn join_segments(segments: &LinkedList<Vec<u8>>) -> String {
    segments
        .iter()
        .map(|s| format!("/{}", String::from_utf8_lossy(s)))
        .collect()
}
