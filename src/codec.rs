//! Content-format driven payload encoding and decoding.
//!
//! The adapter is stateless: a [`ContentFormatLabel`] selects which transform to apply in either
//! direction and the actual serialization is delegated to `serde_json`, `ciborium`, `base64` and
//! the link-format parser in `coap_lite`.

use std::fmt;

use base64::Engine as _;
use ciborium::value::Value as CborValue;
use coap_lite::link_format::LinkFormatParser;
use coap_lite::ContentFormat;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The content-format labels this crate knows how to transform.  Anything else collapses to
/// [`ContentFormatLabel::Unspecified`], which means "leave the payload alone".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ContentFormatLabel {
    TextPlain,
    ApplicationJson,
    ApplicationCbor,
    ApplicationLinkFormat,
    #[default]
    Unspecified,
}

impl ContentFormatLabel {
    pub fn from_label(label: &str) -> Self {
        match label.trim() {
            "text/plain" => Self::TextPlain,
            "application/json" => Self::ApplicationJson,
            "application/cbor" => Self::ApplicationCbor,
            "application/link-format" => Self::ApplicationLinkFormat,
            _ => Self::Unspecified,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::TextPlain => "text/plain",
            Self::ApplicationJson => "application/json",
            Self::ApplicationCbor => "application/cbor",
            Self::ApplicationLinkFormat => "application/link-format",
            Self::Unspecified => "",
        }
    }

    /// Maps a numeric Content-Format option value.  The CBOR pairing (60) is registered here
    /// alongside the formats coap-lite already names.
    pub fn from_number(number: usize) -> Self {
        match number {
            0 => Self::TextPlain,
            40 => Self::ApplicationLinkFormat,
            50 => Self::ApplicationJson,
            60 => Self::ApplicationCbor,
            _ => Self::Unspecified,
        }
    }

    pub fn from_content_format(format: ContentFormat) -> Self {
        Self::from_number(usize::from(format))
    }

    pub fn to_content_format(&self) -> Option<ContentFormat> {
        match self {
            Self::TextPlain => Some(ContentFormat::TextPlain),
            Self::ApplicationJson => Some(ContentFormat::ApplicationJSON),
            Self::ApplicationCbor => Some(ContentFormat::ApplicationCBOR),
            Self::ApplicationLinkFormat => Some(ContentFormat::ApplicationLinkFormat),
            Self::Unspecified => None,
        }
    }

    /// Produce the outbound body for `payload`.  `Ok(None)` means no body should be attached.
    pub fn encode(&self, payload: &Payload) -> Result<Option<Vec<u8>>, CodecError> {
        let encoded = match self {
            Self::TextPlain => payload.to_text_bytes(),
            Self::ApplicationJson => serde_json::to_vec(&payload.to_value())?,
            Self::ApplicationCbor => {
                let mut out = Vec::new();
                let written = match payload {
                    Payload::Bytes(bytes) => {
                        ciborium::ser::into_writer(&CborValue::Bytes(bytes.clone()), &mut out)
                    }
                    other => ciborium::ser::into_writer(&other.to_value(), &mut out),
                };
                written.map_err(|e| CodecError::Cbor(format!("{e:?}")))?;
                out
            }
            Self::ApplicationLinkFormat | Self::Unspecified => return Ok(None),
        };
        Ok(Some(encoded))
    }

    /// Interpret an inbound body according to this label.
    pub fn decode(&self, data: &[u8], options: &DecodeOptions) -> Result<Payload, CodecError> {
        if options.raw_buffer {
            return Ok(Payload::Bytes(data.to_vec()));
        }
        match self {
            Self::TextPlain => Ok(Payload::Text(
                base64::engine::general_purpose::STANDARD.encode(data),
            )),
            Self::ApplicationJson => Ok(Payload::Value(serde_json::from_slice(data)?)),
            Self::ApplicationCbor => {
                // Only the first item of the stream is of interest; trailing items are ignored.
                let value: CborValue = ciborium::de::from_reader(data)
                    .map_err(|e| CodecError::Cbor(format!("{e:?}")))?;
                Ok(match value {
                    CborValue::Bytes(bytes) => Payload::Bytes(bytes),
                    other => Payload::Value(cbor_to_json(other)),
                })
            }
            Self::ApplicationLinkFormat => {
                let text = std::str::from_utf8(data)
                    .map_err(|e| CodecError::LinkFormat(e.to_string()))?;
                Ok(Payload::Links(parse_links(text)?))
            }
            Self::Unspecified => Ok(Payload::Text(String::from_utf8_lossy(data).into_owned())),
        }
    }
}

impl From<String> for ContentFormatLabel {
    fn from(label: String) -> Self {
        Self::from_label(&label)
    }
}

impl From<ContentFormatLabel> for String {
    fn from(label: ContentFormatLabel) -> Self {
        label.label().to_string()
    }
}

impl fmt::Display for ContentFormatLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unspecified => write!(f, "<unspecified>"),
            _ => f.write_str(self.label()),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DecodeOptions {
    /// Skip decoding entirely and forward the raw bytes.
    pub raw_buffer: bool,
}

/// What to do when a CBOR body fails to decode.  Dropping the message silently is the
/// historical behaviour; `Propagate` turns it into an error like malformed JSON.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CborErrorPolicy {
    #[default]
    Drop,
    Propagate,
}

/// A message payload as seen by the host: raw bytes, text, a structured value, or parsed links.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Payload {
    Bytes(Vec<u8>),
    Text(String),
    Value(Value),
    Links(Vec<Link>),
}

impl Payload {
    /// Structured view used by the JSON encoder.  Text becomes a string, bytes an array of
    /// numbers and links an array of objects.  The CBOR encoder writes bytes as a byte string.
    pub fn to_value(&self) -> Value {
        match self {
            Self::Value(value) => value.clone(),
            Self::Text(text) => Value::String(text.clone()),
            Self::Bytes(bytes) => Value::Array(bytes.iter().map(|b| Value::from(*b)).collect()),
            Self::Links(links) => Value::Array(links.iter().map(Link::to_value).collect()),
        }
    }

    fn to_text_bytes(&self) -> Vec<u8> {
        match self {
            Self::Bytes(bytes) => bytes.clone(),
            Self::Text(text) => text.as_bytes().to_vec(),
            Self::Value(Value::String(text)) => text.as_bytes().to_vec(),
            other => other.to_value().to_string().into_bytes(),
        }
    }
}

impl From<Value> for Payload {
    fn from(value: Value) -> Self {
        Self::Value(value)
    }
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Bytes(bytes)
    }
}

/// One entry of an RFC 6690 link-format document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Link {
    pub target: String,
    pub attributes: Vec<(String, String)>,
}

impl Link {
    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    fn to_value(&self) -> Value {
        let mut map = serde_json::Map::new();
        map.insert("href".to_string(), Value::String(self.target.clone()));
        for (key, value) in &self.attributes {
            map.insert(key.clone(), Value::String(value.clone()));
        }
        Value::Object(map)
    }
}

/// Maps a decoded CBOR item onto the JSON data model.  Non-text map keys are rendered as strings,
/// nested byte strings become base64 text and tags are replaced by the item they wrap.
fn cbor_to_json(value: CborValue) -> Value {
    match value {
        CborValue::Null => Value::Null,
        CborValue::Bool(b) => Value::Bool(b),
        CborValue::Integer(int) => {
            let n = i128::from(int);
            if let Ok(n) = i64::try_from(n) {
                Value::from(n)
            } else if let Ok(n) = u64::try_from(n) {
                Value::from(n)
            } else {
                Value::String(n.to_string())
            }
        }
        CborValue::Float(f) => serde_json::Number::from_f64(f).map_or(Value::Null, Value::Number),
        CborValue::Text(text) => Value::String(text),
        CborValue::Bytes(bytes) => {
            Value::String(base64::engine::general_purpose::STANDARD.encode(bytes))
        }
        CborValue::Tag(_, inner) => cbor_to_json(*inner),
        CborValue::Array(items) => Value::Array(items.into_iter().map(cbor_to_json).collect()),
        CborValue::Map(entries) => Value::Object(
            entries
                .into_iter()
                .map(|(key, value)| (cbor_key(key), cbor_to_json(value)))
                .collect(),
        ),
        _ => Value::Null,
    }
}

fn cbor_key(key: CborValue) -> String {
    match cbor_to_json(key) {
        Value::String(text) => text,
        other => other.to_string(),
    }
}

fn parse_links(text: &str) -> Result<Vec<Link>, CodecError> {
    let mut links = Vec::new();
    for entry in LinkFormatParser::new(text) {
        let (target, attrs) = entry.map_err(|e| CodecError::LinkFormat(format!("{e:?}")))?;
        let attributes = attrs
            .map(|(key, value)| (key.to_string(), value.collect::<String>()))
            .collect();
        links.push(Link {
            target: target.to_string(),
            attributes,
        });
    }
    Ok(links)
}

#[derive(thiserror::Error, Debug)]
pub enum CodecError {
    #[error("malformed JSON payload: {0}")]
    Json(#[from] serde_json::Error),

    #[error("malformed CBOR payload: {0}")]
    Cbor(String),

    #[error("malformed link-format payload: {0}")]
    LinkFormat(String),
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use crate::codec::{CodecError, ContentFormatLabel, DecodeOptions, Payload};

    #[test]
    fn test_json_round_trip() {
        let original = Payload::Value(json!({"v": 1, "tags": ["a", "b"], "nested": {"ok": true}}));
        let format = ContentFormatLabel::ApplicationJson;
        let encoded = format.encode(&original).unwrap().unwrap();
        let decoded = format.decode(&encoded, &DecodeOptions::default()).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn test_cbor_round_trip() {
        let original = Payload::Value(json!({"temp": -4, "unit": "C", "history": [1.5, 2.25]}));
        let format = ContentFormatLabel::ApplicationCbor;
        let encoded = format.encode(&original).unwrap().unwrap();
        let decoded = format.decode(&encoded, &DecodeOptions::default()).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn test_cbor_decodes_first_item_only() {
        let format = ContentFormatLabel::ApplicationCbor;
        let mut stream = format.encode(&Payload::Value(json!(7))).unwrap().unwrap();
        stream.extend(format.encode(&Payload::Value(json!("second"))).unwrap().unwrap());
        let decoded = format.decode(&stream, &DecodeOptions::default()).unwrap();
        assert_eq!(decoded, Payload::Value(json!(7)));
    }

    #[test]
    fn test_cbor_outside_the_json_model() {
        let format = ContentFormatLabel::ApplicationCbor;
        let options = DecodeOptions::default();

        // {1: 2, -3: "x"}, as used by SenML-CBOR style payloads.
        let decoded = format
            .decode(&[0xa2, 0x01, 0x02, 0x22, 0x61, 0x78], &options)
            .unwrap();
        assert_eq!(decoded, Payload::Value(json!({"1": 2, "-3": "x"})));

        // h'0102'
        let decoded = format.decode(&[0x42, 0x01, 0x02], &options).unwrap();
        assert_eq!(decoded, Payload::Bytes(vec![1, 2]));

        // {"raw": h'0102'}
        let decoded = format
            .decode(&[0xa1, 0x63, b'r', b'a', b'w', 0x42, 0x01, 0x02], &options)
            .unwrap();
        assert_eq!(decoded, Payload::Value(json!({"raw": "AQI="})));

        // 1(1000), an epoch timestamp.
        let decoded = format.decode(&[0xc1, 0x19, 0x03, 0xe8], &options).unwrap();
        assert_eq!(decoded, Payload::Value(json!(1000)));
    }

    #[test]
    fn test_cbor_bytes_are_a_byte_string() {
        let format = ContentFormatLabel::ApplicationCbor;
        let encoded = format.encode(&Payload::Bytes(vec![1, 2])).unwrap().unwrap();
        assert_eq!(encoded, vec![0x42, 0x01, 0x02]);
        let decoded = format.decode(&encoded, &DecodeOptions::default()).unwrap();
        assert_eq!(decoded, Payload::Bytes(vec![1, 2]));
    }

    #[test]
    fn test_malformed_payloads() {
        let options = DecodeOptions::default();
        let json = ContentFormatLabel::ApplicationJson.decode(b"{not json", &options);
        assert!(matches!(json, Err(CodecError::Json(_))));
        let cbor = ContentFormatLabel::ApplicationCbor.decode(&[0xbf], &options);
        assert!(matches!(cbor, Err(CodecError::Cbor(_))));
    }

    #[test]
    fn test_text_plain() {
        let format = ContentFormatLabel::TextPlain;
        let encoded = format.encode(&Payload::from("hello")).unwrap().unwrap();
        assert_eq!(encoded, b"hello");

        let decoded = format.decode(b"hello", &DecodeOptions::default()).unwrap();
        assert_eq!(decoded, Payload::Text("aGVsbG8=".to_string()));
    }

    #[test]
    fn test_raw_buffer_skips_decoding() {
        let options = DecodeOptions { raw_buffer: true };
        let decoded = ContentFormatLabel::ApplicationJson
            .decode(b"{not json", &options)
            .unwrap();
        assert_eq!(decoded, Payload::Bytes(b"{not json".to_vec()));
    }

    #[test]
    fn test_unspecified() {
        let format = ContentFormatLabel::from_label("application/octet-stream");
        assert_eq!(format, ContentFormatLabel::Unspecified);
        assert_eq!(format.encode(&Payload::from("x")).unwrap(), None);
        let decoded = format.decode(b"plain", &DecodeOptions::default()).unwrap();
        assert_eq!(decoded, Payload::Text("plain".to_string()));
    }

    #[test]
    fn test_link_format() {
        let body = br#"</sensors/temp>;rt="temperature";ct=50,</sensors/light>;if=sensor"#;
        let decoded = ContentFormatLabel::ApplicationLinkFormat
            .decode(body, &DecodeOptions::default())
            .unwrap();
        let Payload::Links(links) = decoded else {
            panic!("expected links, got {decoded:?}");
        };
        assert_eq!(links.len(), 2);
        assert_eq!(links[0].target, "/sensors/temp");
        assert_eq!(links[0].attr("rt"), Some("temperature"));
        assert_eq!(links[0].attr("ct"), Some("50"));
        assert_eq!(links[1].target, "/sensors/light");
        assert_eq!(links[1].attr("if"), Some("sensor"));
    }

    #[test]
    fn test_numeric_mapping() {
        assert_eq!(
            ContentFormatLabel::from_number(60),
            ContentFormatLabel::ApplicationCbor
        );
        for label in [
            ContentFormatLabel::TextPlain,
            ContentFormatLabel::ApplicationJson,
            ContentFormatLabel::ApplicationCbor,
            ContentFormatLabel::ApplicationLinkFormat,
        ] {
            let format = label.to_content_format().unwrap();
            assert_eq!(ContentFormatLabel::from_content_format(format), label);
            assert_eq!(ContentFormatLabel::from_label(label.label()), label);
        }
    }
}
