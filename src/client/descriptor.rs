use std::net::Ipv6Addr;

use coap_lite::{CoapOption, MessageClass, MessageType, Packet, RequestType};
use log::debug;
use percent_encoding::percent_decode_str;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::client::message::Invocation;
use crate::client::ClientError;
use crate::codec::{CborErrorPolicy, ContentFormatLabel, DecodeOptions};
use crate::endpoint::DEFAULT_COAP_PORT;
use crate::router::{method_name, parse_method};

const COAP_SCHEME: &str = "coap";

/// Static configuration of one outbound request builder.  Settings here take precedence over the
/// matching fields of an [`Invocation`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RequestConfig {
    pub url: Option<String>,
    pub method: Option<String>,
    pub observe: bool,
    #[serde(rename = "content-format")]
    pub content_format: ContentFormatLabel,
    #[serde(rename = "raw-buffer")]
    pub raw_buffer: bool,
    pub cbor_errors: CborErrorPolicy,
    /// Port used when the URI is synthesized from an invocation's destination and path.
    pub port: u16,
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            url: None,
            method: None,
            observe: false,
            content_format: ContentFormatLabel::Unspecified,
            raw_buffer: false,
            cbor_errors: CborErrorPolicy::Drop,
            port: DEFAULT_COAP_PORT,
        }
    }
}

impl RequestConfig {
    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn method(mut self, method: impl Into<String>) -> Self {
        self.method = Some(method.into());
        self
    }

    pub fn observe(mut self, observe: bool) -> Self {
        self.observe = observe;
        self
    }

    pub fn content_format(mut self, format: ContentFormatLabel) -> Self {
        self.content_format = format;
        self
    }

    pub fn raw_buffer(mut self, raw: bool) -> Self {
        self.raw_buffer = raw;
        self
    }

    pub fn cbor_errors(mut self, policy: CborErrorPolicy) -> Self {
        self.cbor_errors = policy;
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn decode_options(&self) -> DecodeOptions {
        DecodeOptions {
            raw_buffer: self.raw_buffer,
        }
    }
}

/// Fully resolved outbound request, built fresh for each invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestDescriptor {
    pub uri: Url,
    /// Host as it appears in the URI, so IPv6 literals keep their brackets.
    pub host: String,
    pub port: u16,
    /// Percent-decoded path, as carried by the Uri-Path options.
    pub path: String,
    /// Percent-decoded query, as carried by the Uri-Query options.
    pub query: Option<String>,
    pub method: RequestType,
    pub content_format: ContentFormatLabel,
    pub observe: bool,
    pub payload: Option<Vec<u8>>,
}

impl RequestDescriptor {
    pub fn resolve(config: &RequestConfig, invocation: &Invocation) -> Result<Self, ClientError> {
        let raw_uri = match (&invocation.destination, &invocation.path) {
            (Some(destination), Some(path)) => synthesize_uri(destination, config.port, path)?,
            _ => config
                .url
                .clone()
                .or_else(|| invocation.url.clone())
                .ok_or(ClientError::MissingUrl)?,
        };
        let uri = parse_uri(&raw_uri)?;
        let host = uri
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| ClientError::InvalidUrl {
                url: raw_uri.clone(),
                reason: "missing host".to_string(),
            })?
            .to_string();
        let port = uri.port().unwrap_or(DEFAULT_COAP_PORT);
        let path = format!("/{}", path_segments(&uri).join("/"));
        let query = uri.query().map(decode_component);

        let method_label = config
            .method
            .as_deref()
            .or(invocation.method.as_deref())
            .filter(|m| !m.is_empty())
            .unwrap_or("GET")
            .to_uppercase();
        let method = parse_method(&method_label)
            .ok_or_else(|| ClientError::UnsupportedMethod(method_label.clone()))?;

        // Only the statically configured label is honoured, even if the invocation carries one.
        let content_format = config.content_format;
        let payload = match &invocation.payload {
            Some(payload) => content_format.encode(payload)?,
            None => None,
        }
        .filter(|body| !body.is_empty());

        let descriptor = Self {
            uri,
            host,
            port,
            path,
            query,
            method,
            content_format,
            observe: config.observe,
            payload,
        };
        debug!(
            "Resolved {} {} (observe={})",
            method_name(descriptor.method),
            descriptor.uri,
            descriptor.observe
        );
        Ok(descriptor)
    }

    /// Builds the Confirmable request packet for this descriptor.
    pub fn to_packet(&self, message_id: u16, token: Vec<u8>) -> Packet {
        let mut packet = Packet::new();
        packet.header.set_version(1);
        packet.header.set_type(MessageType::Confirmable);
        packet.header.code = MessageClass::Request(self.method);
        packet.header.message_id = message_id;
        packet.set_token(token);
        for segment in path_segments(&self.uri) {
            packet.add_option(CoapOption::UriPath, segment.into_bytes());
        }
        if let Some(query) = self.uri.query() {
            for part in query.split('&').filter(|s| !s.is_empty()) {
                packet.add_option(CoapOption::UriQuery, decode_component(part).into_bytes());
            }
        }
        if let Some(format) = self.content_format.to_content_format() {
            packet.set_content_format(format);
        }
        if self.observe {
            // Observe register per RFC 7641.
            packet.set_observe_value(0);
        }
        if let Some(body) = &self.payload {
            packet.payload = body.clone();
        }
        packet
    }
}

fn synthesize_uri(destination: &str, port: u16, path: &str) -> Result<String, ClientError> {
    let host = destination
        .strip_prefix("coap://")
        .unwrap_or(destination)
        .trim_end_matches('/');
    let host = if host.parse::<Ipv6Addr>().is_ok() {
        format!("[{host}]")
    } else if is_scoped_ipv6(host) {
        return Err(ClientError::InvalidUrl {
            url: destination.to_string(),
            reason: "IPv6 zone identifiers are not supported".to_string(),
        });
    } else {
        host.to_string()
    };
    let separator = if path.starts_with('/') { "" } else { "/" };
    Ok(format!("coap://{host}:{port}{separator}{path}"))
}

/// `fe80::1%eth0`, bracketed or not.
fn is_scoped_ipv6(host: &str) -> bool {
    let host = host.trim_start_matches('[').trim_end_matches(']');
    host.split_once('%')
        .map_or(false, |(addr, _)| addr.parse::<Ipv6Addr>().is_ok())
}

fn path_segments(uri: &Url) -> Vec<String> {
    uri.path_segments()
        .into_iter()
        .flatten()
        .filter(|s| !s.is_empty())
        .map(decode_component)
        .collect()
}

fn decode_component(encoded: &str) -> String {
    percent_decode_str(encoded).decode_utf8_lossy().into_owned()
}

fn parse_uri(raw: &str) -> Result<Url, ClientError> {
    let with_scheme = if raw.contains("://") {
        raw.to_string()
    } else {
        format!("coap://{raw}")
    };
    let uri = Url::parse(&with_scheme).map_err(|e| ClientError::InvalidUrl {
        url: raw.to_string(),
        reason: e.to_string(),
    })?;
    if uri.scheme() != COAP_SCHEME {
        return Err(ClientError::InvalidUrl {
            url: raw.to_string(),
            reason: format!("unsupported scheme {}", uri.scheme()),
        });
    }
    Ok(uri)
}

#[cfg(test)]
mod tests {
    use coap_lite::{CoapOption, MessageType, RequestType};
    use serde_json::json;

    use crate::client::descriptor::{RequestConfig, RequestDescriptor};
    use crate::client::message::Invocation;
    use crate::client::ClientError;
    use crate::codec::ContentFormatLabel;

    fn json_config() -> RequestConfig {
        RequestConfig::default().content_format(ContentFormatLabel::ApplicationJson)
    }

    #[test]
    fn test_ipv6_destination() {
        let invocation = Invocation::to("2001:db8::1", "temp").payload(json!({"v": 1}));
        let descriptor = RequestDescriptor::resolve(&json_config(), &invocation).unwrap();

        assert_eq!(descriptor.host, "[2001:db8::1]");
        assert_eq!(descriptor.port, 5683);
        assert_eq!(descriptor.path, "/temp");
        assert_eq!(descriptor.method, RequestType::Get);
        assert_eq!(descriptor.payload.as_deref(), Some(&b"{\"v\":1}"[..]));
        assert!(!descriptor.observe);
    }

    #[test]
    fn test_ipv4_and_hostname_are_not_bracketed() {
        let descriptor =
            RequestDescriptor::resolve(&json_config(), &Invocation::to("10.1.2.3", "/a/b"))
                .unwrap();
        assert_eq!(descriptor.host, "10.1.2.3");
        assert_eq!(descriptor.path, "/a/b");

        let config = json_config().port(5690);
        let descriptor =
            RequestDescriptor::resolve(&config, &Invocation::to("coap://sensor.local", "x"))
                .unwrap();
        assert_eq!(descriptor.host, "sensor.local");
        assert_eq!(descriptor.port, 5690);
    }

    #[test]
    fn test_path_options_are_decoded() {
        let invocation = Invocation::to("::1", "temp sensor/ü");
        let descriptor = RequestDescriptor::resolve(&json_config(), &invocation).unwrap();
        assert_eq!(descriptor.path, "/temp sensor/ü");

        let packet = descriptor.to_packet(1, vec![]);
        let segments: Vec<_> = packet
            .get_option(CoapOption::UriPath)
            .unwrap()
            .iter()
            .cloned()
            .collect();
        assert_eq!(
            segments,
            vec![b"temp sensor".to_vec(), "ü".as_bytes().to_vec()]
        );

        let invocation = Invocation::for_url("coap://localhost/a%2Fb?name=caf%C3%A9");
        let descriptor = RequestDescriptor::resolve(&json_config(), &invocation).unwrap();
        assert_eq!(descriptor.query.as_deref(), Some("name=café"));
        let packet = descriptor.to_packet(1, vec![]);
        let path = packet.get_option(CoapOption::UriPath).unwrap();
        assert_eq!(path.len(), 1);
        assert_eq!(path.front().unwrap(), b"a/b");
        let query = packet.get_option(CoapOption::UriQuery).unwrap();
        assert_eq!(query.front().unwrap(), "name=café".as_bytes());
    }

    #[test]
    fn test_zone_scoped_destination_is_refused() {
        let result =
            RequestDescriptor::resolve(&json_config(), &Invocation::to("fe80::1%eth0", "temp"));
        assert!(matches!(
            result,
            Err(ClientError::InvalidUrl { reason, .. }) if reason.contains("zone")
        ));
    }

    #[test]
    fn test_url_fallback_order() {
        let invocation = Invocation::for_url("coap://[::1]:5700/from-invocation?a=1");
        let descriptor = RequestDescriptor::resolve(&json_config(), &invocation).unwrap();
        assert_eq!(descriptor.host, "[::1]");
        assert_eq!(descriptor.port, 5700);
        assert_eq!(descriptor.path, "/from-invocation");
        assert_eq!(descriptor.query.as_deref(), Some("a=1"));

        let config = json_config().url("coap://127.0.0.1/from-config");
        let descriptor = RequestDescriptor::resolve(&config, &invocation).unwrap();
        assert_eq!(descriptor.path, "/from-config");

        // A destination without a path does not override the URL.
        let invocation = Invocation {
            destination: Some("10.0.0.1".to_string()),
            ..invocation
        };
        let descriptor = RequestDescriptor::resolve(&config, &invocation).unwrap();
        assert_eq!(descriptor.host, "127.0.0.1");

        assert!(matches!(
            RequestDescriptor::resolve(&json_config(), &Invocation::default()),
            Err(ClientError::MissingUrl)
        ));
    }

    #[test]
    fn test_method_resolution() {
        let invocation = Invocation::for_url("coap://localhost/x").method("put");
        let descriptor = RequestDescriptor::resolve(&json_config(), &invocation).unwrap();
        assert_eq!(descriptor.method, RequestType::Put);

        let config = json_config().method("post");
        let descriptor = RequestDescriptor::resolve(&config, &invocation).unwrap();
        assert_eq!(descriptor.method, RequestType::Post);

        let invocation = Invocation::for_url("coap://localhost/x").method("brew");
        assert!(matches!(
            RequestDescriptor::resolve(&json_config(), &invocation),
            Err(ClientError::UnsupportedMethod(m)) if m == "BREW"
        ));
    }

    #[test]
    fn test_body_only_attached_when_encoded() {
        let invocation = Invocation::for_url("coap://localhost/x").payload("");
        let config = RequestConfig::default().content_format(ContentFormatLabel::TextPlain);
        let descriptor = RequestDescriptor::resolve(&config, &invocation).unwrap();
        assert_eq!(descriptor.payload, None);

        let invocation = Invocation::for_url("coap://localhost/x").payload(json!({"v": 1}));
        let descriptor = RequestDescriptor::resolve(&RequestConfig::default(), &invocation).unwrap();
        assert_eq!(descriptor.payload, None);
    }

    #[test]
    fn test_to_packet() {
        let config = json_config().observe(true);
        let invocation = Invocation::for_url("coap://localhost/a/b?x=1&y=2").payload(json!(3));
        let descriptor = RequestDescriptor::resolve(&config, &invocation).unwrap();
        let packet = descriptor.to_packet(42, vec![9, 9]);

        assert_eq!(packet.header.get_type(), MessageType::Confirmable);
        assert_eq!(packet.header.message_id, 42);
        assert_eq!(packet.get_token(), &[9, 9]);
        let segments: Vec<_> = packet
            .get_option(CoapOption::UriPath)
            .unwrap()
            .iter()
            .cloned()
            .collect();
        assert_eq!(segments, vec![b"a".to_vec(), b"b".to_vec()]);
        assert_eq!(packet.get_option(CoapOption::UriQuery).unwrap().len(), 2);
        assert_eq!(packet.get_observe_value().unwrap().unwrap(), 0);
        assert_eq!(packet.payload, b"3");
    }

    #[test]
    fn test_config_from_json() {
        let config: RequestConfig = serde_json::from_value(json!({
            "url": "coap://[::1]/temp",
            "observe": true,
            "content-format": "application/cbor",
            "raw-buffer": false,
            "cborErrors": "propagate"
        }))
        .unwrap();
        assert!(config.observe);
        assert_eq!(config.content_format, ContentFormatLabel::ApplicationCbor);
        assert_eq!(config.port, 5683);
    }
}
