//! Outbound side: resolves invocations into CoAP requests, manages the single open observation
//! of a builder and turns responses back into decoded output messages.

pub use builder::{OutputStream, RequestBuilder};
pub use descriptor::{RequestConfig, RequestDescriptor};
pub use message::{Invocation, OutputMessage, ResponseHeaders};
pub use transport::{ClientTransport, Observation, RequestHandle, ResponseEvent};
pub use udp::UdpClientTransport;

use crate::codec::CodecError;

pub mod builder;
pub mod descriptor;
pub mod message;
pub mod transport;
pub mod udp;

/// Problems detected before anything reaches the wire, plus decode failures of individual
/// responses.  Transport failures are never reported through this type; they become
/// synthetic 5.04 output messages instead.
#[derive(thiserror::Error, Debug)]
pub enum ClientError {
    #[error("no URL configured and the invocation has neither url nor destination and path")]
    MissingUrl,

    #[error("invalid URL {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("unsupported method {0}")]
    UnsupportedMethod(String),

    #[error(transparent)]
    Codec(#[from] CodecError),
}
