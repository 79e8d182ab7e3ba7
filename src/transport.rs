use std::fmt::Debug;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;

use async_trait::async_trait;
use coap_lite::error::MessageError;
use coap_lite::Packet;
use futures::{Sink, Stream};

/// Generalization of the listening side of the CoAP transport.  Retransmission, deduplication
/// and framing all live below this seam; the router only ever sees whole [`Packet`]s tagged with
/// the peer they came from.
#[async_trait]
pub trait Transport {
    type Endpoint: Debug + Send + Clone;

    /// Perform the binding, that is, begin accepting new data from this transport even if
    /// there isn't yet a handler serving the data source.  Failing to bind is fatal for the
    /// endpoint and is never retried here.
    async fn bind(self) -> Result<BoxedFramedBinding<Self::Endpoint>, TransportError>;
}

pub type BoxedFramedBinding<Endpoint> = Pin<Box<dyn FramedBinding<Endpoint>>>;

/// A bound socket exposed as both a stream of inbound packets and a sink of outbound packets.
pub trait FramedBinding<Endpoint>:
    Send
    + Stream<Item = Result<FramedItem<Endpoint>, FramedReadError<Endpoint>>>
    + Sink<FramedItem<Endpoint>, Error = FramedWriteError>
{
    /// Largest datagram the link is configured to carry, if known.
    fn mtu(&self) -> Option<u32>;

    /// Address actually bound, useful when binding to port 0.
    fn local_addr(&self) -> Option<SocketAddr>;
}

/// Parsed CoAP packet coming from a remote peer, as designated by `Endpoint`.
pub type FramedItem<Endpoint> = (Packet, Endpoint);

/// Error when receiving from a remote peer.  `Endpoint` is optional as there may be a generic
/// read error unrelated to any remote peer, for example if the underlying bound socket is closed.
pub type FramedReadError<Endpoint> = (TransportError, Option<Endpoint>);

/// Error when sending to a remote peer.
pub type FramedWriteError = TransportError;

/// Generalized errors indicating a range of transport-related issues such as being unable to bind,
/// malformed input, or a peer that never answered.  Most of these errors are non-fatal and the
/// endpoint can happily continue serving other peers.
#[derive(thiserror::Error, Debug)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),

    #[error("packet was malformed: {0:?}")]
    MalformedPacket(MessageError),

    #[error("could not resolve {0}")]
    Unresolved(String),

    #[error("no remote reply after {0} attempts")]
    NoReply(usize),

    #[error("no response within {0:?}")]
    ResponseTimeout(std::time::Duration),

    #[error("reset message received")]
    Reset,

    #[error("unspecified: {0}")]
    Unspecified(String),
}

impl From<MessageError> for TransportError {
    fn from(x: MessageError) -> Self {
        Self::MalformedPacket(x)
    }
}
