use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use bytes::BytesMut;
use coap_lite::error::MessageError;
use coap_lite::Packet;
use futures::{Sink, Stream};
use log::debug;
use pin_project::pin_project;
use tokio::net::{ToSocketAddrs, UdpSocket};
use tokio_util::codec::{Decoder, Encoder};
use tokio_util::udp::UdpFramed;

use crate::transport::{BoxedFramedBinding, FramedBinding, Transport, TransportError};

/// Default CoAP transport as originally defined in RFC 7252.
pub struct UdpTransport<A: ToSocketAddrs> {
    addresses: A,
    mtu: Option<u32>,
}

impl<A: ToSocketAddrs> UdpTransport<A> {
    pub fn new(addresses: A) -> Self {
        Self {
            addresses,
            mtu: None,
        }
    }

    /// Manually set the MTU, used to bound the size of responses the router will emit.
    pub fn set_mtu(mut self, mtu: u32) -> Self {
        self.mtu = Some(mtu);
        self
    }
}

#[async_trait]
impl<A: ToSocketAddrs + Sync + Send> Transport for UdpTransport<A> {
    type Endpoint = SocketAddr;

    async fn bind(self) -> Result<BoxedFramedBinding<Self::Endpoint>, TransportError> {
        let socket = UdpSocket::bind(self.addresses).await?;
        let local_addr = socket.local_addr()?;
        debug!("Bound UDP socket on {local_addr}");
        let framed_socket = UdpFramed::new(socket, Codec::default());
        let binding = UdpBinding {
            framed_socket,
            local_addr,
            mtu: self.mtu,
        };
        Ok(Box::pin(binding))
    }
}

#[pin_project]
struct UdpBinding {
    #[pin]
    framed_socket: UdpFramed<Codec>,
    local_addr: SocketAddr,
    mtu: Option<u32>,
}

impl FramedBinding<SocketAddr> for UdpBinding {
    fn mtu(&self) -> Option<u32> {
        self.mtu
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        Some(self.local_addr)
    }
}

impl Stream for UdpBinding {
    type Item = Result<(Packet, SocketAddr), (TransportError, Option<SocketAddr>)>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.project()
            .framed_socket
            .poll_next(cx)
            .map(|item| item.map(into_framed_result))
    }
}

/// Malformed datagrams are still attributed to their sender so that the server can treat them
/// as a per-peer problem rather than a failure of the whole socket.
fn into_framed_result(
    item: Result<(Result<Packet, MessageError>, SocketAddr), TransportError>,
) -> Result<(Packet, SocketAddr), (TransportError, Option<SocketAddr>)> {
    match item {
        Ok((Ok(packet), peer)) => Ok((packet, peer)),
        Ok((Err(e), peer)) => Err((e.into(), Some(peer))),
        Err(e) => Err((e, None)),
    }
}

impl Sink<(Packet, SocketAddr)> for UdpBinding {
    type Error = TransportError;

    fn poll_ready(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.project().framed_socket.poll_ready(cx)
    }

    fn start_send(self: Pin<&mut Self>, item: (Packet, SocketAddr)) -> Result<(), Self::Error> {
        self.project().framed_socket.start_send(item)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.project().framed_socket.poll_flush(cx)
    }

    fn poll_close(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.project().framed_socket.poll_close(cx)
    }
}

#[derive(Default)]
struct Codec;

impl Decoder for Codec {
    type Item = Result<Packet, MessageError>;
    type Error = TransportError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, TransportError> {
        if buf.is_empty() {
            return Ok(None);
        }
        let result = Packet::from_bytes(buf);
        buf.clear();
        Ok(Some(result))
    }
}

impl Encoder<Packet> for Codec {
    type Error = TransportError;

    fn encode(&mut self, my_packet: Packet, buf: &mut BytesMut) -> Result<(), TransportError> {
        buf.extend_from_slice(&my_packet.to_bytes()?[..]);
        Ok(())
    }
}
