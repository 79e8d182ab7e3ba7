use std::pin::Pin;

use coap_lite::Packet;
use futures::Stream;

/// "Low-level" raw packet handler.  Informs the implementation that a packet has arrived and
/// lets it deliver an arbitrary number of packets back to the same peer.  The router's
/// [`crate::router::Dispatcher`] is the implementation used by [`crate::CoapEndpoint`].
pub trait PacketHandler<Endpoint>: Clone {
    fn handle<'a>(
        &'a self,
        packet: Packet,
        peer: Endpoint,
    ) -> Pin<Box<dyn Stream<Item = Packet> + Send + 'a>>;
}

pub trait IntoHandler<Handler, Endpoint>
where
    Handler: PacketHandler<Endpoint> + Send + 'static,
{
    fn into_handler(self, mtu: Option<u32>) -> Handler;
}

impl<Handler, Endpoint> IntoHandler<Handler, Endpoint> for Handler
where
    Handler: PacketHandler<Endpoint> + Send + 'static,
{
    fn into_handler(self, _mtu: Option<u32>) -> Handler {
        self
    }
}
