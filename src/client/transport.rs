use async_trait::async_trait;
use coap_lite::Packet;
use tokio::sync::{mpsc, oneshot};

use crate::client::descriptor::RequestDescriptor;
use crate::transport::TransportError;

/// Sending side of the CoAP transport.  Implementations own retransmission and matching of
/// responses to requests; callers only see the resulting [`ResponseEvent`]s in order.
#[async_trait]
pub trait ClientTransport: Send + Sync + 'static {
    async fn send_request(&self, request: RequestDescriptor)
        -> Result<RequestHandle, TransportError>;
}

/// In-flight request.  `events` yields every response (more than one for an observation) and
/// closes once the exchange is over.
pub struct RequestHandle {
    pub events: mpsc::UnboundedReceiver<ResponseEvent>,
    pub observation: Observation,
}

#[derive(Debug)]
pub enum ResponseEvent {
    Response(Packet),
    Error(TransportError),
}

/// Handle used to cancel an observe subscription.  Closing is fire-and-forget: nothing waits for
/// the peer to confirm.  Dropping the handle has the same effect as closing it.
#[derive(Debug)]
pub struct Observation {
    close_tx: Option<oneshot::Sender<()>>,
}

impl Observation {
    /// Creates a handle together with the receiver the transport watches for cancellation.
    pub fn new() -> (Self, oneshot::Receiver<()>) {
        let (close_tx, close_rx) = oneshot::channel();
        (
            Self {
                close_tx: Some(close_tx),
            },
            close_rx,
        )
    }

    pub fn close(mut self) {
        if let Some(close_tx) = self.close_tx.take() {
            let _ = close_tx.send(());
        }
    }

    /// True once the transport side has finished with this exchange.
    pub fn is_finished(&self) -> bool {
        self.close_tx.as_ref().map_or(true, |tx| tx.is_closed())
    }
}
