use std::sync::Arc;

use coap_lite::{
    CoapRequest, CoapResponse, ContentFormat, MessageClass, MessageType, Packet, RequestType,
    ResponseType,
};
use log::{debug, warn};
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::Mutex;

use crate::router::coap_utils::new_empty_ack;

/// Inbound request as delivered to a [`crate::router::RequestHandler`].
#[derive(Debug, Clone)]
pub struct Request<Endpoint> {
    pub original: CoapRequest<Endpoint>,
}

impl<Endpoint> Request<Endpoint> {
    pub fn new(original: CoapRequest<Endpoint>) -> Self {
        Self { original }
    }

    /// Normalized path, always beginning with `/`.
    pub fn path(&self) -> String {
        format!("/{}", self.original.get_path())
    }

    pub fn method(&self) -> RequestType {
        *self.original.get_method()
    }

    pub fn payload(&self) -> &[u8] {
        &self.original.message.payload
    }

    pub fn peer(&self) -> Option<&Endpoint> {
        self.original.source.as_ref()
    }

    pub fn content_format(&self) -> Option<ContentFormat> {
        self.original.message.get_content_format()
    }
}

/// Write side of one exchange.  Clones share state so that a response can be finalized at most
/// once no matter how many handlers were handed a copy.
#[derive(Clone)]
pub struct ResponseWriter {
    inner: Arc<Mutex<ExchangeState>>,
}

struct ExchangeState {
    response: CoapResponse,
    packet_tx: Option<UnboundedSender<Packet>>,
    finalized: bool,
    /// Set once an empty ACK has been sent ahead of the real response.
    separate: bool,
    max_packet_size: usize,
}

impl ResponseWriter {
    /// Prepares the response half of `request`.  Returns `None` for messages that cannot be
    /// answered (anything other than Confirmable or Non-confirmable).
    pub fn for_request<Endpoint>(
        request: &CoapRequest<Endpoint>,
        packet_tx: UnboundedSender<Packet>,
        max_packet_size: usize,
    ) -> Option<Self> {
        let mut response = request.response.clone()?;
        response.message.payload = Vec::new();
        let default_code = match request.get_method() {
            RequestType::Get => ResponseType::Content,
            RequestType::Post => ResponseType::Created,
            RequestType::Put => ResponseType::Changed,
            RequestType::Delete => ResponseType::Deleted,
            _ => ResponseType::Content,
        };
        response.set_status(default_code);
        let state = ExchangeState {
            response,
            packet_tx: Some(packet_tx),
            finalized: false,
            separate: false,
            max_packet_size,
        };
        Some(Self {
            inner: Arc::new(Mutex::new(state)),
        })
    }

    pub async fn set_status(&self, status: ResponseType) -> Result<(), ExchangeError> {
        let mut state = self.writable().await?;
        state.response.set_status(status);
        Ok(())
    }

    pub async fn set_payload(&self, payload: impl Into<Vec<u8>>) -> Result<(), ExchangeError> {
        let mut state = self.writable().await?;
        state.response.message.payload = payload.into();
        Ok(())
    }

    pub async fn set_content_format(&self, format: ContentFormat) -> Result<(), ExchangeError> {
        let mut state = self.writable().await?;
        state.response.message.set_content_format(format);
        Ok(())
    }

    pub async fn status(&self) -> ResponseType {
        *self.inner.lock().await.response.get_status()
    }

    pub async fn is_finalized(&self) -> bool {
        self.inner.lock().await.finalized
    }

    /// Finalize the exchange, delivering whatever status and body were written so far.  Only
    /// the first call succeeds.
    pub async fn end(&self) -> Result<(), ExchangeError> {
        let mut state = self.inner.lock().await;
        if state.finalized {
            return Err(ExchangeError::AlreadyFinalized);
        }
        state.finalized = true;
        let packet_tx = state.packet_tx.take().ok_or(ExchangeError::ChannelClosed)?;

        let mut packet = state.response.message.clone();
        if state.separate {
            packet.header.set_type(MessageType::NonConfirmable);
            packet.header.message_id = rand::random();
        }
        let encoded_len = packet
            .to_bytes()
            .map_err(|e| ExchangeError::Malformed(format!("{e:?}")))?
            .len();
        if encoded_len > state.max_packet_size {
            warn!(
                "Response of {encoded_len} bytes exceeds max packet size {}, replacing with 5.00",
                state.max_packet_size
            );
            packet.payload.clear();
            packet.clear_option(coap_lite::CoapOption::ContentFormat);
            packet.header.code = MessageClass::Response(ResponseType::InternalServerError);
        }
        packet_tx
            .send(packet)
            .map_err(|_| ExchangeError::ChannelClosed)
    }

    /// Sends an empty ACK if the exchange is a Confirmable one that has not been answered yet,
    /// switching the eventual response to a separate message.
    pub(crate) async fn acknowledge_if_pending(&self) -> bool {
        let mut state = self.inner.lock().await;
        if state.finalized || state.separate {
            return false;
        }
        if state.response.message.header.get_type() != MessageType::Acknowledgement {
            return false;
        }
        let Some(packet_tx) = state.packet_tx.as_ref() else {
            return false;
        };
        let message_id = state.response.message.header.message_id;
        if packet_tx.send(new_empty_ack(message_id)).is_err() {
            return false;
        }
        debug!("Handler is slow, acknowledged message ID {message_id} ahead of its response");
        state.separate = true;
        true
    }

    async fn writable(&self) -> Result<tokio::sync::MutexGuard<'_, ExchangeState>, ExchangeError> {
        let state = self.inner.lock().await;
        if state.finalized {
            return Err(ExchangeError::AlreadyFinalized);
        }
        Ok(state)
    }
}

impl Drop for ExchangeState {
    fn drop(&mut self) {
        if !self.finalized {
            warn!(
                "Exchange for message ID {} dropped without being finalized",
                self.response.message.header.message_id
            );
        }
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ExchangeError {
    #[error("exchange was already finalized")]
    AlreadyFinalized,

    #[error("peer stream is closed")]
    ChannelClosed,

    #[error("response could not be encoded: {0}")]
    Malformed(String),
}
