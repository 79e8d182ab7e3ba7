use std::sync::Arc;

use coap_lite::{MessageClass, Packet};
use log::{debug, warn};
use tokio::sync::{mpsc, Mutex};
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::client::descriptor::{RequestConfig, RequestDescriptor};
use crate::client::message::{Invocation, OutputMessage, ResponseHeaders};
use crate::client::transport::{ClientTransport, Observation, ResponseEvent};
use crate::client::ClientError;
use crate::codec::{CborErrorPolicy, CodecError};
use crate::transport::TransportError;

/// Messages produced for one invocation, in the order the responses arrived.
pub type OutputStream = UnboundedReceiverStream<Result<OutputMessage, ClientError>>;

/// Turns invocations into CoAP requests and their responses into [`OutputMessage`]s.
///
/// A builder holds at most one open observation.  Any new request closes the previous
/// observation before it is issued.
pub struct RequestBuilder<T> {
    config: RequestConfig,
    transport: Arc<T>,
    observation: Arc<Mutex<Option<Observation>>>,
}

impl<T> Clone for RequestBuilder<T> {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            transport: self.transport.clone(),
            observation: self.observation.clone(),
        }
    }
}

impl<T: ClientTransport> RequestBuilder<T> {
    pub fn new(config: RequestConfig, transport: T) -> Self {
        Self {
            config,
            transport: Arc::new(transport),
            observation: Arc::new(Mutex::new(None)),
        }
    }

    pub fn config(&self) -> &RequestConfig {
        &self.config
    }

    /// Issue the request described by `invocation`.  Resolution and encoding problems are
    /// returned directly; everything that happens on the wire arrives through the stream.
    pub async fn send(&self, invocation: Invocation) -> Result<OutputStream, ClientError> {
        let descriptor = RequestDescriptor::resolve(&self.config, &invocation)?;
        let observe = descriptor.observe;

        if let Some(previous) = self.observation.lock().await.take() {
            debug!("Closing previous observation before issuing a new request");
            previous.close();
        }

        // The lock is not held while sending; name resolution may take a while.
        let (output_tx, output_rx) = mpsc::unbounded_channel();
        match self.transport.send_request(descriptor).await {
            Ok(handle) => {
                if observe {
                    let replaced = self.observation.lock().await.replace(handle.observation);
                    if let Some(stale) = replaced {
                        debug!("Closing observation issued concurrently on this builder");
                        stale.close();
                    }
                }
                let relay = ResponseRelay {
                    invocation,
                    config: self.config.clone(),
                    output_tx,
                };
                tokio::spawn(relay.run(handle.events));
            }
            Err(e) => {
                warn!("Request could not be sent: {e}");
                let _ = output_tx.send(Ok(OutputMessage::transport_failure(invocation, &e)));
            }
        }
        Ok(UnboundedReceiverStream::new(output_rx))
    }

    /// Close the held observation, if any.  Returns whether there was one.
    pub async fn close_observation(&self) -> bool {
        match self.observation.lock().await.take() {
            Some(observation) => {
                observation.close();
                true
            }
            None => false,
        }
    }

    pub async fn has_observation(&self) -> bool {
        self.observation
            .lock()
            .await
            .as_ref()
            .map_or(false, |o| !o.is_finished())
    }
}

struct ResponseRelay {
    invocation: Invocation,
    config: RequestConfig,
    output_tx: mpsc::UnboundedSender<Result<OutputMessage, ClientError>>,
}

impl ResponseRelay {
    async fn run(self, mut events: mpsc::UnboundedReceiver<ResponseEvent>) {
        while let Some(event) = events.recv().await {
            let result = match event {
                ResponseEvent::Response(packet) => self.on_response(packet),
                ResponseEvent::Error(e) => {
                    self.on_error(e);
                    return;
                }
            };
            if result.is_err() {
                debug!("Output stream dropped, no longer relaying responses");
                return;
            }
        }
    }

    fn on_response(&self, packet: Packet) -> Result<(), ()> {
        let MessageClass::Response(status_code) = packet.header.code else {
            debug!("Ignoring non-response packet {:?}", packet.header.code);
            return Ok(());
        };
        if packet.payload.is_empty() {
            return Ok(());
        }
        let headers = ResponseHeaders::from_packet(&packet);
        let decoded = headers
            .content_format
            .decode(&packet.payload, &self.config.decode_options());
        let item = match decoded {
            Ok(payload) => Ok(OutputMessage {
                invocation: self.invocation.clone(),
                payload,
                headers,
                status_code,
            }),
            Err(CodecError::Cbor(e)) if self.config.cbor_errors == CborErrorPolicy::Drop => {
                debug!("Dropping response with undecodable CBOR body: {e}");
                return Ok(());
            }
            Err(e) => Err(ClientError::Codec(e)),
        };
        self.output_tx.send(item).map_err(|_| ())
    }

    fn on_error(&self, error: TransportError) {
        warn!("Transport error, reporting as timeout: {error}");
        let message = OutputMessage::transport_failure(self.invocation.clone(), &error);
        let _ = self.output_tx.send(Ok(message));
    }
}
