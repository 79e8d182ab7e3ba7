use std::fmt::Debug;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use coap_lite::{CoapRequest, MessageClass, MessageType, Packet, ResponseType};
use futures::Stream;
use log::{debug, error, warn};
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::RwLock;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::packet_handler::PacketHandler;
use crate::router::coap_utils::new_pong_message;
use crate::router::method::method_name;
use crate::router::registry::{MatchResult, ResourceRegistry};
use crate::router::{Request, ResponseWriter};
use crate::timing::TimingProfile;

/// Routes inbound requests to the handlers bound in a shared [`ResourceRegistry`], answering
/// 4.04 and 4.05 itself when nothing matches.
pub struct Dispatcher<Endpoint> {
    registry: Arc<RwLock<ResourceRegistry<Endpoint>>>,
    piggyback_reply_delay: Duration,
    max_packet_size: usize,
}

impl<Endpoint> Clone for Dispatcher<Endpoint> {
    fn clone(&self) -> Self {
        Self {
            registry: self.registry.clone(),
            piggyback_reply_delay: self.piggyback_reply_delay,
            max_packet_size: self.max_packet_size,
        }
    }
}

impl<Endpoint: Debug + Clone + Send + Sync + 'static> PacketHandler<Endpoint>
    for Dispatcher<Endpoint>
{
    fn handle<'a>(
        &'a self,
        packet: Packet,
        peer: Endpoint,
    ) -> Pin<Box<dyn Stream<Item = Packet> + Send + 'a>> {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();

        // The stream ends once every ResponseWriter for this exchange has been finalized or
        // dropped, as they own the remaining senders.
        tokio::spawn({
            let cloned_self = self.clone();
            async move {
                cloned_self.handle_packet(tx, packet, peer).await;
            }
        });
        Box::pin(UnboundedReceiverStream::new(rx))
    }
}

impl<Endpoint: Debug + Clone + Send + Sync + 'static> Dispatcher<Endpoint> {
    pub fn new(registry: Arc<RwLock<ResourceRegistry<Endpoint>>>, timing: &TimingProfile) -> Self {
        Self {
            registry,
            piggyback_reply_delay: timing.piggyback_reply_delay(),
            max_packet_size: timing.max_packet_size(),
        }
    }

    async fn handle_packet(&self, tx: UnboundedSender<Packet>, packet: Packet, peer: Endpoint) {
        match packet.header.code {
            MessageClass::Request(_) => {
                self.handle_request(tx, packet, peer).await;
            }
            MessageClass::Response(_) => {
                warn!("Spurious response message from {peer:?}, ignoring...");
            }
            MessageClass::Empty => match packet.header.get_type() {
                MessageType::Confirmable => {
                    // A common way in CoAP to trigger a cheap "ping" to make sure
                    // the server is alive.
                    let _ = tx.send(new_pong_message(&packet));
                }
                t => {
                    debug!("Ignoring empty {t:?} from {peer:?}");
                }
            },
            code => {
                warn!("Unhandled message code {code} from {peer:?}, ignoring...");
            }
        }
    }

    async fn handle_request(&self, tx: UnboundedSender<Packet>, packet: Packet, peer: Endpoint) {
        let confirmable = packet.header.get_type() == MessageType::Confirmable;
        let request = CoapRequest::from_packet(packet, peer);
        let Some(response) = ResponseWriter::for_request(&request, tx, self.max_packet_size) else {
            return;
        };

        let paths = match request.get_path_as_vec() {
            Ok(paths) => paths,
            Err(e) => {
                debug!("Rejecting request with unreadable Uri-Path: {e:?}");
                Self::reject(response, ResponseType::BadRequest).await;
                return;
            }
        };

        let method = *request.get_method();
        let resource = self.registry.read().await.lookup(&paths, method);
        if log::log_enabled!(log::Level::Debug) {
            let peer = &request.source;
            let method = method_name(method);
            let path = request.get_path();
            let handler_label = match &resource {
                MatchResult::NoPathMatch => ": <no resource>!".to_string(),
                MatchResult::PathMatchNoMethodMatch => ": <method not allowed>!".to_string(),
                MatchResult::Matched(handlers) => format!(": matched {} handler(s)", handlers.len()),
            };
            debug!("Received from [{peer:?}]: {method} /{path}{handler_label}");
        }

        match resource {
            MatchResult::NoPathMatch => Self::reject(response, ResponseType::NotFound).await,
            MatchResult::PathMatchNoMethodMatch => {
                Self::reject(response, ResponseType::MethodNotAllowed).await
            }
            MatchResult::Matched(handlers) => {
                let request = Request::new(request);
                for handler in handlers {
                    let request = request.clone();
                    let response = response.clone();
                    tokio::spawn(async move {
                        handler.handle(request, response).await;
                    });
                }
                if confirmable {
                    let delay = self.piggyback_reply_delay;
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        response.acknowledge_if_pending().await;
                    });
                }
            }
        }
    }

    async fn reject(response: ResponseWriter, status: ResponseType) {
        let result = async {
            response.set_status(status).await?;
            response.end().await
        }
        .await;
        if let Err(e) = result {
            error!("Failed to finalize {status:?} response: {e}");
        }
    }
}
