use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use async_trait::async_trait;
use coap_lite::{MessageClass, MessageType, Packet};
use log::{debug, trace, warn};
use rand::Rng;
use tokio::net::{lookup_host, UdpSocket};
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{self, Instant};

use crate::client::descriptor::RequestDescriptor;
use crate::client::transport::{ClientTransport, Observation, RequestHandle, ResponseEvent};
use crate::router::coap_utils::new_empty_ack;
use crate::timing::TimingProfile;
use crate::transport::TransportError;

/// Sends each request from its own ephemeral UDP socket, applying the ack timeout and
/// exponential backoff of the [`TimingProfile`] to the Confirmable request.
#[derive(Debug, Clone, Default)]
pub struct UdpClientTransport {
    timing: TimingProfile,
}

impl UdpClientTransport {
    pub fn new(timing: TimingProfile) -> Self {
        Self { timing }
    }

    pub fn timing(&self) -> &TimingProfile {
        &self.timing
    }
}

#[async_trait]
impl ClientTransport for UdpClientTransport {
    async fn send_request(
        &self,
        request: RequestDescriptor,
    ) -> Result<RequestHandle, TransportError> {
        let peer = resolve_peer(&request).await?;
        let local: SocketAddr = match peer {
            SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
            SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
        };
        let socket = UdpSocket::bind(local).await?;
        socket.connect(peer).await?;

        let (message_id, token) = {
            let mut rng = rand::thread_rng();
            (rng.gen::<u16>(), rng.gen::<[u8; 4]>().to_vec())
        };
        let packet = request.to_packet(message_id, token);

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (observation, close_rx) = Observation::new();
        let exchange = ClientExchange {
            socket,
            peer,
            request: packet,
            observe: request.observe,
            timing: self.timing,
            events_tx,
            recv_buffer: vec![0u8; self.timing.max_packet_size()],
        };
        tokio::spawn(exchange.run(close_rx));

        Ok(RequestHandle {
            events: events_rx,
            observation,
        })
    }
}

async fn resolve_peer(request: &RequestDescriptor) -> Result<SocketAddr, TransportError> {
    let host = request.host.trim_start_matches('[').trim_end_matches(']');
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, request.port));
    }
    lookup_host((host, request.port))
        .await?
        .next()
        .ok_or_else(|| TransportError::Unresolved(request.host.clone()))
}

/// One request/response exchange (or observation) driven to completion on its own task.
struct ClientExchange {
    socket: UdpSocket,
    peer: SocketAddr,
    request: Packet,
    observe: bool,
    timing: TimingProfile,
    events_tx: UnboundedSender<ResponseEvent>,
    recv_buffer: Vec<u8>,
}

impl ClientExchange {
    async fn run(mut self, close_rx: oneshot::Receiver<()>) {
        if let Err(e) = self.drive(close_rx).await {
            debug!("Request to {} failed: {e}", self.peer);
            let _ = self.events_tx.send(ResponseEvent::Error(e));
        }
    }

    async fn drive(&mut self, close_rx: oneshot::Receiver<()>) -> Result<(), TransportError> {
        let response = match self.send_reliably().await? {
            Some(response) => response,
            None => self.await_separate_response().await?,
        };
        let keep_observing = self.observe
            && response.get_observe_value().is_some()
            && is_success(response.header.code);
        if !self.deliver(response) {
            if keep_observing {
                self.deregister().await;
            }
            return Ok(());
        }
        if keep_observing {
            self.observe_until_closed(close_rx).await?;
        }
        Ok(())
    }

    /// Sends the Confirmable request until it is acknowledged, reset, or the retransmission
    /// budget runs out.  Yields the response if it was piggybacked on the ACK.
    async fn send_reliably(&mut self) -> Result<Option<Packet>, TransportError> {
        let bytes = self.request.to_bytes()?;
        let message_id = self.request.header.message_id;
        let max_retransmit = self.timing.max_retransmit();
        let mut next_timeout = rand::thread_rng().gen_range(self.timing.ack_timeout_range());
        for attempt in 0..=max_retransmit {
            if attempt > 0 {
                let peer = &self.peer;
                debug!("Attempting retransmission #{attempt} of message ID {message_id} to {peer}");
            }
            self.socket.send(&bytes).await?;
            let deadline = Instant::now() + next_timeout;
            next_timeout *= 2;
            loop {
                let packet =
                    match time::timeout_at(deadline, recv_packet(&self.socket, &mut self.recv_buffer))
                        .await
                    {
                        Ok(packet) => packet?,
                        Err(_) => break,
                    };
                match packet.header.get_type() {
                    MessageType::Acknowledgement if packet.header.message_id == message_id => {
                        if packet.header.code == MessageClass::Empty {
                            trace!("Empty ACK for {message_id}, awaiting separate response");
                            return Ok(None);
                        }
                        if self.is_our_response(&packet) {
                            return Ok(Some(packet));
                        }
                    }
                    MessageType::Reset if packet.header.message_id == message_id => {
                        return Err(TransportError::Reset);
                    }
                    MessageType::Confirmable | MessageType::NonConfirmable
                        if self.is_our_response(&packet) =>
                    {
                        // Our ACK was lost but the response made it.
                        self.acknowledge(&packet).await?;
                        return Ok(Some(packet));
                    }
                    _ => {}
                }
                trace!("Ignoring unrelated packet from {}", self.peer);
            }
        }
        Err(TransportError::NoReply(max_retransmit + 1))
    }

    async fn await_separate_response(&mut self) -> Result<Packet, TransportError> {
        let max_latency = self.timing.max_latency();
        let deadline = Instant::now() + max_latency;
        loop {
            let packet = time::timeout_at(deadline, recv_packet(&self.socket, &mut self.recv_buffer))
                .await
                .map_err(|_| TransportError::ResponseTimeout(max_latency))??;
            if self.is_our_response(&packet) && packet.header.get_type() != MessageType::Acknowledgement
            {
                self.acknowledge(&packet).await?;
                return Ok(packet);
            }
            trace!("Ignoring unrelated packet from {}", self.peer);
        }
    }

    async fn observe_until_closed(
        &mut self,
        mut close_rx: oneshot::Receiver<()>,
    ) -> Result<(), TransportError> {
        loop {
            tokio::select! {
                _ = &mut close_rx => break,
                _ = self.events_tx.closed() => break,
                packet = recv_packet(&self.socket, &mut self.recv_buffer) => {
                    let packet = packet?;
                    if !self.is_our_response(&packet) {
                        trace!("Ignoring unrelated packet from {}", self.peer);
                        continue;
                    }
                    self.acknowledge(&packet).await?;
                    let last = packet.get_observe_value().is_none()
                        || !is_success(packet.header.code);
                    if !self.deliver(packet) {
                        break;
                    }
                    if last {
                        debug!("Observation of {} ended by peer", self.peer);
                        return Ok(());
                    }
                }
            }
        }
        self.deregister().await;
        Ok(())
    }

    /// Fire-and-forget deregistration; nobody waits for the peer's answer.
    async fn deregister(&self) {
        let mut packet = self.request.clone();
        packet.header.set_type(MessageType::NonConfirmable);
        packet.header.message_id = self.request.header.message_id.wrapping_add(1);
        packet.set_observe_value(1);
        let result = match packet.to_bytes() {
            Ok(bytes) => self.socket.send(&bytes).await.map(|_| ()).map_err(TransportError::from),
            Err(e) => Err(TransportError::from(e)),
        };
        match result {
            Ok(()) => debug!("Deregistered observation at {}", self.peer),
            Err(e) => warn!("Failed to deregister observation at {}: {e}", self.peer),
        }
    }

    async fn acknowledge(&self, packet: &Packet) -> Result<(), TransportError> {
        let ack_required = match packet.header.get_type() {
            MessageType::Confirmable => true,
            MessageType::NonConfirmable => self.timing.send_acks_for_non_confirmable(),
            _ => false,
        };
        if ack_required {
            let ack = new_empty_ack(packet.header.message_id);
            self.socket.send(&ack.to_bytes()?).await?;
        }
        Ok(())
    }

    fn is_our_response(&self, packet: &Packet) -> bool {
        matches!(packet.header.code, MessageClass::Response(_))
            && packet.get_token() == self.request.get_token()
    }

    fn deliver(&self, packet: Packet) -> bool {
        self.events_tx.send(ResponseEvent::Response(packet)).is_ok()
    }
}

async fn recv_packet(socket: &UdpSocket, buffer: &mut [u8]) -> Result<Packet, TransportError> {
    loop {
        let n = socket.recv(buffer).await?;
        match Packet::from_bytes(&buffer[..n]) {
            Ok(packet) => return Ok(packet),
            Err(e) => warn!("Ignoring malformed datagram: {e:?}"),
        }
    }
}

fn is_success(code: MessageClass) -> bool {
    matches!(code, MessageClass::Response(_)) && u8::from(code) >> 5 == 2
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::time::Duration;

    use coap_lite::{
        ContentFormat, MessageClass, MessageType, Packet, RequestType, ResponseType,
    };
    use tokio::net::UdpSocket;

    use crate::client::descriptor::{RequestConfig, RequestDescriptor};
    use crate::client::message::Invocation;
    use crate::client::transport::{ClientTransport, ResponseEvent};
    use crate::client::udp::UdpClientTransport;
    use crate::codec::ContentFormatLabel;
    use crate::timing::TimingProfile;
    use crate::transport::TransportError;

    async fn fake_server() -> (UdpSocket, SocketAddr) {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        (socket, addr)
    }

    fn descriptor(addr: SocketAddr, observe: bool) -> RequestDescriptor {
        let config = RequestConfig::default()
            .url(format!("coap://{addr}/sensor"))
            .content_format(ContentFormatLabel::TextPlain)
            .observe(observe);
        RequestDescriptor::resolve(&config, &Invocation::default()).unwrap()
    }

    async fn recv_from(socket: &UdpSocket) -> (Packet, SocketAddr) {
        let mut buf = [0u8; 1500];
        let (n, peer) = socket.recv_from(&mut buf).await.unwrap();
        (Packet::from_bytes(&buf[..n]).unwrap(), peer)
    }

    async fn send_to(socket: &UdpSocket, packet: &Packet, peer: SocketAddr) {
        socket
            .send_to(&packet.to_bytes().unwrap(), peer)
            .await
            .unwrap();
    }

    fn reply(
        request: &Packet,
        kind: MessageType,
        message_id: u16,
        status: ResponseType,
        body: &[u8],
    ) -> Packet {
        let mut packet = Packet::new();
        packet.header.set_type(kind);
        packet.header.message_id = message_id;
        packet.header.code = MessageClass::Response(status);
        packet.set_token(request.get_token().to_vec());
        packet.set_content_format(ContentFormat::TextPlain);
        packet.payload = body.to_vec();
        packet
    }

    #[tokio::test]
    async fn test_piggybacked_response() {
        let (server, addr) = fake_server().await;
        let transport = UdpClientTransport::default();
        let mut handle = transport.send_request(descriptor(addr, false)).await.unwrap();

        let (request, peer) = recv_from(&server).await;
        assert_eq!(request.header.get_type(), MessageType::Confirmable);
        assert_eq!(request.header.code, MessageClass::Request(RequestType::Get));
        let ack = reply(
            &request,
            MessageType::Acknowledgement,
            request.header.message_id,
            ResponseType::Content,
            b"21.5",
        );
        send_to(&server, &ack, peer).await;

        let Some(ResponseEvent::Response(response)) = handle.events.recv().await else {
            panic!("expected a response");
        };
        assert_eq!(response.payload, b"21.5");
        assert!(handle.events.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_separate_response_is_acknowledged() {
        let (server, addr) = fake_server().await;
        let transport = UdpClientTransport::default();
        let mut handle = transport.send_request(descriptor(addr, false)).await.unwrap();

        let (request, peer) = recv_from(&server).await;
        let mut empty_ack = Packet::new();
        empty_ack.header.set_type(MessageType::Acknowledgement);
        empty_ack.header.message_id = request.header.message_id;
        send_to(&server, &empty_ack, peer).await;

        let separate = reply(
            &request,
            MessageType::Confirmable,
            7000,
            ResponseType::Content,
            b"late",
        );
        send_to(&server, &separate, peer).await;

        let (ack, _) = recv_from(&server).await;
        assert_eq!(ack.header.get_type(), MessageType::Acknowledgement);
        assert_eq!(ack.header.message_id, 7000);

        let Some(ResponseEvent::Response(response)) = handle.events.recv().await else {
            panic!("expected a response");
        };
        assert_eq!(response.payload, b"late");
    }

    #[tokio::test]
    async fn test_reset_is_an_error() {
        let (server, addr) = fake_server().await;
        let transport = UdpClientTransport::default();
        let mut handle = transport.send_request(descriptor(addr, false)).await.unwrap();

        let (request, peer) = recv_from(&server).await;
        let mut reset = Packet::new();
        reset.header.set_type(MessageType::Reset);
        reset.header.message_id = request.header.message_id;
        send_to(&server, &reset, peer).await;

        assert!(matches!(
            handle.events.recv().await,
            Some(ResponseEvent::Error(TransportError::Reset))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retransmits_then_gives_up() {
        let (server, addr) = fake_server().await;
        let timing = TimingProfile::new(Duration::from_secs(1), 1.0, 2).unwrap();
        let transport = UdpClientTransport::new(timing);
        let mut handle = transport.send_request(descriptor(addr, false)).await.unwrap();

        assert!(matches!(
            handle.events.recv().await,
            Some(ResponseEvent::Error(TransportError::NoReply(3)))
        ));

        let mut attempts = Vec::new();
        let mut buf = [0u8; 1500];
        while let Ok(n) = server.try_recv(&mut buf) {
            attempts.push(Packet::from_bytes(&buf[..n]).unwrap());
        }
        assert_eq!(attempts.len(), 3);
        assert!(attempts
            .iter()
            .all(|p| p.header.message_id == attempts[0].header.message_id));
    }

    #[tokio::test]
    async fn test_observation_until_closed() {
        let (server, addr) = fake_server().await;
        let transport = UdpClientTransport::default();
        let mut handle = transport.send_request(descriptor(addr, true)).await.unwrap();

        let (request, peer) = recv_from(&server).await;
        assert_eq!(request.get_observe_value().unwrap().unwrap(), 0);

        let mut first = reply(
            &request,
            MessageType::Acknowledgement,
            request.header.message_id,
            ResponseType::Content,
            b"1",
        );
        first.set_observe_value(1);
        send_to(&server, &first, peer).await;

        let mut notification = reply(
            &request,
            MessageType::NonConfirmable,
            9000,
            ResponseType::Content,
            b"2",
        );
        notification.set_observe_value(2);
        send_to(&server, &notification, peer).await;

        for expected in [&b"1"[..], &b"2"[..]] {
            let Some(ResponseEvent::Response(response)) = handle.events.recv().await else {
                panic!("expected a notification");
            };
            assert_eq!(response.payload, expected);
        }

        // NON notifications are acknowledged by default.
        let (ack, _) = recv_from(&server).await;
        assert_eq!(ack.header.get_type(), MessageType::Acknowledgement);
        assert_eq!(ack.header.message_id, 9000);

        handle.observation.close();
        let (deregister, _) = recv_from(&server).await;
        assert_eq!(deregister.get_observe_value().unwrap().unwrap(), 1);
        assert_eq!(deregister.get_token(), request.get_token());
        assert!(handle.events.recv().await.is_none());
    }
}
