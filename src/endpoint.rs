use std::mem;
use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use coap_lite::RequestType;
use log::{error, info};
use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, RwLock};
use tokio::task::JoinHandle;

use crate::router::{Dispatcher, RegistryError, RequestHandler, ResourceRegistry};
use crate::server::{CoapServer, FatalServerError};
use crate::timing::TimingProfile;
use crate::transport::TransportError;
use crate::udp::UdpTransport;

pub const DEFAULT_COAP_PORT: u16 = 5683;

/// Identifies one listening endpoint.  Immutable once the endpoint is created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EndpointConfig {
    pub name: String,
    pub bind_address: IpAddr,
    pub port: u16,
    #[serde(flatten)]
    pub timing: TimingProfile,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            bind_address: IpAddr::V6(Ipv6Addr::UNSPECIFIED),
            port: DEFAULT_COAP_PORT,
            timing: TimingProfile::default(),
        }
    }
}

impl EndpointConfig {
    pub fn new(name: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            port,
            ..Default::default()
        }
    }

    pub fn bind_address(mut self, address: IpAddr) -> Self {
        self.bind_address = address;
        self
    }

    pub fn timing(mut self, timing: TimingProfile) -> Self {
        self.timing = timing;
        self
    }
}

/// One CoAP listener plus the resource bindings it serves.
///
/// The endpoint moves between two states: `Stopped` (initial) and `Listening`.  Bindings may
/// be added in either state; stopping clears them all and releases the socket.
pub struct CoapEndpoint {
    config: EndpointConfig,
    registry: Arc<RwLock<ResourceRegistry<SocketAddr>>>,
    state: EndpointState,
}

enum EndpointState {
    Stopped,
    Listening {
        local_addr: SocketAddr,
        shutdown_tx: oneshot::Sender<()>,
        server_task: JoinHandle<Result<(), FatalServerError>>,
    },
}

impl CoapEndpoint {
    pub fn new(config: EndpointConfig) -> Result<Self, EndpointError> {
        config
            .timing
            .validate()
            .map_err(|e| EndpointError::InvalidConfig(format!("{e:#}")))?;
        Ok(Self {
            config,
            registry: Arc::new(RwLock::new(ResourceRegistry::new())),
            state: EndpointState::Stopped,
        })
    }

    pub fn config(&self) -> &EndpointConfig {
        &self.config
    }

    pub fn registry(&self) -> Arc<RwLock<ResourceRegistry<SocketAddr>>> {
        self.registry.clone()
    }

    /// Bind `handler` to `path` and `method`.  A second binding for the same pair is refused.
    pub async fn register(
        &self,
        path: &str,
        method: RequestType,
        handler: impl RequestHandler<SocketAddr>,
    ) -> Result<(), RegistryError> {
        self.registry.write().await.register(path, method, handler)
    }

    pub async fn unregister(&self, path: &str, method: RequestType) -> bool {
        self.registry.write().await.unregister(path, method)
    }

    /// False once the listener has died, even before [`CoapEndpoint::stop`] collects its error.
    pub fn is_listening(&self) -> bool {
        self.local_addr().is_some()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        match &self.state {
            EndpointState::Listening {
                local_addr,
                server_task,
                ..
            } if !server_task.is_finished() => Some(*local_addr),
            _ => None,
        }
    }

    /// Bind the configured port and begin serving.  Failure to bind is returned as-is and not
    /// retried.
    pub async fn start(&mut self) -> Result<SocketAddr, EndpointError> {
        if self.is_listening() {
            return Err(EndpointError::AlreadyListening);
        }
        if let EndpointState::Listening { server_task, .. } =
            mem::replace(&mut self.state, EndpointState::Stopped)
        {
            if let Ok(Err(e)) = server_task.await {
                error!("Endpoint '{}' had failed, restarting: {e}", self.config.name);
            }
        }
        let name = &self.config.name;
        let timing = &self.config.timing;
        let mtu = u32::try_from(timing.max_packet_size()).unwrap_or(u32::MAX);
        let bind_addr = SocketAddr::new(self.config.bind_address, self.config.port);
        let transport = UdpTransport::new(bind_addr).set_mtu(mtu);

        let server = CoapServer::<Dispatcher<SocketAddr>, SocketAddr>::bind(transport)
            .await
            .map_err(EndpointError::Bind)?;
        let local_addr = server.local_addr().unwrap_or(bind_addr);
        let dispatcher = Dispatcher::new(self.registry.clone(), timing);

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let server_task = tokio::spawn(async move {
            server
                .serve_until(dispatcher, async move {
                    let _ = shutdown_rx.await;
                })
                .await
        });
        info!("CoAP endpoint '{name}' listening on {local_addr}");

        self.state = EndpointState::Listening {
            local_addr,
            shutdown_tx,
            server_task,
        };
        Ok(local_addr)
    }

    /// Clear all bindings and close the listener.  Stopping an endpoint that is not listening
    /// only clears the bindings.
    pub async fn stop(&mut self) -> Result<(), EndpointError> {
        self.registry.write().await.clear();
        let state = mem::replace(&mut self.state, EndpointState::Stopped);
        let EndpointState::Listening {
            local_addr,
            shutdown_tx,
            server_task,
        } = state
        else {
            return Ok(());
        };
        let _ = shutdown_tx.send(());
        let result = server_task
            .await
            .map_err(|e| EndpointError::Internal(e.to_string()))?;
        info!("CoAP endpoint '{}' on {local_addr} stopped", self.config.name);
        result.map_err(|e| {
            error!("Endpoint '{}' had failed: {e}", self.config.name);
            EndpointError::Fatal(e)
        })
    }
}

impl Drop for CoapEndpoint {
    fn drop(&mut self) {
        if let EndpointState::Listening { shutdown_tx, .. } =
            mem::replace(&mut self.state, EndpointState::Stopped)
        {
            let _ = shutdown_tx.send(());
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum EndpointError {
    #[error("invalid endpoint configuration: {0}")]
    InvalidConfig(String),

    #[error("could not bind listener: {0}")]
    Bind(#[source] TransportError),

    #[error("endpoint is already listening")]
    AlreadyListening,

    #[error(transparent)]
    Fatal(#[from] FatalServerError),

    #[error("internal error: {0}")]
    Internal(String),
}
