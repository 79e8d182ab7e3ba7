//! CoAP resource router and content-format aware client.
//!
//! The server side binds handlers to `(path, method)` pairs on a [`CoapEndpoint`] and dispatches
//! inbound exchanges to them, answering 4.04 and 4.05 itself.  The client side resolves
//! [`client::Invocation`]s into requests, decodes responses according to their Content-Format
//! and keeps at most one observation open per [`client::RequestBuilder`].
//!
//! # Examples
//! ```no_run
//! use std::net::SocketAddr;
//!
//! use coap_lite::RequestType;
//! use coap_router::router::{Request, ResponseWriter};
//! use coap_router::{CoapEndpoint, EndpointConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut endpoint = CoapEndpoint::new(EndpointConfig::new("demo", 5683))?;
//!     endpoint
//!         .register("/hello", RequestType::Get, handle_get_hello)
//!         .await?;
//!     endpoint.start().await?;
//!     tokio::signal::ctrl_c().await?;
//!     endpoint.stop().await?;
//!     Ok(())
//! }
//!
//! async fn handle_get_hello(_request: Request<SocketAddr>, response: ResponseWriter) {
//!     let _ = response.set_payload(b"Hello, world".to_vec()).await;
//!     let _ = response.end().await;
//! }
//! ```
//!
//! See the `demos/` directory for a client example.

pub use client::{Invocation, OutputMessage, RequestBuilder, RequestConfig, UdpClientTransport};
pub use endpoint::{CoapEndpoint, EndpointConfig, EndpointError};
pub use server::CoapServer;
pub use server::FatalServerError;
pub use timing::TimingProfile;
pub use udp::UdpTransport;

pub mod client;
pub mod codec;
pub mod endpoint;
pub mod packet_handler;
pub mod router;
pub mod server;
pub mod timing;
pub mod transport;
pub mod udp;
