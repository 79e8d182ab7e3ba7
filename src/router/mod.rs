//! Server side: resource bindings, route lookup and dispatch of inbound exchanges.

pub use dispatcher::Dispatcher;
pub use exchange::{ExchangeError, Request, ResponseWriter};
pub use method::{method_name, parse_method};
pub use registry::{MatchResult, RegistryError, ResourceBinding, ResourceRegistry};
pub use request_handler::RequestHandler;

pub(crate) mod coap_utils;
pub mod dispatcher;
pub mod exchange;
mod method;
pub mod registry;
mod request_handler;
