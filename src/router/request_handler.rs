use std::future::Future;

use async_trait::async_trait;
use dyn_clone::DynClone;

use crate::router::{Request, ResponseWriter};

/// Target of a resource binding.  The handler owns completion of the exchange: it must call
/// [`ResponseWriter::end`] exactly once, the dispatcher will not do it on its behalf.
#[async_trait]
pub trait RequestHandler<Endpoint>: DynClone + Send + Sync + 'static {
    async fn handle(&self, request: Request<Endpoint>, response: ResponseWriter);
}

dyn_clone::clone_trait_object!(<Endpoint> RequestHandler<Endpoint>);

#[async_trait]
impl<Endpoint, F, R> RequestHandler<Endpoint> for F
where
    Endpoint: Send + Sync + 'static,
    F: Fn(Request<Endpoint>, ResponseWriter) -> R + Sync + Send + Clone + 'static,
    R: Future<Output = ()> + Send,
{
    async fn handle(&self, request: Request<Endpoint>, response: ResponseWriter) {
        (self)(request, response).await
    }
}
