use std::net::SocketAddr;
use std::sync::Arc;

use coap_lite::{ContentFormat, RequestType, ResponseType};
use log::info;
use tokio::sync::Mutex;

use coap_router::router::{Request, ResponseWriter};
use coap_router::{CoapEndpoint, EndpointConfig, EndpointError};

#[tokio::main]
async fn main() -> Result<(), EndpointError> {
    env_logger::init();
    let mut endpoint = CoapEndpoint::new(EndpointConfig::new("demo", 5683))?;

    let reading = Arc::new(Mutex::new(21.5f64));
    let reading_for_get = reading.clone();
    let reading_for_put = reading.clone();

    // Try `coap-client -m get coap://localhost/sensor`.
    register(
        &endpoint,
        "/sensor",
        RequestType::Get,
        move |req, res| handle_get_sensor(req, res, reading_for_get.clone()),
    )
    .await;
    // And `coap-client -m put -e 19.0 coap://localhost/sensor`.
    register(
        &endpoint,
        "/sensor",
        RequestType::Put,
        move |req, res| handle_put_sensor(req, res, reading_for_put.clone()),
    )
    .await;

    let addr = endpoint.start().await?;
    info!("Serving on {addr}, press Ctrl-C to stop");
    let _ = tokio::signal::ctrl_c().await;
    endpoint.stop().await
}

async fn register<F, Fut>(endpoint: &CoapEndpoint, path: &str, method: RequestType, handler: F)
where
    F: Fn(Request<SocketAddr>, ResponseWriter) -> Fut + Clone + Send + Sync + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    if let Err(e) = endpoint.register(path, method, handler).await {
        log::warn!("{e}");
    }
}

async fn handle_get_sensor(
    _request: Request<SocketAddr>,
    response: ResponseWriter,
    reading: Arc<Mutex<f64>>,
) {
    let body = serde_json::json!({ "temperature": *reading.lock().await });
    let result = async {
        response
            .set_content_format(ContentFormat::ApplicationJSON)
            .await?;
        response.set_payload(body.to_string().into_bytes()).await?;
        response.end().await
    }
    .await;
    if let Err(e) = result {
        log::error!("GET /sensor failed: {e}");
    }
}

async fn handle_put_sensor(
    request: Request<SocketAddr>,
    response: ResponseWriter,
    reading: Arc<Mutex<f64>>,
) {
    let parsed = std::str::from_utf8(request.payload())
        .ok()
        .and_then(|s| s.trim().parse::<f64>().ok());
    let result = async {
        match parsed {
            Some(value) => *reading.lock().await = value,
            None => response.set_status(ResponseType::BadRequest).await?,
        }
        response.end().await
    }
    .await;
    if let Err(e) = result {
        log::error!("PUT /sensor failed: {e}");
    }
}
