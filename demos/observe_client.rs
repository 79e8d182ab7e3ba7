use futures::StreamExt;
use log::{error, info};

use coap_router::codec::ContentFormatLabel;
use coap_router::{Invocation, RequestBuilder, RequestConfig, TimingProfile, UdpClientTransport};

#[tokio::main]
async fn main() {
    env_logger::init();
    let url = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "coap://[::1]/sensor".to_string());

    let config = RequestConfig::default()
        .url(url)
        .observe(true)
        .content_format(ContentFormatLabel::ApplicationJson);
    let builder = RequestBuilder::new(config, UdpClientTransport::new(TimingProfile::default()));

    let mut messages = match builder.send(Invocation::default()).await {
        Ok(messages) => messages,
        Err(e) => {
            error!("Could not issue request: {e}");
            return;
        }
    };
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            message = messages.next() => match message {
                Some(Ok(message)) => info!("{}", message.to_json()),
                Some(Err(e)) => error!("{e}"),
                None => break,
            },
        }
    }
    builder.close_observation().await;
}
