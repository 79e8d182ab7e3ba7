use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use coap_lite::{ContentFormat, MessageClass, RequestType, ResponseType};
use futures::StreamExt;
use serde_json::json;

use coap_router::client::{ClientTransport, RequestDescriptor, ResponseEvent};
use coap_router::codec::{ContentFormatLabel, Payload};
use coap_router::router::{Request, ResponseWriter};
use coap_router::{
    CoapEndpoint, EndpointConfig, Invocation, RequestBuilder, RequestConfig, TimingProfile,
    UdpClientTransport,
};

async fn handle_get_sensor(_request: Request<SocketAddr>, response: ResponseWriter) {
    response
        .set_content_format(ContentFormat::ApplicationJSON)
        .await
        .unwrap();
    response
        .set_payload(json!({"temperature": 21.5}).to_string().into_bytes())
        .await
        .unwrap();
    response.end().await.unwrap();
}

async fn handle_post_echo(request: Request<SocketAddr>, response: ResponseWriter) {
    let body = request.payload().to_vec();
    response
        .set_content_format(ContentFormat::ApplicationJSON)
        .await
        .unwrap();
    response.set_payload(body).await.unwrap();
    response.end().await.unwrap();
}

async fn start_endpoint() -> (CoapEndpoint, SocketAddr) {
    let config = EndpointConfig::new("loopback", 0).bind_address(IpAddr::V4(Ipv4Addr::LOCALHOST));
    let mut endpoint = CoapEndpoint::new(config).unwrap();
    endpoint
        .register("/sensor", RequestType::Get, handle_get_sensor)
        .await
        .unwrap();
    endpoint
        .register("echo", RequestType::Post, handle_post_echo)
        .await
        .unwrap();
    let addr = endpoint.start().await.unwrap();
    (endpoint, addr)
}

fn builder(config: RequestConfig) -> RequestBuilder<UdpClientTransport> {
    RequestBuilder::new(config, UdpClientTransport::new(TimingProfile::default()))
}

async fn first_message(
    builder: &RequestBuilder<UdpClientTransport>,
    invocation: Invocation,
) -> coap_router::OutputMessage {
    let mut messages = builder.send(invocation).await.unwrap();
    messages.next().await.unwrap().unwrap()
}

#[tokio::test]
async fn test_routed_exchanges() {
    let (mut endpoint, addr) = start_endpoint().await;
    let config = RequestConfig::default()
        .port(addr.port())
        .content_format(ContentFormatLabel::ApplicationJson);
    let client = builder(config);

    let message = first_message(&client, Invocation::to("127.0.0.1", "sensor")).await;
    assert_eq!(message.status_code, ResponseType::Content);
    assert_eq!(message.payload, Payload::Value(json!({"temperature": 21.5})));

    let echo = Invocation::to("127.0.0.1", "/echo")
        .method("post")
        .payload(json!({"v": 1}));
    let message = first_message(&client, echo).await;
    assert_eq!(message.status_code, ResponseType::Created);
    assert_eq!(message.payload, Payload::Value(json!({"v": 1})));

    endpoint.stop().await.unwrap();
}

#[tokio::test]
async fn test_unmatched_routes_are_answered_by_the_dispatcher() {
    let (mut endpoint, addr) = start_endpoint().await;

    // Error responses carry no body, so they produce no output message; inspect the raw
    // responses through the transport instead.
    let transport = UdpClientTransport::default();
    for (method, path, expected) in [
        ("POST", "/sensor", ResponseType::MethodNotAllowed),
        ("GET", "/other", ResponseType::NotFound),
        ("DELETE", "/sensor/extra", ResponseType::NotFound),
    ] {
        let config = RequestConfig::default()
            .url(format!("coap://{addr}{path}"))
            .method(method);
        let descriptor = RequestDescriptor::resolve(&config, &Invocation::default()).unwrap();
        let mut handle = transport.send_request(descriptor).await.unwrap();
        let Some(ResponseEvent::Response(packet)) = handle.events.recv().await else {
            panic!("expected a response for {method} {path}");
        };
        assert_eq!(
            packet.header.code,
            MessageClass::Response(expected),
            "{method} {path}"
        );
    }

    endpoint.stop().await.unwrap();
}

#[tokio::test]
async fn test_stopped_endpoint_reports_gateway_timeout() {
    let (mut endpoint, addr) = start_endpoint().await;
    endpoint.stop().await.unwrap();

    let timing = TimingProfile::new(std::time::Duration::from_millis(20), 1.0, 1).unwrap();
    let config = RequestConfig::default().url(format!("coap://{addr}/sensor"));
    let client = RequestBuilder::new(config, UdpClientTransport::new(timing));

    let message = first_message(&client, Invocation::default()).await;
    assert_eq!(message.status_number(), 504);
    let Payload::Value(payload) = &message.payload else {
        panic!("expected structured payload");
    };
    assert_eq!(payload["description"], "timeout");
}
