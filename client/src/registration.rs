//! Outbound registration: announce, refresh, withdraw.
//!
//! `POST /rd` carries the endpoint parameters as queries and the object
//! tree as link format; the reply's Location-Path names this
//! registration for the rest of its life. Update re-POSTs to that
//! location, deregister DELETEs it.

use std::net::SocketAddr;

use bytes::Bytes;

use lwm2m_core::coap::message::{
    Code, CoapOption, ContentFormat, Message, Method, OptionNumber, ResponseCode,
};
use lwm2m_core::codec::link_format::{self, Link};
use lwm2m_core::error::{Error, Result};
use lwm2m_core::registration::RegistrationParams;
use lwm2m_core::transport::UdpEndpoint;
use lwm2m_core::uri::ObjectUri;

fn object_payload(objects: &[ObjectUri]) -> Bytes {
    let links: Vec<Link> = objects
        .iter()
        .map(|uri| Link::new(uri.to_string()))
        .collect();
    Bytes::from(link_format::serialize(&links))
}

/// Register with `server` under `root` (plain `"rd"`, or a typed root
/// such as `"gw/rd"`). Returns the location, e.g. `rd/4`.
pub async fn register(
    endpoint: &UdpEndpoint,
    server: SocketAddr,
    root: &str,
    params: &RegistrationParams,
    objects: &[ObjectUri],
) -> Result<String> {
    let mut msg = Message::request(Method::Post, endpoint.new_message_id(), endpoint.new_token());
    for segment in root.split('/').filter(|s| !s.is_empty()) {
        msg.push_option(CoapOption::string(OptionNumber::UriPath, segment));
    }
    msg.push_option(CoapOption::uint(
        OptionNumber::ContentFormat,
        ContentFormat::LinkFormat as u32,
    ));
    for query in params.to_queries() {
        msg.push_option(CoapOption::string(OptionNumber::UriQuery, &query));
    }
    msg.payload = object_payload(objects);

    let reply = endpoint.request(msg, server).await?;
    match reply.code {
        Code::Response(ResponseCode::Created) => {
            let location: Vec<String> = reply
                .options_of(OptionNumber::LocationPath)
                .map(CoapOption::as_str)
                .collect();
            if location.is_empty() {
                return Err(Error::Registration(
                    "registration reply carries no location".into(),
                ));
            }
            Ok(location.join("/"))
        }
        Code::Response(code) => Err(Error::ClientError(code)),
        other => Err(Error::ClientResponse(format!(
            "expected a response, server sent {other:?}"
        ))),
    }
}

/// Refresh the registration at `location`, restating lifetime and the
/// current object tree.
pub async fn update(
    endpoint: &UdpEndpoint,
    server: SocketAddr,
    location: &str,
    params: &RegistrationParams,
    objects: &[ObjectUri],
) -> Result<()> {
    let mut msg = Message::request(Method::Post, endpoint.new_message_id(), endpoint.new_token());
    for segment in location.split('/').filter(|s| !s.is_empty()) {
        msg.push_option(CoapOption::string(OptionNumber::UriPath, segment));
    }
    msg.push_option(CoapOption::string(
        OptionNumber::UriQuery,
        &format!("lt={}", params.lifetime),
    ));
    msg.push_option(CoapOption::uint(
        OptionNumber::ContentFormat,
        ContentFormat::LinkFormat as u32,
    ));
    msg.payload = object_payload(objects);

    let reply = endpoint.request(msg, server).await?;
    match reply.code {
        Code::Response(ResponseCode::Changed) => Ok(()),
        Code::Response(code) => Err(Error::ClientError(code)),
        other => Err(Error::ClientResponse(format!(
            "expected a response, server sent {other:?}"
        ))),
    }
}

/// Withdraw the registration at `location`.
pub async fn deregister(
    endpoint: &UdpEndpoint,
    server: SocketAddr,
    location: &str,
) -> Result<()> {
    let mut msg = Message::request(
        Method::Delete,
        endpoint.new_message_id(),
        endpoint.new_token(),
    );
    for segment in location.split('/').filter(|s| !s.is_empty()) {
        msg.push_option(CoapOption::string(OptionNumber::UriPath, segment));
    }
    let reply = endpoint.request(msg, server).await?;
    match reply.code {
        Code::Response(ResponseCode::Deleted) => Ok(()),
        Code::Response(code) => Err(Error::ClientError(code)),
        other => Err(Error::ClientResponse(format!(
            "expected a response, server sent {other:?}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::future::BoxFuture;
    use lwm2m_core::coap::request::{CoapRequest, CoapResponse};
    use lwm2m_core::coap::router::{RequestHandler, Router};
    use std::sync::Arc;

    struct AcceptingRd;

    impl RequestHandler for AcceptingRd {
        fn handle(&self, request: CoapRequest) -> BoxFuture<'_, Result<CoapResponse>> {
            Box::pin(async move {
                assert_eq!(request.query("ep"), Some("ROOM001"));
                assert_eq!(request.query("lt"), Some("600"));
                assert_eq!(request.query("lwm2m"), Some("1.0"));
                assert_eq!(request.query("b"), Some("U"));
                assert_eq!(
                    String::from_utf8_lossy(request.payload()),
                    "</3/0>,</3303/0>"
                );
                Ok(CoapResponse::new(ResponseCode::Created).location_path("rd/12"))
            })
        }
    }

    struct RefusingRd;

    impl RequestHandler for RefusingRd {
        fn handle(&self, _request: CoapRequest) -> BoxFuture<'_, Result<CoapResponse>> {
            Box::pin(async { Ok(CoapResponse::new(ResponseCode::Forbidden)) })
        }
    }

    async fn endpoint_with(router: Router) -> Arc<UdpEndpoint> {
        let endpoint = Arc::new(UdpEndpoint::bind("127.0.0.1:0", router).await.unwrap());
        endpoint.start();
        endpoint
    }

    #[tokio::test]
    async fn register_round_trip() {
        let mut router = Router::new();
        router.set_handler("/rd", Method::Post, Box::new(AcceptingRd));
        let server = endpoint_with(router).await;
        let client = endpoint_with(Router::new()).await;

        let mut params = RegistrationParams::new("ROOM001");
        params.lifetime = 600;
        let objects = vec![ObjectUri::instance(3, 0), ObjectUri::instance(3303, 0)];
        let location = register(
            &client,
            server.local_addr().unwrap(),
            "rd",
            &params,
            &objects,
        )
        .await
        .unwrap();
        assert_eq!(location, "rd/12");
    }

    #[tokio::test]
    async fn refusal_surfaces_the_server_code() {
        let mut router = Router::new();
        router.set_handler("/rd", Method::Post, Box::new(RefusingRd));
        let server = endpoint_with(router).await;
        let client = endpoint_with(Router::new()).await;

        let err = register(
            &client,
            server.local_addr().unwrap(),
            "rd",
            &RegistrationParams::new("ROOM001"),
            &[],
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::ClientError(ResponseCode::Forbidden)));
    }
}
