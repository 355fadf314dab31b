//! The `/rd` registration interface.
//!
//! `POST /rd` admits a device, `POST /rd/:id` refreshes it and
//! `DELETE /rd/:id` withdraws it. The id in the location is the
//! registry-allocated device id, so `rd/4` and device 4 are the same
//! thing everywhere in the server. The same three routes can be mounted
//! again under configured prefixes; devices arriving through `/gw/rd`
//! are recorded with the device type that prefix maps to.

use std::sync::Arc;

use futures_util::future::BoxFuture;
use log::info;

use lwm2m_core::coap::message::{ContentFormat, Method, ResponseCode};
use lwm2m_core::coap::request::{CoapRequest, CoapResponse};
use lwm2m_core::coap::router::{RequestHandler, Router};
use lwm2m_core::codec::link_format;
use lwm2m_core::error::{Error, Result};
use lwm2m_core::registration::RegistrationParams;

use crate::device_registry::DeviceRegistry;
use crate::reporting::Observations;

/// Maps a registration URL prefix to the device type recorded for
/// everything arriving through it: a rule with prefix `"gw"` serves
/// `POST /gw/rd` and types those devices with its `name`.
#[derive(Debug, Clone)]
pub struct DeviceTypeRule {
    pub name: String,
    pub prefix: String,
}

pub struct RegistrationInterface {
    pub registry: Arc<DeviceRegistry>,
    pub observations: Arc<Observations>,
    /// Extra typed registration roots, mounted at `/<prefix>/rd`.
    pub types: Vec<DeviceTypeRule>,
    /// Type recorded for devices arriving through plain `/rd`.
    pub default_type: String,
}

impl RegistrationInterface {
    pub fn mount(self: &Arc<Self>, router: &mut Router) {
        let mut roots = vec![String::from("/rd")];
        roots.extend(
            self.types
                .iter()
                .map(|rule| format!("/{}/rd", rule.prefix.trim_matches('/'))),
        );
        for root in roots {
            router.set_handler(&root, Method::Post, Box::new(Register(Arc::clone(self))));
            let entry = format!("{root}/:id");
            router.set_handler(&entry, Method::Post, Box::new(Update(Arc::clone(self))));
            router.set_handler(&entry, Method::Delete, Box::new(Deregister(Arc::clone(self))));
        }
    }

    /// Device type for a registration landing on `path`: the rule whose
    /// prefix matches the segments before `rd`, or the default.
    fn device_type_for(&self, path: &[String]) -> String {
        let prefix = path[..path.len().saturating_sub(1)].join("/");
        self.types
            .iter()
            .find(|rule| rule.prefix.trim_matches('/') == prefix)
            .map(|rule| rule.name.clone())
            .unwrap_or_else(|| self.default_type.clone())
    }
}

/// Object list from a link format payload; `None` when absent.
fn parse_objects(request: &CoapRequest) -> Result<Option<Vec<String>>> {
    if request.payload().is_empty() {
        return Ok(None);
    }
    if let Some(format) = request.content_format() {
        if format != ContentFormat::LinkFormat {
            return Err(Error::BadRequest(format!(
                "registration payload must be link format, not {format:?}"
            )));
        }
    }
    let raw = String::from_utf8(request.payload().to_vec())
        .map_err(|_| Error::BadRequest("registration payload is not UTF-8".into()))?;
    let links = link_format::parse(&raw)?;
    Ok(Some(links.into_iter().map(|link| link.target).collect()))
}

fn device_id(request: &CoapRequest) -> Result<u64> {
    let raw = request
        .param("id")
        .ok_or_else(|| Error::BadRequest("missing registration id".into()))?;
    raw.parse()
        .map_err(|_| Error::BadRequest(format!("bad registration id {raw:?}")))
}

struct Register(Arc<RegistrationInterface>);

impl RequestHandler for Register {
    fn handle(&self, request: CoapRequest) -> BoxFuture<'_, Result<CoapResponse>> {
        Box::pin(async move {
            let params = RegistrationParams::from_queries(&request.queries)?;
            let objects = parse_objects(&request)?.unwrap_or_default();
            let device_type = self.0.device_type_for(&request.path);
            let (device, superseded) = self
                .0
                .registry
                .register(params, request.source, device_type, objects)
                .await;
            if let Some(old) = superseded {
                self.0.observations.cancel_device(old.id).await;
            }
            info!(
                "{} {} registered as rd/{} from {} ({} objects, lt {}s)",
                device.device_type,
                device.endpoint,
                device.id,
                device.address,
                device.objects.len(),
                device.lifetime
            );
            // The location echoes the root the device registered through,
            // so updates keep using the same prefix.
            Ok(CoapResponse::new(ResponseCode::Created)
                .location_path(&format!("{}/{}", request.path_string(), device.id)))
        })
    }
}

struct Update(Arc<RegistrationInterface>);

impl RequestHandler for Update {
    fn handle(&self, request: CoapRequest) -> BoxFuture<'_, Result<CoapResponse>> {
        Box::pin(async move {
            let id = device_id(&request)?;
            let lifetime = match request.query("lt") {
                Some(raw) => Some(raw.parse().map_err(|_| {
                    Error::BadRequest(format!("bad lifetime {raw:?}"))
                })?),
                None => None,
            };
            let objects = parse_objects(&request)?;
            let device = self
                .0
                .registry
                .update(id, request.source, lifetime, objects)
                .await?;
            info!("device {} refreshed rd/{}", device.endpoint, device.id);
            Ok(CoapResponse::new(ResponseCode::Changed))
        })
    }
}

struct Deregister(Arc<RegistrationInterface>);

impl RequestHandler for Deregister {
    fn handle(&self, request: CoapRequest) -> BoxFuture<'_, Result<CoapResponse>> {
        Box::pin(async move {
            let id = device_id(&request)?;
            let device = self.0.registry.remove(id).await?;
            self.0.observations.cancel_device(id).await;
            info!("device {} deregistered rd/{id}", device.endpoint);
            Ok(CoapResponse::new(ResponseCode::Deleted))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use lwm2m_core::coap::message::{Code, CoapOption, Message, OptionNumber, Token};
    use std::net::SocketAddr;

    fn fixture() -> (Router, Arc<DeviceRegistry>, Arc<Observations>) {
        fixture_with_types(Vec::new())
    }

    fn fixture_with_types(
        types: Vec<DeviceTypeRule>,
    ) -> (Router, Arc<DeviceRegistry>, Arc<Observations>) {
        let registry = Arc::new(DeviceRegistry::in_memory());
        let observations = Arc::new(Observations::new(Arc::clone(&registry)));
        let mut router = Router::new();
        Arc::new(RegistrationInterface {
            registry: Arc::clone(&registry),
            observations: Arc::clone(&observations),
            types,
            default_type: "Device".into(),
        })
        .mount(&mut router);
        (router, registry, observations)
    }

    fn peer() -> SocketAddr {
        "127.0.0.1:56830".parse().unwrap()
    }

    fn register_message(mid: u16, queries: &[&str]) -> Message {
        let mut msg = Message::request(Method::Post, mid, Token::new());
        msg.push_option(CoapOption::string(OptionNumber::UriPath, "rd"));
        for query in queries {
            msg.push_option(CoapOption::string(OptionNumber::UriQuery, query));
        }
        msg.payload = Bytes::from_static(b"</1>,</2>,</3>,</4>,</5>");
        msg
    }

    #[tokio::test]
    async fn register_answers_created_with_a_location() {
        let (router, registry, _) = fixture();
        let reply = router
            .dispatch(
                register_message(1, &["ep=ROOM001", "lt=86400", "lwm2m=1.0", "b=U"]),
                peer(),
            )
            .await
            .unwrap();
        assert_eq!(reply.code, Code::Response(ResponseCode::Created));
        let location: Vec<String> = reply
            .options_of(OptionNumber::LocationPath)
            .map(CoapOption::as_str)
            .collect();
        assert_eq!(location[0], "rd");
        let id: u64 = location[1].parse().unwrap();

        let device = registry.get(id).await.unwrap();
        assert_eq!(device.endpoint, "ROOM001");
        assert_eq!(device.device_type, "Device");
        assert_eq!(device.lifetime, 86400);
        assert_eq!(device.objects.len(), 5);
        assert_eq!(device.address, peer());
    }

    #[tokio::test]
    async fn typed_roots_assign_device_types() {
        let (router, registry, _) = fixture_with_types(vec![DeviceTypeRule {
            name: "Gateway".into(),
            prefix: "gw".into(),
        }]);

        let mut msg = Message::request(Method::Post, 7, Token::new());
        msg.push_option(CoapOption::string(OptionNumber::UriPath, "gw"));
        msg.push_option(CoapOption::string(OptionNumber::UriPath, "rd"));
        msg.push_option(CoapOption::string(OptionNumber::UriQuery, "ep=GW-1"));
        let reply = router.dispatch(msg, peer()).await.unwrap();
        assert_eq!(reply.code, Code::Response(ResponseCode::Created));
        let location: Vec<String> = reply
            .options_of(OptionNumber::LocationPath)
            .map(CoapOption::as_str)
            .collect();
        assert_eq!(location[..2], ["gw".to_string(), "rd".to_string()]);
        assert_eq!(
            registry.find_by_endpoint("GW-1").await.unwrap().device_type,
            "Gateway"
        );

        // Plain /rd still types with the default.
        let reply = router
            .dispatch(register_message(8, &["ep=node"]), peer())
            .await
            .unwrap();
        assert_eq!(reply.code, Code::Response(ResponseCode::Created));
        assert_eq!(
            registry.find_by_endpoint("node").await.unwrap().device_type,
            "Device"
        );
    }

    #[tokio::test]
    async fn register_without_ep_is_refused() {
        let (router, registry, _) = fixture();
        let reply = router
            .dispatch(register_message(2, &["lt=600"]), peer())
            .await
            .unwrap();
        assert_eq!(reply.code, Code::Response(ResponseCode::BadRequest));
        assert!(registry.list().await.is_empty());
    }

    #[tokio::test]
    async fn update_and_deregister_lifecycle() {
        let (router, registry, _) = fixture();
        let reply = router
            .dispatch(register_message(3, &["ep=node", "lt=60"]), peer())
            .await
            .unwrap();
        let id: u64 = reply
            .options_of(OptionNumber::LocationPath)
            .nth(1)
            .unwrap()
            .as_str()
            .parse()
            .unwrap();

        let mut update = Message::request(Method::Post, 4, Token::new());
        update.push_option(CoapOption::string(OptionNumber::UriPath, "rd"));
        update.push_option(CoapOption::string(OptionNumber::UriPath, &id.to_string()));
        update.push_option(CoapOption::string(OptionNumber::UriQuery, "lt=900"));
        let reply = router.dispatch(update, peer()).await.unwrap();
        assert_eq!(reply.code, Code::Response(ResponseCode::Changed));
        assert_eq!(registry.get(id).await.unwrap().lifetime, 900);
        // No payload leaves the object list as registered.
        assert_eq!(registry.get(id).await.unwrap().objects.len(), 5);

        let mut remove = Message::request(Method::Delete, 5, Token::new());
        remove.push_option(CoapOption::string(OptionNumber::UriPath, "rd"));
        remove.push_option(CoapOption::string(OptionNumber::UriPath, &id.to_string()));
        let reply = router.dispatch(remove, peer()).await.unwrap();
        assert_eq!(reply.code, Code::Response(ResponseCode::Deleted));
        assert!(registry.get(id).await.is_err());

        let mut again = Message::request(Method::Delete, 6, Token::new());
        again.push_option(CoapOption::string(OptionNumber::UriPath, "rd"));
        again.push_option(CoapOption::string(OptionNumber::UriPath, &id.to_string()));
        let reply = router.dispatch(again, peer()).await.unwrap();
        assert_eq!(reply.code, Code::Response(ResponseCode::NotFound));
    }
}
