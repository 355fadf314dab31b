//! Device-management handlers mounted on the client's router.
//!
//! The server addresses the object tree directly: `GET /3/6/2` reads,
//! `PUT` writes (or stores notification attributes when the payload is
//! empty and queries are present), `POST` executes on a resource and
//! creates on an instance, `DELETE` removes. `GET` doubles as discover
//! when the request accepts link format, and as observe when it carries
//! the Observe option. At the object level only discover and
//! write-attributes are served; a `cancel` query drops the observations
//! on the target instead of storing attributes.

use std::sync::Arc;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use log::info;

use lwm2m_core::attributes::NotifyAttributes;
use lwm2m_core::coap::message::{ContentFormat, Method};
use lwm2m_core::coap::request::{CoapRequest, CoapResponse};
use lwm2m_core::coap::router::{RequestHandler, Router};
use lwm2m_core::coap::ResponseCode;
use lwm2m_core::codec::{self, link_format, text};
use lwm2m_core::error::{Error, Result};
use lwm2m_core::schema::{ObjectValue, ResourceValue};
use lwm2m_core::uri::ObjectUri;

use crate::object_registry::ObjectRegistry;
use crate::observe::Notifier;

/// Shared state behind every handler.
pub struct DeviceManagement {
    pub registry: Arc<ObjectRegistry>,
    pub notifier: Arc<Notifier>,
}

impl DeviceManagement {
    pub fn mount(self: &Arc<Self>, router: &mut Router) {
        for pattern in ["/:object/:instance", "/:object/:instance/:resource"] {
            router.set_handler(pattern, Method::Get, Box::new(Read(Arc::clone(self))));
            router.set_handler(pattern, Method::Put, Box::new(Write(Arc::clone(self))));
        }
        router.set_handler("/:object", Method::Get, Box::new(ReadObject(Arc::clone(self))));
        router.set_handler("/:object", Method::Put, Box::new(WriteObject(Arc::clone(self))));
        router.set_handler(
            "/:object/:instance/:resource",
            Method::Post,
            Box::new(Execute(Arc::clone(self))),
        );
        router.set_handler(
            "/:object/:instance",
            Method::Post,
            Box::new(Create(Arc::clone(self))),
        );
        router.set_handler(
            "/:object/:instance",
            Method::Delete,
            Box::new(Remove(Arc::clone(self))),
        );
    }
}

fn param_u16(request: &CoapRequest, name: &str) -> Result<u16> {
    let raw = request
        .param(name)
        .ok_or_else(|| Error::MalformedUri(format!("missing {name} segment")))?;
    raw.parse()
        .map_err(|_| Error::MalformedUri(format!("non-numeric segment {raw:?}")))
}

fn parse_uri(request: &CoapRequest) -> Result<ObjectUri> {
    let object = param_u16(request, "object")?;
    let instance = param_u16(request, "instance")?;
    match request.param("resource") {
        Some(_) => Ok(ObjectUri::resource(
            object,
            instance,
            param_u16(request, "resource")?,
        )),
        None => Ok(ObjectUri::instance(object, instance)),
    }
}

struct Read(Arc<DeviceManagement>);

impl RequestHandler for Read {
    fn handle(&self, request: CoapRequest) -> BoxFuture<'_, Result<CoapResponse>> {
        Box::pin(async move {
            let uri = parse_uri(&request)?;
            match request.observe() {
                Some(0) => {
                    let (format, payload) = self
                        .0
                        .notifier
                        .start(uri, request.source, request.message.token.clone())
                        .await?;
                    info!("{} now observed by {}", uri, request.source);
                    Ok(CoapResponse::new(ResponseCode::Content)
                        .observe(0)
                        .content_format(format)
                        .payload(payload))
                }
                Some(_) => {
                    // Any non-zero value deregisters the observation and
                    // falls back to a plain read.
                    self.0.notifier.cancel(&uri).await;
                    self.read(&request, &uri).await
                }
                None if request.accept() == Some(ContentFormat::LinkFormat) => {
                    self.discover(&uri).await
                }
                None => self.read(&request, &uri).await,
            }
        })
    }
}

impl Read {
    async fn read(&self, request: &CoapRequest, uri: &ObjectUri) -> Result<CoapResponse> {
        let registry = &self.0.registry;
        match uri.resource_id {
            Some(_) => {
                let value = registry.resource(uri).await?;
                Ok(CoapResponse::with_payload(
                    ResponseCode::Content,
                    ContentFormat::Lwm2mText,
                    Bytes::from(text::encode(&value)),
                ))
            }
            None => {
                let instance = registry.instance(uri).await?;
                let schema = registry.schema(uri.object_id).await?;
                let format = match request.accept() {
                    Some(ContentFormat::Lwm2mJson) | Some(ContentFormat::Json) => {
                        ContentFormat::Lwm2mJson
                    }
                    _ => ContentFormat::Lwm2mTlv,
                };
                let payload = codec::encode_object(format, &schema, &instance)?;
                Ok(CoapResponse::with_payload(
                    ResponseCode::Content,
                    format,
                    payload,
                ))
            }
        }
    }

    async fn discover(&self, uri: &ObjectUri) -> Result<CoapResponse> {
        let registry = &self.0.registry;
        let mut links = Vec::new();
        match uri.resource_id {
            Some(_) => {
                registry.resource(uri).await?;
                let attributes = registry.attributes(uri).await;
                links.push(attributes.decorate(link_format::Link::new(uri.to_string())));
            }
            None => {
                registry.instance(uri).await?;
                let attributes = registry.attributes(uri).await;
                links.push(attributes.decorate(link_format::Link::new(uri.to_string())));
                let schema = registry.schema(uri.object_id).await?;
                for resource in schema.resources() {
                    let resource_uri =
                        ObjectUri::resource(uri.object_id, uri.instance_id, resource.id);
                    let attributes = registry.attributes(&resource_uri).await;
                    links.push(
                        attributes.decorate(link_format::Link::new(resource_uri.to_string())),
                    );
                }
            }
        }
        Ok(CoapResponse::with_payload(
            ResponseCode::Content,
            ContentFormat::LinkFormat,
            Bytes::from(link_format::serialize(&links)),
        ))
    }
}

struct Write(Arc<DeviceManagement>);

impl RequestHandler for Write {
    fn handle(&self, request: CoapRequest) -> BoxFuture<'_, Result<CoapResponse>> {
        Box::pin(async move {
            let uri = parse_uri(&request)?;
            if request.payload().is_empty() && !request.queries.is_empty() {
                return self.write_attributes(&request, uri).await;
            }
            self.write_value(&request, &uri).await
        })
    }
}

impl Write {
    async fn write_attributes(
        &self,
        request: &CoapRequest,
        uri: ObjectUri,
    ) -> Result<CoapResponse> {
        if request.query("cancel").is_some() {
            // Cancel names the observed target and wins over any other
            // parameter in the same request.
            self.0.notifier.cancel(&uri).await;
            info!("observation on {uri} cancelled by write-attributes");
            return Ok(CoapResponse::new(ResponseCode::Changed));
        }
        let attributes = NotifyAttributes::from_queries(&request.queries)?;
        info!("attributes on {uri} set to {attributes:?}");
        self.0.registry.set_attributes(uri, attributes).await;
        Ok(CoapResponse::new(ResponseCode::Changed))
    }

    async fn write_value(&self, request: &CoapRequest, uri: &ObjectUri) -> Result<CoapResponse> {
        let registry = &self.0.registry;
        let schema = registry.schema(uri.object_id).await?;
        match uri.resource_id {
            Some(resource_id) => {
                let value = match request.content_format() {
                    None | Some(ContentFormat::TextPlain) | Some(ContentFormat::Lwm2mText) => {
                        let spec =
                            schema
                                .resource(resource_id)
                                .ok_or_else(|| Error::ResourceNotFound {
                                    uri: uri.instance_uri().to_string(),
                                    resource: resource_id.to_string(),
                                })?;
                        let raw = String::from_utf8_lossy(request.payload());
                        text::decode(spec.kind.element_type(), &raw)?
                    }
                    Some(format) => {
                        let mut decoded =
                            codec::decode_object(format, &schema, request.payload())?;
                        decoded.remove(&resource_id).ok_or_else(|| {
                            Error::Format(format!(
                                "payload does not carry resource {resource_id}"
                            ))
                        })?
                    }
                };
                registry.set_resource(uri, resource_id, value).await?;
            }
            None => {
                let format = request.content_format().unwrap_or(ContentFormat::Lwm2mTlv);
                let value = codec::decode_object(format, &schema, request.payload())?;
                registry.set_instance(uri, value).await?;
            }
        }
        Ok(CoapResponse::new(ResponseCode::Changed))
    }
}

/// Object-level GET. Only discover makes sense here; there is no wire
/// encoding for a whole object type.
struct ReadObject(Arc<DeviceManagement>);

impl RequestHandler for ReadObject {
    fn handle(&self, request: CoapRequest) -> BoxFuture<'_, Result<CoapResponse>> {
        Box::pin(async move {
            let object_id = param_u16(&request, "object")?;
            if request.accept() != Some(ContentFormat::LinkFormat) {
                return Ok(CoapResponse::new(ResponseCode::MethodNotAllowed));
            }
            let registry = &self.0.registry;
            registry.schema(object_id).await?;
            let mut links = Vec::new();
            let attributes = registry.object_attributes(object_id).await;
            links.push(attributes.decorate(link_format::Link::new(format!("/{object_id}"))));
            for uri in registry.list().await {
                if uri.object_id != object_id {
                    continue;
                }
                let attributes = registry.attributes(&uri).await;
                links.push(attributes.decorate(link_format::Link::new(uri.to_string())));
            }
            Ok(CoapResponse::with_payload(
                ResponseCode::Content,
                ContentFormat::LinkFormat,
                Bytes::from(link_format::serialize(&links)),
            ))
        })
    }
}

/// Object-level PUT: write-attributes for the whole type, or a `cancel`
/// sweep of every observation under it. Value writes have nowhere to go.
struct WriteObject(Arc<DeviceManagement>);

impl RequestHandler for WriteObject {
    fn handle(&self, request: CoapRequest) -> BoxFuture<'_, Result<CoapResponse>> {
        Box::pin(async move {
            let object_id = param_u16(&request, "object")?;
            if !request.payload().is_empty() || request.queries.is_empty() {
                return Ok(CoapResponse::new(ResponseCode::MethodNotAllowed));
            }
            self.0.registry.schema(object_id).await?;
            if request.query("cancel").is_some() {
                self.0.notifier.cancel_object(object_id).await;
                info!("observations under object {object_id} cancelled");
                return Ok(CoapResponse::new(ResponseCode::Changed));
            }
            let attributes = NotifyAttributes::from_queries(&request.queries)?;
            info!("attributes on object {object_id} set to {attributes:?}");
            self.0
                .registry
                .set_object_attributes(object_id, attributes)
                .await;
            Ok(CoapResponse::new(ResponseCode::Changed))
        })
    }
}

struct Execute(Arc<DeviceManagement>);

impl RequestHandler for Execute {
    fn handle(&self, request: CoapRequest) -> BoxFuture<'_, Result<CoapResponse>> {
        Box::pin(async move {
            let uri = parse_uri(&request)?;
            let arguments = String::from_utf8_lossy(request.payload()).into_owned();
            info!("execute {uri} ({arguments:?})");
            self.0.registry.execute(&uri, arguments).await?;
            Ok(CoapResponse::new(ResponseCode::Changed))
        })
    }
}

struct Create(Arc<DeviceManagement>);

impl RequestHandler for Create {
    fn handle(&self, request: CoapRequest) -> BoxFuture<'_, Result<CoapResponse>> {
        Box::pin(async move {
            let uri = parse_uri(&request)?;
            let value = if request.payload().is_empty() {
                ObjectValue::new()
            } else {
                let schema = self.0.registry.schema(uri.object_id).await?;
                let format = request.content_format().unwrap_or(ContentFormat::Lwm2mTlv);
                codec::decode_object(format, &schema, request.payload())?
            };
            let created = self
                .0
                .registry
                .create_with(uri.object_id, uri.instance_id, value)
                .await?;
            info!("created {created} for {}", request.source);
            Ok(CoapResponse::new(ResponseCode::Created).location_path(&created.to_string()))
        })
    }
}

struct Remove(Arc<DeviceManagement>);

impl RequestHandler for Remove {
    fn handle(&self, request: CoapRequest) -> BoxFuture<'_, Result<CoapResponse>> {
        Box::pin(async move {
            let uri = parse_uri(&request)?;
            self.0.registry.remove(&uri).await?;
            self.0.notifier.cancel_under(&uri).await;
            info!("removed {uri}");
            Ok(CoapResponse::new(ResponseCode::Deleted))
        })
    }
}
