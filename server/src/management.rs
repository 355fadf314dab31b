//! Outbound device management: read, write, execute, create, delete,
//! discover and write-attributes against a registered device.
//!
//! Every operation resolves the device through the registry first, so a
//! lapsed or deregistered device fails with `DeviceNotFound` before any
//! datagram leaves the socket.

use std::sync::Arc;

use bytes::Bytes;
use log::debug;

use lwm2m_core::attributes::NotifyAttributes;
use lwm2m_core::coap::message::{
    Code, CoapOption, ContentFormat, Message, Method, OptionNumber, ResponseCode,
};
use lwm2m_core::codec::link_format::{self, Link};
use lwm2m_core::error::{Error, Result};
use lwm2m_core::transport::UdpEndpoint;
use lwm2m_core::ObjectUri;

use crate::device_registry::DeviceRegistry;

/// Request skeleton addressing `uri` on a device.
pub(crate) fn device_request(endpoint: &UdpEndpoint, method: Method, uri: &ObjectUri) -> Message {
    let mut message = Message::request(method, endpoint.new_message_id(), endpoint.new_token());
    message.push_option(CoapOption::string(
        OptionNumber::UriPath,
        &uri.object_id.to_string(),
    ));
    message.push_option(CoapOption::string(
        OptionNumber::UriPath,
        &uri.instance_id.to_string(),
    ));
    if let Some(resource) = uri.resource_id {
        message.push_option(CoapOption::string(
            OptionNumber::UriPath,
            &resource.to_string(),
        ));
    }
    message
}

/// Narrow a reply down to the code an operation is entitled to. A 4.04
/// from the device means `uri` does not exist over there, which callers
/// treat differently from other failures; everything else comes back as
/// the device's own code.
pub(crate) fn remote(uri: &ObjectUri, reply: Message, wanted: ResponseCode) -> Result<Message> {
    match reply.code {
        Code::Response(code) if code == wanted => Ok(reply),
        Code::Response(ResponseCode::NotFound) => Err(Error::ObjectNotFound(uri.to_string())),
        Code::Response(code) => Err(Error::ClientError(code)),
        other => Err(Error::ClientResponse(format!(
            "expected a response, device sent {other:?}"
        ))),
    }
}

pub struct Management {
    endpoint: Arc<UdpEndpoint>,
    registry: Arc<DeviceRegistry>,
}

impl Management {
    pub fn new(endpoint: Arc<UdpEndpoint>, registry: Arc<DeviceRegistry>) -> Self {
        Self { endpoint, registry }
    }

    /// Read a resource or a whole instance. The payload comes back in
    /// whatever format the device chose, tagged with its Content-Format.
    pub async fn read(
        &self,
        device_id: u64,
        uri: &ObjectUri,
    ) -> Result<(Option<ContentFormat>, Bytes)> {
        let device = self.registry.get(device_id).await?;
        let message = device_request(&self.endpoint, Method::Get, uri);
        debug!("read {uri} from {} (rd/{device_id})", device.endpoint);
        let reply = self.endpoint.request(message, device.address).await?;
        let reply = remote(uri, reply, ResponseCode::Content)?;
        Ok((reply.content_format(), reply.payload))
    }

    /// Read a single resource as its plain-text rendering.
    pub async fn read_text(&self, device_id: u64, uri: &ObjectUri) -> Result<String> {
        let (_, payload) = self.read(device_id, uri).await?;
        String::from_utf8(payload.to_vec())
            .map_err(|_| Error::Format("resource value is not UTF-8".into()))
    }

    /// Replace a single resource with a plain-text value.
    pub async fn write(&self, device_id: u64, uri: &ObjectUri, value: &str) -> Result<()> {
        let device = self.registry.get(device_id).await?;
        let mut message = device_request(&self.endpoint, Method::Put, uri);
        message.push_option(CoapOption::uint(
            OptionNumber::ContentFormat,
            ContentFormat::Lwm2mText as u32,
        ));
        message.payload = Bytes::copy_from_slice(value.as_bytes());
        debug!("write {uri} = {value:?} on {}", device.endpoint);
        let reply = self.endpoint.request(message, device.address).await?;
        remote(uri, reply, ResponseCode::Changed)?;
        Ok(())
    }

    /// Replace a whole instance with an encoded payload.
    pub async fn write_instance(
        &self,
        device_id: u64,
        uri: &ObjectUri,
        format: ContentFormat,
        payload: Bytes,
    ) -> Result<()> {
        let device = self.registry.get(device_id).await?;
        let mut message = device_request(&self.endpoint, Method::Put, uri);
        message.push_option(CoapOption::uint(OptionNumber::ContentFormat, format as u32));
        message.payload = payload;
        debug!("write {uri} ({format:?}) on {}", device.endpoint);
        let reply = self.endpoint.request(message, device.address).await?;
        remote(uri, reply, ResponseCode::Changed)?;
        Ok(())
    }

    /// Trigger an executable resource, passing `arguments` through opaquely.
    pub async fn execute(&self, device_id: u64, uri: &ObjectUri, arguments: &[u8]) -> Result<()> {
        let device = self.registry.get(device_id).await?;
        let mut message = device_request(&self.endpoint, Method::Post, uri);
        message.payload = Bytes::copy_from_slice(arguments);
        debug!("execute {uri} on {}", device.endpoint);
        let reply = self.endpoint.request(message, device.address).await?;
        remote(uri, reply, ResponseCode::Changed)?;
        Ok(())
    }

    /// Create an object instance at `uri`, returning the location the
    /// device reports it under.
    pub async fn create(
        &self,
        device_id: u64,
        uri: &ObjectUri,
        format: ContentFormat,
        payload: Bytes,
    ) -> Result<String> {
        let device = self.registry.get(device_id).await?;
        let mut message = device_request(&self.endpoint, Method::Post, uri);
        message.push_option(CoapOption::uint(OptionNumber::ContentFormat, format as u32));
        message.payload = payload;
        debug!("create {uri} on {}", device.endpoint);
        let reply = self.endpoint.request(message, device.address).await?;
        let reply = remote(uri, reply, ResponseCode::Created)?;
        let mut location = String::new();
        for segment in reply.options_of(OptionNumber::LocationPath) {
            location.push('/');
            location.push_str(&segment.as_str());
        }
        Ok(location)
    }

    /// Delete an object instance.
    pub async fn remove(&self, device_id: u64, uri: &ObjectUri) -> Result<()> {
        let device = self.registry.get(device_id).await?;
        let message = device_request(&self.endpoint, Method::Delete, uri);
        debug!("delete {uri} on {}", device.endpoint);
        let reply = self.endpoint.request(message, device.address).await?;
        remote(uri, reply, ResponseCode::Deleted)?;
        Ok(())
    }

    /// Discover the links (and attached notification attributes) below `uri`.
    pub async fn discover(&self, device_id: u64, uri: &ObjectUri) -> Result<Vec<Link>> {
        let device = self.registry.get(device_id).await?;
        let mut message = device_request(&self.endpoint, Method::Get, uri);
        message.push_option(CoapOption::uint(
            OptionNumber::Accept,
            ContentFormat::LinkFormat as u32,
        ));
        debug!("discover {uri} on {}", device.endpoint);
        let reply = self.endpoint.request(message, device.address).await?;
        let reply = remote(uri, reply, ResponseCode::Content)?;
        let raw = String::from_utf8(reply.payload.to_vec())
            .map_err(|_| Error::Format("discover payload is not UTF-8".into()))?;
        link_format::parse(&raw)
    }

    /// Attach notification attributes to `uri` ahead of an observation.
    pub async fn write_attributes(
        &self,
        device_id: u64,
        uri: &ObjectUri,
        attributes: &NotifyAttributes,
    ) -> Result<()> {
        if attributes.is_empty() {
            return Err(Error::BadRequest("no attributes to write".into()));
        }
        let device = self.registry.get(device_id).await?;
        let mut message = device_request(&self.endpoint, Method::Put, uri);
        for query in attributes.to_queries() {
            message.push_option(CoapOption::string(OptionNumber::UriQuery, &query));
        }
        debug!("write-attributes {uri} on {}", device.endpoint);
        let reply = self.endpoint.request(message, device.address).await?;
        remote(uri, reply, ResponseCode::Changed)?;
        Ok(())
    }
}
