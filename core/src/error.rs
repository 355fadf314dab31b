//! Error taxonomy shared by both protocol roles.
//!
//! Every failure a handler can produce maps onto exactly one CoAP response
//! code via [`Error::response_code`]; transport failures are translated into
//! this taxonomy at the send/receive boundary so application code never sees
//! raw socket errors.

use thiserror::Error;

use crate::coap::message::ResponseCode;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// Malformed input or a missing mandatory parameter.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Object URI did not match `/<objectType>/<objectInstance>[/<resourceId>]`.
    #[error("URI did not match an object URI pattern: {0}")]
    MalformedUri(String),

    /// No device registered under the given id.
    #[error("device not found: {0}")]
    DeviceNotFound(String),

    /// No object instance stored under the given URI.
    #[error("object not found: {0}")]
    ObjectNotFound(String),

    /// Object exists but the addressed resource does not.
    #[error("resource {resource} not found in {uri}")]
    ResourceNotFound { uri: String, resource: String },

    /// Registration path did not resolve to a configured device type.
    #[error("device type not found for path: {0}")]
    TypeNotFound(String),

    /// Write-attributes request carried keys outside the allowed set.
    #[error("unsupported attributes: {0:?}")]
    UnsupportedAttributes(Vec<String>),

    /// Malformed schema definition. Surfaces at construction time; a schema
    /// that builds is immutable and cannot fail later.
    #[error("invalid resource definition for {field}: {reason}")]
    SchemaDefinition { field: String, reason: String },

    /// Value did not match the declared resource type or its validator.
    #[error("type mismatch for resource {field}: expected {expected}")]
    TypeMismatch { field: String, expected: String },

    /// A mandatory resource was absent from the object.
    #[error("missing mandatory resource: {0}")]
    MissingResource(String),

    /// Payload did not parse under the negotiated content format.
    #[error("payload format error: {0}")]
    Format(String),

    /// Backing store failure inside a registry.
    #[error("registry error: {0}")]
    Registry(String),

    /// Registration pipeline failed past validation.
    #[error("registration failed: {0}")]
    Registration(String),

    /// The peer could not be reached or stopped answering.
    #[error("client connection error: {0}")]
    ClientConnection(String),

    /// The peer answered with something other than a CoAP response.
    #[error("client response error: {0}")]
    ClientResponse(String),

    /// The peer answered with an error code of its own; propagated verbatim.
    #[error("client returned error code {0}")]
    ClientError(ResponseCode),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// The CoAP response code a handler answers with when this error
    /// short-circuits its pipeline.
    pub fn response_code(&self) -> ResponseCode {
        match self {
            Error::BadRequest(_)
            | Error::MalformedUri(_)
            | Error::UnsupportedAttributes(_)
            | Error::SchemaDefinition { .. }
            | Error::TypeMismatch { .. }
            | Error::MissingResource(_)
            | Error::Format(_)
            | Error::Json(_) => ResponseCode::BadRequest,
            Error::DeviceNotFound(_)
            | Error::ObjectNotFound(_)
            | Error::ResourceNotFound { .. }
            | Error::TypeNotFound(_) => ResponseCode::NotFound,
            Error::Registry(_)
            | Error::Registration(_)
            | Error::ClientConnection(_)
            | Error::ClientResponse(_)
            | Error::Io(_) => ResponseCode::NotImplemented,
            Error::ClientError(code) => *code,
        }
    }
}
