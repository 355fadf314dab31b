//! Core engine for the lightweight device-management protocol: CoAP
//! framing and routing over UDP, the object/instance/resource data model
//! with schema validation, and the payload codecs both roles share.
//!
//! The `lwm2m-client` and `lwm2m-server` crates build the two protocol
//! roles on top of this one.

pub mod attributes;
pub mod coap;
pub mod codec;
pub mod error;
pub mod registration;
pub mod schema;
pub mod transport;
pub mod uri;

pub use error::{Error, Result};
pub use uri::ObjectUri;
