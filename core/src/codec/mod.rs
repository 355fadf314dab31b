//! Payload codecs, selected by CoAP content format.

pub mod link_format;
pub mod senml;
pub mod text;
pub mod tlv;

use bytes::Bytes;

use crate::coap::message::ContentFormat;
use crate::error::{Error, Result};
use crate::schema::{ObjectSchema, ObjectValue};

/// Serialize a whole instance in the requested format. Text is scalar-only
/// and refused here; link format carries structure, not values.
pub fn encode_object(
    format: ContentFormat,
    schema: &ObjectSchema,
    value: &ObjectValue,
) -> Result<Bytes> {
    match format {
        ContentFormat::Lwm2mTlv => tlv::encode(schema, value),
        ContentFormat::Lwm2mJson | ContentFormat::Json => senml::encode(schema, value),
        other => Err(Error::Format(format!(
            "cannot serialize an object instance as {other:?}"
        ))),
    }
}

/// Parse a whole instance in the stated format.
pub fn decode_object(
    format: ContentFormat,
    schema: &ObjectSchema,
    payload: &[u8],
) -> Result<ObjectValue> {
    match format {
        ContentFormat::Lwm2mTlv => tlv::decode(schema, payload),
        ContentFormat::Lwm2mJson | ContentFormat::Json => senml::decode(schema, payload),
        other => Err(Error::Format(format!(
            "cannot parse an object instance from {other:?}"
        ))),
    }
}
