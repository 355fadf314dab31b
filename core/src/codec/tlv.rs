//! Binary TLV codec for object instance payloads.
//!
//! Header layout, one per entry:
//!
//! - bits 7-6  entry type: 0 object instance, 1 resource instance,
//!             2 multiple resource, 3 resource
//! - bit 5     identifier is 16-bit (else 8-bit)
//! - bits 4-3  length field width: 0 inline, 1/2/3 trailing bytes
//! - bits 2-0  inline length when bits 4-3 are 0
//!
//! Numbers ride as minimal-width big-endian two's complement in 1, 2, 4
//! or 8 bytes. Multiple resources nest their members as resource
//! instances indexed from zero.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use log::debug;

use crate::error::{Error, Result};
use crate::schema::{ObjectSchema, ObjectValue, ResourceType, ResourceValue};

const TYPE_OBJECT_INSTANCE: u8 = 0;
const TYPE_RESOURCE_INSTANCE: u8 = 1;
const TYPE_MULTIPLE_RESOURCE: u8 = 2;
const TYPE_RESOURCE: u8 = 3;

/// Serialize a whole instance value. Resources are visited in schema
/// declaration order; values for ids the schema does not declare are
/// never emitted.
pub fn encode(schema: &ObjectSchema, value: &ObjectValue) -> Result<Bytes> {
    let mut out = BytesMut::new();
    for spec in schema.resources() {
        if let Some(resource_value) = value.get(&spec.id) {
            encode_entry(spec.id, resource_value, &mut out)?;
        }
    }
    Ok(out.freeze())
}

fn encode_entry(id: u16, value: &ResourceValue, out: &mut BytesMut) -> Result<()> {
    match value {
        ResourceValue::Array(items) => {
            let mut members = BytesMut::new();
            for (index, item) in items.iter().enumerate() {
                let body = scalar_bytes(id, item)?;
                put_header(TYPE_RESOURCE_INSTANCE, index as u16, body.len(), &mut members);
                members.put_slice(&body);
            }
            put_header(TYPE_MULTIPLE_RESOURCE, id, members.len(), out);
            out.put_slice(&members);
        }
        scalar => {
            let body = scalar_bytes(id, scalar)?;
            put_header(TYPE_RESOURCE, id, body.len(), out);
            out.put_slice(&body);
        }
    }
    Ok(())
}

fn scalar_bytes(id: u16, value: &ResourceValue) -> Result<Vec<u8>> {
    match value {
        ResourceValue::Str(s) => Ok(s.as_bytes().to_vec()),
        ResourceValue::Bool(b) => Ok(vec![u8::from(*b)]),
        ResourceValue::Opaque(bytes) => Ok(bytes.clone()),
        ResourceValue::Num(n) => {
            if n.fract() != 0.0 || *n < i64::MIN as f64 || *n > i64::MAX as f64 {
                return Err(Error::TypeMismatch {
                    field: id.to_string(),
                    expected: "integer representable in 64 bits".into(),
                });
            }
            Ok(integer_bytes(*n as i64))
        }
        ResourceValue::Array(_) => Err(Error::TypeMismatch {
            field: id.to_string(),
            expected: "scalar array members".into(),
        }),
    }
}

fn integer_bytes(v: i64) -> Vec<u8> {
    if i8::try_from(v).is_ok() {
        (v as i8).to_be_bytes().to_vec()
    } else if i16::try_from(v).is_ok() {
        (v as i16).to_be_bytes().to_vec()
    } else if i32::try_from(v).is_ok() {
        (v as i32).to_be_bytes().to_vec()
    } else {
        v.to_be_bytes().to_vec()
    }
}

fn put_header(tlv_type: u8, id: u16, len: usize, out: &mut BytesMut) {
    let mut first = tlv_type << 6;
    let wide_id = id > 0xFF;
    if wide_id {
        first |= 0b0010_0000;
    }
    if len < 8 {
        out.put_u8(first | len as u8);
        put_id(id, wide_id, out);
    } else if len <= 0xFF {
        out.put_u8(first | 0b0000_1000);
        put_id(id, wide_id, out);
        out.put_u8(len as u8);
    } else if len <= 0xFFFF {
        out.put_u8(first | 0b0001_0000);
        put_id(id, wide_id, out);
        out.put_u16(len as u16);
    } else {
        out.put_u8(first | 0b0001_1000);
        put_id(id, wide_id, out);
        out.put_u8((len >> 16) as u8);
        out.put_u16(len as u16);
    }
}

fn put_id(id: u16, wide: bool, out: &mut BytesMut) {
    if wide {
        out.put_u16(id);
    } else {
        out.put_u8(id as u8);
    }
}

/// Parse an instance payload against `schema`. Entries for resource ids
/// the schema does not declare are quietly skipped; decoded values are
/// type-checked, but the payload may carry any subset of resources.
pub fn decode(schema: &ObjectSchema, mut buf: &[u8]) -> Result<ObjectValue> {
    let mut value = ObjectValue::new();
    while buf.has_remaining() {
        let (tlv_type, id, body) = read_entry(&mut buf)?;
        match tlv_type {
            // A single wrapping object instance; its body is the resource
            // list we were after.
            TYPE_OBJECT_INSTANCE => {
                let inner = decode(schema, body)?;
                value.extend(inner);
            }
            TYPE_RESOURCE => {
                let Some(spec) = schema.resource(id) else {
                    debug!("skipping unknown resource {id} for object {}", schema.object_id);
                    continue;
                };
                value.insert(id, decode_scalar(spec.kind.element_type(), body)?);
            }
            TYPE_MULTIPLE_RESOURCE => {
                let Some(spec) = schema.resource(id) else {
                    debug!("skipping unknown resource {id} for object {}", schema.object_id);
                    continue;
                };
                let mut members = Vec::new();
                let mut inner = body;
                while inner.has_remaining() {
                    let (member_type, _index, member_body) = read_entry(&mut inner)?;
                    if member_type != TYPE_RESOURCE_INSTANCE {
                        return Err(Error::Format(format!(
                            "entry type {member_type} inside multiple resource {id}"
                        )));
                    }
                    members.push(decode_scalar(spec.kind.element_type(), member_body)?);
                }
                value.insert(id, ResourceValue::Array(members));
            }
            TYPE_RESOURCE_INSTANCE => {
                return Err(Error::Format(format!(
                    "bare resource instance {id} outside a multiple resource"
                )));
            }
            _ => unreachable!("two-bit field"),
        }
    }
    schema.validate_partial(&value)?;
    Ok(value)
}

fn read_entry<'a>(buf: &mut &'a [u8]) -> Result<(u8, u16, &'a [u8])> {
    if !buf.has_remaining() {
        return Err(Error::Format("empty TLV entry".into()));
    }
    let first = buf.get_u8();
    let tlv_type = first >> 6;
    let wide_id = first & 0b0010_0000 != 0;
    let length_width = (first >> 3) & 0b11;
    let id = if wide_id {
        if buf.remaining() < 2 {
            return Err(Error::Format("truncated TLV identifier".into()));
        }
        buf.get_u16()
    } else {
        if !buf.has_remaining() {
            return Err(Error::Format("truncated TLV identifier".into()));
        }
        buf.get_u8() as u16
    };
    let len = match length_width {
        0 => (first & 0b111) as usize,
        width => {
            let width = width as usize;
            if buf.remaining() < width {
                return Err(Error::Format("truncated TLV length".into()));
            }
            let mut len = 0usize;
            for _ in 0..width {
                len = (len << 8) | buf.get_u8() as usize;
            }
            len
        }
    };
    if buf.remaining() < len {
        return Err(Error::Format(format!(
            "TLV entry {id} claims {len} bytes, {} remain",
            buf.remaining()
        )));
    }
    let (body, rest) = buf.split_at(len);
    *buf = rest;
    Ok((tlv_type, id, body))
}

fn decode_scalar(rtype: ResourceType, body: &[u8]) -> Result<ResourceValue> {
    match rtype {
        ResourceType::Str => Ok(ResourceValue::Str(
            String::from_utf8(body.to_vec())
                .map_err(|_| Error::Format("string resource is not UTF-8".into()))?,
        )),
        ResourceType::Opaque => Ok(ResourceValue::Opaque(body.to_vec())),
        ResourceType::Bool => match body {
            [0] => Ok(ResourceValue::Bool(false)),
            [1] => Ok(ResourceValue::Bool(true)),
            _ => Err(Error::Format("boolean resource is not a 0/1 byte".into())),
        },
        ResourceType::Num => read_integer(body).map(|n| ResourceValue::Num(n as f64)),
    }
}

fn read_integer(body: &[u8]) -> Result<i64> {
    match body.len() {
        1 => Ok(i8::from_be_bytes([body[0]]) as i64),
        2 => Ok(i16::from_be_bytes([body[0], body[1]]) as i64),
        4 => Ok(i32::from_be_bytes([body[0], body[1], body[2], body[3]]) as i64),
        8 => {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(body);
            Ok(i64::from_be_bytes(raw))
        }
        other => Err(Error::Format(format!("integer width {other} not in 1/2/4/8"))),
    }
}
