//! SenML-shaped JSON codec for object instance payloads.
//!
//! Payloads look like
//! `{"e":[{"n":"0","sv":"ACME"},{"n":"9","v":42}]}` where `n` is the
//! resource id, with `/index` appended for members of a multiple
//! resource. Strings ride in `sv`, numbers in `v`, booleans in `bv`;
//! opaque resources are base64 inside `sv`. Fields we do not know are
//! ignored, which keeps us compatible with richer SenML emitters.

use std::collections::BTreeMap;

use base64ct::{Base64, Encoding};
use bytes::Bytes;
use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::schema::{ObjectSchema, ObjectValue, ResourceKind, ResourceType, ResourceValue};

#[derive(Debug, Serialize, Deserialize)]
struct Entry {
    n: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    v: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    sv: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    bv: Option<bool>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Payload {
    e: Vec<Entry>,
}

/// Serialize an instance value against `schema`, validation first: a
/// value carrying a single resource is checked as that resource alone,
/// anything larger as a whole instance. Resources the schema does not
/// declare, and members with no SenML form, are skipped with a warning
/// instead of failing the payload.
pub fn encode(schema: &ObjectSchema, value: &ObjectValue) -> Result<Bytes> {
    let mut known = ObjectValue::new();
    for (id, resource_value) in value {
        if schema.resource(*id).is_none() {
            warn!(
                "not serializing unknown resource {id} for object {}",
                schema.object_id
            );
            continue;
        }
        known.insert(*id, resource_value.clone());
    }
    if value.len() == 1 {
        if let Some((id, resource_value)) = known.iter().next() {
            schema.validate_resource(&id.to_string(), resource_value)?;
        }
    } else {
        schema.validate(&known)?;
    }

    let mut entries = Vec::new();
    for (id, resource_value) in &known {
        match resource_value {
            ResourceValue::Array(items) => {
                for (index, item) in items.iter().enumerate() {
                    entries.extend(entry(format!("{id}/{index}"), item));
                }
            }
            scalar => entries.extend(entry(id.to_string(), scalar)),
        }
    }
    Ok(Bytes::from(serde_json::to_vec(&Payload { e: entries })?))
}

fn entry(n: String, value: &ResourceValue) -> Option<Entry> {
    let mut entry = Entry {
        n,
        v: None,
        sv: None,
        bv: None,
    };
    match value {
        ResourceValue::Str(s) => entry.sv = Some(s.clone()),
        ResourceValue::Num(n) => entry.v = Some(*n),
        ResourceValue::Bool(b) => entry.bv = Some(*b),
        ResourceValue::Opaque(bytes) => entry.sv = Some(Base64::encode_string(bytes)),
        ResourceValue::Array(_) => {
            warn!("not serializing {}: nested arrays have no SenML form", entry.n);
            return None;
        }
    }
    Some(entry)
}

/// Parse an instance payload against `schema`. Entries naming resources
/// the schema does not declare are quietly skipped; decoded values are
/// type-checked, but the payload may carry any subset of resources.
pub fn decode(schema: &ObjectSchema, bytes: &[u8]) -> Result<ObjectValue> {
    let payload: Payload = serde_json::from_slice(bytes)?;
    let mut scalars = ObjectValue::new();
    let mut arrays: BTreeMap<u16, BTreeMap<u16, ResourceValue>> = BTreeMap::new();

    for entry in payload.e {
        let (id, index) = match parse_name(&entry.n) {
            Some(parsed) => parsed,
            None => {
                debug!("skipping entry with unparseable name {:?}", entry.n);
                continue;
            }
        };
        let Some(spec) = schema.resource(id) else {
            debug!("skipping unknown resource {id} for object {}", schema.object_id);
            continue;
        };
        let value = extract(&entry, spec.kind.element_type())?;
        match (spec.kind, index) {
            (ResourceKind::Array(_), Some(index)) => {
                arrays.entry(id).or_default().insert(index, value);
            }
            (ResourceKind::Array(_), None) => {
                return Err(Error::Format(format!(
                    "resource {id} is multiple, entry {:?} has no index",
                    entry.n
                )));
            }
            (ResourceKind::Scalar(_), None) => {
                scalars.insert(id, value);
            }
            (ResourceKind::Scalar(_), Some(_)) => {
                return Err(Error::Format(format!(
                    "resource {id} is single, entry {:?} has an index",
                    entry.n
                )));
            }
        }
    }

    for (id, members) in arrays {
        scalars.insert(
            id,
            ResourceValue::Array(members.into_values().collect()),
        );
    }
    schema.validate_partial(&scalars)?;
    Ok(scalars)
}

/// `"5"` or `"5/0"`, both segments numeric.
fn parse_name(n: &str) -> Option<(u16, Option<u16>)> {
    match n.split_once('/') {
        Some((id, index)) => Some((id.parse().ok()?, Some(index.parse().ok()?))),
        None => Some((n.parse().ok()?, None)),
    }
}

fn extract(entry: &Entry, rtype: ResourceType) -> Result<ResourceValue> {
    let missing = |field: &str| {
        Error::Format(format!("entry {:?} carries no {field}", entry.n))
    };
    match rtype {
        ResourceType::Str => entry
            .sv
            .clone()
            .map(ResourceValue::Str)
            .ok_or_else(|| missing("sv")),
        ResourceType::Num => entry.v.map(ResourceValue::Num).ok_or_else(|| missing("v")),
        ResourceType::Bool => entry.bv.map(ResourceValue::Bool).ok_or_else(|| missing("bv")),
        ResourceType::Opaque => {
            let sv = entry.sv.as_deref().ok_or_else(|| missing("sv"))?;
            Base64::decode_vec(sv)
                .map(ResourceValue::Opaque)
                .map_err(|_| Error::Format(format!("entry {:?} is not base64", entry.n)))
        }
    }
}
