//! Object schemas and value validation.
//!
//! A schema names an object type and declares its resources. Values are
//! checked against the schema before they are stored or sent, so malformed
//! data is refused at the edge instead of surfacing mid-exchange.

pub mod oma;

use std::collections::BTreeMap;

use crate::error::{Error, Result};

/// Scalar value types a resource can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceType {
    Str,
    Num,
    Bool,
    Opaque,
}

impl ResourceType {
    pub fn name(self) -> &'static str {
        match self {
            ResourceType::Str => "string",
            ResourceType::Num => "number",
            ResourceType::Bool => "boolean",
            ResourceType::Opaque => "opaque",
        }
    }
}

/// Whether a resource holds one value or an indexed set of them. Array
/// members are scalars of the declared element type; validation samples
/// the first member as representative.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Scalar(ResourceType),
    Array(ResourceType),
}

impl ResourceKind {
    pub fn element_type(self) -> ResourceType {
        match self {
            ResourceKind::Scalar(t) | ResourceKind::Array(t) => t,
        }
    }
}

/// One resource declaration inside a schema.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceSpec {
    pub id: u16,
    pub name: String,
    pub kind: ResourceKind,
    /// Whole-instance validation fails when this resource is absent.
    pub required: bool,
    /// Permitted values, strings only.
    pub enum_values: Option<Vec<String>>,
    /// Inclusive bounds, numbers only.
    pub range: Option<(f64, f64)>,
}

impl ResourceSpec {
    pub fn scalar(id: u16, name: &str, rtype: ResourceType) -> Self {
        Self {
            id,
            name: name.to_string(),
            kind: ResourceKind::Scalar(rtype),
            required: false,
            enum_values: None,
            range: None,
        }
    }

    pub fn array(id: u16, name: &str, rtype: ResourceType) -> Self {
        Self {
            id,
            name: name.to_string(),
            kind: ResourceKind::Array(rtype),
            required: false,
            enum_values: None,
            range: None,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn enumeration<I, S>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.enum_values = Some(values.into_iter().map(Into::into).collect());
        self
    }

    pub fn range(mut self, min: f64, max: f64) -> Self {
        self.range = Some((min, max));
        self
    }
}

/// A runtime value for one resource.
#[derive(Debug, Clone, PartialEq)]
pub enum ResourceValue {
    Str(String),
    Num(f64),
    Bool(bool),
    Opaque(Vec<u8>),
    Array(Vec<ResourceValue>),
}

impl ResourceValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            ResourceValue::Str(_) => "string",
            ResourceValue::Num(_) => "number",
            ResourceValue::Bool(_) => "boolean",
            ResourceValue::Opaque(_) => "opaque",
            ResourceValue::Array(_) => "array",
        }
    }

    pub fn as_num(&self) -> Option<f64> {
        match self {
            ResourceValue::Num(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ResourceValue::Str(s) => Some(s),
            _ => None,
        }
    }
}

impl From<&str> for ResourceValue {
    fn from(value: &str) -> Self {
        ResourceValue::Str(value.to_string())
    }
}

impl From<f64> for ResourceValue {
    fn from(value: f64) -> Self {
        ResourceValue::Num(value)
    }
}

impl From<bool> for ResourceValue {
    fn from(value: bool) -> Self {
        ResourceValue::Bool(value)
    }
}

/// An object instance's state: resource id to value.
pub type ObjectValue = BTreeMap<u16, ResourceValue>;

/// Declares an object type: its numeric id and resources.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectSchema {
    pub object_id: u16,
    pub name: String,
    resources: Vec<ResourceSpec>,
}

impl ObjectSchema {
    /// Build a schema, refusing contradictory declarations up front:
    /// duplicate ids or names, enumerations on non-strings, ranges on
    /// non-numbers.
    pub fn new(object_id: u16, name: &str, resources: Vec<ResourceSpec>) -> Result<Self> {
        for (index, resource) in resources.iter().enumerate() {
            let field = format!("{name}/{}", resource.name);
            if resources[..index]
                .iter()
                .any(|r| r.id == resource.id || r.name == resource.name)
            {
                return Err(Error::SchemaDefinition {
                    field,
                    reason: "duplicate resource id or name".into(),
                });
            }
            if resource.enum_values.is_some() && resource.kind.element_type() != ResourceType::Str
            {
                return Err(Error::SchemaDefinition {
                    field,
                    reason: "enumeration on a non-string resource".into(),
                });
            }
            if resource.range.is_some() && resource.kind.element_type() != ResourceType::Num {
                return Err(Error::SchemaDefinition {
                    field,
                    reason: "range on a non-numeric resource".into(),
                });
            }
            if let Some((min, max)) = resource.range {
                if min > max {
                    return Err(Error::SchemaDefinition {
                        field,
                        reason: format!("empty range [{min}, {max}]"),
                    });
                }
            }
        }
        Ok(Self {
            object_id,
            name: name.to_string(),
            resources,
        })
    }

    pub fn resources(&self) -> &[ResourceSpec] {
        &self.resources
    }

    pub fn resource(&self, id: u16) -> Option<&ResourceSpec> {
        self.resources.iter().find(|r| r.id == id)
    }

    /// Look a resource up by name, or by decimal id.
    pub fn resolve(&self, key: &str) -> Option<&ResourceSpec> {
        if let Ok(id) = key.parse::<u16>() {
            if let Some(spec) = self.resource(id) {
                return Some(spec);
            }
        }
        self.resources.iter().find(|r| r.name == key)
    }

    /// Validate a single value against the resource named or numbered `key`.
    pub fn validate_resource(&self, key: &str, value: &ResourceValue) -> Result<()> {
        let spec = self.resolve(key).ok_or_else(|| Error::ResourceNotFound {
            uri: format!("/{}", self.object_id),
            resource: key.to_string(),
        })?;
        self.check(spec, value)
    }

    /// Validate the resources present in a partial instance value. Used by
    /// the codecs, which must accept payloads carrying any subset of the
    /// declared resources.
    pub fn validate_partial(&self, value: &ObjectValue) -> Result<()> {
        for (id, resource_value) in value {
            let spec = self.resource(*id).ok_or_else(|| Error::ResourceNotFound {
                uri: format!("/{}", self.object_id),
                resource: id.to_string(),
            })?;
            self.check(spec, resource_value)?;
        }
        Ok(())
    }

    /// Validate an instance value for storage: every present resource must
    /// check out and every required resource must be present.
    pub fn validate(&self, value: &ObjectValue) -> Result<()> {
        self.validate_partial(value)?;
        for spec in &self.resources {
            if spec.required && !value.contains_key(&spec.id) {
                return Err(Error::MissingResource(format!(
                    "{}/{}",
                    self.name, spec.name
                )));
            }
        }
        Ok(())
    }

    fn check(&self, spec: &ResourceSpec, value: &ResourceValue) -> Result<()> {
        match (spec.kind, value) {
            // The first member is sampled as representative of the array.
            (ResourceKind::Array(element), ResourceValue::Array(items)) => match items.first() {
                Some(ResourceValue::Array(_)) => Err(self.mismatch(spec, "scalar array members")),
                Some(first) => self.check_scalar(spec, element, first),
                None => Ok(()),
            },
            (ResourceKind::Array(_), _) => Err(self.mismatch(spec, "array")),
            (ResourceKind::Scalar(_), ResourceValue::Array(_)) => {
                Err(self.mismatch(spec, spec.kind.element_type().name()))
            }
            (ResourceKind::Scalar(scalar), single) => self.check_scalar(spec, scalar, single),
        }
    }

    fn check_scalar(
        &self,
        spec: &ResourceSpec,
        expected: ResourceType,
        value: &ResourceValue,
    ) -> Result<()> {
        let matches_type = matches!(
            (expected, value),
            (ResourceType::Str, ResourceValue::Str(_))
                | (ResourceType::Num, ResourceValue::Num(_))
                | (ResourceType::Bool, ResourceValue::Bool(_))
                | (ResourceType::Opaque, ResourceValue::Opaque(_))
        );
        if !matches_type {
            return Err(self.mismatch(spec, expected.name()));
        }
        if let (Some(allowed), ResourceValue::Str(s)) = (&spec.enum_values, value) {
            if !allowed.iter().any(|a| a == s) {
                return Err(self.mismatch(spec, &format!("one of {allowed:?}")));
            }
        }
        if let (Some((min, max)), ResourceValue::Num(n)) = (spec.range, value) {
            if *n < min || *n > max {
                return Err(self.mismatch(spec, &format!("number in [{min}, {max}]")));
            }
        }
        Ok(())
    }

    fn mismatch(&self, spec: &ResourceSpec, expected: &str) -> Error {
        Error::TypeMismatch {
            field: format!("{}/{}", self.name, spec.name),
            expected: expected.to_string(),
        }
    }
}
