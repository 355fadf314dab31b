//! Object tree addressing.
//!
//! Every addressable thing lives at `/<object>/<instance>` or
//! `/<object>/<instance>/<resource>`, all segments numeric. Anything else
//! is malformed and rejected before it reaches a handler.

use core::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// A parsed object-tree URI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectUri {
    pub object_id: u16,
    pub instance_id: u16,
    pub resource_id: Option<u16>,
}

impl ObjectUri {
    pub fn instance(object_id: u16, instance_id: u16) -> Self {
        Self {
            object_id,
            instance_id,
            resource_id: None,
        }
    }

    pub fn resource(object_id: u16, instance_id: u16, resource_id: u16) -> Self {
        Self {
            object_id,
            instance_id,
            resource_id: Some(resource_id),
        }
    }

    /// The enclosing instance, with any resource segment dropped.
    pub fn instance_uri(&self) -> ObjectUri {
        Self::instance(self.object_id, self.instance_id)
    }
}

fn segment(uri: &str, raw: &str) -> Result<u16> {
    raw.parse()
        .map_err(|_| Error::MalformedUri(format!("non-numeric segment {raw:?} in {uri:?}")))
}

impl FromStr for ObjectUri {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let Some(rest) = s.strip_prefix('/') else {
            return Err(Error::MalformedUri(format!("{s:?} does not start with /")));
        };
        let segments: Vec<&str> = rest.split('/').collect();
        match segments.as_slice() {
            [object, instance] => Ok(Self::instance(segment(s, object)?, segment(s, instance)?)),
            [object, instance, resource] => Ok(Self::resource(
                segment(s, object)?,
                segment(s, instance)?,
                segment(s, resource)?,
            )),
            _ => Err(Error::MalformedUri(format!(
                "{s:?} must have two or three segments"
            ))),
        }
    }
}

impl fmt::Display for ObjectUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}/{}", self.object_id, self.instance_id)?;
        if let Some(resource) = self.resource_id {
            write!(f, "/{resource}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_instance_and_resource_uris() {
        let instance: ObjectUri = "/3/6".parse().unwrap();
        assert_eq!(instance, ObjectUri::instance(3, 6));
        let resource: ObjectUri = "/3/6/2".parse().unwrap();
        assert_eq!(resource, ObjectUri::resource(3, 6, 2));
        assert_eq!(resource.instance_uri(), instance);
        assert_eq!(resource.to_string(), "/3/6/2");
    }

    #[test]
    fn rejects_malformed_uris() {
        for bad in ["3/6", "/3", "/3/6/2/9", "/x/1", "/3/-1", "/3/99999"] {
            let err = bad.parse::<ObjectUri>().unwrap_err();
            assert!(matches!(err, Error::MalformedUri(_)), "{bad} should fail");
        }
    }
}
