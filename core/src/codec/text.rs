//! Plain-text codec used for single-resource reads and writes.

use base64ct::{Base64, Encoding};

use crate::error::{Error, Result};
use crate::schema::{ResourceType, ResourceValue};

/// Render one scalar as its text form. Opaque values go out as base64;
/// arrays as comma-joined members.
pub fn encode(value: &ResourceValue) -> String {
    match value {
        ResourceValue::Str(s) => s.clone(),
        ResourceValue::Num(n) => {
            if n.fract() == 0.0 && n.abs() < 1e15 {
                format!("{}", *n as i64)
            } else {
                n.to_string()
            }
        }
        ResourceValue::Bool(b) => b.to_string(),
        ResourceValue::Opaque(bytes) => Base64::encode_string(bytes),
        ResourceValue::Array(items) => {
            let rendered: Vec<String> = items.iter().map(encode).collect();
            rendered.join(",")
        }
    }
}

/// Parse one scalar of the declared type from its text form.
pub fn decode(rtype: ResourceType, text: &str) -> Result<ResourceValue> {
    match rtype {
        ResourceType::Str => Ok(ResourceValue::Str(text.to_string())),
        ResourceType::Num => text
            .trim()
            .parse()
            .map(ResourceValue::Num)
            .map_err(|_| Error::Format(format!("{text:?} is not a number"))),
        ResourceType::Bool => match text.trim() {
            "true" | "1" => Ok(ResourceValue::Bool(true)),
            "false" | "0" => Ok(ResourceValue::Bool(false)),
            other => Err(Error::Format(format!("{other:?} is not a boolean"))),
        },
        ResourceType::Opaque => Base64::decode_vec(text.trim())
            .map(ResourceValue::Opaque)
            .map_err(|_| Error::Format(format!("{text:?} is not base64"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integral_numbers_render_without_a_point() {
        assert_eq!(encode(&ResourceValue::Num(42.0)), "42");
        assert_eq!(encode(&ResourceValue::Num(21.5)), "21.5");
        assert_eq!(encode(&ResourceValue::Num(-3.0)), "-3");
    }

    #[test]
    fn decodes_each_type() {
        assert_eq!(
            decode(ResourceType::Num, "21.5").unwrap(),
            ResourceValue::Num(21.5)
        );
        assert_eq!(
            decode(ResourceType::Bool, "1").unwrap(),
            ResourceValue::Bool(true)
        );
        assert_eq!(
            decode(ResourceType::Str, "Cel").unwrap(),
            ResourceValue::Str("Cel".into())
        );
        assert!(decode(ResourceType::Num, "warm").is_err());
        assert!(decode(ResourceType::Opaque, "!!!").is_err());
    }
}
