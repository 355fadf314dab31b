//! Built-in schemas for the standard object ids most devices expose.
//!
//! These cover the value-bearing resources of the OMA Security (0),
//! Device (3) and Location (6) objects. Applications register their own
//! schemas for everything else.

use once_cell::sync::Lazy;

use super::{ObjectSchema, ResourceSpec, ResourceType};

pub static SECURITY: Lazy<ObjectSchema> = Lazy::new(|| {
    ObjectSchema::new(
        0,
        "Security",
        vec![
            ResourceSpec::scalar(0, "serverUri", ResourceType::Str),
            ResourceSpec::scalar(1, "bootstrapServer", ResourceType::Bool),
            ResourceSpec::scalar(2, "securityMode", ResourceType::Num).range(0.0, 3.0),
            ResourceSpec::scalar(3, "publicKeyOrIdentity", ResourceType::Opaque),
            ResourceSpec::scalar(4, "serverPublicKey", ResourceType::Opaque),
            ResourceSpec::scalar(5, "secretKey", ResourceType::Opaque),
            ResourceSpec::scalar(10, "shortServerId", ResourceType::Num),
        ],
    )
    .expect("static schema")
});

pub static DEVICE: Lazy<ObjectSchema> = Lazy::new(|| {
    ObjectSchema::new(
        3,
        "Device",
        vec![
            ResourceSpec::scalar(0, "manufacturer", ResourceType::Str),
            ResourceSpec::scalar(1, "modelNumber", ResourceType::Str),
            ResourceSpec::scalar(2, "serialNumber", ResourceType::Str),
            ResourceSpec::scalar(3, "firmwareVersion", ResourceType::Str),
            ResourceSpec::array(6, "availablePowerSources", ResourceType::Num).range(0.0, 7.0),
            ResourceSpec::array(7, "powerSourceVoltage", ResourceType::Num),
            ResourceSpec::scalar(9, "batteryLevel", ResourceType::Num).range(0.0, 100.0),
            ResourceSpec::scalar(13, "currentTime", ResourceType::Num),
            ResourceSpec::scalar(14, "utcOffset", ResourceType::Str),
            ResourceSpec::scalar(16, "supportedBindingModes", ResourceType::Str),
        ],
    )
    .expect("static schema")
});

pub static LOCATION: Lazy<ObjectSchema> = Lazy::new(|| {
    ObjectSchema::new(
        6,
        "Location",
        vec![
            ResourceSpec::scalar(0, "latitude", ResourceType::Num).range(-90.0, 90.0),
            ResourceSpec::scalar(1, "longitude", ResourceType::Num).range(-180.0, 180.0),
            ResourceSpec::scalar(2, "altitude", ResourceType::Num),
            ResourceSpec::scalar(5, "timestamp", ResourceType::Num),
        ],
    )
    .expect("static schema")
});

/// The built-in schema for `object_id`, if there is one.
pub fn builtin(object_id: u16) -> Option<&'static ObjectSchema> {
    match object_id {
        0 => Some(&SECURITY),
        3 => Some(&DEVICE),
        6 => Some(&LOCATION),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::ResourceValue;

    #[test]
    fn builtins_resolve_by_id() {
        assert_eq!(builtin(3).unwrap().name, "Device");
        assert_eq!(builtin(6).unwrap().name, "Location");
        assert!(builtin(3303).is_none());
    }

    #[test]
    fn device_schema_validates_real_values() {
        DEVICE
            .validate_resource("manufacturer", &"ACME".into())
            .unwrap();
        DEVICE
            .validate_resource("batteryLevel", &ResourceValue::Num(42.0))
            .unwrap();
        assert!(DEVICE
            .validate_resource("batteryLevel", &ResourceValue::Num(250.0))
            .is_err());
    }
}
