//! Registration parameters shared by both sides of the `/rd` interface.
//!
//! The client serializes these into Uri-Query options; the server parses
//! them back out. Keeping the grammar in one place keeps the two in step.

use core::fmt;
use std::str::FromStr;

use bitflags::bitflags;

use crate::error::{Error, Result};

/// Default registration lifetime in seconds when the client sends no `lt`.
pub const DEFAULT_LIFETIME_SECS: u64 = 86_400;

/// Protocol version advertised in `lwm2m=`.
pub const PROTOCOL_VERSION: &str = "1.0";

bitflags! {
    /// Transport binding advertised at registration (`b=`). `U` is plain
    /// UDP, `Q` queue mode, `S` SMS; combinations such as `UQ` are legal.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BindingMode: u8 {
        const U = 0b001;
        const Q = 0b010;
        const S = 0b100;
    }
}

impl Default for BindingMode {
    fn default() -> Self {
        BindingMode::U
    }
}

impl fmt::Display for BindingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.contains(BindingMode::U) {
            f.write_str("U")?;
        }
        if self.contains(BindingMode::Q) {
            f.write_str("Q")?;
        }
        if self.contains(BindingMode::S) {
            f.write_str("S")?;
        }
        Ok(())
    }
}

impl FromStr for BindingMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut mode = BindingMode::empty();
        for c in s.chars() {
            mode |= match c {
                'U' => BindingMode::U,
                'Q' => BindingMode::Q,
                'S' => BindingMode::S,
                other => {
                    return Err(Error::BadRequest(format!("unknown binding mode {other:?}")))
                }
            };
        }
        if mode.is_empty() {
            return Err(Error::BadRequest("empty binding mode".into()));
        }
        Ok(mode)
    }
}

/// Everything a client states about itself when it registers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationParams {
    pub endpoint: String,
    pub lifetime: u64,
    pub version: String,
    pub binding: BindingMode,
}

impl RegistrationParams {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            lifetime: DEFAULT_LIFETIME_SECS,
            version: PROTOCOL_VERSION.to_string(),
            binding: BindingMode::default(),
        }
    }

    /// Uri-Query values in `k=v` form, one per option.
    pub fn to_queries(&self) -> Vec<String> {
        vec![
            format!("ep={}", self.endpoint),
            format!("lt={}", self.lifetime),
            format!("lwm2m={}", self.version),
            format!("b={}", self.binding),
        ]
    }

    /// Parse from query pairs. Only `ep` is mandatory; the rest fall back
    /// to defaults so older clients still register.
    pub fn from_queries(queries: &[(String, String)]) -> Result<Self> {
        let mut params: Option<RegistrationParams> = None;
        let mut lifetime = DEFAULT_LIFETIME_SECS;
        let mut version = PROTOCOL_VERSION.to_string();
        let mut binding = BindingMode::default();
        for (key, value) in queries {
            match key.as_str() {
                "ep" => {
                    if value.is_empty() {
                        return Err(Error::BadRequest("empty endpoint name".into()));
                    }
                    params = Some(RegistrationParams::new(value.clone()));
                }
                "lt" => {
                    lifetime = value
                        .parse()
                        .map_err(|_| Error::BadRequest(format!("bad lifetime {value:?}")))?;
                }
                "lwm2m" => version = value.clone(),
                "b" => binding = value.parse()?,
                _ => {}
            }
        }
        let mut params =
            params.ok_or_else(|| Error::BadRequest("registration without ep=".into()))?;
        params.lifetime = lifetime;
        params.version = version;
        params.binding = binding;
        Ok(params)
    }
}
