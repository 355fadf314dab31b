//! CoRE link format (RFC 6690), the subset the `/rd` interface speaks.
//!
//! Registration payloads list the object tree (`</1>,</3/0>`); discover
//! responses attach attributes (`</3/6/2>;pmin=5000;pmax=20000`).

use core::fmt;

use crate::error::{Error, Result};

/// One `<target>;attr=value;attr` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Link {
    pub target: String,
    pub attributes: Vec<(String, String)>,
}

impl Link {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            attributes: Vec::new(),
        }
    }

    pub fn attribute(mut self, name: &str, value: impl fmt::Display) -> Self {
        self.attributes.push((name.to_string(), value.to_string()));
        self
    }
}

impl fmt::Display for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{}>", self.target)?;
        for (name, value) in &self.attributes {
            if value.is_empty() {
                write!(f, ";{name}")?;
            } else {
                write!(f, ";{name}={value}")?;
            }
        }
        Ok(())
    }
}

/// Join links with `,`, the wire form.
pub fn serialize(links: &[Link]) -> String {
    let rendered: Vec<String> = links.iter().map(Link::to_string).collect();
    rendered.join(",")
}

/// Parse a comma-separated link list.
pub fn parse(payload: &str) -> Result<Vec<Link>> {
    let payload = payload.trim();
    if payload.is_empty() {
        return Ok(Vec::new());
    }
    payload.split(',').map(parse_one).collect()
}

fn parse_one(raw: &str) -> Result<Link> {
    let raw = raw.trim();
    let mut parts = raw.split(';');
    let target = parts
        .next()
        .and_then(|t| t.strip_prefix('<'))
        .and_then(|t| t.strip_suffix('>'))
        .ok_or_else(|| Error::Format(format!("link entry {raw:?} has no <target>")))?;
    let mut link = Link::new(target);
    for attribute in parts {
        let (name, value) = match attribute.split_once('=') {
            Some((name, value)) => (name, value.trim_matches('"')),
            None => (attribute, ""),
        };
        if name.is_empty() {
            return Err(Error::Format(format!("empty attribute in {raw:?}")));
        }
        link.attributes.push((name.to_string(), value.to_string()));
    }
    Ok(link)
}
