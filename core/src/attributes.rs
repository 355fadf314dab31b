//! Notification attributes attached to resources by write-attributes.
//!
//! Five attributes are understood: `pmin` and `pmax` bound the notify
//! period in milliseconds, `gt`/`lt` are value thresholds and `st` a
//! minimum step. Anything else in a write-attributes request is refused
//! by name, so a misspelled attribute fails loudly instead of being
//! silently dropped.

use crate::codec::link_format::Link;
use crate::error::{Error, Result};

pub const SUPPORTED: [&str; 5] = ["pmin", "pmax", "gt", "lt", "st"];

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct NotifyAttributes {
    /// Minimum period between notifications, milliseconds.
    pub pmin: Option<u64>,
    /// Maximum quiet period before a notification is forced, milliseconds.
    pub pmax: Option<u64>,
    /// Notify when the value exceeds this threshold.
    pub gt: Option<f64>,
    /// Notify when the value falls below this threshold.
    pub lt: Option<f64>,
    /// Notify when the value moves at least this much.
    pub st: Option<f64>,
}

impl NotifyAttributes {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Parse from Uri-Query pairs, refusing unsupported names.
    pub fn from_queries(queries: &[(String, String)]) -> Result<Self> {
        let unsupported: Vec<String> = queries
            .iter()
            .filter(|(k, _)| !SUPPORTED.contains(&k.as_str()))
            .map(|(k, _)| k.clone())
            .collect();
        if !unsupported.is_empty() {
            return Err(Error::UnsupportedAttributes(unsupported));
        }
        let mut attributes = Self::default();
        for (key, value) in queries {
            match key.as_str() {
                "pmin" => attributes.pmin = Some(parse_period(key, value)?),
                "pmax" => attributes.pmax = Some(parse_period(key, value)?),
                "gt" => attributes.gt = Some(parse_threshold(key, value)?),
                "lt" => attributes.lt = Some(parse_threshold(key, value)?),
                "st" => attributes.st = Some(parse_threshold(key, value)?),
                _ => unreachable!("filtered above"),
            }
        }
        Ok(attributes)
    }

    /// Render as `k=v` query values, supported-attribute order.
    pub fn to_queries(&self) -> Vec<String> {
        let mut queries = Vec::new();
        if let Some(pmin) = self.pmin {
            queries.push(format!("pmin={pmin}"));
        }
        if let Some(pmax) = self.pmax {
            queries.push(format!("pmax={pmax}"));
        }
        if let Some(gt) = self.gt {
            queries.push(format!("gt={gt}"));
        }
        if let Some(lt) = self.lt {
            queries.push(format!("lt={lt}"));
        }
        if let Some(st) = self.st {
            queries.push(format!("st={st}"));
        }
        queries
    }

    /// Attach the set attributes to a discover link, same order.
    pub fn decorate(&self, mut link: Link) -> Link {
        if let Some(pmin) = self.pmin {
            link = link.attribute("pmin", pmin);
        }
        if let Some(pmax) = self.pmax {
            link = link.attribute("pmax", pmax);
        }
        if let Some(gt) = self.gt {
            link = link.attribute("gt", gt);
        }
        if let Some(lt) = self.lt {
            link = link.attribute("lt", lt);
        }
        if let Some(st) = self.st {
            link = link.attribute("st", st);
        }
        link
    }
}

fn parse_period(key: &str, value: &str) -> Result<u64> {
    value
        .parse()
        .map_err(|_| Error::BadRequest(format!("{key}={value:?} is not a period")))
}

fn parse_threshold(key: &str, value: &str) -> Result<f64> {
    value
        .parse()
        .map_err(|_| Error::BadRequest(format!("{key}={value:?} is not a number")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pairs(raw: &[(&str, &str)]) -> Vec<(String, String)> {
        raw.iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn parses_the_full_set() {
        let attributes = NotifyAttributes::from_queries(&pairs(&[
            ("pmin", "5000"),
            ("pmax", "20000"),
            ("gt", "30"),
            ("lt", "-5"),
            ("st", "0.5"),
        ]))
        .unwrap();
        assert_eq!(attributes.pmin, Some(5000));
        assert_eq!(attributes.st, Some(0.5));
    }

    #[test]
    fn unsupported_names_are_refused_by_name() {
        let err = NotifyAttributes::from_queries(&pairs(&[("pmin", "5000"), ("foo", "bar")]))
            .unwrap_err();
        match err {
            Error::UnsupportedAttributes(names) => assert_eq!(names, vec!["foo"]),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn renders_in_stable_order() {
        let attributes = NotifyAttributes {
            pmax: Some(20000),
            pmin: Some(5000),
            ..Default::default()
        };
        assert_eq!(attributes.to_queries(), vec!["pmin=5000", "pmax=20000"]);
        let link = attributes.decorate(Link::new("/3/6/2"));
        assert_eq!(link.to_string(), "</3/6/2>;pmin=5000;pmax=20000");
    }

    #[test]
    fn bad_numbers_are_bad_requests() {
        let err = NotifyAttributes::from_queries(&pairs(&[("pmin", "soon")])).unwrap_err();
        assert!(matches!(err, Error::BadRequest(_)));
    }
}
