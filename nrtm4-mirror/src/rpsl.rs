//! Minimal RPSL object parsing: enough to identify an object.
//!
//! The parser extracts the object class, the source and the class specific
//! primary key. The text itself is kept verbatim as the payload.

use nested_enum_utils::common_fields;
use snafu::{Backtrace, Snafu, ensure};

#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
#[snafu(visibility(pub(crate)))]
pub enum RpslError {
    #[snafu(display("cannot determine object class"))]
    MissingObjectType {},
    #[snafu(display("{object_type} object has no source attribute"))]
    MissingSource { object_type: String },
    #[snafu(display("{object_type} object has no primary key"))]
    MissingPrimaryKey { object_type: String },
    #[snafu(display("{object_type} object needs a prefix and an origin, found {parts} key part(s)"))]
    IncompleteRouteKey { object_type: String, parts: usize },
}

/// An identified RPSL object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpslObject {
    /// Lowercase class name, e.g. `route` or `mntner`.
    pub object_type: String,
    /// Uppercase primary key.
    pub primary_key: String,
    /// Uppercase source name.
    pub source: String,
    /// The unmodified object text.
    pub payload: String,
}

impl RpslObject {
    /// Parses one object.
    pub fn parse(text: &str) -> Result<Self, RpslError> {
        let mut lines = text
            .lines()
            .map(strip_comment)
            .filter(|line| !line.is_empty());

        let (object_type, first_value) = lines
            .next()
            .and_then(|line| line.split_once(':'))
            .map(|(name, value)| (name.trim().to_ascii_lowercase(), value))
            .filter(|(name, _)| !name.is_empty())
            .ok_or_else(|| MissingObjectTypeSnafu.build())?;

        let mut key_parts = Vec::new();
        if is_key_attribute(&object_type, &object_type) {
            key_parts.push(first_value.trim().to_ascii_uppercase());
        }
        let mut source = String::new();
        for line in lines {
            let Some((name, value)) = line.split_once(':') else {
                continue;
            };
            let name = name.trim().to_ascii_lowercase();
            if name == "source" {
                source = value.trim().to_ascii_uppercase();
            } else if is_key_attribute(&object_type, &name) {
                key_parts.push(value.trim().to_ascii_uppercase());
            }
        }

        ensure!(!source.is_empty(), MissingSourceSnafu { object_type });
        ensure!(!key_parts.is_empty(), MissingPrimaryKeySnafu { object_type });
        if is_route(&object_type) {
            ensure!(
                key_parts.len() == 2,
                IncompleteRouteKeySnafu {
                    object_type,
                    parts: key_parts.len(),
                }
            );
        }
        Ok(Self {
            object_type,
            primary_key: key_parts.concat(),
            source,
            payload: text.to_string(),
        })
    }
}

fn is_route(object_type: &str) -> bool {
    matches!(object_type, "route" | "route6")
}

/// Whether `attribute` contributes to the primary key of `object_type`.
fn is_key_attribute(object_type: &str, attribute: &str) -> bool {
    match object_type {
        "person" | "role" => attribute == "nic-hdl",
        "route" | "route6" => attribute == object_type || attribute == "origin",
        _ => attribute == object_type,
    }
}

fn strip_comment(line: &str) -> &str {
    line.split('#').next().unwrap_or_default().trim()
}
