//! Per-context request ids. Log lines of one context carry the same `[corr=...]` tag.

use std::fmt;

use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CorrelationId(String);

impl CorrelationId {
    /// Keep the caller's id if it has any content; a blank or absent one gets a fresh v4.
    pub fn from_upstream(upstream: Option<&str>) -> Self {
        match upstream.map(str::trim) {
            Some(id) if !id.is_empty() => Self(id.to_string()),
            _ => Self(Uuid::new_v4().to_string()),
        }
    }

    pub fn as_str(&self) -> &str { &self.0 }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.0) }
}
