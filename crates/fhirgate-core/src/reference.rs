//! Resource reference parsing.
//!
//! References move through the gateway in two forms: relative
//! `ResourceType/id` strings and temporary `urn:uuid:` tokens that
//! cross-link not-yet-created resources inside one transaction submission.

use std::fmt;

/// Prefix of a temporary client-assigned bundle reference.
pub const URN_UUID_PREFIX: &str = "urn:uuid:";

/// A parsed relative reference (`Patient/123`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceRef {
    pub resource_type: String,
    pub id: String,
}

impl ResourceRef {
    pub fn new(resource_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            id: id.into(),
        }
    }

    /// Parses a relative `Type/id` reference. Anything else (absolute URLs,
    /// contained `#` references, urns, bare ids) yields `None`.
    pub fn parse(reference: &str) -> Option<Self> {
        let (resource_type, id) = reference.split_once('/')?;
        if resource_type.is_empty() || id.is_empty() || id.contains('/') {
            return None;
        }
        Some(Self::new(resource_type, id))
    }

    pub fn is_type(&self, resource_type: &str) -> bool {
        self.resource_type == resource_type
    }
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.resource_type, self.id)
    }
}

/// Builds a `urn:uuid:<id>` token.
pub fn urn_uuid(id: &str) -> String {
    format!("{URN_UUID_PREFIX}{id}")
}

/// Extracts the uuid portion of a `urn:uuid:` token, if it is one.
pub fn uuid_of_urn(full_url: &str) -> Option<&str> {
    full_url.strip_prefix(URN_UUID_PREFIX).filter(|s| !s.is_empty())
}
