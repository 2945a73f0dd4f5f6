//! Tolerant accessors for untyped FHIR documents.
//!
//! Clinical documents flow through the gateway as raw `serde_json::Value`
//! trees. These helpers read the handful of attributes the pipeline cares
//! about (`resourceType`, references, Bundle entries) and return `None` for
//! anything absent or of the wrong shape instead of panicking, mirroring the
//! tolerant parsing the rest of the system relies on.

use serde_json::Value;

/// Returns the `resourceType` of a document, if present.
///
/// A well-formed FHIR resource always carries one; absence signals a
/// malformed or error document.
pub fn resource_type(doc: &Value) -> Option<&str> {
    doc.get("resourceType")?.as_str()
}

/// Walks `path` through nested objects and returns the string at the leaf.
///
/// `get_str(doc, &["subject", "reference"])` reads `doc.subject.reference`.
pub fn get_str<'a>(doc: &'a Value, path: &[&str]) -> Option<&'a str> {
    let mut cur = doc;
    for seg in path {
        cur = cur.get(seg)?;
    }
    cur.as_str()
}

/// Walks `path` through nested objects and returns the array at the leaf.
pub fn get_array<'a>(doc: &'a Value, path: &[&str]) -> Option<&'a Vec<Value>> {
    let mut cur = doc;
    for seg in path {
        cur = cur.get(seg)?;
    }
    cur.as_array()
}

/// True when the document is a Bundle of the given `type` (e.g. "transaction",
/// "searchset").
pub fn is_bundle_of_type(doc: &Value, bundle_type: &str) -> bool {
    resource_type(doc) == Some("Bundle") && get_str(doc, &["type"]) == Some(bundle_type)
}

/// Returns the entries of a Bundle, or `None` when the document is not a
/// Bundle or has no `entry` list.
pub fn bundle_entries(doc: &Value) -> Option<&Vec<Value>> {
    if resource_type(doc) != Some("Bundle") {
        return None;
    }
    get_array(doc, &["entry"])
}
