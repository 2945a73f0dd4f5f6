pub mod document;
pub mod error;
pub mod outcome;
pub mod reference;

pub use document::{bundle_entries, get_array, get_str, is_bundle_of_type, resource_type};
pub use error::GatewayError;
pub use outcome::operation_outcome;
pub use reference::{ResourceRef, URN_UUID_PREFIX, urn_uuid, uuid_of_urn};
