//! Pre-processors that run before the backend call.

mod bundle;
mod everything;
mod validation;

pub use bundle::TransformBundle;
pub use everything::PatientEverything;
pub use validation::ProfileValidation;
