pub mod client;
pub mod response;
pub mod token;

pub use client::{ClientError, FhirBackend, FhirClient};
pub use response::{BackendResponse, DEFAULT_RETAINED_HEADERS};
pub use token::{AccessToken, OAuthClientCredentials, StaticToken, TokenCache, TokenSource};
