//! Security utilities shared by the authentication path and the HTTP endpoints

pub mod headers;
pub mod timing;

pub use headers::with_api_headers;
pub use timing::{constant_time_eq_bytes, secrets_match};
