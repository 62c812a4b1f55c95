//! Authentication module

pub mod authenticator;
pub mod token;

// Re-export main components
pub use authenticator::{AuthFailure, Authenticator};
pub use token::{Claims, TokenManager};
