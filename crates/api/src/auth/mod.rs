//! Authentication module for Olly

pub mod jwt;
pub mod middleware;

pub use jwt::{Claims, JwtError, JwtManager};
pub use middleware::{optional_auth, require_auth, AuthState, AuthUser};
