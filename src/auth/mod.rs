//! Identity: verification of tokens minted by the external identity provider.

mod jwt;

pub use jwt::{Claims, JwtSecret};
