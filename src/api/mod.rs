//! Upstream service client: session auth and product listing.

pub mod auth;
pub mod products;

pub use auth::Session;
