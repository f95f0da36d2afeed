//! PriceWatch backend library.
//!
//! Exposes the module tree for the binary and the integration tests.

pub mod api;
pub mod auth;
pub mod crawler;
pub mod digest;
pub mod email;
pub mod entitlements;
pub mod middleware;
pub mod models;
pub mod store;
