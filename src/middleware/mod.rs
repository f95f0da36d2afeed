//! Request logging and write rate limiting.

pub mod logging;
pub mod rate_limit;
