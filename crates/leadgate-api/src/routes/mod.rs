//! HTTP route handlers.

pub mod enrich;
pub mod runs;
