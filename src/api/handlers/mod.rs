//! HTTP request handlers.

pub mod exec;
pub mod version;
