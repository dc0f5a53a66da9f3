//! Shared domain types for the OpenClaw gateway: configuration model,
//! error taxonomy, and the session-level enums every crate speaks.

pub mod config;
pub mod error;
pub mod levels;
