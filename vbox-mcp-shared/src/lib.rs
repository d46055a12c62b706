//! Shared types for the VirtualBox management server.
//!
//! This crate holds the error taxonomy and environment/constant surface
//! that the orchestrator, the portmanteau tools, and the test-util crate
//! all depend on.

pub mod constants;
pub mod errors;

pub use errors::{ErrorDetail, ErrorKind, McpError, McpResult};
