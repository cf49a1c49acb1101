//! CLI command implementations.

pub mod list;
pub mod transfer;
pub mod unlink;
