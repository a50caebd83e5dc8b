//! CLI command implementations.

pub mod fix;
pub mod init;
pub mod memory;
pub mod version;
