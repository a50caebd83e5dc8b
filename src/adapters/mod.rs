//! Infrastructure adapters for external systems.

pub mod openai;
pub mod sqlite;
