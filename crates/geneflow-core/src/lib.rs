//! Leaf types and utilities shared by the GeneFlow workflow engine:
//! URI parsing, slugs, definition loading, the job/workflow/app store,
//! and engine configuration.

pub mod config;
pub mod definition;
pub mod error;
pub mod slug;
pub mod store;
pub mod uri;

pub use config::EngineConfig;
pub use error::{CoreError, Result};
pub use uri::ParsedUri;
