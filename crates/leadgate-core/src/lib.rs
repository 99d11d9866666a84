//! # leadgate-core
//!
//! Core abstractions for the leadgate intake service.
//!
//! This crate provides the foundational types and traits used across all
//! leadgate components:
//!
//! - **Dedup Keys**: Identity-derived keys that collapse duplicate leads
//! - **Identifiers**: Strongly-typed ULID identifiers for enrichment runs
//! - **Storage Backend**: Conditional-write object storage (filesystem, memory)
//! - **Error Types**: Shared error definitions and result types
//! - **Observability**: Logging initialization and span helpers
//!
//! ## Crate Boundary
//!
//! `leadgate-core` is the **only** crate allowed to define shared primitives.
//! The intake protocol and the HTTP surface build on the contracts defined here.
//!
//! ## Example
//!
//! ```rust
//! use leadgate_core::prelude::*;
//! use serde_json::json;
//!
//! let payload = json!({"email": "jane@example.com", "phone": "555-0100"});
//! let key = derive_key(&payload).expect("payload has identity fields");
//! let run_id = RunId::generate();
//! # let _ = (key, run_id);
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod dedup;
pub mod error;
pub mod id;
pub mod observability;
pub mod storage;

/// Prelude module for convenient imports.
///
/// # Example
///
/// ```rust
/// use leadgate_core::prelude::*;
/// ```
pub mod prelude {
    pub use crate::dedup::{DedupKey, KeyError, derive_key, extract_source};
    pub use crate::error::{Error, Result};
    pub use crate::id::RunId;
    pub use crate::storage::{
        FsBackend, MemoryBackend, ObjectMeta, StorageBackend, WritePrecondition, WriteResult,
    };
}

// Re-export key types at crate root for ergonomics
pub use dedup::{DedupKey, KeyError, derive_key, extract_source};
pub use error::{Error, Result};
pub use id::RunId;
pub use observability::{LogFormat, init_logging};
pub use storage::{
    FsBackend, MemoryBackend, ObjectMeta, StorageBackend, WritePrecondition, WriteResult,
};
