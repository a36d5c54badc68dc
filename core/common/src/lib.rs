//! Common utilities and types shared across Tideline crates.
//!
//! This module provides the error taxonomy, document addressing, and the
//! document/delta model used by the store, the remote client and the
//! sync engine.

pub mod document;
pub mod error;
pub mod types;

pub use document::{
    ChangeType, Document, FieldChange, FieldDelta, Fields, ServerRevision, SyncCursor,
};
pub use error::{Error, Result};
pub use types::{CollectionPath, DocumentKey};
