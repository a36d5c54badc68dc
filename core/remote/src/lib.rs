//! Remote document store abstraction for Tideline.
//!
//! The sync engine consumes a [`RemoteClient`]: conditional pushes guarded
//! by an expected server revision, single-document fetches, and cancellable
//! per-collection change streams. Implementations handle their own
//! transport; authentication is passed in per call as a bearer
//! [`Credential`].
//!
//! Two implementations ship with the crate, both driving the same
//! [`Ledger`] server model:
//! - [`MemoryRemote`]: in-process, with fault injection for tests
//! - [`DirectoryRemote`]: a JSON ledger per collection under a directory,
//!   shareable between replicas on one machine

pub mod client;
pub mod credentials;
pub mod directory;
pub mod ledger;
pub mod memory;
pub mod registry;

pub use client::{ChangeStream, PushOutcome, PushRequest, RemoteChange, RemoteClient, RemoteDocument};
pub use credentials::{Credential, CredentialProvider, StaticCredentials};
pub use directory::DirectoryRemote;
pub use ledger::{CollectionLedger, Ledger};
pub use memory::MemoryRemote;
pub use registry::{create_default_registry, RemoteFactory, RemoteRegistry};
