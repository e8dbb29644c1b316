//! Status and quarantine persistence
//!
//! - Status store: one record per `order_id`, always upserted
//! - Quarantine store: append-only rows, one per terminal failure
//!
//! Backends are feature-gated: `mongo` for status, `sqlite` for quarantine.
//! In-memory versions of both are always available.

pub mod repository;
pub mod memory;

#[cfg(feature = "mongo")]
pub mod mongo;
#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use memory::{InMemoryQuarantineStore, InMemoryStatusStore};
pub use repository::{
    QuarantineEntry, QuarantineRecord, QuarantineStore, Result, StatusRecord, StatusStore,
    StoreError,
};
