//! PostgreSQL persistence for live state, history, the fleet registry,
//! assignments and the target catalog.
//!
//! Callers depend on the repository traits in [`repo`]; [`PgRepository`]
//! implements them on top of a lazily reconnecting [`Database`], and
//! [`memory::MemoryRepository`] (feature `test-utils`) implements them in
//! memory for tests.

pub mod db;
pub mod error;
pub mod file;
pub mod pg;
pub mod repo;

#[cfg(any(test, feature = "test-utils"))]
pub mod memory;

pub use db::Database;
pub use error::StoreError;
pub use file::FileTargetRepo;
pub use pg::PgRepository;
pub use repo::*;
