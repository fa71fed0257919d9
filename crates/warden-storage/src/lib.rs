//! Warden Storage crate - the durable proposal store.
//!
//! Provides the `ProposalStore` abstraction consumed by the governance
//! pipeline, a WAL-mode SQLite implementation with migrations, and an
//! in-memory implementation for tests and single-process embedding.

pub mod db;
pub mod memory;
pub mod migrations;
pub mod sqlite;
pub mod store;

pub use db::Database;
pub use memory::MemoryProposalStore;
pub use sqlite::SqliteProposalStore;
pub use store::{
    merge_patch, InsertOutcome, ProposalPatch, ProposalQuery, ProposalStore, SortOrder, VoteOutcome,
};
