//! Codex durable storage on SQLite.
//!
//! Implements [`pipeline::DeliveryLedger`], [`pipeline::RunStore`], and
//! [`pipeline::KnowledgeGraph`] on one [`SqliteStore`].
//!
//! ## Architectural Layer
//!
//! **Infrastructure.** This crate must not contain domain rules. It owns the
//! schema, transactions, and the mapping of SQLite failures onto
//! [`pipeline::StorageError`].
//!
//! ## Lifecycle
//!
//! [`SqliteStore::open`] connects and migrates at startup (failure is fatal);
//! [`SqliteStore::close`] flushes the write-ahead log at shutdown.

mod graph;
mod ledger;
mod sqlite;

pub use sqlite::{SqliteStore, CURRENT_SCHEMA_VERSION};
