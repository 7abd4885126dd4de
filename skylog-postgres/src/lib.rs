//! PostgreSQL-backed skylog adapters.
//!
//! This crate provides relational implementations of the core skylog ports:
//!
//! - [`Store`] - An implementation of [`skylog_core::store::EventStore`]
//! - [`index::Store`] - An implementation of
//!   [`skylog_core::index::StreamIndex`]
//!
//! Both use the same database and can share a connection pool. Each exposes
//! an idempotent `migrate()` that applies its part of the schema; the schema
//! (columns, constraint names, append-only triggers) is a cross-language
//! contract shared with other implementations writing to the same database.

pub mod index;
mod store;
mod translate;

pub use store::Store;
