//! Core ports and value objects for the skylog event-sourced persistence
//! layer.
//!
//! This crate provides the storage-agnostic foundation:
//!
//! - [`envelope`] - Immutable event envelopes and single-stream append batches
//! - [`store`] - Event store port ([`store::EventStore`]) and its error
//!   taxonomy, plus a reference in-memory implementation
//! - [`index`] - Stream index port ([`index::StreamIndex`]) mapping natural
//!   keys to stream identifiers, plus a reference in-memory implementation
//!
//! # Example
//!
//! ```
//! use skylog_core::store::inmemory;
//!
//! let store = inmemory::Store::new();
//! ```
//!
//! Most users should depend on the `skylog` crate, which re-exports these
//! types together with the optional PostgreSQL backend.

pub mod envelope;
pub mod index;
pub mod store;
