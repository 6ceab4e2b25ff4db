//! docsync: index synchronization engine for a dual-store document search
//! index.
//!
//! The relational metadata store is the source of truth; this crate keeps
//! the keyword and vector stores converged with it through fenced,
//! at-least-once sync tasks coordinated over Redis.

pub mod access;
pub mod config;
pub mod connectors;
pub mod coordination;
pub mod error;
pub mod index;
pub mod indexing;
pub mod metrics;
pub mod models;
pub mod scheduler;
pub mod settings;
pub mod store;
pub mod worker;
