//! Cirrus Core
//!
//! Cloud-agnostic resource lifecycle engine for infrastructure provider
//! plugins: typed values and schemas, error classification, waiters, retries,
//! update decomposition, import decoding, tag reconciliation, dependency-aware
//! deletes, and the plugin protocol server that routes host requests to
//! resource handlers.

pub mod classify;
pub mod context;
pub mod decompose;
pub mod deleter;
pub mod differ;
pub mod engine;
pub mod error;
pub mod importer;
pub mod protocol;
pub mod provider;
pub mod resource;
pub mod retry;
pub mod schema;
pub mod server;
pub mod tags;
pub mod timeouts;
pub mod waiter;
