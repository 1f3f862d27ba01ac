//! Cirrus cloud provider
//!
//! Resource handlers for the cloud's REST services, built on the lifecycle
//! engine in `cirrus-core`.
//!
//! ## Module Structure
//!
//! - `config` - Provider configuration block
//! - `auth` - Token and AK/SK request authentication
//! - `transport` - HTTPS transport and the scripted transport used in tests
//! - `catalog` - Service endpoint templates and overrides
//! - `client` - Authenticated client for one service endpoint
//! - `registry` - Lazily built, shared service clients
//! - `rules` - Per-service error classification tables
//! - `resources` - Resource definitions
//! - `provider` - CloudProvider implementation

pub mod auth;
pub mod catalog;
pub mod client;
pub mod config;
pub mod provider;
pub mod registry;
pub mod resources;
pub mod rules;
pub mod transport;

// Re-export main types
pub use config::ProviderConfig;
pub use provider::CloudProvider;
pub use registry::ClientRegistry;
pub use transport::{HttpTransport, MockTransport, Transport};
