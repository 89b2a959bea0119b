//! EAP-TTLS Server
//!
//! This crate wires the `ttls-proto` protocol core to a JSON configuration
//! and an in-memory credential store.
//!
//! # Features
//!
//! - JSON configuration with validation and example generation
//! - Outer wildcard and tunneled user entries
//! - Multi-session authenticator mapping EAP-Responses to the next packet
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use ttls_proto::{BuiltinMethods, RustlsTunnelFactory};
//! use ttls_server::{Config, MemoryUserStore, TtlsAuthenticator};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::from_file("config.json")?;
//!     let users = MemoryUserStore::from_config(&config)?;
//!     let tunnels = RustlsTunnelFactory::from_pem_files("server.pem", "server-key.pem")?;
//!
//!     let authenticator = TtlsAuthenticator::new(
//!         config.ttls.session_config(),
//!         Arc::new(tunnels),
//!         Arc::new(users),
//!         Arc::new(BuiltinMethods),
//!     );
//!     assert_eq!(authenticator.session_count(), 0);
//!
//!     Ok(())
//! }
//! ```

pub mod authenticator;
pub mod config;
pub mod users;

pub use authenticator::{AuthenticatorError, DEFAULT_SESSION_TIMEOUT, EapOutcome, TtlsAuthenticator};
pub use config::{Config, ConfigError, TlsSettings, TtlsSettings, User};
pub use users::MemoryUserStore;
