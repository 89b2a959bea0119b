//! EAP-TTLS Server Implementation
//!
//! This crate provides the server side of EAP-TTLS as defined in RFC 5281,
//! including the EAP-TTLSv1 (TLS/IA) variant.
//!
//! # Features
//!
//! - EAP-TTLS frame fragmentation and reassembly
//! - Diameter AVP encoding and decoding
//! - Phase 2 PAP, CHAP, MS-CHAP and MS-CHAPv2 with implicit challenges
//! - Nested EAP methods through a pluggable [`MethodRegistry`]
//! - Pluggable TLS backend through the [`Tunnel`] trait, with a rustls
//!   implementation behind the `tls` feature
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use ttls_proto::{BuiltinMethods, EapUser, TtlsConfig, TtlsSession, TunnelFactory, UserStore};
//!
//! struct NoUsers;
//!
//! impl UserStore for NoUsers {
//!     fn get_user(&self, _identity: &[u8], _phase2: bool) -> Option<EapUser> {
//!         None
//!     }
//! }
//!
//! # fn run(factory: &dyn TunnelFactory) -> Result<(), Box<dyn std::error::Error>> {
//! let mut session = TtlsSession::new(
//!     &TtlsConfig::default(),
//!     factory.create()?,
//!     Arc::new(NoUsers),
//!     Arc::new(BuiltinMethods),
//!     b"anonymous",
//! )?;
//!
//! let start = session.build_request(1)?;
//! assert!(!session.is_done());
//! # let _ = start;
//! # Ok(())
//! # }
//! ```

pub mod avp;
pub mod chap;
pub mod eap;
pub mod framing;
pub mod inner;
pub mod keys;
pub mod ms_funcs;
pub mod phase2;
pub mod prf;
#[cfg(feature = "tls")]
pub mod rustls_tunnel;
pub mod session;
pub mod tunnel;
pub mod user;

pub use avp::{AvpError, AvpSet, Phase2Request};
pub use chap::{ChapError, ChapResponse, compute_chap_response, verify_chap_response};
pub use eap::{EapCode, EapError, EapPacket, EapType};
pub use framing::{FramingState, TtlsFlags, TtlsFraming, TtlsPacket};
pub use inner::{BuiltinMethods, InnerContext, InnerMethod, MethodRegistry, MethodStatus};
pub use keys::{EAP_TLS_KEY_LEN, derive_key, implicit_challenge};
pub use phase2::Phase2Error;
#[cfg(feature = "tls")]
pub use rustls_tunnel::{RustlsTunnel, RustlsTunnelFactory};
pub use session::{EAP_TTLS_MAX_VERSION, Stage, TtlsConfig, TtlsError, TtlsSession, TtlsState};
pub use tunnel::{TlsKeys, Tunnel, TunnelError, TunnelFactory};
pub use user::{EapUser, TtlsAuth, UserStore};
