//! EAP-TTLS Authenticator
//!
//! Drives one [`TtlsSession`] per outer conversation. The caller supplies a
//! session id (for RADIUS, the State attribute or the calling station) and
//! every EAP-Response received for it; the authenticator answers with the
//! next EAP packet to send.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use ttls_proto::{BuiltinMethods, EapPacket, RustlsTunnelFactory, TtlsConfig};
//! use ttls_server::{EapOutcome, MemoryUserStore, TtlsAuthenticator};
//!
//! let tunnels = RustlsTunnelFactory::from_pem_files("server.pem", "server-key.pem").unwrap();
//! let authenticator = TtlsAuthenticator::new(
//!     TtlsConfig::default(),
//!     Arc::new(tunnels),
//!     Arc::new(MemoryUserStore::new()),
//!     Arc::new(BuiltinMethods),
//! );
//!
//! let identity = EapPacket::identity_response(1, b"anonymous");
//! match authenticator.handle("station-1", &identity).unwrap() {
//!     EapOutcome::Continue(request) => println!("send {} bytes", request.length()),
//!     other => println!("{:?}", other),
//! }
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, info, warn};
use ttls_proto::{
    EapCode, EapPacket, EapType, MethodRegistry, TtlsConfig, TtlsSession, TunnelError, TunnelFactory,
    UserStore,
};

/// Idle time after which a session is dropped by [`TtlsAuthenticator::cleanup_timed_out`]
pub const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(300);

/// What to send back to the peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EapOutcome {
    /// Another EAP-Request
    Continue(EapPacket),
    /// The inner method is waiting on a lookup; call
    /// [`TtlsAuthenticator::resume`] once it completes
    Pending,
    /// EAP-Success and the exported MSK
    Accept { packet: EapPacket, msk: Vec<u8> },
    /// EAP-Failure
    Reject(EapPacket),
}

#[derive(Debug, Error)]
pub enum AuthenticatorError {
    #[error("Expected an EAP-Response, got {0:?}")]
    NotAResponse(EapCode),

    #[error("No session '{0}'")]
    UnknownSession(String),

    #[error("Response identifier {actual} does not match request identifier {expected}")]
    IdentifierMismatch { expected: u8, actual: u8 },

    #[error("Response is not a valid EAP-TTLS frame")]
    InvalidResponse,

    #[error("Session '{0}' has no pending response")]
    NotPending(String),

    #[error("Tunnel error: {0}")]
    Tunnel(#[from] TunnelError),
}

struct SessionEntry {
    session: TtlsSession,
    /// Identifier of the last request sent
    identifier: u8,
    /// Response held while the inner method is pending
    pending: Option<EapPacket>,
    last_activity: Instant,
}

impl SessionEntry {
    fn is_timed_out(&self, timeout: Duration) -> bool {
        self.last_activity.elapsed() > timeout
    }
}

/// Multi-session EAP-TTLS authenticator
pub struct TtlsAuthenticator {
    config: TtlsConfig,
    tunnels: Arc<dyn TunnelFactory>,
    users: Arc<dyn UserStore>,
    registry: Arc<dyn MethodRegistry>,
    sessions: Mutex<HashMap<String, SessionEntry>>,
    session_timeout: Duration,
}

impl std::fmt::Debug for TtlsAuthenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TtlsAuthenticator")
            .field("config", &self.config)
            .field("sessions", &self.session_count())
            .field("session_timeout", &self.session_timeout)
            .finish_non_exhaustive()
    }
}

impl TtlsAuthenticator {
    pub fn new(
        config: TtlsConfig,
        tunnels: Arc<dyn TunnelFactory>,
        users: Arc<dyn UserStore>,
        registry: Arc<dyn MethodRegistry>,
    ) -> Self {
        TtlsAuthenticator {
            config,
            tunnels,
            users,
            registry,
            sessions: Mutex::new(HashMap::new()),
            session_timeout: DEFAULT_SESSION_TIMEOUT,
        }
    }

    /// Drop sessions idle for longer than `timeout` instead of the default
    pub fn with_session_timeout(mut self, timeout: Duration) -> Self {
        self.session_timeout = timeout;
        self
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<String, SessionEntry>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of sessions in progress
    pub fn session_count(&self) -> usize {
        self.sessions().len()
    }

    /// Drop a session, e.g. after an outer timeout
    pub fn remove(&self, session_id: &str) -> bool {
        self.sessions().remove(session_id).is_some()
    }

    /// Drop sessions with no activity within the session timeout
    ///
    /// Also run whenever a new session starts. Returns how many were dropped.
    pub fn cleanup_timed_out(&self) -> usize {
        let timeout = self.session_timeout;
        let mut sessions = self.sessions();
        let before_count = sessions.len();

        sessions.retain(|session_id, entry| {
            let timed_out = entry.is_timed_out(timeout);
            if timed_out {
                info!("EAP-TTLS: Session {} timed out", session_id);
            }
            !timed_out
        });

        before_count - sessions.len()
    }

    /// Handle one EAP-Response for a session
    ///
    /// An EAP-Response/Identity (re)starts the session; everything else must
    /// belong to a session in progress.
    pub fn handle(&self, session_id: &str, response: &EapPacket) -> Result<EapOutcome, AuthenticatorError> {
        if response.code != EapCode::Response {
            return Err(AuthenticatorError::NotAResponse(response.code));
        }

        if response.eap_type() == Some(EapType::Identity) {
            return self.start(session_id, response);
        }

        let mut sessions = self.sessions();
        let entry = sessions
            .get_mut(session_id)
            .ok_or_else(|| AuthenticatorError::UnknownSession(session_id.to_string()))?;

        if response.identifier != entry.identifier {
            return Err(AuthenticatorError::IdentifierMismatch {
                expected: entry.identifier,
                actual: response.identifier,
            });
        }

        if response.eap_type() == Some(EapType::Nak) {
            info!("EAP-TTLS: Peer rejected EAP-TTLS for session {}", session_id);
            sessions.remove(session_id);
            return Ok(EapOutcome::Reject(EapPacket::failure(response.identifier)));
        }

        if !entry.session.check(response) {
            return Err(AuthenticatorError::InvalidResponse);
        }

        entry.last_activity = Instant::now();
        entry.session.process(response);
        let outcome = Self::advance(session_id, entry, response);
        if matches!(outcome, EapOutcome::Accept { .. } | EapOutcome::Reject(_)) {
            sessions.remove(session_id);
        }
        Ok(outcome)
    }

    /// Redeliver the held response once a pending inner method can proceed
    pub fn resume(&self, session_id: &str) -> Result<EapOutcome, AuthenticatorError> {
        let mut sessions = self.sessions();
        let entry = sessions
            .get_mut(session_id)
            .ok_or_else(|| AuthenticatorError::UnknownSession(session_id.to_string()))?;
        let response = entry
            .pending
            .take()
            .ok_or_else(|| AuthenticatorError::NotPending(session_id.to_string()))?;

        entry.last_activity = Instant::now();
        entry.session.process(&response);
        let outcome = Self::advance(session_id, entry, &response);
        if matches!(outcome, EapOutcome::Accept { .. } | EapOutcome::Reject(_)) {
            sessions.remove(session_id);
        }
        Ok(outcome)
    }

    fn start(&self, session_id: &str, response: &EapPacket) -> Result<EapOutcome, AuthenticatorError> {
        let expired = self.cleanup_timed_out();
        if expired > 0 {
            debug!("EAP-TTLS: Dropped {} idle sessions", expired);
        }

        debug!(
            "EAP-TTLS: New session {} for identity '{}'",
            session_id,
            String::from_utf8_lossy(&response.data)
        );

        let tunnel = self.tunnels.create()?;
        let mut session = match TtlsSession::new(
            &self.config,
            tunnel,
            self.users.clone(),
            self.registry.clone(),
            &response.data,
        ) {
            Ok(session) => session,
            Err(e) => {
                warn!("EAP-TTLS: Failed to start session {}: {}", session_id, e);
                self.remove(session_id);
                return Ok(EapOutcome::Reject(EapPacket::failure(response.identifier)));
            }
        };

        let identifier = response.identifier.wrapping_add(1);
        let request = match session.build_request(identifier) {
            Ok(request) => request,
            Err(e) => {
                warn!("EAP-TTLS: Failed to build Start for session {}: {}", session_id, e);
                self.remove(session_id);
                return Ok(EapOutcome::Reject(EapPacket::failure(response.identifier)));
            }
        };

        self.sessions().insert(
            session_id.to_string(),
            SessionEntry {
                session,
                identifier,
                pending: None,
                last_activity: Instant::now(),
            },
        );
        Ok(EapOutcome::Continue(request))
    }

    /// Turn the session's state after processing into the next packet
    fn advance(session_id: &str, entry: &mut SessionEntry, response: &EapPacket) -> EapOutcome {
        let session = &mut entry.session;

        if session.is_done() {
            if !session.is_success() {
                info!("EAP-TTLS: Session {} failed", session_id);
                return EapOutcome::Reject(EapPacket::failure(response.identifier));
            }
            return match session.key() {
                Some(msk) => {
                    info!("EAP-TTLS: Session {} succeeded", session_id);
                    EapOutcome::Accept {
                        packet: EapPacket::success(response.identifier),
                        msk,
                    }
                }
                None => {
                    warn!("EAP-TTLS: Session {} succeeded without keying material", session_id);
                    EapOutcome::Reject(EapPacket::failure(response.identifier))
                }
            };
        }

        if session.has_pending_response() {
            debug!("EAP-TTLS: Session {} waiting on inner method", session_id);
            entry.pending = Some(response.clone());
            return EapOutcome::Pending;
        }

        let identifier = response.identifier.wrapping_add(1);
        match session.build_request(identifier) {
            Ok(request) => {
                entry.identifier = identifier;
                EapOutcome::Continue(request)
            }
            Err(e) => {
                warn!("EAP-TTLS: Session {}: {}", session_id, e);
                EapOutcome::Reject(EapPacket::failure(response.identifier))
            }
        }
    }
}
