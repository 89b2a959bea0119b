//! Secure tunnel contract
//!
//! The TTLS core never touches TLS records itself. It drives a [`Tunnel`]
//! for the handshake, record protection, keying material export and the
//! TLS/IA extensions used by EAP-TTLSv1.

use thiserror::Error;

/// Handshake randoms and the TLS/IA inner secret
#[derive(Clone, PartialEq, Eq)]
pub struct TlsKeys {
    pub client_random: Vec<u8>,
    pub server_random: Vec<u8>,
    /// Empty unless TLS/IA is active
    pub inner_secret: Vec<u8>,
}

impl std::fmt::Debug for TlsKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsKeys")
            .field("client_random", &self.client_random.len())
            .field("server_random", &self.server_random.len())
            .field("inner_secret", &"<redacted>")
            .finish()
    }
}

/// Tunnel errors
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("TLS handshake failed: {0}")]
    Handshake(String),

    #[error("Failed to encrypt Phase 2 data: {0}")]
    Encrypt(String),

    #[error("Failed to decrypt Phase 2 data: {0}")]
    Decrypt(String),

    #[error("Keying material export failed: {0}")]
    Export(String),

    #[error("TLS keys not available")]
    KeysUnavailable,

    #[error("{0} is not supported by this tunnel")]
    Unsupported(&'static str),

    #[error("TLS configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// One server-side TLS connection, owned by exactly one session
pub trait Tunnel: Send {
    /// Feed handshake bytes from the peer, returning bytes to send back
    fn handshake(&mut self, input: &[u8]) -> Result<Vec<u8>, TunnelError>;

    /// Whether the handshake has completed
    fn is_established(&self) -> bool;

    /// Protect application data
    fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, TunnelError>;

    /// Unprotect application data
    ///
    /// Under TLS/IA a PhaseFinished record decrypts to an empty buffer.
    fn decrypt(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, TunnelError>;

    /// RFC 5705 keying material exporter, without context
    fn export_keying_material(&self, label: &str, len: usize) -> Result<Vec<u8>, TunnelError>;

    /// Handshake randoms and inner secret
    fn keys(&self) -> Result<TlsKeys, TunnelError>;

    /// Whether TLS/IA (EAP-TTLSv1) can be enabled on this tunnel
    fn supports_inner_application(&self) -> bool {
        false
    }

    fn set_inner_application(&mut self, _enabled: bool) -> Result<(), TunnelError> {
        Err(TunnelError::Unsupported("TLS/IA"))
    }

    /// Mix Phase 2 session key material into the TLS/IA inner secret
    ///
    /// `None` permutes with no key material.
    fn permute_inner_secret(&mut self, _key: Option<&[u8]>) -> Result<(), TunnelError> {
        Err(TunnelError::Unsupported("TLS/IA inner secret permutation"))
    }

    /// Build an encrypted (Intermediate|Final)PhaseFinished record
    fn phase_finished(&mut self, _final_phase: bool) -> Result<Vec<u8>, TunnelError> {
        Err(TunnelError::Unsupported("TLS/IA PhaseFinished"))
    }

    /// Whether the peer has answered a FinalPhaseFinished
    fn final_phase_finished_received(&self) -> bool {
        false
    }
}

/// Creates a fresh tunnel for each new session
pub trait TunnelFactory: Send + Sync {
    fn create(&self) -> Result<Box<dyn Tunnel>, TunnelError>;
}
