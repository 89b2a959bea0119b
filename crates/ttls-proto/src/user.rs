//! Credential store contract

use crate::eap::EapType;

/// Phase 2 authentication protocols a user may use, as a bitmask
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct TtlsAuth(u8);

impl TtlsAuth {
    pub const PAP: TtlsAuth = TtlsAuth(0x01);
    pub const CHAP: TtlsAuth = TtlsAuth(0x02);
    pub const MSCHAP: TtlsAuth = TtlsAuth(0x04);
    pub const MSCHAPV2: TtlsAuth = TtlsAuth(0x08);

    pub const fn empty() -> Self {
        TtlsAuth(0)
    }

    pub const fn all() -> Self {
        TtlsAuth(0x0f)
    }

    pub fn from_bits(bits: u8) -> Self {
        TtlsAuth(bits & 0x0f)
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn contains(self, other: TtlsAuth) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: TtlsAuth) {
        self.0 |= other.0;
    }

    /// Parse a configuration name ("PAP", "CHAP", "MSCHAP", "MSCHAPV2")
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_uppercase().as_str() {
            "PAP" => Some(Self::PAP),
            "CHAP" => Some(Self::CHAP),
            "MSCHAP" => Some(Self::MSCHAP),
            "MSCHAPV2" => Some(Self::MSCHAPV2),
            _ => None,
        }
    }
}

impl std::ops::BitOr for TtlsAuth {
    type Output = TtlsAuth;

    fn bitor(self, rhs: TtlsAuth) -> TtlsAuth {
        TtlsAuth(self.0 | rhs.0)
    }
}

/// One credential store entry
#[derive(Clone, Default, PartialEq, Eq)]
pub struct EapUser {
    /// Nested EAP methods, in the order they are proposed
    pub methods: Vec<EapType>,
    /// Plaintext password, or the 16-byte NT hash when `password_hash` is set
    pub password: Option<Vec<u8>>,
    pub password_hash: bool,
    pub ttls_auth: TtlsAuth,
    /// Pin the EAP-TTLS version for this user
    pub force_version: Option<u8>,
}

impl EapUser {
    /// The stored NT hash, when the credential is pre-hashed
    pub fn nt_hash(&self) -> Option<[u8; 16]> {
        if !self.password_hash {
            return None;
        }
        self.password.as_deref()?.try_into().ok()
    }
}

impl std::fmt::Debug for EapUser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EapUser")
            .field("methods", &self.methods)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("password_hash", &self.password_hash)
            .field("ttls_auth", &self.ttls_auth)
            .field("force_version", &self.force_version)
            .finish()
    }
}

/// User lookup used by the session
///
/// `phase2` selects between outer (Phase 1) and tunneled identities.
pub trait UserStore: Send + Sync {
    fn get_user(&self, identity: &[u8], phase2: bool) -> Option<EapUser>;
}
