//! CHAP (RFC 1994) as carried in EAP-TTLS Phase 2
//!
//! The challenge is not sent by the server: both sides derive it from the
//! tunnel, together with the CHAP identifier that follows it.

/// CHAP-Challenge length used by EAP-TTLS
pub const CHAP_CHALLENGE_LEN: usize = 16;

/// CHAP-Password length: identifier plus MD5 digest
pub const CHAP_PASSWORD_LEN: usize = 17;

/// Decoded CHAP-Password AVP
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChapResponse {
    /// Must equal the octet derived right after the implicit challenge
    pub ident: u8,
    pub response: [u8; 16],
}

impl ChapResponse {
    /// Parse the 17-byte CHAP-Password value
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ChapError> {
        let (&ident, digest) = bytes
            .split_first()
            .filter(|_| bytes.len() == CHAP_PASSWORD_LEN)
            .ok_or(ChapError::InvalidLength(bytes.len()))?;
        let response = digest
            .try_into()
            .map_err(|_| ChapError::InvalidLength(bytes.len()))?;

        Ok(ChapResponse { ident, response })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        std::iter::once(self.ident)
            .chain(self.response)
            .collect()
    }
}

/// MD5(ident ‖ password ‖ challenge)
pub fn compute_chap_response(ident: u8, password: &[u8], challenge: &[u8]) -> [u8; 16] {
    let mut ctx = md5::Context::new();
    ctx.consume([ident]);
    ctx.consume(password);
    ctx.consume(challenge);
    ctx.compute().0
}

pub fn verify_chap_response(chap_response: &ChapResponse, password: &[u8], challenge: &[u8]) -> bool {
    compute_chap_response(chap_response.ident, password, challenge) == chap_response.response
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChapError {
    #[error("Invalid CHAP-Password length: expected 17 bytes, got {0}")]
    InvalidLength(usize),
}
