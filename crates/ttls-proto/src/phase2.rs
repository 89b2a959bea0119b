//! Phase 2 credential checks for the non-EAP inner protocols
//!
//! PAP, CHAP, MS-CHAP and MS-CHAPv2 run directly on AVPs. Except for PAP,
//! the challenge is implicit: the peer must present exactly the bytes both
//! sides derive from the tunnel, followed by a derived identifier byte.

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::chap::{CHAP_CHALLENGE_LEN, CHAP_PASSWORD_LEN, ChapResponse, verify_chap_response};
use crate::keys::implicit_challenge;
use crate::ms_funcs;
use crate::tunnel::{Tunnel, TunnelError};
use crate::user::{EapUser, TtlsAuth};

pub const MSCHAP_CHALLENGE_LEN: usize = 8;
/// Ident, flags, LM-Response and NT-Response
pub const MSCHAP_RESPONSE_LEN: usize = 50;
pub const MSCHAPV2_CHALLENGE_LEN: usize = 16;
/// Ident, flags, peer challenge, reserved and NT-Response
pub const MSCHAPV2_RESPONSE_LEN: usize = 50;
/// Length of each MS-CHAPv2 session key half
pub const MSCHAPV2_KEY_LEN: usize = 16;

/// Offset of the NT-Response inside an MS-CHAP-Response
const MSCHAP_NT_RESPONSE_OFFSET: usize = 2 + 24;
/// Offset of the NT-Response inside an MS-CHAP2-Response
const MSCHAPV2_NT_RESPONSE_OFFSET: usize = 2 + MSCHAPV2_CHALLENGE_LEN + 8;

/// Reasons a Phase 2 attempt is rejected before or during verification
#[derive(Debug, Error)]
pub enum Phase2Error {
    #[error("No {0} credential configured for user")]
    NotConfigured(&'static str),

    #[error("Invalid {protocol} attributes (challenge len {challenge_len} response len {response_len})")]
    InvalidAttributes {
        protocol: &'static str,
        challenge_len: usize,
        response_len: usize,
    },

    #[error("Failed to generate challenge from TLS data: {0}")]
    Challenge(#[from] TunnelError),

    #[error("Challenge mismatch")]
    ChallengeMismatch,

    #[error("Invalid user password")]
    InvalidPassword,

    #[error("Invalid NT-Response")]
    InvalidResponse,
}

/// Outcome of a verified MS-CHAP2-Response
///
/// A wrong NT-Response is not an error here: the peer still has to
/// acknowledge the failure result.
#[derive(Clone, PartialEq, Eq)]
pub struct MsChapV2Result {
    pub success: bool,
    /// Identifier to echo in the result AVP
    pub ident: u8,
    /// Authenticator response, set on success
    pub auth_response: Option<[u8; 20]>,
    /// Receive ‖ send start keys, derived only for EAP-TTLSv1
    pub session_key: Option<Vec<u8>>,
}

impl std::fmt::Debug for MsChapV2Result {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MsChapV2Result")
            .field("success", &self.success)
            .field("ident", &self.ident)
            .field("auth_response", &self.auth_response.is_some())
            .field("session_key", &self.session_key.as_ref().map(Vec::len))
            .finish()
    }
}

fn plaintext_password<'a>(user: Option<&'a EapUser>, auth: TtlsAuth, name: &'static str) -> Result<&'a [u8], Phase2Error> {
    match user {
        Some(user) if user.ttls_auth.contains(auth) && !user.password_hash => {
            user.password.as_deref().ok_or(Phase2Error::NotConfigured(name))
        }
        _ => Err(Phase2Error::NotConfigured(name)),
    }
}

fn any_password<'a>(user: Option<&'a EapUser>, auth: TtlsAuth, name: &'static str) -> Result<&'a EapUser, Phase2Error> {
    match user {
        Some(user) if user.ttls_auth.contains(auth) && user.password.is_some() => Ok(user),
        _ => Err(Phase2Error::NotConfigured(name)),
    }
}

/// Compare the received challenge and identifier with the derived ones
fn check_implicit_challenge(
    tunnel: &dyn Tunnel,
    version: u8,
    challenge: &[u8],
    ident: u8,
) -> Result<(), Phase2Error> {
    let derived = implicit_challenge(tunnel, version, challenge.len() + 1)?;
    if derived.len() != challenge.len() + 1
        || derived[..challenge.len()] != *challenge
        || derived[challenge.len()] != ident
    {
        return Err(Phase2Error::ChallengeMismatch);
    }
    Ok(())
}

/// PAP: plaintext compare against the stored password
pub fn process_pap(user: Option<&EapUser>, password: &[u8]) -> Result<(), Phase2Error> {
    let stored = plaintext_password(user, TtlsAuth::PAP, "plaintext PAP").inspect_err(|_| {
        debug!("EAP-TTLS/PAP: No plaintext user password configured");
    })?;

    if stored != password {
        debug!("EAP-TTLS/PAP: Invalid user password");
        return Err(Phase2Error::InvalidPassword);
    }

    debug!("EAP-TTLS/PAP: Correct user password");
    Ok(())
}

/// CHAP with an implicit challenge
pub fn process_chap(
    tunnel: &dyn Tunnel,
    version: u8,
    user: Option<&EapUser>,
    challenge: Option<&[u8]>,
    password: &[u8],
) -> Result<(), Phase2Error> {
    let challenge = match challenge {
        Some(c) if c.len() == CHAP_CHALLENGE_LEN && password.len() == CHAP_PASSWORD_LEN => c,
        _ => {
            debug!(
                "EAP-TTLS/CHAP: Invalid CHAP attributes (challenge len {} password len {})",
                challenge.map_or(0, <[u8]>::len),
                password.len()
            );
            return Err(Phase2Error::InvalidAttributes {
                protocol: "CHAP",
                challenge_len: challenge.map_or(0, <[u8]>::len),
                response_len: password.len(),
            });
        }
    };

    let stored = plaintext_password(user, TtlsAuth::CHAP, "plaintext CHAP").inspect_err(|_| {
        debug!("EAP-TTLS/CHAP: No plaintext user password configured");
    })?;

    let response = ChapResponse::from_bytes(password).map_err(|_| Phase2Error::InvalidAttributes {
        protocol: "CHAP",
        challenge_len: challenge.len(),
        response_len: password.len(),
    })?;

    check_implicit_challenge(tunnel, version, challenge, response.ident)
        .inspect_err(|e| debug!("EAP-TTLS/CHAP: {}", e))?;

    if verify_chap_response(&response, stored, challenge) {
        debug!("EAP-TTLS/CHAP: Correct user password");
        Ok(())
    } else {
        debug!("EAP-TTLS/CHAP: Invalid user password");
        Err(Phase2Error::InvalidPassword)
    }
}

/// MS-CHAP (v1) with an implicit challenge
///
/// Only the NT-Response is verified; the LM-Response is ignored.
pub fn process_mschap(
    tunnel: &dyn Tunnel,
    version: u8,
    user: Option<&EapUser>,
    challenge: Option<&[u8]>,
    response: &[u8],
) -> Result<(), Phase2Error> {
    let challenge: &[u8; MSCHAP_CHALLENGE_LEN] = match challenge.map(<&[u8; MSCHAP_CHALLENGE_LEN]>::try_from) {
        Some(Ok(c)) if response.len() == MSCHAP_RESPONSE_LEN => c,
        _ => {
            debug!(
                "EAP-TTLS/MSCHAP: Invalid MS-CHAP attributes (challenge len {} response len {})",
                challenge.map_or(0, <[u8]>::len),
                response.len()
            );
            return Err(Phase2Error::InvalidAttributes {
                protocol: "MS-CHAP",
                challenge_len: challenge.map_or(0, <[u8]>::len),
                response_len: response.len(),
            });
        }
    };

    let user = any_password(user, TtlsAuth::MSCHAP, "MS-CHAP").inspect_err(|_| {
        debug!("EAP-TTLS/MSCHAP: No user password configured");
    })?;

    check_implicit_challenge(tunnel, version, challenge, response[0])
        .inspect_err(|e| debug!("EAP-TTLS/MSCHAP: {}", e))?;

    let expected = match user.nt_hash() {
        Some(hash) => ms_funcs::challenge_response(challenge, &hash),
        None if user.password_hash => return Err(Phase2Error::NotConfigured("MS-CHAP")),
        None => ms_funcs::nt_challenge_response(challenge, user.password.as_deref().unwrap_or_default()),
    };

    let received = &response[MSCHAP_NT_RESPONSE_OFFSET..MSCHAP_NT_RESPONSE_OFFSET + 24];
    if expected == *received {
        debug!("EAP-TTLS/MSCHAP: Correct response");
        Ok(())
    } else {
        debug!("EAP-TTLS/MSCHAP: Invalid NT-Response");
        Err(Phase2Error::InvalidResponse)
    }
}

/// MS-CHAPv2 with an implicit authenticator challenge
///
/// `identity` is the Phase 2 identity; any `DOMAIN\` prefix is dropped
/// before it enters the challenge hash.
pub fn process_mschapv2(
    tunnel: &dyn Tunnel,
    version: u8,
    user: Option<&EapUser>,
    identity: &[u8],
    challenge: Option<&[u8]>,
    response: &[u8],
) -> Result<MsChapV2Result, Phase2Error> {
    let auth_challenge: &[u8; MSCHAPV2_CHALLENGE_LEN] =
        match challenge.map(<&[u8; MSCHAPV2_CHALLENGE_LEN]>::try_from) {
            Some(Ok(c)) if response.len() == MSCHAPV2_RESPONSE_LEN => c,
            _ => {
                debug!(
                    "EAP-TTLS/MSCHAPV2: Invalid MS-CHAP2 attributes (challenge len {} response len {})",
                    challenge.map_or(0, <[u8]>::len),
                    response.len()
                );
                return Err(Phase2Error::InvalidAttributes {
                    protocol: "MS-CHAPv2",
                    challenge_len: challenge.map_or(0, <[u8]>::len),
                    response_len: response.len(),
                });
            }
        };

    let user = any_password(user, TtlsAuth::MSCHAPV2, "MS-CHAPv2").inspect_err(|_| {
        debug!("EAP-TTLS/MSCHAPV2: No user password configured");
    })?;

    let username = strip_domain(identity);
    let ident = response[0];

    check_implicit_challenge(tunnel, version, auth_challenge, ident)
        .inspect_err(|e| debug!("EAP-TTLS/MSCHAPV2: {}", e))?;

    let mut peer_challenge = [0u8; MSCHAPV2_CHALLENGE_LEN];
    peer_challenge.copy_from_slice(&response[2..2 + MSCHAPV2_CHALLENGE_LEN]);

    let password_hash = match user.nt_hash() {
        Some(hash) => hash,
        None if user.password_hash => return Err(Phase2Error::NotConfigured("MS-CHAPv2")),
        None => ms_funcs::nt_password_hash(user.password.as_deref().unwrap_or_default()),
    };

    let nt_response =
        ms_funcs::generate_nt_response_pwhash(auth_challenge, &peer_challenge, username, &password_hash);

    let received = &response[MSCHAPV2_NT_RESPONSE_OFFSET..MSCHAPV2_NT_RESPONSE_OFFSET + 24];
    if nt_response != *received {
        debug!("EAP-TTLS/MSCHAPV2: Invalid NT-Response");
        return Ok(MsChapV2Result {
            success: false,
            ident,
            auth_response: None,
            session_key: None,
        });
    }

    debug!("EAP-TTLS/MSCHAPV2: Correct NT-Response");

    let session_key = (version > 0).then(|| {
        let password_hash_hash = ms_funcs::hash_nt_password_hash(&password_hash);
        let master_key = ms_funcs::get_master_key(&password_hash_hash, &nt_response);
        let mut key = ms_funcs::get_asymmetric_start_key(&master_key, MSCHAPV2_KEY_LEN, false, false);
        key.extend(ms_funcs::get_asymmetric_start_key(&master_key, MSCHAPV2_KEY_LEN, true, false));
        info!("EAP-TTLS/MSCHAPV2: Derived TLS/IA session keys");
        key
    });

    let auth_response = ms_funcs::generate_authenticator_response_pwhash(
        &password_hash,
        &nt_response,
        &peer_challenge,
        auth_challenge,
        username,
    );

    Ok(MsChapV2Result {
        success: true,
        ident,
        auth_response: Some(auth_response),
        session_key,
    })
}

/// Drop everything up to and including the first backslash
pub fn strip_domain(identity: &[u8]) -> &[u8] {
    match identity.iter().position(|&b| b == b'\\') {
        Some(pos) => &identity[pos + 1..],
        None => identity,
    }
}
