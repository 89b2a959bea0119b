//! Nested EAP methods run inside the tunnel
//!
//! The session drives whichever method the [`MethodRegistry`] hands back
//! through the [`InnerMethod`] contract: build a request, check and process
//! the response, then read the outcome once the method reports done.

use rand::Rng;
use tracing::{debug, info, warn};

use crate::eap::{EapPacket, EapType, eap_md5};
use crate::user::EapUser;

/// Session data visible to inner methods
#[derive(Debug, Clone, Copy)]
pub struct InnerContext<'a> {
    /// Current Phase 2 identity
    pub identity: &'a [u8],
    /// Phase 2 user entry, once looked up
    pub user: Option<&'a EapUser>,
}

/// Outcome of processing one response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MethodStatus {
    /// The response was consumed
    Continue,
    /// The method is waiting on an external lookup; redeliver the same
    /// response on the next pass
    Pending,
}

/// A nested EAP method
pub trait InnerMethod: Send {
    /// Build the next request, or `None` when the method has nothing to send
    fn build_request(&mut self, ctx: &InnerContext<'_>, identifier: u8) -> Option<EapPacket>;

    /// Returns false when the response should be dropped unprocessed
    fn check(&mut self, ctx: &InnerContext<'_>, response: &EapPacket) -> bool;

    fn process(&mut self, ctx: &InnerContext<'_>, response: &EapPacket) -> MethodStatus;

    fn is_done(&self) -> bool;

    fn is_success(&self) -> bool;

    /// Exported key material, if the method derives any
    fn key(&self) -> Option<Vec<u8>> {
        None
    }

    /// Identity learned by the method (EAP-Identity only)
    fn identity(&self) -> Option<&[u8]> {
        None
    }
}

/// Resolves method types to fresh method instances
pub trait MethodRegistry: Send + Sync {
    fn resolve(&self, eap_type: EapType, ctx: &InnerContext<'_>) -> Option<Box<dyn InnerMethod>>;
}

/// Drop the untried methods the peer did not propose in its NAK
///
/// Methods before `index` have already been tried and are kept.
pub fn apply_nak(methods: &mut Vec<EapType>, index: usize, proposed: &[u8]) {
    let index = index.min(methods.len());
    let mut remaining = methods.split_off(index);
    remaining.retain(|method| {
        let keep = proposed.contains(&method.as_u8());
        if !keep {
            debug!("EAP-TTLS: Removing {:?} (not in NAK list)", method);
        }
        keep
    });
    methods.extend(remaining);
}

/// EAP-Identity (RFC 3748 Section 5.1)
#[derive(Debug, Default)]
pub struct IdentityMethod {
    identity: Option<Vec<u8>>,
    done: bool,
}

impl IdentityMethod {
    pub fn new() -> Self {
        Self::default()
    }
}

impl InnerMethod for IdentityMethod {
    fn build_request(&mut self, _ctx: &InnerContext<'_>, identifier: u8) -> Option<EapPacket> {
        Some(EapPacket::identity_request(identifier, ""))
    }

    fn check(&mut self, _ctx: &InnerContext<'_>, response: &EapPacket) -> bool {
        let ok = response.eap_type() == Some(EapType::Identity);
        if !ok {
            warn!("EAP-Identity: Invalid frame");
        }
        ok
    }

    fn process(&mut self, _ctx: &InnerContext<'_>, response: &EapPacket) -> MethodStatus {
        debug!(
            "EAP-Identity: Peer identity '{}'",
            String::from_utf8_lossy(&response.data)
        );
        self.identity = Some(response.data.clone());
        self.done = true;
        MethodStatus::Continue
    }

    fn is_done(&self) -> bool {
        self.done
    }

    fn is_success(&self) -> bool {
        self.done && self.identity.is_some()
    }

    fn identity(&self) -> Option<&[u8]> {
        self.identity.as_deref()
    }
}

/// EAP-MD5-Challenge (RFC 3748 Section 5.4)
#[derive(Debug, Default)]
pub struct Md5ChallengeMethod {
    challenge: Option<[u8; eap_md5::MD5_CHALLENGE_SIZE]>,
    done: bool,
    success: bool,
}

impl Md5ChallengeMethod {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a fixed challenge instead of a random one
    pub fn with_challenge(challenge: [u8; eap_md5::MD5_CHALLENGE_SIZE]) -> Self {
        Md5ChallengeMethod {
            challenge: Some(challenge),
            ..Self::default()
        }
    }
}

impl InnerMethod for Md5ChallengeMethod {
    fn build_request(&mut self, _ctx: &InnerContext<'_>, identifier: u8) -> Option<EapPacket> {
        let challenge = *self.challenge.get_or_insert_with(|| {
            let mut challenge = [0u8; eap_md5::MD5_CHALLENGE_SIZE];
            rand::rng().fill(&mut challenge);
            challenge
        });
        Some(eap_md5::create_challenge(identifier, &challenge, ""))
    }

    fn check(&mut self, _ctx: &InnerContext<'_>, response: &EapPacket) -> bool {
        match eap_md5::parse_response(response) {
            Ok(_) => true,
            Err(e) => {
                warn!("EAP-MD5: Invalid frame: {}", e);
                false
            }
        }
    }

    fn process(&mut self, ctx: &InnerContext<'_>, response: &EapPacket) -> MethodStatus {
        self.done = true;

        let password = match ctx.user {
            Some(user) if !user.password_hash => user.password.as_deref(),
            _ => None,
        };
        let (Some(password), Some(challenge), Ok(received)) =
            (password, self.challenge, eap_md5::parse_response(response))
        else {
            warn!("EAP-MD5: Plaintext password not configured");
            return MethodStatus::Continue;
        };

        let mut data = Vec::with_capacity(1 + password.len() + challenge.len());
        data.push(response.identifier);
        data.extend_from_slice(password);
        data.extend_from_slice(&challenge);

        self.success = md5::compute(&data).0 == received;
        if self.success {
            info!("EAP-MD5: Done - Success");
        } else {
            info!("EAP-MD5: Done - Authentication failed");
        }
        MethodStatus::Continue
    }

    fn is_done(&self) -> bool {
        self.done
    }

    fn is_success(&self) -> bool {
        self.success
    }
}

/// Registry of the methods implemented in this crate
///
/// Resolves EAP-Identity and EAP-MD5-Challenge.
#[derive(Debug, Clone, Copy, Default)]
pub struct BuiltinMethods;

impl MethodRegistry for BuiltinMethods {
    fn resolve(&self, eap_type: EapType, _ctx: &InnerContext<'_>) -> Option<Box<dyn InnerMethod>> {
        match eap_type {
            EapType::Identity => Some(Box::new(IdentityMethod::new())),
            EapType::Md5Challenge => Some(Box::new(Md5ChallengeMethod::new())),
            _ => None,
        }
    }
}
