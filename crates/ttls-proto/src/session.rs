//! EAP-TTLS server session
//!
//! One [`TtlsSession`] per authentication attempt. The outer EAP runtime
//! alternates [`TtlsSession::build_request`] and [`TtlsSession::process`]
//! until [`TtlsSession::is_done`] reports true.
//!
//! ```text
//! START -> PHASE1 -> PHASE2_START -> PHASE2_METHOD ------------+
//!                        |               |                     |
//!                        +---------------+-> PHASE2_MSCHAPV2_RESP
//!                                        |                     |
//!                                        v                     v
//!                                 PHASE_FINISHED (v1) -> SUCCESS / FAILURE
//! ```

use std::fmt;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::avp::{self, AvpError, AvpSet, Phase2Request, VENDOR_ID_MICROSOFT, attr, ms_attr};
use crate::eap::{EAP_HEADER_LEN, EapCode, EapError, EapPacket, EapType};
use crate::framing::{DEFAULT_FRAGMENT_SIZE, FramingState, Received, TtlsFraming, TtlsPacket};
use crate::inner::{InnerContext, InnerMethod, MethodRegistry, MethodStatus, apply_nak};
use crate::keys::derive_key;
use crate::phase2::{self, MsChapV2Result, Phase2Error};
use crate::tunnel::{Tunnel, TunnelError};
use crate::user::{EapUser, UserStore};

/// Highest EAP-TTLS version this implementation speaks
pub const EAP_TTLS_MAX_VERSION: u8 = 1;

/// Session states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TtlsState {
    Start,
    Phase1,
    Phase2Start,
    Phase2Method,
    Phase2MsChapV2Resp,
    PhaseFinished,
    Success,
    Failure,
}

impl TtlsState {
    pub fn as_str(self) -> &'static str {
        match self {
            TtlsState::Start => "START",
            TtlsState::Phase1 => "PHASE1",
            TtlsState::Phase2Start => "PHASE2_START",
            TtlsState::Phase2Method => "PHASE2_METHOD",
            TtlsState::Phase2MsChapV2Resp => "PHASE2_MSCHAPV2_RESP",
            TtlsState::PhaseFinished => "PHASE_FINISHED",
            TtlsState::Success => "SUCCESS",
            TtlsState::Failure => "FAILURE",
        }
    }
}

impl fmt::Display for TtlsState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What drives the next outbound frame
///
/// A fragment exchange in progress takes precedence over the protocol
/// state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Transport(FramingState),
    Protocol(TtlsState),
}

/// Session-level settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TtlsConfig {
    /// Version offered in the Start frame (0 or 1)
    pub max_version: u8,
    pub fragment_size: usize,
    /// Run a TNC inner method after successful authentication
    pub tnc: bool,
}

impl Default for TtlsConfig {
    fn default() -> Self {
        TtlsConfig {
            max_version: 0,
            fragment_size: DEFAULT_FRAGMENT_SIZE,
            tnc: false,
        }
    }
}

/// Session errors
#[derive(Debug, Error)]
pub enum TtlsError {
    #[error("Forced TTLSv{0} and the TLS library does not support TLS/IA")]
    TlsIaUnavailable(u8),

    #[error("Unexpected state {0} for building a request")]
    UnexpectedState(TtlsState),

    #[error("Phase 2 method did not produce a request")]
    NoInnerRequest,

    #[error("Tunnel error: {0}")]
    Tunnel(#[from] TunnelError),

    #[error("AVP error: {0}")]
    Avp(#[from] AvpError),

    #[error("EAP error: {0}")]
    Eap(#[from] EapError),
}

/// Whether Phase 2 waits for an inner method's external lookup
///
/// Held on the session rather than the method: in PHASE2_START the
/// Identity method is rebuilt for every frame, redelivered ones included.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Resume {
    Ready,
    /// The decrypted inner frame to redeliver instead of decrypting again
    Awaiting(Vec<u8>),
}

struct ActiveMethod {
    eap_type: EapType,
    method: Box<dyn InnerMethod>,
}

/// MS-CHAPv2 result awaiting the peer's acknowledgment
#[derive(Debug, Clone, Default)]
struct MsChapV2State {
    resp_ok: bool,
    auth_response: [u8; 20],
    ident: u8,
}

/// Server side of one EAP-TTLS authentication
pub struct TtlsSession {
    state: TtlsState,
    version: u8,
    force_version: Option<u8>,
    tls_ia_configured: bool,
    tunnel: Box<dyn Tunnel>,
    framing: TtlsFraming,
    inner: Option<ActiveMethod>,
    resume: Resume,
    /// Current identity; starts as the outer identity
    identity: Vec<u8>,
    /// Current user entry; starts as the outer entry
    user: Option<EapUser>,
    method_index: usize,
    mschapv2: MsChapV2State,
    tnc: bool,
    tnc_started: bool,
    users: Arc<dyn UserStore>,
    registry: Arc<dyn MethodRegistry>,
}

impl fmt::Debug for TtlsSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TtlsSession")
            .field("state", &self.state)
            .field("version", &self.version)
            .field("framing", &self.framing.state())
            .field("inner", &self.inner.as_ref().map(|m| m.eap_type))
            .field("identity", &String::from_utf8_lossy(&self.identity))
            .finish_non_exhaustive()
    }
}

impl TtlsSession {
    /// Create a session for an outer identity
    ///
    /// The outer user's `force_version` overrides the configured version.
    /// Without TLS/IA support the version drops to 0, unless it was forced.
    pub fn new(
        config: &TtlsConfig,
        tunnel: Box<dyn Tunnel>,
        users: Arc<dyn UserStore>,
        registry: Arc<dyn MethodRegistry>,
        identity: &[u8],
    ) -> Result<Self, TtlsError> {
        let user = users.get_user(identity, false);
        let mut version = config.max_version.min(EAP_TTLS_MAX_VERSION);

        let force_version = user.as_ref().and_then(|u| u.force_version);
        if let Some(forced) = force_version {
            debug!("EAP-TTLS: forcing version {}", forced);
            version = forced;
        }

        if version > 0 && !tunnel.supports_inner_application() {
            if let Some(forced) = force_version.filter(|&v| v > 0) {
                warn!(
                    "EAP-TTLS: Forced TTLSv{} and TLS library does not support TLS/IA",
                    forced
                );
                return Err(TtlsError::TlsIaUnavailable(forced));
            }
            version = 0;
        }

        Ok(TtlsSession {
            state: TtlsState::Start,
            version,
            force_version,
            tls_ia_configured: false,
            tunnel,
            framing: TtlsFraming::new(config.fragment_size),
            inner: None,
            resume: Resume::Ready,
            identity: identity.to_vec(),
            user,
            method_index: 0,
            mschapv2: MsChapV2State::default(),
            tnc: config.tnc,
            tnc_started: false,
            users,
            registry,
        })
    }

    pub fn state(&self) -> TtlsState {
        self.state
    }

    /// Negotiated version
    pub fn version(&self) -> u8 {
        self.version
    }

    pub fn force_version(&self) -> Option<u8> {
        self.force_version
    }

    /// Current (Phase 2 once known) identity
    pub fn identity(&self) -> &[u8] {
        &self.identity
    }

    /// Type of the active inner method
    pub fn inner_method(&self) -> Option<EapType> {
        self.inner.as_ref().map(|m| m.eap_type)
    }

    /// Whether an inner response is held for redelivery
    pub fn has_pending_response(&self) -> bool {
        matches!(self.resume, Resume::Awaiting(_))
    }

    pub fn stage(&self) -> Stage {
        match self.framing.state() {
            FramingState::Idle => Stage::Protocol(self.state),
            transport => Stage::Transport(transport),
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(self.state, TtlsState::Success | TtlsState::Failure)
    }

    pub fn is_success(&self) -> bool {
        self.state == TtlsState::Success
    }

    fn set_state(&mut self, state: TtlsState) {
        debug!("EAP-TTLS: {} -> {}", self.state, state);
        self.state = state;
        if !matches!(state, TtlsState::Phase2Start | TtlsState::Phase2Method) {
            self.inner = None;
            self.resume = Resume::Ready;
        }
    }

    fn inner_context(&self) -> InnerContext<'_> {
        InnerContext {
            identity: &self.identity,
            user: self.user.as_ref(),
        }
    }

    /// Build the next EAP-Request
    pub fn build_request(&mut self, identifier: u8) -> Result<EapPacket, TtlsError> {
        let state = match self.stage() {
            Stage::Transport(FramingState::FragAck) => {
                return Ok(self.framing.build_ack(identifier, self.version));
            }
            Stage::Transport(_) => {
                return Ok(self.framing.build_msg(identifier, self.version));
            }
            Stage::Protocol(state) => state,
        };

        match state {
            TtlsState::Start => {
                let request = TtlsPacket::start(self.version).to_eap_request(identifier);
                self.set_state(TtlsState::Phase1);
                return Ok(request);
            }
            TtlsState::Phase1 => {
                if self.tunnel.is_established() {
                    info!("EAP-TTLS: Phase1 done, starting Phase2");
                    self.set_state(TtlsState::Phase2Start);
                }
            }
            TtlsState::Phase2Method => {
                let out = self.build_phase2_eap_req(identifier)?;
                self.framing.set_out(out);
            }
            TtlsState::Phase2MsChapV2Resp => {
                let out = self.build_phase2_mschapv2()?;
                self.framing.set_out(out);
            }
            TtlsState::PhaseFinished => {
                let out = self.tunnel.phase_finished(true)?;
                self.framing.set_out(out);
            }
            state => {
                debug!("EAP-TTLS: build_request - unexpected state {}", state);
                return Err(TtlsError::UnexpectedState(state));
            }
        }

        Ok(self.framing.build_msg(identifier, self.version))
    }

    fn build_phase2_eap_req(&mut self, identifier: u8) -> Result<Vec<u8>, TtlsError> {
        let ctx = InnerContext {
            identity: &self.identity,
            user: self.user.as_ref(),
        };
        let request = self
            .inner
            .as_mut()
            .and_then(|active| active.method.build_request(&ctx, identifier))
            .ok_or(TtlsError::NoInnerRequest)?;

        debug!(
            "EAP-TTLS/EAP: Encapsulate Phase 2 data ({} bytes)",
            request.length()
        );
        let avps = avp::encapsulate(&request.to_bytes(), attr::EAP_MESSAGE, true)?;
        Ok(self.tunnel.encrypt(&avps)?)
    }

    fn build_phase2_mschapv2(&mut self) -> Result<Vec<u8>, TtlsError> {
        let mut buf = Vec::with_capacity(64);
        if self.mschapv2.resp_ok {
            let mut data = Vec::with_capacity(43);
            data.push(self.mschapv2.ident);
            data.extend_from_slice(b"S=");
            data.extend_from_slice(hex::encode_upper(self.mschapv2.auth_response).as_bytes());
            avp::encode_avp(
                &mut buf,
                ms_attr::MS_CHAP2_SUCCESS,
                VENDOR_ID_MICROSOFT,
                true,
                &data,
            )?;
        } else {
            avp::encode_avp(
                &mut buf,
                ms_attr::MS_CHAP_ERROR,
                VENDOR_ID_MICROSOFT,
                true,
                b"Failed",
            )?;
        }

        Ok(self.tunnel.encrypt(&buf)?)
    }

    /// Whether an inbound response is an EAP-TTLS frame with a flags octet
    pub fn check(&self, response: &EapPacket) -> bool {
        let ok = response.code == EapCode::Response
            && response.eap_type() == Some(EapType::Ttls)
            && !response.data.is_empty();
        if !ok {
            warn!("EAP-TTLS: Invalid frame");
        }
        ok
    }

    /// Process one EAP-Response
    ///
    /// Protocol errors never surface as `Err`; they move the session to
    /// FAILURE.
    pub fn process(&mut self, response: &EapPacket) {
        let packet = match TtlsPacket::from_eap_data(&response.data) {
            Ok(packet) => packet,
            Err(e) => {
                warn!("EAP-TTLS: Invalid frame: {}", e);
                self.set_state(TtlsState::Failure);
                return;
            }
        };

        if let Err(e) = self.process_version(packet.flags.version()) {
            warn!("EAP-TTLS: {}", e);
            self.set_state(TtlsState::Failure);
            return;
        }

        match self.framing.receive(&packet) {
            Ok(Received::Message(in_buf)) => self.process_msg(&in_buf),
            Ok(Received::Fragment) | Ok(Received::Ack) => {}
            Err(e) => {
                warn!("EAP-TTLS: Framing error: {}", e);
                self.set_state(TtlsState::Failure);
            }
        }
    }

    fn process_version(&mut self, peer_version: u8) -> Result<(), TunnelError> {
        if peer_version < self.version {
            debug!(
                "EAP-TTLS: peer ver={}, own ver={}; use version {}",
                peer_version, self.version, peer_version
            );
            self.version = peer_version;
        }

        if self.version > 0 && !self.tls_ia_configured {
            self.tunnel.set_inner_application(true).inspect_err(|_| {
                warn!("EAP-TTLS: Failed to enable TLS/IA");
            })?;
            self.tls_ia_configured = true;
        }

        Ok(())
    }

    fn process_msg(&mut self, in_buf: &[u8]) {
        match self.state {
            TtlsState::Phase1 => match self.tunnel.handshake(in_buf) {
                Ok(out) => self.framing.set_out(out),
                Err(e) => {
                    warn!("EAP-TTLS: {}", e);
                    self.set_state(TtlsState::Failure);
                }
            },
            TtlsState::Phase2Start | TtlsState::Phase2Method | TtlsState::PhaseFinished => {
                self.process_phase2(in_buf);
                self.start_tnc();
            }
            TtlsState::Phase2MsChapV2Resp => {
                if self.mschapv2.resp_ok && in_buf.is_empty() {
                    debug!("EAP-TTLS/MSCHAPV2: Peer acknowledged response");
                    self.finish_phase2();
                } else if !self.mschapv2.resp_ok {
                    debug!("EAP-TTLS/MSCHAPV2: Peer acknowledged error");
                    self.set_state(TtlsState::Failure);
                } else {
                    debug!(
                        "EAP-TTLS/MSCHAPV2: Unexpected frame from peer (payload len {}, expected empty frame)",
                        in_buf.len()
                    );
                    self.set_state(TtlsState::Failure);
                }
                self.start_tnc();
            }
            state => {
                debug!("EAP-TTLS: Unexpected state {} in process", state);
            }
        }
    }

    /// Successful inner authentication: PHASE_FINISHED under v1, else SUCCESS
    fn finish_phase2(&mut self) {
        let next = if self.version > 0 {
            TtlsState::PhaseFinished
        } else {
            TtlsState::Success
        };
        self.set_state(next);
    }

    fn process_phase2(&mut self, in_buf: &[u8]) {
        debug!(
            "EAP-TTLS: received {} bytes encrypted data for Phase 2",
            in_buf.len()
        );

        if let Resume::Awaiting(pending) = std::mem::replace(&mut self.resume, Resume::Ready) {
            debug!("EAP-TTLS: Pending Phase 2 EAP response - skip decryption and use old data");
            self.process_phase2_eap(&pending);
            return;
        }

        let decrypted = match self.tunnel.decrypt(in_buf) {
            Ok(decrypted) => decrypted,
            Err(e) => {
                info!("EAP-TTLS: Failed to decrypt Phase 2 data: {}", e);
                self.set_state(TtlsState::Failure);
                return;
            }
        };

        if self.state == TtlsState::PhaseFinished {
            if decrypted.is_empty() && self.tunnel.final_phase_finished_received() {
                debug!("EAP-TTLS: FinalPhaseFinished received");
                self.set_state(TtlsState::Success);
            } else {
                info!("EAP-TTLS: Did not receive valid FinalPhaseFinished");
                self.set_state(TtlsState::Failure);
            }
            return;
        }

        let avps = match AvpSet::parse(&decrypted) {
            Ok(avps) => avps,
            Err(e) => {
                debug!("EAP-TTLS: Failed to parse AVPs: {}", e);
                self.set_state(TtlsState::Failure);
                return;
            }
        };

        if let Some(user_name) = avps.user_name {
            self.identity = user_name.to_vec();
            self.user = self.users.get_user(user_name, true);
            if self.user.is_none() {
                debug!("EAP-TTLS: Phase2 Identity not found in the user database");
                self.set_state(TtlsState::Failure);
                return;
            }
        }

        if self.tnc_started && avps.eap.is_none() {
            debug!("EAP-TTLS: TNC started but no EAP response from peer");
            self.set_state(TtlsState::Failure);
            return;
        }

        match avps.into_request() {
            Phase2Request::Eap(eap) => self.process_phase2_eap(&eap),
            Phase2Request::Pap { password } => {
                let result = phase2::process_pap(self.user.as_ref(), password);
                self.complete_phase2("PAP", result);
            }
            Phase2Request::Chap {
                challenge,
                password,
            } => {
                let result = phase2::process_chap(
                    self.tunnel.as_ref(),
                    self.version,
                    self.user.as_ref(),
                    challenge,
                    password,
                );
                self.complete_phase2("CHAP", result);
            }
            Phase2Request::MsChap {
                challenge,
                response,
            } => {
                let result = phase2::process_mschap(
                    self.tunnel.as_ref(),
                    self.version,
                    self.user.as_ref(),
                    challenge,
                    response,
                );
                self.complete_phase2("MSCHAP", result);
            }
            Phase2Request::MsChapV2 {
                challenge,
                response,
            } => {
                let result = phase2::process_mschapv2(
                    self.tunnel.as_ref(),
                    self.version,
                    self.user.as_ref(),
                    &self.identity,
                    challenge,
                    response,
                );
                self.complete_mschapv2(result);
            }
            Phase2Request::Empty => {
                debug!("EAP-TTLS: No Phase 2 payload in message");
            }
        }
    }

    fn complete_phase2(&mut self, protocol: &str, result: Result<(), Phase2Error>) {
        match result {
            Ok(()) => {
                info!("EAP-TTLS/{}: Authentication succeeded", protocol);
                self.finish_phase2();
            }
            Err(e) => {
                info!("EAP-TTLS/{}: {}", protocol, e);
                self.set_state(TtlsState::Failure);
            }
        }
    }

    fn complete_mschapv2(&mut self, result: Result<MsChapV2Result, Phase2Error>) {
        let result = match result {
            Ok(result) => result,
            Err(e) => {
                info!("EAP-TTLS/MSCHAPV2: {}", e);
                self.set_state(TtlsState::Failure);
                return;
            }
        };

        self.mschapv2.resp_ok = result.success;
        self.mschapv2.ident = result.ident;
        if let Some(auth_response) = result.auth_response {
            self.mschapv2.auth_response = auth_response;
        }
        if let Some(session_key) = result.session_key {
            self.permute_inner_secret(Some(&session_key));
        }
        self.set_state(TtlsState::Phase2MsChapV2Resp);
    }

    /// Mix method key material into the TLS/IA inner secret
    fn permute_inner_secret(&mut self, key: Option<&[u8]>) {
        let buf = key.map(|key| {
            let mut buf = Vec::with_capacity(2 + key.len());
            buf.extend_from_slice(&(key.len() as u16).to_be_bytes());
            buf.extend_from_slice(key);
            buf
        });

        debug!(
            "EAP-TTLS: Session keys for TLS/IA inner secret permutation ({} bytes)",
            buf.as_ref().map_or(0, Vec::len)
        );
        if let Err(e) = self.tunnel.permute_inner_secret(buf.as_deref()) {
            warn!("EAP-TTLS: Inner secret permutation failed: {}", e);
        }
    }

    /// Replace the active inner method
    fn init_inner(&mut self, eap_type: EapType) -> bool {
        self.inner = None;
        let method = self.registry.resolve(eap_type, &self.inner_context());
        match method {
            Some(method) => {
                self.inner = Some(ActiveMethod { eap_type, method });
                true
            }
            None => false,
        }
    }

    fn process_phase2_eap(&mut self, eap: &[u8]) {
        if self.state == TtlsState::Phase2Start {
            debug!("EAP-TTLS/EAP: initializing Phase 2");
            if !self.init_inner(EapType::Identity) {
                debug!("EAP-TTLS/EAP: failed to initialize EAP-Identity");
                return;
            }
        }

        if eap.len() < EAP_HEADER_LEN {
            debug!(
                "EAP-TTLS/EAP: too short Phase 2 EAP packet (len={})",
                eap.len()
            );
            return;
        }

        let len = u16::from_be_bytes([eap[2], eap[3]]) as usize;
        debug!(
            "EAP-TTLS/EAP: received Phase 2 EAP: code={} identifier={} length={}",
            eap[0], eap[1], len
        );
        if len > eap.len() {
            info!(
                "EAP-TTLS/EAP: Length mismatch in Phase 2 EAP frame (hdr len={}, data len in AVP={})",
                len,
                eap.len()
            );
            return;
        }

        if eap[0] != EapCode::Response.as_u8() {
            info!("EAP-TTLS/EAP: Unexpected code={} in Phase 2 EAP header", eap[0]);
            return;
        }

        self.process_phase2_eap_response(&eap[..len]);

        if self.state == TtlsState::Phase2Start {
            self.inner = None;
        }
    }

    fn process_phase2_eap_response(&mut self, frame: &[u8]) {
        if self.inner.is_none() {
            debug!("EAP-TTLS/EAP: Phase2 not initialized");
            return;
        }

        if frame.len() > EAP_HEADER_LEN && frame[EAP_HEADER_LEN] == EapType::Nak.as_u8() {
            let proposed = &frame[EAP_HEADER_LEN + 1..];
            debug!("EAP-TTLS/EAP: Phase2 type Nak'ed; allowed types {:?}", proposed);
            self.process_nak(proposed);
            return;
        }

        let packet = match EapPacket::from_bytes(frame) {
            Ok(packet) => packet,
            Err(e) => {
                debug!("EAP-TTLS/EAP: Invalid Phase 2 frame: {}", e);
                return;
            }
        };

        let ctx = InnerContext {
            identity: &self.identity,
            user: self.user.as_ref(),
        };
        let Some(active) = self.inner.as_mut() else {
            return;
        };

        if !active.method.check(&ctx, &packet) {
            debug!("EAP-TTLS/EAP: Phase2 check() asked to ignore the packet");
            return;
        }

        if active.method.process(&ctx, &packet) == MethodStatus::Pending {
            debug!("EAP-TTLS/EAP: Phase2 method is in pending wait state - save decrypted response");
            self.resume = Resume::Awaiting(frame.to_vec());
        }

        if !active.method.is_done() {
            return;
        }

        if !active.method.is_success() {
            debug!("EAP-TTLS/EAP: Phase2 method failed");
            self.set_state(TtlsState::Failure);
            return;
        }

        let key = active.method.key();
        let learned = active.method.identity().map(<[u8]>::to_vec);

        match self.state {
            TtlsState::Phase2Start => {
                if let Some(identity) = learned {
                    self.identity = identity;
                }
                let Some(user) = self.users.get_user(&self.identity, true) else {
                    debug!(
                        "EAP_TTLS: Phase2 Identity '{}' not found in the user database",
                        String::from_utf8_lossy(&self.identity)
                    );
                    self.set_state(TtlsState::Failure);
                    return;
                };

                let first = user.methods.first().copied();
                self.user = Some(user);
                self.set_state(TtlsState::Phase2Method);
                self.method_index = 1;
                self.try_method(first);
            }
            TtlsState::Phase2Method => {
                if self.version > 0 {
                    self.permute_inner_secret(key.as_deref());
                    self.set_state(TtlsState::PhaseFinished);
                } else {
                    self.set_state(TtlsState::Success);
                }
            }
            TtlsState::Failure => {}
            state => {
                debug!("EAP-TTLS: Phase2 EAP response in unexpected state {}", state);
            }
        }
    }

    fn process_nak(&mut self, proposed: &[u8]) {
        let Some(user) = self.user.as_mut() else {
            self.set_state(TtlsState::Failure);
            return;
        };

        apply_nak(&mut user.methods, self.method_index, proposed);
        let next = user.methods.get(self.method_index).copied();
        if next.is_some() {
            self.method_index += 1;
        }
        self.try_method(next);
    }

    /// Start the next candidate method, or fail when there is none
    fn try_method(&mut self, next: Option<EapType>) {
        let Some(next) = next else {
            debug!("EAP-TTLS: No more Phase 2 methods to try");
            self.set_state(TtlsState::Failure);
            return;
        };

        info!("EAP-TTLS: try EAP type {} ({})", next.name(), next.as_u8());
        if !self.init_inner(next) {
            debug!("EAP-TTLS: Failed to initialize EAP type {}", next.name());
            self.set_state(TtlsState::Failure);
        }
    }

    fn start_tnc(&mut self) {
        if !self.tnc || self.state != TtlsState::Success || self.tnc_started {
            return;
        }

        debug!("EAP-TTLS: Initialize TNC");
        if !self.init_inner(EapType::Tnc) {
            debug!("EAP-TTLS: Failed to initialize TNC");
            self.set_state(TtlsState::Failure);
            return;
        }

        self.tnc_started = true;
        self.set_state(TtlsState::Phase2Method);
    }

    /// Exported 64-byte MSK, only once the session succeeded
    pub fn key(&self) -> Option<Vec<u8>> {
        if self.state != TtlsState::Success {
            return None;
        }

        derive_key(self.tunnel.as_ref(), self.version)
            .inspect_err(|e| warn!("EAP-TTLS: Failed to derive key: {}", e))
            .ok()
    }
}
