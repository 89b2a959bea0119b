//! End-to-end EAP-TTLS session tests over a loopback tunnel
//!
//! The loopback tunnel passes Phase 2 data through unencrypted and derives
//! keying material from the exporter label, so every challenge and key the
//! session computes can be predicted by the test.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use ttls_proto::avp::{self, VENDOR_ID_MICROSOFT, attr, ms_attr};
use ttls_proto::eap::eap_md5;
use ttls_proto::inner::{IdentityMethod, Md5ChallengeMethod};
use ttls_proto::ms_funcs;
use ttls_proto::prf::tls_prf_sha1_md5;
use ttls_proto::*;

const SERVER_FINISHED: &[u8] = b"server finished";
const FINAL_PHASE_FINISHED: &[u8] = b"final phase finished";
const MD5_CHALLENGE: [u8; 16] = [0x3c; 16];

type PermuteLog = Arc<Mutex<Vec<Option<Vec<u8>>>>>;

/// Pass-through tunnel with a predictable exporter
struct LoopbackTunnel {
    established: bool,
    tls_ia: bool,
    ia_enabled: bool,
    phase_finished_sent: bool,
    final_received: bool,
    permutations: PermuteLog,
}

impl LoopbackTunnel {
    fn new(tls_ia: bool) -> Self {
        LoopbackTunnel {
            established: false,
            tls_ia,
            ia_enabled: false,
            phase_finished_sent: false,
            final_received: false,
            permutations: Arc::default(),
        }
    }

    fn client_random() -> Vec<u8> {
        vec![0x11; 32]
    }

    fn server_random() -> Vec<u8> {
        vec![0x22; 32]
    }

    fn inner_secret() -> Vec<u8> {
        vec![0x33; 48]
    }
}

impl Tunnel for LoopbackTunnel {
    fn handshake(&mut self, input: &[u8]) -> Result<Vec<u8>, TunnelError> {
        if input.is_empty() {
            return Err(TunnelError::Handshake("empty ClientHello".to_string()));
        }
        self.established = true;
        Ok(SERVER_FINISHED.to_vec())
    }

    fn is_established(&self) -> bool {
        self.established
    }

    fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, TunnelError> {
        Ok(plaintext.to_vec())
    }

    fn decrypt(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, TunnelError> {
        if self.phase_finished_sent && ciphertext == FINAL_PHASE_FINISHED {
            self.final_received = true;
            return Ok(Vec::new());
        }
        Ok(ciphertext.to_vec())
    }

    fn export_keying_material(&self, label: &str, len: usize) -> Result<Vec<u8>, TunnelError> {
        Ok(label.bytes().cycle().take(len).collect())
    }

    fn keys(&self) -> Result<TlsKeys, TunnelError> {
        if !self.tls_ia {
            return Err(TunnelError::KeysUnavailable);
        }
        Ok(TlsKeys {
            client_random: Self::client_random(),
            server_random: Self::server_random(),
            inner_secret: Self::inner_secret(),
        })
    }

    fn supports_inner_application(&self) -> bool {
        self.tls_ia
    }

    fn set_inner_application(&mut self, enabled: bool) -> Result<(), TunnelError> {
        if !self.tls_ia {
            return Err(TunnelError::Unsupported("TLS/IA"));
        }
        self.ia_enabled = enabled;
        Ok(())
    }

    fn permute_inner_secret(&mut self, key: Option<&[u8]>) -> Result<(), TunnelError> {
        self.permutations
            .lock()
            .unwrap()
            .push(key.map(<[u8]>::to_vec));
        Ok(())
    }

    fn phase_finished(&mut self, final_phase: bool) -> Result<Vec<u8>, TunnelError> {
        assert!(final_phase);
        self.phase_finished_sent = true;
        Ok(b"FinalPhaseFinished".to_vec())
    }

    fn final_phase_finished_received(&self) -> bool {
        self.final_received
    }
}

#[derive(Default)]
struct MapStore {
    outer: HashMap<Vec<u8>, EapUser>,
    inner: HashMap<Vec<u8>, EapUser>,
}

impl UserStore for MapStore {
    fn get_user(&self, identity: &[u8], phase2: bool) -> Option<EapUser> {
        let users = if phase2 { &self.inner } else { &self.outer };
        users.get(identity).cloned()
    }
}

/// Answers its first response with `Pending`, then succeeds
#[derive(Default)]
struct LookupMethod {
    passes: usize,
    done: bool,
}

impl InnerMethod for LookupMethod {
    fn build_request(&mut self, _ctx: &InnerContext<'_>, identifier: u8) -> Option<EapPacket> {
        Some(EapPacket::new(
            EapCode::Request,
            identifier,
            Some(EapType::GenericTokenCard),
            b"Password: ".to_vec(),
        ))
    }

    fn check(&mut self, _ctx: &InnerContext<'_>, response: &EapPacket) -> bool {
        response.eap_type() == Some(EapType::GenericTokenCard)
    }

    fn process(&mut self, _ctx: &InnerContext<'_>, response: &EapPacket) -> MethodStatus {
        assert_eq!(response.data, b"token");
        self.passes += 1;
        if self.passes == 1 {
            return MethodStatus::Pending;
        }
        self.done = true;
        MethodStatus::Continue
    }

    fn is_done(&self) -> bool {
        self.done
    }

    fn is_success(&self) -> bool {
        self.done
    }

    fn key(&self) -> Option<Vec<u8>> {
        Some(vec![0x77; 32])
    }
}

/// Accepts any TNC response
#[derive(Default)]
struct TncMethod {
    done: bool,
}

impl InnerMethod for TncMethod {
    fn build_request(&mut self, _ctx: &InnerContext<'_>, identifier: u8) -> Option<EapPacket> {
        Some(EapPacket::new(
            EapCode::Request,
            identifier,
            Some(EapType::Tnc),
            vec![0x81],
        ))
    }

    fn check(&mut self, _ctx: &InnerContext<'_>, response: &EapPacket) -> bool {
        response.eap_type() == Some(EapType::Tnc)
    }

    fn process(&mut self, _ctx: &InnerContext<'_>, _response: &EapPacket) -> MethodStatus {
        self.done = true;
        MethodStatus::Continue
    }

    fn is_done(&self) -> bool {
        self.done
    }

    fn is_success(&self) -> bool {
        self.done
    }
}

/// EAP-Identity whose first response waits on a directory lookup
///
/// The session rebuilds the Identity method for every Phase 2 frame, so the
/// lookup count is shared between instances.
struct DirectoryIdentity {
    lookups: Arc<AtomicUsize>,
    identity: IdentityMethod,
}

impl InnerMethod for DirectoryIdentity {
    fn build_request(&mut self, ctx: &InnerContext<'_>, identifier: u8) -> Option<EapPacket> {
        self.identity.build_request(ctx, identifier)
    }

    fn check(&mut self, ctx: &InnerContext<'_>, response: &EapPacket) -> bool {
        self.identity.check(ctx, response)
    }

    fn process(&mut self, ctx: &InnerContext<'_>, response: &EapPacket) -> MethodStatus {
        if self.lookups.fetch_add(1, Ordering::SeqCst) == 0 {
            return MethodStatus::Pending;
        }
        self.identity.process(ctx, response)
    }

    fn is_done(&self) -> bool {
        self.identity.is_done()
    }

    fn is_success(&self) -> bool {
        self.identity.is_success()
    }

    fn identity(&self) -> Option<&[u8]> {
        self.identity.identity()
    }
}

#[derive(Default)]
struct DirectoryMethods {
    lookups: Arc<AtomicUsize>,
}

impl MethodRegistry for DirectoryMethods {
    fn resolve(&self, eap_type: EapType, ctx: &InnerContext<'_>) -> Option<Box<dyn InnerMethod>> {
        match eap_type {
            EapType::Identity => Some(Box::new(DirectoryIdentity {
                lookups: self.lookups.clone(),
                identity: IdentityMethod::new(),
            })),
            other => TestMethods.resolve(other, ctx),
        }
    }
}

struct TestMethods;

impl MethodRegistry for TestMethods {
    fn resolve(&self, eap_type: EapType, ctx: &InnerContext<'_>) -> Option<Box<dyn InnerMethod>> {
        match eap_type {
            EapType::Md5Challenge => Some(Box::new(Md5ChallengeMethod::with_challenge(MD5_CHALLENGE))),
            EapType::GenericTokenCard => Some(Box::new(LookupMethod::default())),
            EapType::Tnc => Some(Box::new(TncMethod::default())),
            other => BuiltinMethods.resolve(other, ctx),
        }
    }
}

fn alice(auth: TtlsAuth, methods: Vec<EapType>) -> EapUser {
    EapUser {
        methods,
        password: Some(b"secret".to_vec()),
        ttls_auth: auth,
        ..Default::default()
    }
}

fn store_with(user: EapUser) -> MapStore {
    let mut store = MapStore::default();
    store.inner.insert(b"alice".to_vec(), user);
    store
}

fn session_with(config: TtlsConfig, tunnel: LoopbackTunnel, store: MapStore) -> TtlsSession {
    TtlsSession::new(
        &config,
        Box::new(tunnel),
        Arc::new(store),
        Arc::new(TestMethods),
        b"anonymous",
    )
    .unwrap()
}

fn response(version: u8, identifier: u8, data: &[u8]) -> EapPacket {
    TtlsPacket::new(TtlsFlags::new(false, false, false, version), None, data.to_vec())
        .to_eap_response(identifier)
}

fn payload(request: &EapPacket) -> TtlsPacket {
    assert_eq!(request.code, EapCode::Request);
    assert_eq!(request.eap_type(), Some(EapType::Ttls));
    TtlsPacket::from_eap_data(&request.data).unwrap()
}

/// Run the Start exchange and the (single round trip) handshake
fn establish(session: &mut TtlsSession, version: u8) {
    let start = payload(&session.build_request(1).unwrap());
    assert!(start.flags.start());
    assert_eq!(start.flags.version(), version);
    assert_eq!(session.state(), TtlsState::Phase1);

    let hello = response(version, 1, b"client hello");
    assert!(session.check(&hello));
    session.process(&hello);

    let finished = payload(&session.build_request(2).unwrap());
    assert_eq!(finished.data, SERVER_FINISHED);
    assert_eq!(session.state(), TtlsState::Phase2Start);
    assert!(session.key().is_none());
}

fn user_name_and(extra: &[u8]) -> Vec<u8> {
    let mut buf = Vec::new();
    avp::encode_avp(&mut buf, attr::USER_NAME, 0, true, b"alice").unwrap();
    buf.extend_from_slice(extra);
    buf
}

fn eap_avp(packet: &EapPacket) -> Vec<u8> {
    avp::encapsulate(&packet.to_bytes(), attr::EAP_MESSAGE, true).unwrap()
}

/// Pull the tunneled EAP-Request out of a server frame
fn inner_request(request: &EapPacket) -> EapPacket {
    let data = payload(request).data;
    let avps = AvpSet::parse(&data).unwrap();
    EapPacket::from_bytes(&avps.eap.unwrap()).unwrap()
}

/// Split the single vendor AVP the server sends after MS-CHAPv2
fn vendor_avp(buf: &[u8]) -> (u32, u32, Vec<u8>) {
    let code = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
    assert_eq!(buf[4] & avp::AVP_FLAGS_VENDOR, avp::AVP_FLAGS_VENDOR);
    let length = u32::from_be_bytes([0, buf[5], buf[6], buf[7]]) as usize;
    let vendor = u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]);
    (code, vendor, buf[12..length].to_vec())
}

fn mschapv2_avps(auth_challenge: &[u8; 16], ident: u8, password: &[u8]) -> Vec<u8> {
    let peer_challenge = [0x21; 16];
    let nt_response = ms_funcs::generate_nt_response(auth_challenge, &peer_challenge, b"alice", password);

    let mut response = vec![ident, 0];
    response.extend_from_slice(&peer_challenge);
    response.extend_from_slice(&[0; 8]);
    response.extend_from_slice(&nt_response);
    assert_eq!(response.len(), 50);

    let mut buf = Vec::new();
    avp::encode_avp(&mut buf, ms_attr::MS_CHAP_CHALLENGE, VENDOR_ID_MICROSOFT, true, auth_challenge).unwrap();
    avp::encode_avp(&mut buf, ms_attr::MS_CHAP2_RESPONSE, VENDOR_ID_MICROSOFT, true, &response).unwrap();
    user_name_and(&buf)
}

fn mschap_avps(challenge: &[u8], ident: u8, password: &[u8]) -> Vec<u8> {
    let challenge: &[u8; 8] = challenge.try_into().unwrap();
    let mut response = vec![ident, 1];
    response.extend_from_slice(&[0; 24]);
    response.extend_from_slice(&ms_funcs::nt_challenge_response(challenge, password));
    assert_eq!(response.len(), 50);

    let mut buf = Vec::new();
    avp::encode_avp(&mut buf, ms_attr::MS_CHAP_CHALLENGE, VENDOR_ID_MICROSOFT, true, challenge).unwrap();
    avp::encode_avp(&mut buf, ms_attr::MS_CHAP_RESPONSE, VENDOR_ID_MICROSOFT, true, &response).unwrap();
    user_name_and(&buf)
}

fn split_challenge(derived: &[u8]) -> ([u8; 16], u8) {
    let mut challenge = [0u8; 16];
    challenge.copy_from_slice(&derived[..16]);
    (challenge, derived[16])
}

#[test]
fn test_pap_v0_goes_straight_to_success() {
    let mut session = session_with(
        TtlsConfig::default(),
        LoopbackTunnel::new(false),
        store_with(alice(TtlsAuth::PAP, vec![])),
    );
    establish(&mut session, 0);

    let mut buf = Vec::new();
    avp::encode_avp(&mut buf, attr::USER_PASSWORD, 0, true, b"secret\0\0").unwrap();
    session.process(&response(0, 2, &user_name_and(&buf)));

    assert_eq!(session.state(), TtlsState::Success);
    assert!(session.is_done());
    assert_eq!(session.identity(), b"alice");

    let key = session.key().unwrap();
    let expected: Vec<u8> = "ttls keying material".bytes().cycle().take(64).collect();
    assert_eq!(key.len(), EAP_TLS_KEY_LEN);
    assert_eq!(key, expected);
}

#[test]
fn test_pap_wrong_password_fails() {
    let mut session = session_with(
        TtlsConfig::default(),
        LoopbackTunnel::new(false),
        store_with(alice(TtlsAuth::PAP, vec![])),
    );
    establish(&mut session, 0);

    let mut buf = Vec::new();
    avp::encode_avp(&mut buf, attr::USER_PASSWORD, 0, true, b"guess").unwrap();
    session.process(&response(0, 2, &user_name_and(&buf)));

    assert_eq!(session.state(), TtlsState::Failure);
    assert!(session.key().is_none());
}

#[test]
fn test_pap_not_allowed_for_user() {
    let mut session = session_with(
        TtlsConfig::default(),
        LoopbackTunnel::new(false),
        store_with(alice(TtlsAuth::CHAP, vec![])),
    );
    establish(&mut session, 0);

    let mut buf = Vec::new();
    avp::encode_avp(&mut buf, attr::USER_PASSWORD, 0, true, b"secret").unwrap();
    session.process(&response(0, 2, &user_name_and(&buf)));

    assert_eq!(session.state(), TtlsState::Failure);
}

#[test]
fn test_unknown_phase2_user_fails() {
    let mut session = session_with(
        TtlsConfig::default(),
        LoopbackTunnel::new(false),
        MapStore::default(),
    );
    establish(&mut session, 0);

    let mut buf = Vec::new();
    avp::encode_avp(&mut buf, attr::USER_PASSWORD, 0, true, b"secret").unwrap();
    session.process(&response(0, 2, &user_name_and(&buf)));

    assert_eq!(session.state(), TtlsState::Failure);
}

#[test]
fn test_chap_with_implicit_challenge() {
    let mut session = session_with(
        TtlsConfig::default(),
        LoopbackTunnel::new(false),
        store_with(alice(TtlsAuth::CHAP, vec![])),
    );
    establish(&mut session, 0);

    let derived = implicit_challenge(&LoopbackTunnel::new(false), 0, 17).unwrap();
    let (challenge, ident) = split_challenge(&derived);

    let mut password = vec![ident];
    password.extend_from_slice(&compute_chap_response(ident, b"secret", &challenge));

    let mut buf = Vec::new();
    avp::encode_avp(&mut buf, attr::CHAP_CHALLENGE, 0, true, &challenge).unwrap();
    avp::encode_avp(&mut buf, attr::CHAP_PASSWORD, 0, true, &password).unwrap();
    session.process(&response(0, 2, &user_name_and(&buf)));

    assert_eq!(session.state(), TtlsState::Success);
}

#[test]
fn test_chap_with_foreign_challenge_fails() {
    let mut session = session_with(
        TtlsConfig::default(),
        LoopbackTunnel::new(false),
        store_with(alice(TtlsAuth::CHAP, vec![])),
    );
    establish(&mut session, 0);

    let challenge = [0x42; 16];
    let mut password = vec![7];
    password.extend_from_slice(&compute_chap_response(7, b"secret", &challenge));

    let mut buf = Vec::new();
    avp::encode_avp(&mut buf, attr::CHAP_CHALLENGE, 0, true, &challenge).unwrap();
    avp::encode_avp(&mut buf, attr::CHAP_PASSWORD, 0, true, &password).unwrap();
    session.process(&response(0, 2, &user_name_and(&buf)));

    assert_eq!(session.state(), TtlsState::Failure);
}

#[test]
fn test_mschapv2_success_waits_for_empty_ack() {
    let mut session = session_with(
        TtlsConfig::default(),
        LoopbackTunnel::new(false),
        store_with(alice(TtlsAuth::MSCHAPV2, vec![])),
    );
    establish(&mut session, 0);

    let derived = implicit_challenge(&LoopbackTunnel::new(false), 0, 17).unwrap();
    let (auth_challenge, ident) = split_challenge(&derived);
    session.process(&response(0, 2, &mschapv2_avps(&auth_challenge, ident, b"secret")));
    assert_eq!(session.state(), TtlsState::Phase2MsChapV2Resp);
    assert!(session.key().is_none());

    let request = session.build_request(3).unwrap();
    let (code, vendor, data) = vendor_avp(&payload(&request).data);
    assert_eq!(code, ms_attr::MS_CHAP2_SUCCESS);
    assert_eq!(vendor, VENDOR_ID_MICROSOFT);

    let peer_challenge = [0x21; 16];
    let nt_response = ms_funcs::generate_nt_response(&auth_challenge, &peer_challenge, b"alice", b"secret");
    let auth_response =
        ms_funcs::generate_authenticator_response(b"secret", &nt_response, &peer_challenge, &auth_challenge, b"alice");
    let mut expected = vec![ident];
    expected.extend_from_slice(b"S=");
    expected.extend_from_slice(hex::encode_upper(auth_response).as_bytes());
    assert_eq!(data, expected);

    session.process(&response(0, 3, &[]));
    assert_eq!(session.state(), TtlsState::Success);
    assert_eq!(session.key().map(|k| k.len()), Some(EAP_TLS_KEY_LEN));
}

#[test]
fn test_mschapv2_non_empty_ack_fails() {
    let mut session = session_with(
        TtlsConfig::default(),
        LoopbackTunnel::new(false),
        store_with(alice(TtlsAuth::MSCHAPV2, vec![])),
    );
    establish(&mut session, 0);

    let derived = implicit_challenge(&LoopbackTunnel::new(false), 0, 17).unwrap();
    let (auth_challenge, ident) = split_challenge(&derived);
    session.process(&response(0, 2, &mschapv2_avps(&auth_challenge, ident, b"secret")));
    session.build_request(3).unwrap();

    session.process(&response(0, 3, b"unexpected"));
    assert_eq!(session.state(), TtlsState::Failure);
}

#[test]
fn test_mschapv2_wrong_password_sends_error() {
    let mut session = session_with(
        TtlsConfig::default(),
        LoopbackTunnel::new(false),
        store_with(alice(TtlsAuth::MSCHAPV2, vec![])),
    );
    establish(&mut session, 0);

    let derived = implicit_challenge(&LoopbackTunnel::new(false), 0, 17).unwrap();
    let (auth_challenge, ident) = split_challenge(&derived);
    session.process(&response(0, 2, &mschapv2_avps(&auth_challenge, ident, b"wrong")));
    assert_eq!(session.state(), TtlsState::Phase2MsChapV2Resp);

    let request = session.build_request(3).unwrap();
    let (code, _, data) = vendor_avp(&payload(&request).data);
    assert_eq!(code, ms_attr::MS_CHAP_ERROR);
    assert_eq!(data, b"Failed");

    session.process(&response(0, 3, &[]));
    assert_eq!(session.state(), TtlsState::Failure);
}

#[test]
fn test_mschap_success() {
    let mut session = session_with(
        TtlsConfig::default(),
        LoopbackTunnel::new(false),
        store_with(alice(TtlsAuth::MSCHAP, vec![])),
    );
    establish(&mut session, 0);

    let derived = implicit_challenge(&LoopbackTunnel::new(false), 0, 9).unwrap();
    session.process(&response(0, 2, &mschap_avps(&derived[..8], derived[8], b"secret")));

    assert_eq!(session.state(), TtlsState::Success);
    assert_eq!(session.key().map(|k| k.len()), Some(EAP_TLS_KEY_LEN));
}

#[test]
fn test_mschap_wrong_password() {
    let mut session = session_with(
        TtlsConfig::default(),
        LoopbackTunnel::new(false),
        store_with(alice(TtlsAuth::MSCHAP, vec![])),
    );
    establish(&mut session, 0);

    let derived = implicit_challenge(&LoopbackTunnel::new(false), 0, 9).unwrap();
    session.process(&response(0, 2, &mschap_avps(&derived[..8], derived[8], b"guess")));

    assert_eq!(session.state(), TtlsState::Failure);
    assert!(session.key().is_none());
}

#[test]
fn test_mschap_wrong_identifier() {
    let mut session = session_with(
        TtlsConfig::default(),
        LoopbackTunnel::new(false),
        store_with(alice(TtlsAuth::MSCHAP, vec![])),
    );
    establish(&mut session, 0);

    let derived = implicit_challenge(&LoopbackTunnel::new(false), 0, 9).unwrap();
    let ident = derived[8].wrapping_add(1);
    session.process(&response(0, 2, &mschap_avps(&derived[..8], ident, b"secret")));

    assert_eq!(session.state(), TtlsState::Failure);
}

#[test]
fn test_mschap_v1_success_goes_to_phase_finished() {
    let config = TtlsConfig {
        max_version: 1,
        ..Default::default()
    };
    let tunnel = LoopbackTunnel::new(true);
    let permutations = tunnel.permutations.clone();
    let mut session = session_with(config, tunnel, store_with(alice(TtlsAuth::MSCHAP, vec![])));
    establish(&mut session, 1);

    let derived = implicit_challenge(&LoopbackTunnel::new(true), 1, 9).unwrap();
    session.process(&response(1, 2, &mschap_avps(&derived[..8], derived[8], b"secret")));
    assert_eq!(session.state(), TtlsState::PhaseFinished);
    assert!(session.key().is_none());
    assert!(permutations.lock().unwrap().is_empty());

    let finished = payload(&session.build_request(3).unwrap());
    assert_eq!(finished.data, b"FinalPhaseFinished");
    session.process(&response(1, 3, FINAL_PHASE_FINISHED));
    assert_eq!(session.state(), TtlsState::Success);
    assert!(session.key().is_some());
}

#[test]
fn test_mschap_v1_wrong_password() {
    let config = TtlsConfig {
        max_version: 1,
        ..Default::default()
    };
    let mut session = session_with(config, LoopbackTunnel::new(true), store_with(alice(TtlsAuth::MSCHAP, vec![])));
    establish(&mut session, 1);

    let derived = implicit_challenge(&LoopbackTunnel::new(true), 1, 9).unwrap();
    session.process(&response(1, 2, &mschap_avps(&derived[..8], derived[8], b"guess")));
    assert_eq!(session.state(), TtlsState::Failure);
}

#[test]
fn test_eap_md5_inner_method() {
    let mut session = session_with(
        TtlsConfig::default(),
        LoopbackTunnel::new(false),
        store_with(alice(TtlsAuth::empty(), vec![EapType::Md5Challenge])),
    );
    establish(&mut session, 0);

    let identity = EapPacket::identity_response(0, b"alice");
    session.process(&response(0, 2, &eap_avp(&identity)));
    assert_eq!(session.state(), TtlsState::Phase2Method);
    assert_eq!(session.inner_method(), Some(EapType::Md5Challenge));

    let challenge = inner_request(&session.build_request(3).unwrap());
    assert_eq!(challenge.eap_type(), Some(EapType::Md5Challenge));
    assert_eq!(&challenge.data[1..17], &MD5_CHALLENGE);

    let mut data = vec![challenge.identifier];
    data.extend_from_slice(b"secret");
    data.extend_from_slice(&MD5_CHALLENGE);
    let answer = eap_md5::create_response(challenge.identifier, &md5::compute(&data).0, "");
    session.process(&response(0, 3, &eap_avp(&answer)));

    assert_eq!(session.state(), TtlsState::Success);
    assert!(session.key().is_some());
}

#[test]
fn test_nak_without_remaining_methods_fails() {
    let mut session = session_with(
        TtlsConfig::default(),
        LoopbackTunnel::new(false),
        store_with(alice(
            TtlsAuth::empty(),
            vec![EapType::Md5Challenge, EapType::GenericTokenCard],
        )),
    );
    establish(&mut session, 0);

    session.process(&response(0, 2, &eap_avp(&EapPacket::identity_response(0, b"alice"))));
    assert_eq!(session.inner_method(), Some(EapType::Md5Challenge));
    session.build_request(3).unwrap();

    let nak = EapPacket::nak(3, &[EapType::Tls.as_u8()]);
    session.process(&response(0, 3, &eap_avp(&nak)));
    assert_eq!(session.state(), TtlsState::Failure);
}

#[test]
fn test_nak_switches_method_and_pending_response_is_redelivered() {
    let mut session = session_with(
        TtlsConfig::default(),
        LoopbackTunnel::new(false),
        store_with(alice(
            TtlsAuth::empty(),
            vec![EapType::Md5Challenge, EapType::GenericTokenCard],
        )),
    );
    establish(&mut session, 0);

    session.process(&response(0, 2, &eap_avp(&EapPacket::identity_response(0, b"alice"))));
    session.build_request(3).unwrap();

    let nak = EapPacket::nak(3, &[EapType::GenericTokenCard.as_u8()]);
    session.process(&response(0, 3, &eap_avp(&nak)));
    assert_eq!(session.state(), TtlsState::Phase2Method);
    assert_eq!(session.inner_method(), Some(EapType::GenericTokenCard));

    let prompt = inner_request(&session.build_request(4).unwrap());
    assert_eq!(prompt.eap_type(), Some(EapType::GenericTokenCard));

    let token = EapPacket::new(
        EapCode::Response,
        prompt.identifier,
        Some(EapType::GenericTokenCard),
        b"token".to_vec(),
    );
    session.process(&response(0, 4, &eap_avp(&token)));
    assert_eq!(session.state(), TtlsState::Phase2Method);
    assert!(session.has_pending_response());

    // The held response is used instead of whatever arrives next
    session.process(&response(0, 4, b"not decrypted"));
    assert!(!session.has_pending_response());
    assert_eq!(session.state(), TtlsState::Success);
}

#[test]
fn test_pending_identity_lookup_is_redelivered() {
    let registry = Arc::new(DirectoryMethods::default());
    let mut session = TtlsSession::new(
        &TtlsConfig::default(),
        Box::new(LoopbackTunnel::new(false)),
        Arc::new(store_with(alice(TtlsAuth::empty(), vec![EapType::Md5Challenge]))),
        registry.clone(),
        b"anonymous",
    )
    .unwrap();
    establish(&mut session, 0);

    session.process(&response(0, 2, &eap_avp(&EapPacket::identity_response(0, b"alice"))));
    assert_eq!(session.state(), TtlsState::Phase2Start);
    assert!(session.has_pending_response());
    assert_eq!(registry.lookups.load(Ordering::SeqCst), 1);

    session.process(&response(0, 2, b"not decrypted"));
    assert!(!session.has_pending_response());
    assert_eq!(registry.lookups.load(Ordering::SeqCst), 2);
    assert_eq!(session.identity(), b"alice");
    assert_eq!(session.state(), TtlsState::Phase2Method);
    assert_eq!(session.inner_method(), Some(EapType::Md5Challenge));

    let challenge = inner_request(&session.build_request(3).unwrap());
    assert_eq!(challenge.eap_type(), Some(EapType::Md5Challenge));
}

#[test]
fn test_fragmented_request_takes_precedence() {
    let config = TtlsConfig {
        fragment_size: 8,
        ..Default::default()
    };
    let mut session = session_with(config, LoopbackTunnel::new(false), MapStore::default());

    session.build_request(1).unwrap();
    session.process(&response(0, 1, b"client hello"));

    let first = payload(&session.build_request(2).unwrap());
    assert!(first.flags.length_included());
    assert!(first.flags.more_fragments());
    assert_eq!(first.message_length, Some(SERVER_FINISHED.len() as u32));
    assert_eq!(first.data, &SERVER_FINISHED[..8]);
    assert_eq!(session.stage(), Stage::Transport(FramingState::WaitFragAck));
    assert_eq!(session.state(), TtlsState::Phase2Start);

    session.process(&response(0, 2, &[]));
    let last = payload(&session.build_request(3).unwrap());
    assert!(!last.flags.length_included());
    assert!(!last.flags.more_fragments());
    assert_eq!(last.data, &SERVER_FINISHED[8..]);
    assert_eq!(session.stage(), Stage::Protocol(TtlsState::Phase2Start));
}

#[test]
fn test_fragmented_response_is_acknowledged() {
    let mut session = session_with(
        TtlsConfig::default(),
        LoopbackTunnel::new(false),
        store_with(alice(TtlsAuth::PAP, vec![])),
    );
    establish(&mut session, 0);

    let mut buf = Vec::new();
    avp::encode_avp(&mut buf, attr::USER_PASSWORD, 0, true, b"secret").unwrap();
    let message = user_name_and(&buf);
    let (head, tail) = message.split_at(10);

    let first = TtlsPacket::new(
        TtlsFlags::new(true, true, false, 0),
        Some(message.len() as u32),
        head.to_vec(),
    );
    session.process(&first.to_eap_response(2));
    assert_eq!(session.stage(), Stage::Transport(FramingState::FragAck));

    let ack = payload(&session.build_request(3).unwrap());
    assert!(ack.data.is_empty());
    assert!(!ack.flags.more_fragments());
    assert_eq!(session.state(), TtlsState::Phase2Start);

    session.process(&response(0, 3, tail));
    assert_eq!(session.state(), TtlsState::Success);
}

#[test]
fn test_v1_phase_finished_exchange() {
    let config = TtlsConfig {
        max_version: 1,
        ..Default::default()
    };
    let tunnel = LoopbackTunnel::new(true);
    let permutations = tunnel.permutations.clone();
    let mut session = session_with(config, tunnel, store_with(alice(TtlsAuth::MSCHAPV2, vec![])));
    assert_eq!(session.version(), 1);
    establish(&mut session, 1);

    let derived = implicit_challenge(&LoopbackTunnel::new(true), 1, 17).unwrap();
    let mut seed = LoopbackTunnel::server_random();
    seed.extend(LoopbackTunnel::client_random());
    assert_eq!(
        derived,
        tls_prf_sha1_md5(&LoopbackTunnel::inner_secret(), b"inner application challenge", &seed, 17)
    );

    let (auth_challenge, ident) = split_challenge(&derived);
    session.process(&response(1, 2, &mschapv2_avps(&auth_challenge, ident, b"secret")));
    assert_eq!(session.state(), TtlsState::Phase2MsChapV2Resp);
    {
        let log = permutations.lock().unwrap();
        assert_eq!(log.len(), 1);
        let mixed = log[0].as_ref().unwrap();
        assert_eq!(&mixed[..2], &[0, 32]);
        assert_eq!(mixed.len(), 34);
    }

    session.build_request(3).unwrap();
    session.process(&response(1, 3, &[]));
    assert_eq!(session.state(), TtlsState::PhaseFinished);
    assert!(session.key().is_none());

    let finished = payload(&session.build_request(4).unwrap());
    assert_eq!(finished.data, b"FinalPhaseFinished");
    assert_eq!(finished.flags.version(), 1);

    session.process(&response(1, 4, FINAL_PHASE_FINISHED));
    assert_eq!(session.state(), TtlsState::Success);

    let mut seed = LoopbackTunnel::client_random();
    seed.extend(LoopbackTunnel::server_random());
    let expected = tls_prf_sha1_md5(&LoopbackTunnel::inner_secret(), b"ttls v1 keying material", &seed, 64);
    assert_eq!(session.key(), Some(expected));
}

#[test]
fn test_v1_bad_phase_finished_fails() {
    let config = TtlsConfig {
        max_version: 1,
        ..Default::default()
    };
    let mut session = session_with(config, LoopbackTunnel::new(true), store_with(alice(TtlsAuth::PAP, vec![])));
    establish(&mut session, 1);

    let mut buf = Vec::new();
    avp::encode_avp(&mut buf, attr::USER_PASSWORD, 0, true, b"secret").unwrap();
    session.process(&response(1, 2, &user_name_and(&buf)));
    assert_eq!(session.state(), TtlsState::PhaseFinished);

    session.build_request(3).unwrap();
    session.process(&response(1, 3, b"application data"));
    assert_eq!(session.state(), TtlsState::Failure);
}

#[test]
fn test_v1_inner_eap_key_is_permuted() {
    let config = TtlsConfig {
        max_version: 1,
        ..Default::default()
    };
    let tunnel = LoopbackTunnel::new(true);
    let permutations = tunnel.permutations.clone();
    let mut session = session_with(
        config,
        tunnel,
        store_with(alice(TtlsAuth::empty(), vec![EapType::GenericTokenCard])),
    );
    establish(&mut session, 1);

    session.process(&response(1, 2, &eap_avp(&EapPacket::identity_response(0, b"alice"))));
    let prompt = inner_request(&session.build_request(3).unwrap());
    let token = EapPacket::new(
        EapCode::Response,
        prompt.identifier,
        Some(EapType::GenericTokenCard),
        b"token".to_vec(),
    );
    session.process(&response(1, 3, &eap_avp(&token)));
    session.process(&response(1, 3, &[]));
    assert_eq!(session.state(), TtlsState::PhaseFinished);

    let log = permutations.lock().unwrap();
    let mixed = log.last().unwrap().as_ref().unwrap();
    assert_eq!(&mixed[..2], &[0, 32]);
    assert_eq!(&mixed[2..], &[0x77; 32]);
}

#[test]
fn test_peer_version_downgrade() {
    let config = TtlsConfig {
        max_version: 1,
        ..Default::default()
    };
    let mut session = session_with(config, LoopbackTunnel::new(true), MapStore::default());

    let start = payload(&session.build_request(1).unwrap());
    assert_eq!(start.flags.version(), 1);
    session.process(&response(0, 1, b"client hello"));
    assert_eq!(session.version(), 0);

    let finished = payload(&session.build_request(2).unwrap());
    assert_eq!(finished.flags.version(), 0);
}

#[test]
fn test_no_tls_ia_falls_back_to_v0() {
    let config = TtlsConfig {
        max_version: 1,
        ..Default::default()
    };
    let session = session_with(config, LoopbackTunnel::new(false), MapStore::default());
    assert_eq!(session.version(), 0);
}

#[test]
fn test_forced_version_requires_tls_ia() {
    let mut store = MapStore::default();
    store.outer.insert(
        b"anonymous".to_vec(),
        EapUser {
            force_version: Some(1),
            ..Default::default()
        },
    );

    let result = TtlsSession::new(
        &TtlsConfig::default(),
        Box::new(LoopbackTunnel::new(false)),
        Arc::new(store),
        Arc::new(TestMethods),
        b"anonymous",
    );
    assert!(matches!(result, Err(TtlsError::TlsIaUnavailable(1))));
}

#[test]
fn test_forced_version_overrides_config() {
    let mut store = MapStore::default();
    store.outer.insert(
        b"anonymous".to_vec(),
        EapUser {
            force_version: Some(0),
            ..Default::default()
        },
    );
    let config = TtlsConfig {
        max_version: 1,
        ..Default::default()
    };
    let session = session_with(config, LoopbackTunnel::new(true), store);
    assert_eq!(session.version(), 0);
    assert_eq!(session.force_version(), Some(0));
}

#[test]
fn test_tnc_runs_after_success() {
    let config = TtlsConfig {
        tnc: true,
        ..Default::default()
    };
    let mut session = session_with(config, LoopbackTunnel::new(false), store_with(alice(TtlsAuth::PAP, vec![])));
    establish(&mut session, 0);

    let mut buf = Vec::new();
    avp::encode_avp(&mut buf, attr::USER_PASSWORD, 0, true, b"secret").unwrap();
    session.process(&response(0, 2, &user_name_and(&buf)));
    assert_eq!(session.state(), TtlsState::Phase2Method);
    assert_eq!(session.inner_method(), Some(EapType::Tnc));

    let request = inner_request(&session.build_request(3).unwrap());
    assert_eq!(request.eap_type(), Some(EapType::Tnc));

    let answer = EapPacket::new(EapCode::Response, request.identifier, Some(EapType::Tnc), vec![0x01]);
    session.process(&response(0, 3, &eap_avp(&answer)));
    assert_eq!(session.state(), TtlsState::Success);
    assert!(session.key().is_some());
}

#[test]
fn test_tnc_requires_eap_response() {
    let config = TtlsConfig {
        tnc: true,
        ..Default::default()
    };
    let mut session = session_with(config, LoopbackTunnel::new(false), store_with(alice(TtlsAuth::PAP, vec![])));
    establish(&mut session, 0);

    let mut buf = Vec::new();
    avp::encode_avp(&mut buf, attr::USER_PASSWORD, 0, true, b"secret").unwrap();
    session.process(&response(0, 2, &user_name_and(&buf)));
    session.build_request(3).unwrap();

    session.process(&response(0, 3, &buf));
    assert_eq!(session.state(), TtlsState::Failure);
}

#[test]
fn test_invalid_frames() {
    let mut session = session_with(TtlsConfig::default(), LoopbackTunnel::new(false), MapStore::default());
    session.build_request(1).unwrap();

    assert!(!session.check(&EapPacket::identity_response(1, b"alice")));
    let empty = EapPacket::new(EapCode::Response, 1, Some(EapType::Ttls), Vec::new());
    assert!(!session.check(&empty));

    session.process(&empty);
    assert_eq!(session.state(), TtlsState::Failure);
    assert!(matches!(
        session.build_request(2),
        Err(TtlsError::UnexpectedState(TtlsState::Failure))
    ));
}

#[test]
fn test_handshake_failure() {
    let mut session = session_with(TtlsConfig::default(), LoopbackTunnel::new(false), MapStore::default());
    session.build_request(1).unwrap();
    session.process(&response(0, 1, &[]));
    assert_eq!(session.state(), TtlsState::Failure);
}
