//! Keying material derived from the tunnel
//!
//! Both the Phase 2 implicit challenge and the exported MSK come from TLS
//! secrets only the two endpoints hold. Version 0 uses the RFC 5705
//! exporter; version 1 runs the TLS 1.0 PRF over the TLS/IA inner secret.

use tracing::{debug, warn};

use crate::prf::tls_prf_sha1_md5;
use crate::tunnel::{Tunnel, TunnelError};

/// Length of the exported MSK
pub const EAP_TLS_KEY_LEN: usize = 64;

const CHALLENGE_LABEL_V0: &str = "ttls challenge";
const CHALLENGE_LABEL_V1: &[u8] = b"inner application challenge";
const KEYING_LABEL_V0: &str = "ttls keying material";
const KEYING_LABEL_V1: &[u8] = b"ttls v1 keying material";

/// Derive `len` bytes of implicit challenge for PAP/CHAP/MS-CHAP/MS-CHAPv2
pub fn implicit_challenge(tunnel: &dyn Tunnel, version: u8, len: usize) -> Result<Vec<u8>, TunnelError> {
    if version == 0 {
        return tunnel
            .export_keying_material(CHALLENGE_LABEL_V0, len)
            .inspect_err(|e| warn!("EAP-TTLS: Failed to derive implicit challenge: {}", e));
    }

    let keys = tunnel.keys()?;
    if keys.client_random.is_empty() || keys.server_random.is_empty() || keys.inner_secret.is_empty() {
        warn!("EAP-TTLS: Could not get keys from TLS library");
        return Err(TunnelError::KeysUnavailable);
    }

    let mut seed = Vec::with_capacity(keys.client_random.len() + keys.server_random.len());
    seed.extend_from_slice(&keys.server_random);
    seed.extend_from_slice(&keys.client_random);

    debug!("EAP-TTLSv1: Derived {} bytes of implicit challenge", len);
    Ok(tls_prf_sha1_md5(&keys.inner_secret, CHALLENGE_LABEL_V1, &seed, len))
}

/// Derive the 64-byte MSK exported on success
pub fn derive_key(tunnel: &dyn Tunnel, version: u8) -> Result<Vec<u8>, TunnelError> {
    if version == 0 {
        return tunnel.export_keying_material(KEYING_LABEL_V0, EAP_TLS_KEY_LEN);
    }

    let keys = tunnel.keys()?;
    if keys.client_random.is_empty() || keys.server_random.is_empty() || keys.inner_secret.is_empty() {
        return Err(TunnelError::KeysUnavailable);
    }

    let mut seed = Vec::with_capacity(keys.client_random.len() + keys.server_random.len());
    seed.extend_from_slice(&keys.client_random);
    seed.extend_from_slice(&keys.server_random);

    Ok(tls_prf_sha1_md5(
        &keys.inner_secret,
        KEYING_LABEL_V1,
        &seed,
        EAP_TLS_KEY_LEN,
    ))
}
