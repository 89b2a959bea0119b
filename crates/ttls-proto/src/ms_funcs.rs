//! MS-CHAP and MS-CHAPv2 primitive functions (RFC 2433, RFC 2759, RFC 3079)
//!
//! Pure functions over fixed-size arrays. Passwords are taken as raw bytes
//! and converted to UTF-16LE before hashing, as Windows does.
//! Passwords that are not UTF-8 are widened byte by byte (Latin-1).

use des::Des;
use des::cipher::{BlockEncrypt, KeyInit, generic_array::GenericArray};
use md4::Md4;
use sha1::{Digest, Sha1};
use tracing::warn;

/// "Magic server to client signing constant"
const MAGIC1: &[u8] = b"Magic server to client signing constant";
/// "Pad to make it do more than one iteration"
const MAGIC2: &[u8] = b"Pad to make it do more than one iteration";

const MASTER_KEY_MAGIC: &[u8] = b"This is the MPPE Master Key";

const SEND_KEY_MAGIC: &[u8] =
    b"On the client side, this is the send key; on the server side, it is the receive key.";
const RECV_KEY_MAGIC: &[u8] =
    b"On the client side, this is the receive key; on the server side, it is the send key.";

const SHS_PAD1: [u8; 40] = [0x00; 40];
const SHS_PAD2: [u8; 40] = [0xf2; 40];

/// NtPasswordHash: MD4 over the UTF-16LE password
pub fn nt_password_hash(password: &[u8]) -> [u8; 16] {
    let unicode: Vec<u8> = match std::str::from_utf8(password) {
        Ok(text) => text.encode_utf16().flat_map(u16::to_le_bytes).collect(),
        Err(e) => {
            warn!("MS-CHAP: Password is not valid UTF-8 ({}); hashing it as Latin-1", e);
            password.iter().flat_map(|&b| [b, 0]).collect()
        }
    };

    Md4::digest(&unicode).into()
}

/// HashNtPasswordHash: MD4 of the NT hash
pub fn hash_nt_password_hash(password_hash: &[u8; 16]) -> [u8; 16] {
    Md4::digest(password_hash).into()
}

/// ChallengeHash: first 8 bytes of SHA1(peer ‖ authenticator ‖ username)
pub fn challenge_hash(peer_challenge: &[u8; 16], auth_challenge: &[u8; 16], username: &[u8]) -> [u8; 8] {
    let digest = Sha1::new()
        .chain_update(peer_challenge)
        .chain_update(auth_challenge)
        .chain_update(username)
        .finalize();

    let mut out = [0u8; 8];
    out.copy_from_slice(&digest[..8]);
    out
}

/// Spread 56 key bits over 8 bytes, leaving the parity bit clear
fn des_key(input: &[u8]) -> [u8; 8] {
    [
        input[0] & 0xfe,
        ((input[0] << 7) | (input[1] >> 1)) & 0xfe,
        ((input[1] << 6) | (input[2] >> 2)) & 0xfe,
        ((input[2] << 5) | (input[3] >> 3)) & 0xfe,
        ((input[3] << 4) | (input[4] >> 4)) & 0xfe,
        ((input[4] << 3) | (input[5] >> 5)) & 0xfe,
        ((input[5] << 2) | (input[6] >> 6)) & 0xfe,
        (input[6] << 1) & 0xfe,
    ]
}

fn des_encrypt(clear: &[u8; 8], key7: &[u8]) -> [u8; 8] {
    let key = des_key(key7);
    let cipher = Des::new(GenericArray::from_slice(&key));
    let mut block = GenericArray::clone_from_slice(clear);
    cipher.encrypt_block(&mut block);
    block.into()
}

/// ChallengeResponse: three DES encryptions keyed by the zero-padded hash
pub fn challenge_response(challenge: &[u8; 8], password_hash: &[u8; 16]) -> [u8; 24] {
    let mut z = [0u8; 21];
    z[..16].copy_from_slice(password_hash);

    let mut response = [0u8; 24];
    for (i, key7) in z.chunks_exact(7).enumerate() {
        response[i * 8..(i + 1) * 8].copy_from_slice(&des_encrypt(challenge, key7));
    }
    response
}

/// NtChallengeResponse (MS-CHAPv1) from a plaintext password
pub fn nt_challenge_response(challenge: &[u8; 8], password: &[u8]) -> [u8; 24] {
    challenge_response(challenge, &nt_password_hash(password))
}

/// GenerateNTResponse from an NT password hash
pub fn generate_nt_response_pwhash(
    auth_challenge: &[u8; 16],
    peer_challenge: &[u8; 16],
    username: &[u8],
    password_hash: &[u8; 16],
) -> [u8; 24] {
    let challenge = challenge_hash(peer_challenge, auth_challenge, username);
    challenge_response(&challenge, password_hash)
}

/// GenerateNTResponse from a plaintext password
pub fn generate_nt_response(
    auth_challenge: &[u8; 16],
    peer_challenge: &[u8; 16],
    username: &[u8],
    password: &[u8],
) -> [u8; 24] {
    generate_nt_response_pwhash(
        auth_challenge,
        peer_challenge,
        username,
        &nt_password_hash(password),
    )
}

/// GenerateAuthenticatorResponse from an NT password hash
///
/// Returns the raw 20-byte digest; the wire form is `"S="` followed by
/// its uppercase hex encoding.
pub fn generate_authenticator_response_pwhash(
    password_hash: &[u8; 16],
    nt_response: &[u8; 24],
    peer_challenge: &[u8; 16],
    auth_challenge: &[u8; 16],
    username: &[u8],
) -> [u8; 20] {
    let password_hash_hash = hash_nt_password_hash(password_hash);

    let digest = Sha1::new()
        .chain_update(password_hash_hash)
        .chain_update(nt_response)
        .chain_update(MAGIC1)
        .finalize();

    let challenge = challenge_hash(peer_challenge, auth_challenge, username);

    Sha1::new()
        .chain_update(digest)
        .chain_update(challenge)
        .chain_update(MAGIC2)
        .finalize()
        .into()
}

/// GenerateAuthenticatorResponse from a plaintext password
pub fn generate_authenticator_response(
    password: &[u8],
    nt_response: &[u8; 24],
    peer_challenge: &[u8; 16],
    auth_challenge: &[u8; 16],
    username: &[u8],
) -> [u8; 20] {
    generate_authenticator_response_pwhash(
        &nt_password_hash(password),
        nt_response,
        peer_challenge,
        auth_challenge,
        username,
    )
}

/// GetMasterKey (RFC 3079 Section 3.4)
pub fn get_master_key(password_hash_hash: &[u8; 16], nt_response: &[u8; 24]) -> [u8; 16] {
    let digest = Sha1::new()
        .chain_update(password_hash_hash)
        .chain_update(nt_response)
        .chain_update(MASTER_KEY_MAGIC)
        .finalize();

    let mut master_key = [0u8; 16];
    master_key.copy_from_slice(&digest[..16]);
    master_key
}

/// GetAsymmetricStartKey (RFC 3079 Section 3.4)
///
/// `len` is capped at the 20-byte SHA1 output.
pub fn get_asymmetric_start_key(master_key: &[u8; 16], len: usize, is_send: bool, is_server: bool) -> Vec<u8> {
    let magic = match (is_send, is_server) {
        (true, true) | (false, false) => RECV_KEY_MAGIC,
        (true, false) | (false, true) => SEND_KEY_MAGIC,
    };

    let digest = Sha1::new()
        .chain_update(master_key)
        .chain_update(SHS_PAD1)
        .chain_update(magic)
        .chain_update(SHS_PAD2)
        .finalize();

    digest[..len.min(digest.len())].to_vec()
}
