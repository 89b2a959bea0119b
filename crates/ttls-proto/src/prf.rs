//! TLS 1.0 pseudo-random function (RFC 2246 Section 5)
//!
//! PRF(secret, label, seed) = P_MD5(S1, label + seed) XOR P_SHA-1(S2, label + seed)
//!
//! S1 and S2 are the two halves of the secret; for an odd-length secret
//! they share the middle byte.

use hmac::digest::KeyInit;
use hmac::{Hmac, Mac};
use md5_digest::Md5;
use sha1::Sha1;

type HmacMd5 = Hmac<Md5>;
type HmacSha1 = Hmac<Sha1>;

/// TLS 1.0 PRF producing `output_len` bytes
pub fn tls_prf_sha1_md5(secret: &[u8], label: &[u8], seed: &[u8], output_len: usize) -> Vec<u8> {
    let mut label_seed = Vec::with_capacity(label.len() + seed.len());
    label_seed.extend_from_slice(label);
    label_seed.extend_from_slice(seed);

    let half = secret.len().div_ceil(2);
    let s1 = &secret[..half];
    let s2 = &secret[secret.len() - half..];

    let mut output = vec![0u8; output_len];
    p_hash::<HmacMd5>(s1, &label_seed, &mut output);
    p_hash::<HmacSha1>(s2, &label_seed, &mut output);
    output
}

/// XOR P_hash(secret, seed) into `output`
fn p_hash<M: Mac + KeyInit>(secret: &[u8], seed: &[u8], output: &mut [u8]) {
    // A(0) = seed
    let mut a = seed.to_vec();
    let mut pos = 0;

    while pos < output.len() {
        // A(i) = HMAC(secret, A(i-1))
        let mut mac =
            <M as KeyInit>::new_from_slice(secret).expect("HMAC can take key of any size");
        mac.update(&a);
        a = mac.finalize().into_bytes().to_vec();

        // HMAC(secret, A(i) + seed)
        let mut mac =
            <M as KeyInit>::new_from_slice(secret).expect("HMAC can take key of any size");
        mac.update(&a);
        mac.update(seed);
        let block = mac.finalize().into_bytes();

        for (out, b) in output[pos..].iter_mut().zip(block.iter()) {
            *out ^= b;
        }
        pos += block.len();
    }
}
