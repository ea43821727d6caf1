//! The TLS 1.2 key schedule: P_SHA256 and its three uses (master secret,
//! key expansion, Finished verify_data), per RFC 5246 §5 and §8.1.

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

pub const MASTER_LEN: usize = 48;
pub const KEY_BLOCK_LEN: usize = 40;
pub const VERIFY_DATA_LEN: usize = 12;

fn hmac(secret: &[u8], parts: &[&[u8]]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(secret).expect("hmac accepts any key length");
    for part in parts {
        mac.update(part);
    }
    mac.finalize().into_bytes().into()
}

/// P_SHA256: A(i) = HMAC(secret, A(i-1)) with A(0) = label ∥ seed; output
/// chunks are HMAC(secret, A(i) ∥ label ∥ seed).
pub fn p_sha256(secret: &[u8], label: &[u8], seed: &[u8], len: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(len + 31);
    let mut a = hmac(secret, &[label, seed]);

    while out.len() < len {
        out.extend_from_slice(&hmac(secret, &[&a[..], label, seed]));
        a = hmac(secret, &[&a[..]]);
    }

    out.truncate(len);
    out
}

pub fn master_secret(
    premaster: &[u8],
    client_random: &[u8; 32],
    server_random: &[u8; 32],
) -> [u8; MASTER_LEN] {
    let mut seed = [0u8; 64];
    seed[..32].copy_from_slice(client_random);
    seed[32..].copy_from_slice(server_random);

    p_sha256(premaster, b"master secret", &seed, MASTER_LEN)
        .try_into()
        .unwrap()
}

/// The 40-byte key block split. No MAC keys: AES-GCM is an AEAD.
#[derive(Debug, Clone)]
pub struct KeyBlock {
    pub client_key: [u8; 16],
    pub server_key: [u8; 16],
    pub client_iv: [u8; 4],
    pub server_iv: [u8; 4],
}

pub fn key_block(
    master: &[u8; MASTER_LEN],
    client_random: &[u8; 32],
    server_random: &[u8; 32],
) -> KeyBlock {
    // key expansion seeds server_random first, unlike the master secret
    let mut seed = [0u8; 64];
    seed[..32].copy_from_slice(server_random);
    seed[32..].copy_from_slice(client_random);

    let block = p_sha256(master, b"key expansion", &seed, KEY_BLOCK_LEN);

    KeyBlock {
        client_key: block[..16].try_into().unwrap(),
        server_key: block[16..32].try_into().unwrap(),
        client_iv: block[32..36].try_into().unwrap(),
        server_iv: block[36..40].try_into().unwrap(),
    }
}

pub fn transcript_hash(transcript: &[u8]) -> [u8; 32] {
    Sha256::digest(transcript).into()
}

pub fn verify_data(
    master: &[u8; MASTER_LEN],
    label: &[u8],
    transcript_hash: &[u8; 32],
) -> [u8; VERIFY_DATA_LEN] {
    p_sha256(master, label, transcript_hash, VERIFY_DATA_LEN)
        .try_into()
        .unwrap()
}
