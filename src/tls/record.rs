//! The TLS record layer: plaintext framing plus the RFC 5288 AES-128-GCM
//! framing used once a ChangeCipherSpec arms a direction.

use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{Aead, Payload};
use aes_gcm::{Aes128Gcm, KeyInit};

use crate::err::Fatal;

pub const CHANGE_CIPHER_SPEC: u8 = 20;
pub const ALERT: u8 = 21;
pub const HANDSHAKE: u8 = 22;
pub const APPLICATION_DATA: u8 = 23;

pub const VERSION: u16 = 0x0303;

pub const HEADER_LEN: usize = 5;
pub const EXPLICIT_NONCE_LEN: usize = 8;
pub const TAG_LEN: usize = 16;

// 2^14 plaintext plus the expansion RFC 5246 allows
const MAX_FRAGMENT: usize = (1 << 14) + 2048;

/// Pops one complete record off the front of the reassembly buffer.
/// Returns `None` while the length prefix wants more bytes than buffered.
pub fn take(buf: &mut Vec<u8>) -> Result<Option<(u8, Vec<u8>)>, Fatal> {
    if buf.len() < HEADER_LEN {
        return Ok(None);
    }

    let content_type = buf[0];
    let len = u16::from_be_bytes([buf[3], buf[4]]) as usize;
    if len > MAX_FRAGMENT {
        return Err(Fatal::Tls("record length over limit"));
    }

    if buf.len() < HEADER_LEN + len {
        return Ok(None);
    }

    let fragment = buf[HEADER_LEN..HEADER_LEN + len].to_vec();
    buf.drain(..HEADER_LEN + len);

    Ok(Some((content_type, fragment)))
}

pub fn encode(content_type: u8, fragment: &[u8], out: &mut Vec<u8>) {
    out.push(content_type);
    out.extend_from_slice(&VERSION.to_be_bytes());
    out.extend_from_slice(&(fragment.len() as u16).to_be_bytes());
    out.extend_from_slice(fragment);
}

/// One direction of AEAD record protection. The sequence counter starts
/// at 0 when the direction is armed and increments once per record.
pub struct RecordCipher {
    aead: Aes128Gcm,
    salt: [u8; 4],
    seq: u64,
}

impl RecordCipher {
    pub fn new(key: &[u8; 16], salt: [u8; 4]) -> Self {
        RecordCipher {
            aead: Aes128Gcm::new(GenericArray::from_slice(key)),
            salt,
            seq: 0,
        }
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    fn nonce(&self, explicit: &[u8; EXPLICIT_NONCE_LEN]) -> [u8; 12] {
        let mut nonce = [0u8; 12];
        nonce[..4].copy_from_slice(&self.salt);
        nonce[4..].copy_from_slice(explicit);
        nonce
    }

    // seq ∥ content-type ∥ version ∥ plaintext length
    fn aad(seq: u64, content_type: u8, len: usize) -> [u8; 13] {
        let mut aad = [0u8; 13];
        aad[..8].copy_from_slice(&seq.to_be_bytes());
        aad[8] = content_type;
        aad[9..11].copy_from_slice(&VERSION.to_be_bytes());
        aad[11..13].copy_from_slice(&(len as u16).to_be_bytes());
        aad
    }

    fn bump(&mut self) -> Result<(), Fatal> {
        self.seq = self.seq.checked_add(1).ok_or(Fatal::CounterExhausted)?;
        Ok(())
    }

    /// Protects one fragment: explicit nonce ∥ ciphertext ∥ tag. The
    /// explicit nonce is the send counter, big-endian.
    pub fn seal(&mut self, content_type: u8, plaintext: &[u8]) -> Result<Vec<u8>, Fatal> {
        let explicit = self.seq.to_be_bytes();
        let nonce = self.nonce(&explicit);
        let aad = Self::aad(self.seq, content_type, plaintext.len());

        let ciphertext = self
            .aead
            .encrypt(
                GenericArray::from_slice(&nonce),
                Payload {
                    msg: plaintext,
                    aad: &aad,
                },
            )
            .map_err(|_| Fatal::Tls("aead seal failed"))?;
        self.bump()?;

        let mut fragment = Vec::with_capacity(EXPLICIT_NONCE_LEN + ciphertext.len());
        fragment.extend_from_slice(&explicit);
        fragment.extend_from_slice(&ciphertext);
        Ok(fragment)
    }

    /// Opens one fragment; the explicit nonce comes from the wire, the
    /// sequence number in the AAD from our receive counter.
    pub fn open(&mut self, content_type: u8, fragment: &[u8]) -> Result<Vec<u8>, Fatal> {
        if fragment.len() < EXPLICIT_NONCE_LEN + TAG_LEN {
            return Err(Fatal::Tls("short encrypted record"));
        }

        let explicit: [u8; EXPLICIT_NONCE_LEN] = fragment[..EXPLICIT_NONCE_LEN].try_into().unwrap();
        let nonce = self.nonce(&explicit);
        let plaintext_len = fragment.len() - EXPLICIT_NONCE_LEN - TAG_LEN;
        let aad = Self::aad(self.seq, content_type, plaintext_len);

        let plaintext = self
            .aead
            .decrypt(
                GenericArray::from_slice(&nonce),
                Payload {
                    msg: &fragment[EXPLICIT_NONCE_LEN..],
                    aad: &aad,
                },
            )
            .map_err(|_| Fatal::BadRecordMac)?;
        self.bump()?;

        Ok(plaintext)
    }
}
