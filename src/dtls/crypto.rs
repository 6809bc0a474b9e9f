//! Key derivation and record protection for `TLS_PSK_WITH_AES_128_CCM_8`.

use std::time::{SystemTime, UNIX_EPOCH};

use aes::Aes128;
use ccm::{
    aead::{generic_array::GenericArray, Aead, KeyInit, Payload},
    consts::{U12, U8},
    Ccm,
};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::{Error, Result};

/// DTLS 1.2 on the wire.
pub(crate) const DTLS_VERSION: u16 = 0xfefd;

pub(crate) const KEY_LEN: usize = 16;
pub(crate) const IV_LEN: usize = 4;
pub(crate) const MAC_LEN: usize = 8;
/// Explicit nonce (epoch || 48-bit sequence) carried on every record.
pub(crate) const EXPLICIT_NONCE_LEN: usize = 8;

/// AES-CCM with an 8-byte tag and a 12-byte nonce, the AEAD of this suite
/// (RFC 6655).
type SuiteCcm = Ccm<Aes128, U8, U12>;

type HmacSha256 = Hmac<Sha256>;

/// RFC 4279 §2: `uint16(N) || N zero octets || uint16(N) || PSK`.
pub(crate) fn pre_master_secret(psk: &[u8]) -> Vec<u8> {
    let length = (psk.len() as u16).to_be_bytes();
    let mut out = Vec::with_capacity(2 * psk.len() + 4);
    out.extend_from_slice(&length);
    out.resize(2 + psk.len(), 0);
    out.extend_from_slice(&length);
    out.extend_from_slice(psk);
    out
}

/// 32-byte client random: unix time in the first four bytes, 28 random
/// bytes after it (RFC 5246 §7.4.1.2).
pub(crate) fn client_random() -> [u8; 32] {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or_default();
    let mut out = [0u8; 32];
    out[..4].copy_from_slice(&now.to_be_bytes());
    rand::thread_rng().fill_bytes(&mut out[4..]);
    out
}

fn hmac_sha256(secret: &[u8], chunks: &[&[u8]]) -> [u8; 32] {
    // HMAC-SHA256 accepts keys of any length.
    let mut mac = <HmacSha256 as Mac>::new_from_slice(secret)
        .expect("HMAC accepts any key length");
    for chunk in chunks {
        mac.update(chunk);
    }
    mac.finalize().into_bytes().into()
}

/// The TLS 1.2 PRF (RFC 5246 §5) with HMAC-SHA256:
/// `P_hash(secret, label || seed)` truncated to `length` bytes.
pub(crate) fn prf(
    secret: &[u8],
    label: &[u8],
    seed: &[u8],
    length: usize,
) -> Vec<u8> {
    let label_seed = [label, seed].concat();
    let mut a = hmac_sha256(secret, &[&label_seed]);
    let mut out = Vec::with_capacity(length + 32);
    while out.len() < length {
        out.extend_from_slice(&hmac_sha256(secret, &[&a, &label_seed]));
        a = hmac_sha256(secret, &[&a]);
    }
    out.truncate(length);
    out
}

/// SHA-256 over the running handshake transcript.
pub(crate) fn transcript_hash(messages: &[u8]) -> [u8; 32] {
    Sha256::digest(messages).into()
}

fn explicit_nonce(epoch: u16, sequence: u64) -> [u8; EXPLICIT_NONCE_LEN] {
    let mut out = sequence.to_be_bytes();
    out[..2].copy_from_slice(&epoch.to_be_bytes());
    out
}

fn nonce(iv: &[u8; IV_LEN], explicit: &[u8; EXPLICIT_NONCE_LEN]) -> [u8; 12] {
    let mut out = [0u8; 12];
    out[..IV_LEN].copy_from_slice(iv);
    out[IV_LEN..].copy_from_slice(explicit);
    out
}

/// RFC 5246 §6.2.3.3: `seq_num || type || version || length`, with the
/// DTLS sequence number being `epoch || sequence`.
fn additional_data(
    explicit: &[u8; EXPLICIT_NONCE_LEN],
    content_type: u8,
    length: u16,
) -> [u8; 13] {
    let mut out = [0u8; 13];
    out[..8].copy_from_slice(explicit);
    out[8] = content_type;
    out[9..11].copy_from_slice(&DTLS_VERSION.to_be_bytes());
    out[11..13].copy_from_slice(&length.to_be_bytes());
    out
}

/// Protects one record fragment; the wire form is
/// `epoch || sequence || ciphertext || tag`.
pub(crate) fn seal(
    key: &[u8; KEY_LEN],
    iv: &[u8; IV_LEN],
    epoch: u16,
    sequence: u64,
    content_type: u8,
    plain: &[u8],
) -> Result<Vec<u8>> {
    let explicit = explicit_nonce(epoch, sequence);
    let aad = additional_data(&explicit, content_type, plain.len() as u16);
    let cipher = SuiteCcm::new(GenericArray::from_slice(key));
    let sealed = cipher
        .encrypt(
            GenericArray::from_slice(&nonce(iv, &explicit)),
            Payload {
                msg: plain,
                aad: &aad,
            },
        )
        .map_err(|_| Error::Decrypt)?;

    let mut out = Vec::with_capacity(EXPLICIT_NONCE_LEN + sealed.len());
    out.extend_from_slice(&explicit);
    out.extend_from_slice(&sealed);
    Ok(out)
}

/// Verifies and strips record protection. `Error::Decrypt` on a record
/// shorter than its tag or on any authentication mismatch.
pub(crate) fn open(
    key: &[u8; KEY_LEN],
    iv: &[u8; IV_LEN],
    content_type: u8,
    wire: &[u8],
) -> Result<Vec<u8>> {
    if wire.len() < EXPLICIT_NONCE_LEN + MAC_LEN {
        return Err(Error::Decrypt);
    }
    let mut explicit = [0u8; EXPLICIT_NONCE_LEN];
    explicit.copy_from_slice(&wire[..EXPLICIT_NONCE_LEN]);
    let body = &wire[EXPLICIT_NONCE_LEN..];
    let length = (body.len() - MAC_LEN) as u16;
    let aad = additional_data(&explicit, content_type, length);

    let cipher = SuiteCcm::new(GenericArray::from_slice(key));
    cipher
        .decrypt(
            GenericArray::from_slice(&nonce(iv, &explicit)),
            Payload {
                msg: body,
                aad: &aad,
            },
        )
        .map_err(|_| Error::Decrypt)
}
