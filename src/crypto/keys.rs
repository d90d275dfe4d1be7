//! Key derivation and key wrapping.
//!
//! The password KDFs here are MEGA's own constructions, not general-purpose
//! KDFs; do not reuse them elsewhere. v1 accounts use 65,536 rounds of AES
//! over the password, v2 accounts use PBKDF2-HMAC-SHA512 with the server
//! salt.

use hmac::Hmac;
use pbkdf2::pbkdf2;
use sha2::Sha512;

use crate::base64::base64url_decode;
use crate::crypto::aes::{aes128_ecb_decrypt, aes128_ecb_encrypt, aes128_ecb_encrypt_block};
use crate::error::{MegaError, Result};

/// Pack a password into the byte layout MEGA's legacy KDF expects.
///
/// Mirrors the webclient's `str_to_a32`: UTF-16 code units, single bytes for
/// BMP values <= 0xFF, big-endian pairs otherwise, zero-padded to a 4-byte
/// boundary. The code-unit count is returned for empty-password detection.
fn password_to_a32_bytes(password: &str) -> (Vec<u8>, usize) {
    let code_units: Vec<u16> = password.encode_utf16().collect();
    let len_units = code_units.len();

    let mut bytes = Vec::with_capacity(len_units * 2);
    for cu in &code_units {
        if *cu <= 0x00FF {
            bytes.push(*cu as u8);
        } else {
            bytes.extend_from_slice(&cu.to_be_bytes());
        }
    }

    while bytes.len() % 4 != 0 {
        bytes.push(0);
    }

    (bytes, len_units)
}

/// Derive the v1 password key: 65,536 iterations of AES-ECB over the
/// password chunks, starting from MEGA's fixed initialization vector.
pub fn make_password_key(password: &str) -> [u8; 16] {
    let (password_bytes, len_units) = password_to_a32_bytes(password);
    let mut pkey: [u8; 16] = [
        0x93, 0xC4, 0x67, 0xE3, 0x7D, 0xB0, 0xC7, 0xA4, 0xD1, 0xBE, 0x3F, 0x81, 0x01, 0x52, 0xCB,
        0x56,
    ];

    if len_units == 0 {
        return pkey;
    }

    for _ in 0..65536 {
        for chunk in password_bytes.chunks(16) {
            let mut key = [0u8; 16];
            key[..chunk.len()].copy_from_slice(chunk);
            pkey = aes128_ecb_encrypt_block(&pkey, &key);
        }
    }

    pkey
}

/// Derive the v1 login evidence: XOR the email into a 16-byte buffer,
/// encrypt it 16,384 times under the password key, return bytes
/// `[0..4] || [8..12]`.
pub fn make_username_hash(username: &str, key: &[u8; 16]) -> [u8; 8] {
    let mut hash = [0u8; 16];
    for (i, &byte) in username.as_bytes().iter().enumerate() {
        hash[i % 16] ^= byte;
    }

    for _ in 0..16384 {
        hash = aes128_ecb_encrypt_block(&hash, key);
    }

    let mut result = [0u8; 8];
    result[..4].copy_from_slice(&hash[..4]);
    result[4..].copy_from_slice(&hash[8..12]);
    result
}

/// Derive the v2 password key and login evidence: PBKDF2-HMAC-SHA512,
/// 100,000 rounds, 32 bytes out. The first half becomes the password key,
/// the second half the login hash.
pub fn derive_key_v2(password: &str, salt: &[u8]) -> Result<[u8; 32]> {
    let mut key = [0u8; 32];
    pbkdf2::<Hmac<Sha512>>(password.as_bytes(), salt, 100_000, &mut key)
        .map_err(|_| MegaError::Crypto("PBKDF2 derivation failed".to_string()))?;
    Ok(key)
}

/// Wrap key material with AES-128-ECB. Accepts 16 or 32 bytes (folder and
/// file keys respectively).
pub fn encrypt_key(material: &[u8], wrapping_key: &[u8; 16]) -> Vec<u8> {
    aes128_ecb_encrypt(material, wrapping_key)
}

/// Unwrap a base64url-encoded 16-byte key.
pub fn decrypt_key(b64: &str, wrapping_key: &[u8; 16]) -> Result<[u8; 16]> {
    let data = base64url_decode(b64)?;
    if data.len() != 16 {
        return Err(MegaError::Crypto(format!(
            "wrapped key must be 16 bytes, got {}",
            data.len()
        )));
    }

    let decrypted = aes128_ecb_decrypt(&data, wrapping_key);
    let mut key = [0u8; 16];
    key.copy_from_slice(&decrypted);
    Ok(key)
}

/// Split a decrypted 32-byte file key into its working parts:
/// `(aes_key, nonce, meta_mac)` where the AES key is the XOR of the halves.
pub fn split_file_key(full: &[u8; 32]) -> ([u8; 16], [u8; 8], [u8; 8]) {
    let mut aes_key = [0u8; 16];
    for i in 0..16 {
        aes_key[i] = full[i] ^ full[i + 16];
    }

    let mut nonce = [0u8; 8];
    nonce.copy_from_slice(&full[16..24]);

    let mut mac = [0u8; 8];
    mac.copy_from_slice(&full[24..32]);

    (aes_key, nonce, mac)
}

/// Assemble the on-wire 32-byte file key from its parts: the first half is
/// `aes_key XOR (nonce || meta_mac)`, the second half is `nonce || meta_mac`.
pub fn merge_file_key(aes_key: &[u8; 16], nonce: &[u8; 8], meta_mac: &[u8; 8]) -> [u8; 32] {
    let mut full = [0u8; 32];
    full[16..24].copy_from_slice(nonce);
    full[24..32].copy_from_slice(meta_mac);
    for i in 0..16 {
        full[i] = aes_key[i] ^ full[i + 16];
    }
    full
}
