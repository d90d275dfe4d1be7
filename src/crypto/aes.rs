//! AES-128 operations.
//!
//! MEGA uses AES-128 in several modes:
//! - ECB for key wrapping and the share auth-hash
//! - CBC with a zero IV for attribute blobs and thumbnails
//! - CTR for file content (counter seeded from the byte offset)
//! - CBC-MAC with a `nonce||nonce` IV for chunk integrity

use aes::cipher::{generic_array::GenericArray, BlockDecrypt, BlockEncrypt, KeyInit};
use aes::Aes128;
use cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit, StreamCipher, StreamCipherSeek};
use subtle::ConstantTimeEq;

type Ctr128 = ctr::Ctr128BE<Aes128>;
type CbcEnc = cbc::Encryptor<Aes128>;
type CbcDec = cbc::Decryptor<Aes128>;

/// AES-128-ECB encrypt a single 16-byte block.
pub fn aes128_ecb_encrypt_block(data: &[u8; 16], key: &[u8; 16]) -> [u8; 16] {
    let cipher = Aes128::new(GenericArray::from_slice(key));
    let mut block = GenericArray::clone_from_slice(data);
    cipher.encrypt_block(&mut block);
    block.into()
}

/// AES-128-ECB decrypt a single 16-byte block.
pub fn aes128_ecb_decrypt_block(data: &[u8; 16], key: &[u8; 16]) -> [u8; 16] {
    let cipher = Aes128::new(GenericArray::from_slice(key));
    let mut block = GenericArray::clone_from_slice(data);
    cipher.decrypt_block(&mut block);
    block.into()
}

/// AES-128-ECB encrypt an aligned run of blocks.
///
/// # Panics
/// Panics if data length is not a multiple of 16.
pub fn aes128_ecb_encrypt(data: &[u8], key: &[u8; 16]) -> Vec<u8> {
    assert!(
        data.len() % 16 == 0,
        "Data length must be multiple of 16, got {}",
        data.len()
    );

    let cipher = Aes128::new(GenericArray::from_slice(key));
    let mut result = data.to_vec();
    for chunk in result.chunks_mut(16) {
        cipher.encrypt_block(GenericArray::from_mut_slice(chunk));
    }
    result
}

/// AES-128-ECB decrypt an aligned run of blocks.
///
/// # Panics
/// Panics if data length is not a multiple of 16.
pub fn aes128_ecb_decrypt(data: &[u8], key: &[u8; 16]) -> Vec<u8> {
    assert!(
        data.len() % 16 == 0,
        "Data length must be multiple of 16, got {}",
        data.len()
    );

    let cipher = Aes128::new(GenericArray::from_slice(key));
    let mut result = data.to_vec();
    for chunk in result.chunks_mut(16) {
        cipher.decrypt_block(GenericArray::from_mut_slice(chunk));
    }
    result
}

/// AES-128-CBC encrypt with an all-zero IV, as used for attribute blobs.
///
/// # Panics
/// Panics if data length is not a multiple of 16 (callers pad first).
pub fn aes128_cbc_encrypt(data: &[u8], key: &[u8; 16]) -> Vec<u8> {
    assert!(data.len() % 16 == 0, "CBC input must be 16-byte aligned");

    let mut cbc = CbcEnc::new(key.into(), &GenericArray::default());
    let mut result = data.to_vec();
    for chunk in result.chunks_mut(16) {
        cbc.encrypt_block_mut(chunk.into());
    }
    result
}

/// AES-128-CBC decrypt with an all-zero IV.
///
/// # Panics
/// Panics if data length is not a multiple of 16.
pub fn aes128_cbc_decrypt(data: &[u8], key: &[u8; 16]) -> Vec<u8> {
    assert!(data.len() % 16 == 0, "CBC input must be 16-byte aligned");

    let mut cbc = CbcDec::new(key.into(), &GenericArray::default());
    let mut result = data.to_vec();
    for chunk in result.chunks_mut(16) {
        cbc.decrypt_block_mut(chunk.into());
    }
    result
}

/// AES-128-CTR encrypt or decrypt `data` as it appears at byte `offset`
/// within the file stream.
///
/// The counter block is `nonce || counter` with a big-endian 64-bit counter
/// starting at zero for the start of the file; seeking by `offset` positions
/// the keystream so chunks can be processed independently and out of order.
/// CTR is symmetric, so the same call serves both directions.
pub fn aes128_ctr_xcrypt(data: &[u8], key: &[u8; 16], nonce: &[u8; 8], offset: u64) -> Vec<u8> {
    let mut iv = [0u8; 16];
    iv[..8].copy_from_slice(nonce);

    let mut cipher = Ctr128::new(key.into(), &iv.into());
    cipher.seek(offset);

    let mut result = data.to_vec();
    cipher.apply_keystream(&mut result);
    result
}

/// CBC-MAC of one chunk's plaintext under the file key.
///
/// The IV is `nonce || nonce`; a trailing partial block is zero-padded
/// before the final fold.
pub fn chunk_mac(data: &[u8], key: &[u8; 16], nonce: &[u8; 8]) -> [u8; 16] {
    let cipher = Aes128::new(GenericArray::from_slice(key));

    let mut mac = [0u8; 16];
    mac[..8].copy_from_slice(nonce);
    mac[8..].copy_from_slice(nonce);

    let mut chunks = data.chunks_exact(16);
    for block in &mut chunks {
        for (m, b) in mac.iter_mut().zip(block) {
            *m ^= b;
        }
        let ga = GenericArray::from_mut_slice(&mut mac);
        cipher.encrypt_block(ga);
    }

    let rest = chunks.remainder();
    if !rest.is_empty() {
        for (m, b) in mac.iter_mut().zip(rest) {
            *m ^= b;
        }
        let ga = GenericArray::from_mut_slice(&mut mac);
        cipher.encrypt_block(ga);
    }

    mac
}

/// Iterate AES-ECB over the per-chunk MACs in index order, producing the
/// 16-byte condensed MAC: `state = E(state XOR chunk_mac_i)` from a zero
/// initial state.
pub fn condense_macs(chunk_macs: &[[u8; 16]], key: &[u8; 16]) -> [u8; 16] {
    let cipher = Aes128::new(GenericArray::from_slice(key));

    let mut state = [0u8; 16];
    for mac in chunk_macs {
        for (s, m) in state.iter_mut().zip(mac) {
            *s ^= m;
        }
        let ga = GenericArray::from_mut_slice(&mut state);
        cipher.encrypt_block(ga);
    }
    state
}

/// Fold a condensed 16-byte MAC to the 8-byte meta-MAC stored in the file
/// key: `m[0..4]^m[4..8] || m[8..12]^m[12..16]`.
pub fn fold_meta_mac(condensed: &[u8; 16]) -> [u8; 8] {
    let mut out = [0u8; 8];
    for i in 0..4 {
        out[i] = condensed[i] ^ condensed[i + 4];
        out[i + 4] = condensed[i + 8] ^ condensed[i + 12];
    }
    out
}

/// Meta-MAC over an ordered chunk MAC list.
pub fn meta_mac(chunk_macs: &[[u8; 16]], key: &[u8; 16]) -> [u8; 8] {
    fold_meta_mac(&condense_macs(chunk_macs, key))
}

/// Constant-time byte comparison.
///
/// Unequal lengths compare unequal without leaking position information.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.ct_eq(b).into()
}
