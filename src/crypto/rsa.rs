//! RSA-2048 operations for the MEGA login handshake.
//!
//! The private key arrives AES-ECB-encrypted under the master key as four
//! MPIs (p, q, d, u); the session challenge is decrypted with raw modular
//! exponentiation via the CRT.

use num_bigint::BigUint;
use num_traits::One;

use crate::base64::{base64url_decode, base64url_encode};
use crate::crypto::aes::aes128_ecb_decrypt;
use crate::error::{MegaError, Result};

/// MEGA RSA private key material.
#[derive(Debug, Clone)]
pub struct RsaPrivateKey {
    /// Prime factor p
    pub p: BigUint,
    /// Prime factor q
    pub q: BigUint,
    /// Private exponent d
    pub d: BigUint,
    /// CRT coefficient p^-1 mod q
    pub u: BigUint,
}

impl RsaPrivateKey {
    /// Decrypt the `privk` blob from a login response and parse it,
    /// returning the key alongside the decrypted MPI material (kept for
    /// session snapshots).
    pub fn from_encrypted(privk_b64: &str, master_key: &[u8; 16]) -> Result<(Self, Vec<u8>)> {
        let encrypted = base64url_decode(privk_b64)?;
        if encrypted.is_empty() || encrypted.len() % 16 != 0 {
            return Err(MegaError::Crypto(
                "private key blob is not block-aligned".to_string(),
            ));
        }
        let decrypted = aes128_ecb_decrypt(&encrypted, master_key);
        let key = Self::from_decrypted(&decrypted)?;
        Ok((key, decrypted))
    }

    /// Parse already-decrypted MPI material: p, q, d, u in sequence.
    pub fn from_decrypted(material: &[u8]) -> Result<Self> {
        let mut pos = 0;
        let p = read_mpi(material, &mut pos)?;
        let q = read_mpi(material, &mut pos)?;
        let d = read_mpi(material, &mut pos)?;
        let u = read_mpi(material, &mut pos)?;
        Ok(Self { p, q, d, u })
    }

    /// Raw RSA decryption using the CRT.
    pub fn decrypt(&self, ciphertext: &BigUint) -> BigUint {
        // xp = m^(d mod (p-1)) mod p, xq = m^(d mod (q-1)) mod q
        let p1 = &self.p - BigUint::one();
        let xp = (ciphertext % &self.p).modpow(&(&self.d % &p1), &self.p);

        let q1 = &self.q - BigUint::one();
        let xq = (ciphertext % &self.q).modpow(&(&self.d % &q1), &self.q);

        let t = if xq >= xp {
            ((&xq - &xp) * &self.u) % &self.q
        } else {
            let tmp = ((&xp - &xq) * &self.u) % &self.q;
            if tmp.bits() == 0 {
                tmp
            } else {
                &self.q - tmp
            }
        };

        &t * &self.p + &xp
    }

    /// Decrypt the `csid` login challenge and derive the session id: the
    /// first 43 base64url characters of the plaintext.
    pub fn decrypt_session_id(&self, csid_b64: &str) -> Result<String> {
        let data = base64url_decode(csid_b64)?;

        let mut pos = 0;
        let ciphertext = read_mpi(&data, &mut pos)?;

        let plaintext = self.decrypt(&ciphertext).to_bytes_be();
        if plaintext.len() < 43 {
            return Err(MegaError::Crypto("session challenge too short".to_string()));
        }

        Ok(base64url_encode(&plaintext[..43]))
    }
}

/// Read a multi-precision integer: 2-byte big-endian bit length, then the
/// value bytes.
fn read_mpi(data: &[u8], pos: &mut usize) -> Result<BigUint> {
    if *pos + 2 > data.len() {
        return Err(MegaError::Crypto("MPI header truncated".to_string()));
    }

    let bit_len = u16::from_be_bytes([data[*pos], data[*pos + 1]]) as usize;
    let byte_len = (bit_len + 7) / 8;
    *pos += 2;

    if *pos + byte_len > data.len() {
        return Err(MegaError::Crypto("MPI data truncated".to_string()));
    }

    let bytes = &data[*pos..*pos + byte_len];
    *pos += byte_len;

    Ok(BigUint::from_bytes_be(bytes))
}
