//! Hashcash proof-of-work solver.
//!
//! During login MEGA may answer with an `X-Hashcash` challenge of the form
//! `1:<easiness>:<_>:<token>`. The solution is a 4-byte prefix such that
//! SHA-256 over `prefix || token_bytes * 262144` starts with a big-endian
//! u32 at or below the easiness-derived threshold. The prefix is counted
//! up as a little-endian integer until the digest qualifies.

use sha2::{Digest, Sha256};

use crate::base64::{base64url_decode, base64url_encode};
use crate::error::{MegaError, Result};

const TOKEN_REPETITIONS: usize = 262_144;

/// A parsed hashcash challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashcashChallenge {
    pub version: u32,
    pub easiness: u8,
    pub token: String,
}

impl HashcashChallenge {
    /// Parse the `X-Hashcash` header value.
    pub fn parse(header: &str) -> Result<Self> {
        let parts: Vec<&str> = header.split(':').collect();
        if parts.len() != 4 {
            return Err(MegaError::Protocol(format!(
                "malformed hashcash challenge: {header}"
            )));
        }

        let version: u32 = parts[0]
            .parse()
            .map_err(|_| MegaError::Protocol("hashcash version is not numeric".to_string()))?;
        if version != 1 {
            return Err(MegaError::Protocol(format!(
                "unsupported hashcash version {version}"
            )));
        }

        let easiness: u8 = parts[1]
            .parse()
            .map_err(|_| MegaError::Protocol("hashcash easiness is not numeric".to_string()))?;

        Ok(Self {
            version,
            easiness,
            token: parts[3].to_string(),
        })
    }

    /// Threshold the leading digest word must not exceed:
    /// `(((easiness & 63) << 1 | 1) << ((easiness >> 6) * 7 + 3)`.
    pub fn threshold(&self) -> u32 {
        let base = ((self.easiness as u32 & 63) << 1) | 1;
        let shifts = (self.easiness as u32 >> 6) * 7 + 3;
        base << shifts
    }

    /// Brute-force the prefix and return the `1:token:prefix` solution.
    pub fn solve(&self) -> Result<String> {
        let token_bytes = base64url_decode(&self.token)
            .map_err(|_| MegaError::Protocol("hashcash token is not valid base64".to_string()))?;
        if token_bytes.len() != 48 {
            return Err(MegaError::Protocol(format!(
                "hashcash token must decode to 48 bytes, got {}",
                token_bytes.len()
            )));
        }

        let threshold = self.threshold();

        // One buffer, prefix patched in place between attempts.
        let mut buffer = Vec::with_capacity(4 + TOKEN_REPETITIONS * token_bytes.len());
        buffer.extend_from_slice(&[0u8; 4]);
        for _ in 0..TOKEN_REPETITIONS {
            buffer.extend_from_slice(&token_bytes);
        }

        let mut prefix: u32 = 0;
        loop {
            buffer[..4].copy_from_slice(&prefix.to_le_bytes());

            let digest = Sha256::digest(&buffer);
            let leading = u32::from_be_bytes(digest[..4].try_into().unwrap());
            if leading <= threshold {
                return Ok(format!(
                    "1:{}:{}",
                    self.token,
                    base64url_encode(&prefix.to_le_bytes())
                ));
            }

            prefix = prefix.checked_add(1).ok_or_else(|| {
                MegaError::Protocol("hashcash prefix space exhausted".to_string())
            })?;
        }
    }
}
