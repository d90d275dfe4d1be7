//! Share-key intake and node-key resolution.
//!
//! An account-tree response delivers share keys in two encodings: the
//! legacy `ok` array and the streaming `ok0` form (map or list). When a
//! response carries both, `ok0` wins and `ok` is ignored. Each entry is
//! authenticated against the master key before use: `E(master, h||h)`
//! must equal the provided `ha`, compared in constant time.
//!
//! Node `k` fields hold `id:enc_k` pairs separated by `/`. The pair keyed
//! by the account's own user id decrypts under the master key and is
//! preferred; otherwise pairs are tried in order against known share keys.

use std::collections::HashMap;

use serde_json::Value;
use tracing::{debug, warn};

use crate::base64::base64url_decode;
use crate::crypto::aes::{aes128_ecb_decrypt, aes128_ecb_encrypt, constant_time_eq};
use crate::crypto::rsa::RsaPrivateKey;
use crate::fs::node::NodeKey;

/// Share keys by share-root handle.
#[derive(Debug, Clone, Default)]
pub struct ShareKeys {
    keys: HashMap<String, [u8; 16]>,
}

impl ShareKeys {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, handle: &str) -> Option<&[u8; 16]> {
        self.keys.get(handle)
    }

    pub fn insert(&mut self, handle: impl Into<String>, key: [u8; 16]) {
        self.keys.insert(handle.into(), key);
    }

    pub fn contains(&self, handle: &str) -> bool {
        self.keys.contains_key(handle)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Handles of all known share roots.
    pub fn handles(&self) -> impl Iterator<Item = &str> {
        self.keys.keys().map(|s| s.as_str())
    }

    /// Ingest the share-key section of a fetch response. `ok0` takes
    /// priority; the legacy `ok` array is consulted only in its absence.
    pub fn ingest_fetch_response(
        &mut self,
        response: &Value,
        master_key: &[u8; 16],
        rsa_key: Option<&RsaPrivateKey>,
    ) {
        if let Some(ok0) = response.get("ok0") {
            self.ingest_entries(ok0, master_key, rsa_key);
        } else if let Some(ok) = response.get("ok") {
            self.ingest_entries(ok, master_key, rsa_key);
        }
    }

    /// Ingest a share-key collection: a list of entries or a map keyed by
    /// handle (the streaming `ok0` shape).
    pub fn ingest_entries(
        &mut self,
        entries: &Value,
        master_key: &[u8; 16],
        rsa_key: Option<&RsaPrivateKey>,
    ) {
        match entries {
            Value::Array(list) => {
                for entry in list {
                    self.ingest_entry(entry, master_key, rsa_key);
                }
            }
            Value::Object(map) => {
                for entry in map.values() {
                    self.ingest_entry(entry, master_key, rsa_key);
                }
            }
            _ => {}
        }
    }

    fn ingest_entry(
        &mut self,
        entry: &Value,
        master_key: &[u8; 16],
        rsa_key: Option<&RsaPrivateKey>,
    ) {
        let Some(handle) = entry.get("h").and_then(|v| v.as_str()) else {
            return;
        };
        let Some(k) = entry.get("k").and_then(|v| v.as_str()) else {
            return;
        };
        let ha = entry.get("ha").and_then(|v| v.as_str());

        if is_placeholder(k) || ha.is_some_and(is_placeholder) {
            debug!(handle, "skipping placeholder share-key entry");
            return;
        }

        // Share keys longer than 22 base64 chars are RSA-encrypted for a
        // sharee; those carry no master-key auth hash.
        if k.len() > 22 {
            let Some(rsa) = rsa_key else {
                return;
            };
            let Ok(encrypted) = base64url_decode(k) else {
                return;
            };
            let plain = rsa
                .decrypt(&num_bigint::BigUint::from_bytes_be(&encrypted))
                .to_bytes_be();
            if plain.len() < 16 {
                warn!(handle, "RSA share key too short, discarding");
                return;
            }
            let mut key = [0u8; 16];
            key.copy_from_slice(&plain[..16]);
            self.keys.entry(handle.to_string()).or_insert(key);
            return;
        }

        // Own-share entry: authenticate, then unwrap with the master key.
        let Some(ha) = ha else {
            return;
        };
        if !verify_share_auth(handle, ha, master_key) {
            warn!(handle, "share auth-hash mismatch, discarding entry");
            return;
        }

        let Ok(encrypted) = base64url_decode(k) else {
            return;
        };
        if encrypted.len() != 16 {
            return;
        }
        let decrypted = aes128_ecb_decrypt(&encrypted, master_key);
        let mut key = [0u8; 16];
        key.copy_from_slice(&decrypted);
        self.keys.entry(handle.to_string()).or_insert(key);
    }
}

/// Authenticate a share entry: `E(master, h||h)` must equal `ha`.
pub fn verify_share_auth(handle: &str, ha_b64: &str, master_key: &[u8; 16]) -> bool {
    let handle_bytes = handle.as_bytes();
    if handle_bytes.len() != 8 {
        return false;
    }

    let Ok(expected) = base64url_decode(ha_b64) else {
        return false;
    };

    let mut block = [0u8; 16];
    block[..8].copy_from_slice(handle_bytes);
    block[8..].copy_from_slice(handle_bytes);
    let auth = aes128_ecb_encrypt(&block, master_key);

    constant_time_eq(&auth, &expected)
}

/// Placeholder entries are all-`A` strings (decoded all-zero data).
fn is_placeholder(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b == b'A')
}

/// Resolve a node's `k` field against the master key and known share keys.
///
/// Pairs look like `id1:enc_k1[/id2:enc_k2...]`. The own-user pair wins
/// whenever it is present and decrypts; otherwise the first pair whose id
/// names a known share key is used. Returns `None` when nothing matches,
/// leaving the node undecryptable.
pub fn resolve_node_key(
    raw_k: &str,
    user_handle: &str,
    master_key: &[u8; 16],
    share_keys: &ShareKeys,
) -> Option<NodeKey> {
    let pairs: Vec<(&str, &str)> = raw_k
        .split('/')
        .filter_map(|pair| pair.split_once(':'))
        .collect();

    // Own-user pair first, regardless of position.
    for (id, enc_k) in &pairs {
        if *id == user_handle {
            if let Some(key) = unwrap_pair(enc_k, master_key) {
                return Some(key);
            }
        }
    }

    for (id, enc_k) in &pairs {
        if *id == user_handle {
            continue;
        }
        if let Some(share_key) = share_keys.get(id) {
            if let Some(key) = unwrap_pair(enc_k, share_key) {
                return Some(key);
            }
        }
    }

    None
}

fn unwrap_pair(enc_k: &str, wrapping_key: &[u8; 16]) -> Option<NodeKey> {
    let encrypted = base64url_decode(enc_k).ok()?;
    if encrypted.len() != 16 && encrypted.len() != 32 {
        return None;
    }
    NodeKey::from_bytes(&aes128_ecb_decrypt(&encrypted, wrapping_key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::base64::base64url_encode;
    use crate::crypto::aes::aes128_ecb_encrypt;
    use serde_json::json;

    fn master() -> [u8; 16] {
        core::array::from_fn(|i| i as u8)
    }

    fn auth_hash(handle: &str, master_key: &[u8; 16]) -> String {
        let mut block = [0u8; 16];
        block[..8].copy_from_slice(handle.as_bytes());
        block[8..].copy_from_slice(handle.as_bytes());
        base64url_encode(&aes128_ecb_encrypt(&block, master_key))
    }

    fn wrapped(key: &[u8], wrapping: &[u8; 16]) -> String {
        base64url_encode(&aes128_ecb_encrypt(key, wrapping))
    }

    #[test]
    fn share_auth_known_vector() {
        // E(00..0f, "H1AAAAAA"x2), independently computed.
        assert!(verify_share_auth(
            "H1AAAAAA",
            "sgrs2uy_OkxRwPB_yJJn2Q",
            &master()
        ));
        assert!(!verify_share_auth(
            "H2AAAAAA",
            "sgrs2uy_OkxRwPB_yJJn2Q",
            &master()
        ));
    }

    #[test]
    fn ingests_authenticated_entry() {
        let mut keys = ShareKeys::new();
        let share_key = [0x22u8; 16];

        keys.ingest_entries(
            &json!([{
                "h": "H1AAAAAA",
                "ha": auth_hash("H1AAAAAA", &master()),
                "k": wrapped(&share_key, &master()),
            }]),
            &master(),
            None,
        );

        assert_eq!(keys.get("H1AAAAAA"), Some(&share_key));
    }

    #[test]
    fn rejects_bad_auth_hash() {
        let mut keys = ShareKeys::new();
        keys.ingest_entries(
            &json!([{
                "h": "H1AAAAAA",
                "ha": auth_hash("XXAAAAAA", &master()),
                "k": wrapped(&[1u8; 16], &master()),
            }]),
            &master(),
            None,
        );
        assert!(keys.is_empty());
    }

    #[test]
    fn skips_placeholder_entries() {
        let mut keys = ShareKeys::new();
        keys.ingest_entries(
            &json!([
                {"h": "H1AAAAAA", "ha": "A".repeat(22), "k": wrapped(&[1u8; 16], &master())},
                {"h": "H2AAAAAA", "ha": auth_hash("H2AAAAAA", &master()), "k": "A".repeat(22)},
            ]),
            &master(),
            None,
        );
        assert!(keys.is_empty());
    }

    #[test]
    fn ok0_wins_over_legacy_ok() {
        let good = [0x33u8; 16];
        let bad = [0x44u8; 16];
        let response = json!({
            "ok": [{
                "h": "H1AAAAAA",
                "ha": auth_hash("H1AAAAAA", &master()),
                "k": wrapped(&bad, &master()),
            }],
            "ok0": {
                "H1AAAAAA": {
                    "h": "H1AAAAAA",
                    "ha": auth_hash("H1AAAAAA", &master()),
                    "k": wrapped(&good, &master()),
                }
            }
        });

        let mut keys = ShareKeys::new();
        keys.ingest_fetch_response(&response, &master(), None);

        assert_eq!(keys.len(), 1);
        assert_eq!(keys.get("H1AAAAAA"), Some(&good));
    }

    #[test]
    fn resolver_prefers_own_user_pair() {
        let mut share_keys = ShareKeys::new();
        let share_key = [0x66u8; 16];
        share_keys.insert("SHAREROOT", share_key);

        let own_key = [0xABu8; 16];
        let foreign_key = [0xCDu8; 16];
        let raw_k = format!(
            "SHAREROOT:{}/me______:{}",
            wrapped(&foreign_key, &share_key),
            wrapped(&own_key, &master()),
        );

        // Both pairs decrypt, but the own-user pair must win even when it
        // comes second.
        let key = resolve_node_key(&raw_k, "me______", &master(), &share_keys).unwrap();
        assert_eq!(key, NodeKey::Folder(own_key));
    }

    #[test]
    fn resolver_falls_back_to_share_keys() {
        let mut share_keys = ShareKeys::new();
        let share_key = [0x66u8; 16];
        share_keys.insert("SHAREROOT", share_key);

        let node_key = [0xEFu8; 16];
        let raw_k = format!("SHAREROOT:{}", wrapped(&node_key, &share_key));

        let key = resolve_node_key(&raw_k, "me______", &master(), &share_keys).unwrap();
        assert_eq!(key, NodeKey::Folder(node_key));
    }

    #[test]
    fn resolver_handles_file_keys() {
        let full: [u8; 32] = core::array::from_fn(|i| (i * 3) as u8);
        let raw_k = format!("me______:{}", wrapped(&full, &master()));

        let key = resolve_node_key(&raw_k, "me______", &master(), &ShareKeys::new()).unwrap();
        assert_eq!(key, NodeKey::File(full));
    }

    #[test]
    fn resolver_returns_none_for_unknown_ids() {
        let raw_k = format!("UNKNOWN1:{}", wrapped(&[1u8; 16], &master()));
        assert!(resolve_node_key(&raw_k, "me______", &master(), &ShareKeys::new()).is_none());
    }
}
