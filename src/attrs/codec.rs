//! Encrypted attribute blob codec.
//!
//! Attributes travel as a minified JSON object prefixed with the literal
//! `MEGA`, zero-padded to a 16-byte boundary, AES-CBC encrypted under the
//! node's AES key with an all-zero IV, and base64url encoded.
//!
//! Recognized keys use MEGA's minimized names:
//! - `n`: name (mandatory)
//! - `t`: modification time, Unix seconds
//! - `lbl`: label color 0-7
//! - `fav`: favorite flag 0/1
//! - `c`: content fingerprint
//! - `e`: nested custom map with 1-2 character keys
//!
//! Unknown keys are preserved verbatim so a re-encryption (rename, folder
//! import) never drops fields this client does not understand.

use serde_json::{Map, Value};

use crate::base64::{base64url_decode, base64url_encode};
use crate::crypto::aes::{aes128_cbc_decrypt, aes128_cbc_encrypt};
use crate::error::{MegaError, Result};

const MARKER: &[u8; 4] = b"MEGA";

/// Decrypted node attributes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeAttributes {
    /// Node name (`n`).
    pub name: String,
    /// Modification time in Unix seconds (`t`).
    pub mtime: Option<u64>,
    /// Label color 0-7 (`lbl`).
    pub label: Option<u8>,
    /// Favorite flag (`fav`).
    pub favorite: bool,
    /// Content fingerprint (`c`).
    pub fingerprint: Option<String>,
    /// Custom sub-map (`e`).
    pub custom: Option<Map<String, Value>>,
    /// Unrecognized fields, preserved on re-encryption.
    pub extra: Map<String, Value>,
}

impl NodeAttributes {
    /// Attributes carrying only a name.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Serialize to the JSON object MEGA expects.
    pub fn to_value(&self) -> Value {
        let mut map = Map::new();
        map.insert("n".to_string(), Value::String(self.name.clone()));

        if let Some(t) = self.mtime {
            map.insert("t".to_string(), Value::from(t));
        }
        if let Some(lbl) = self.label.filter(|l| *l > 0) {
            map.insert("lbl".to_string(), Value::from(lbl));
        }
        if self.favorite {
            map.insert("fav".to_string(), Value::from(1));
        }
        if let Some(c) = &self.fingerprint {
            map.insert("c".to_string(), Value::String(c.clone()));
        }
        if let Some(e) = self.custom.as_ref().filter(|e| !e.is_empty()) {
            map.insert("e".to_string(), Value::Object(e.clone()));
        }
        for (k, v) in &self.extra {
            map.entry(k.clone()).or_insert_with(|| v.clone());
        }

        Value::Object(map)
    }

    /// Build from a decrypted JSON object. The `n` field is mandatory.
    pub fn from_value(value: &Value) -> Result<Self> {
        let obj = value
            .as_object()
            .ok_or_else(|| MegaError::Integrity("attribute blob is not an object".to_string()))?;

        let name = obj
            .get("n")
            .and_then(|v| v.as_str())
            .ok_or_else(|| MegaError::Integrity("attribute blob has no name".to_string()))?
            .to_string();

        let mut extra = Map::new();
        for (k, v) in obj {
            if !matches!(k.as_str(), "n" | "t" | "lbl" | "fav" | "c" | "e") {
                extra.insert(k.clone(), v.clone());
            }
        }

        Ok(Self {
            name,
            mtime: obj.get("t").and_then(|v| v.as_u64()),
            label: obj.get("lbl").and_then(|v| v.as_u64()).map(|l| l.min(7) as u8),
            favorite: obj.get("fav").and_then(|v| v.as_u64()).unwrap_or(0) != 0,
            fingerprint: obj.get("c").and_then(|v| v.as_str()).map(|s| s.to_string()),
            custom: obj.get("e").and_then(|v| v.as_object()).cloned(),
            extra,
        })
    }

    /// Remove a top-level attribute by its wire key (used by the importer's
    /// strip list). Only optional fields can be removed.
    pub fn strip(&mut self, key: &str) {
        match key {
            "lbl" => self.label = None,
            "fav" => self.favorite = false,
            "c" => self.fingerprint = None,
            "e" => self.custom = None,
            _ => {
                self.extra.remove(key);
            }
        }
    }

    /// Encrypt to the base64url blob sent in the `a` field.
    pub fn encrypt(&self, key: &[u8; 16]) -> Result<String> {
        Ok(encrypt_attr_value(&self.to_value(), key))
    }

    /// Decrypt a base64url `a` blob.
    pub fn decrypt(blob: &str, key: &[u8; 16]) -> Result<Self> {
        Self::from_value(&decrypt_attr_value(blob, key)?)
    }
}

/// Encrypt an arbitrary attribute JSON value.
pub fn encrypt_attr_value(value: &Value, key: &[u8; 16]) -> String {
    let json = serde_json::to_string(value).expect("attribute map serializes");

    let mut data = Vec::with_capacity(4 + json.len() + 16);
    data.extend_from_slice(MARKER);
    data.extend_from_slice(json.as_bytes());

    // Zero-pad to the block boundary; an aligned blob still gains a full
    // block so the terminator is unambiguous.
    let mut pad = 16 - data.len() % 16;
    if pad == 0 {
        pad = 16;
    }
    data.extend(std::iter::repeat(0u8).take(pad));

    base64url_encode(&aes128_cbc_encrypt(&data, key))
}

/// Decrypt an `a` blob to its JSON value, verifying the `MEGA` marker.
pub fn decrypt_attr_value(blob: &str, key: &[u8; 16]) -> Result<Value> {
    let encrypted = base64url_decode(blob)
        .map_err(|_| MegaError::Integrity("attribute blob is not valid base64".to_string()))?;
    if encrypted.is_empty() || encrypted.len() % 16 != 0 {
        return Err(MegaError::Integrity(
            "attribute blob is not block-aligned".to_string(),
        ));
    }

    let decrypted = aes128_cbc_decrypt(&encrypted, key);
    if !decrypted.starts_with(MARKER) {
        return Err(MegaError::Integrity(
            "attribute blob lacks MEGA marker".to_string(),
        ));
    }

    let json = &decrypted[4..];
    let end = json.iter().position(|b| *b == 0).unwrap_or(json.len());
    let text = std::str::from_utf8(&json[..end])
        .map_err(|_| MegaError::Integrity("attribute JSON is not UTF-8".to_string()))?;

    serde_json::from_str(text)
        .map_err(|_| MegaError::Integrity("attribute JSON is malformed".to_string()))
}
