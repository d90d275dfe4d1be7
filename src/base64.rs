//! MEGA-style URL-safe base64 encoding/decoding.
//!
//! MEGA uses base64 with the `-_` alphabet and no `=` padding throughout
//! its protocol (handles, keys, attribute blobs, upload tokens).

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;

/// Encode bytes to MEGA's URL-safe base64 (no padding).
///
/// # Example
/// ```
/// use megakit::base64::base64url_encode;
/// assert_eq!(base64url_encode(b"hello"), "aGVsbG8");
/// ```
pub fn base64url_encode(data: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(data)
}

/// Decode MEGA's URL-safe base64 to bytes.
///
/// Accepts unpadded input of any valid length.
///
/// # Example
/// ```
/// use megakit::base64::{base64url_encode, base64url_decode};
/// let original = b"hello world";
/// let decoded = base64url_decode(&base64url_encode(original)).unwrap();
/// assert_eq!(decoded, original);
/// ```
pub fn base64url_decode(s: &str) -> Result<Vec<u8>, base64::DecodeError> {
    URL_SAFE_NO_PAD.decode(s)
}
