//! Random key material generation.

use rand::RngCore;

/// Generate a random 16-byte AES key.
pub fn make_random_key() -> [u8; 16] {
    let mut key = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut key);
    key
}

/// Generate the 24 bytes of upload key material: a 16-byte AES key followed
/// by the 8-byte CTR nonce.
pub fn make_upload_key_material() -> ([u8; 16], [u8; 8]) {
    let mut rng = rand::thread_rng();
    let mut key = [0u8; 16];
    let mut nonce = [0u8; 8];
    rng.fill_bytes(&mut key);
    rng.fill_bytes(&mut nonce);
    (key, nonce)
}
