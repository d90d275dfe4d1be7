//! Login handshake.
//!
//! Two-step flow: `us0` reports the account's login variant (and salt for
//! v2), then `us` exchanges the derived evidence for the encrypted master
//! key, the RSA private key and the session challenge. v1 accounts derive
//! their key with MEGA's AES-round KDF; v2 accounts use PBKDF2-HMAC-SHA512
//! over the server salt. The session id is the first 43 base64url
//! characters of the RSA-decrypted challenge.

use serde_json::json;

use crate::api::ApiClient;
use crate::base64::{base64url_decode, base64url_encode};
use crate::crypto::keys::{decrypt_key, derive_key_v2, make_password_key, make_username_hash};
use crate::crypto::rsa::RsaPrivateKey;
use crate::error::{MegaError, Result};

/// Everything a successful login yields.
pub(crate) struct LoginOutcome {
    pub session_id: String,
    pub master_key: [u8; 16],
    pub rsa_key: RsaPrivateKey,
    /// Decrypted RSA key material, retained for session snapshots.
    pub private_key_material: Vec<u8>,
    pub user_id: String,
    pub user_name: Option<String>,
    pub email: String,
}

/// Run the full login flow. Login-family commands bypass the batch queue
/// so nothing else interleaves before the session id is installed.
pub(crate) async fn login(api: &ApiClient, email: &str, password: &str) -> Result<LoginOutcome> {
    let email = email.to_lowercase();

    let prelogin = api
        .request_immediate(json!({"a": "us0", "user": email}))
        .await?;
    let variant = prelogin.get("v").and_then(|v| v.as_i64()).unwrap_or(1);

    let (password_key, user_hash) = if variant == 2 {
        let salt_b64 = prelogin
            .get("s")
            .and_then(|v| v.as_str())
            .ok_or_else(|| MegaError::Protocol("v2 prelogin without salt".to_string()))?;
        let salt = base64url_decode(salt_b64)?;

        let derived = derive_key_v2(password, &salt)?;
        let password_key: [u8; 16] = derived[..16].try_into().unwrap();
        (password_key, base64url_encode(&derived[16..32]))
    } else {
        let password_key = make_password_key(password);
        let hash = make_username_hash(&email, &password_key);
        (password_key, base64url_encode(&hash))
    };

    let login = api
        .request_immediate(json!({"a": "us", "user": email, "uh": user_hash}))
        .await?;

    let k_b64 = login
        .get("k")
        .and_then(|v| v.as_str())
        .ok_or_else(|| MegaError::Auth("login response carries no master key".to_string()))?;
    let master_key = decrypt_key(k_b64, &password_key)?;

    let privk_b64 = login
        .get("privk")
        .and_then(|v| v.as_str())
        .ok_or_else(|| MegaError::Auth("login response carries no private key".to_string()))?;
    let (rsa_key, private_key_material) = RsaPrivateKey::from_encrypted(privk_b64, &master_key)?;

    let csid_b64 = login
        .get("csid")
        .and_then(|v| v.as_str())
        .ok_or_else(|| MegaError::Auth("login response carries no session challenge".to_string()))?;
    let session_id = rsa_key.decrypt_session_id(csid_b64)?;

    api.set_session_id(Some(session_id.clone())).await;

    let (user_id, user_name, email) = fetch_identity(api, &email).await?;

    Ok(LoginOutcome {
        session_id,
        master_key,
        rsa_key,
        private_key_material,
        user_id,
        user_name,
        email,
    })
}

/// Validate an existing session id and fetch account identity for it.
pub(crate) async fn fetch_identity(
    api: &ApiClient,
    fallback_email: &str,
) -> Result<(String, Option<String>, String)> {
    let user_info = api.request_immediate(json!({"a": "ug"})).await?;

    let user_id = user_info
        .get("u")
        .and_then(|v| v.as_str())
        .ok_or_else(|| MegaError::Auth("`ug` response carries no user id".to_string()))?
        .to_string();
    let user_name = user_info
        .get("name")
        .and_then(|v| v.as_str())
        .map(String::from);
    let email = user_info
        .get("email")
        .and_then(|v| v.as_str())
        .unwrap_or(fallback_email)
        .to_string();

    Ok((user_id, user_name, email))
}
