//! Authenticated session facade.
//!
//! A [`Session`] owns the command pipeline, the decrypted key material and
//! the in-memory tree, and exposes the account operations. Tree mutations
//! go through the pipeline and then update the local view from the
//! server's response record; bulk changes are observed by calling
//! [`Session::fetch_nodes`] again.

use std::path::Path;
use std::sync::Arc;

use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::api::ApiClient;
use crate::attrs::codec::NodeAttributes;
use crate::attrs::media::CodecTables;
use crate::base64::base64url_encode;
use crate::config::Config;
use crate::crypto::keys::encrypt_key;
use crate::crypto::random::make_random_key;
use crate::crypto::rsa::RsaPrivateKey;
use crate::error::{MegaError, Result};
use crate::fs::keys::ShareKeys;
use crate::fs::node::Node;
use crate::fs::tree::{parse_node, Tree};
use crate::http::HttpClient;
use crate::progress::ProgressCallback;
use crate::session::auth::{self, LoginOutcome};
use crate::session::storage::{SessionSnapshot, SessionStorage};
use crate::transfer::download::{download_node, DownloadContext};
use crate::transfer::import::import_folder;
use crate::transfer::upload::{upload_file, UploadContext, UploadOptions};

/// Storage quota, in bytes.
#[derive(Debug, Clone, Copy)]
pub struct Quota {
    pub used: u64,
    pub total: u64,
}

impl Quota {
    pub fn free(&self) -> u64 {
        self.total.saturating_sub(self.used)
    }
}

/// An authenticated MEGA session.
pub struct Session {
    config: Config,
    http: HttpClient,
    api: ApiClient,
    email: String,
    user_id: String,
    user_name: Option<String>,
    session_id: String,
    master_key: [u8; 16],
    rsa_key: RsaPrivateKey,
    private_key_material: Vec<u8>,
    share_keys: ShareKeys,
    tree: Tree,
    codec_tables: CodecTables,
    storage: Option<Box<dyn SessionStorage>>,
}

impl Session {
    /// Log in with email and password.
    pub async fn login(config: Config, email: &str, password: &str) -> Result<Self> {
        let http = HttpClient::from_config(&config)?;
        let api = ApiClient::new(
            Arc::new(http.clone()),
            config.gateway_base(),
            config.retry.clone(),
        );

        let outcome = auth::login(&api, email, password).await?;
        Ok(Self::from_login(config, http, api, outcome, None))
    }

    /// Log in and persist the session snapshot into `storage`.
    pub async fn login_with_storage(
        config: Config,
        email: &str,
        password: &str,
        storage: Box<dyn SessionStorage>,
    ) -> Result<Self> {
        let mut session = Self::login(config, email, password).await?;
        session.storage = Some(storage);
        session.save_snapshot()?;
        Ok(session)
    }

    /// Resume a previously stored session. Returns `Ok(None)` when no
    /// snapshot exists or the stored session id is no longer valid (the
    /// stale snapshot is deleted in that case).
    pub async fn restore(
        config: Config,
        storage: Box<dyn SessionStorage>,
    ) -> Result<Option<Self>> {
        let Some(snapshot) = storage.load()? else {
            return Ok(None);
        };

        let http = HttpClient::from_config(&config)?;
        let api = ApiClient::new(
            Arc::new(http.clone()),
            config.gateway_base(),
            config.retry.clone(),
        );
        api.set_session_id(Some(snapshot.session_id.clone())).await;

        let identity = match auth::fetch_identity(&api, &snapshot.email).await {
            Ok(identity) => identity,
            Err(MegaError::Auth(_)) => {
                warn!("stored session no longer valid, deleting snapshot");
                storage.delete()?;
                return Ok(None);
            }
            Err(err) => return Err(err),
        };
        let (user_id, user_name, email) = identity;

        let master_key = snapshot.master_key_bytes()?;
        let private_key_material = snapshot.private_key_bytes()?.unwrap_or_default();
        let rsa_key = RsaPrivateKey::from_decrypted(&private_key_material)?;

        Ok(Some(Self {
            config,
            http,
            api,
            email,
            user_id,
            user_name,
            session_id: snapshot.session_id,
            master_key,
            rsa_key,
            private_key_material,
            share_keys: ShareKeys::new(),
            tree: Tree::new(),
            codec_tables: CodecTables::default(),
            storage: Some(storage),
        }))
    }

    fn from_login(
        config: Config,
        http: HttpClient,
        api: ApiClient,
        outcome: LoginOutcome,
        storage: Option<Box<dyn SessionStorage>>,
    ) -> Self {
        Self {
            config,
            http,
            api,
            email: outcome.email,
            user_id: outcome.user_id,
            user_name: outcome.user_name,
            session_id: outcome.session_id,
            master_key: outcome.master_key,
            rsa_key: outcome.rsa_key,
            private_key_material: outcome.private_key_material,
            share_keys: ShareKeys::new(),
            tree: Tree::new(),
            codec_tables: CodecTables::default(),
            storage,
        }
    }

    /// Account email.
    pub fn email(&self) -> &str {
        &self.email
    }

    /// Account user id (the handle MEGA assigns the user).
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Display name, when the account has one.
    pub fn user_name(&self) -> Option<&str> {
        self.user_name.as_deref()
    }

    /// Opaque session id sent on every API call.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// The decrypted filesystem tree (empty before the first
    /// [`Session::fetch_nodes`]).
    pub fn tree(&self) -> &Tree {
        &self.tree
    }

    /// Media codec id tables, seedable via [`Session::fetch_media_codecs`].
    pub fn codec_tables(&self) -> &CodecTables {
        &self.codec_tables
    }

    /// Fetch the full account tree and rebuild the in-memory view. Share
    /// keys from the response (`ok`/`ok0`, with `ok0` winning) are
    /// ingested before node keys are resolved.
    pub async fn fetch_nodes(&mut self) -> Result<()> {
        let response = self
            .api
            .request(json!({"a": "f", "c": 1, "r": 1}))
            .await?;

        self.share_keys
            .ingest_fetch_response(&response, &self.master_key, Some(&self.rsa_key));

        let records = response
            .get("f")
            .and_then(|v| v.as_array())
            .ok_or_else(|| MegaError::Protocol("fetch response carries no nodes".to_string()))?;

        // The new index replaces the old one atomically from the caller's
        // point of view.
        self.tree = Tree::build(records, &self.user_id, &self.master_key, &self.share_keys);
        debug!(nodes = self.tree.len(), "tree rebuilt");
        Ok(())
    }

    /// Account storage quota.
    pub async fn quota(&self) -> Result<Quota> {
        let response = self
            .api
            .request(json!({"a": "uq", "strg": 1}))
            .await?;

        let used = response.get("cstrg").and_then(|v| v.as_u64()).unwrap_or(0);
        let total = response.get("mstrg").and_then(|v| v.as_u64()).unwrap_or(0);
        Ok(Quota { used, total })
    }

    /// Fetch the media codec tables via `mc` and merge them in.
    pub async fn fetch_media_codecs(&mut self) -> Result<()> {
        let response = self.api.request(json!({"a": "mc"})).await?;
        self.codec_tables.merge_mc_response(&response);
        Ok(())
    }

    /// Create a folder under `parent_handle`.
    pub async fn mkdir(&mut self, parent_handle: &str, name: &str) -> Result<Node> {
        let parent = self.expect_container(parent_handle)?;
        let parent_handle = parent.handle().to_string();

        let key = make_random_key();
        let attrs = NodeAttributes::named(name).encrypt(&key)?;
        let wrapped = base64url_encode(&encrypt_key(&key, &self.master_key));

        let response = self
            .api
            .request(json!({
                "a": "p",
                "t": parent_handle,
                "n": [{"h": "xxxxxxxx", "t": 1, "a": attrs, "k": wrapped}],
            }))
            .await?;

        let node = self.parse_created_node(&response)?;
        self.tree.add_node(node.clone());
        Ok(node)
    }

    /// Rename a node, re-encrypting its attribute blob.
    pub async fn rename(&mut self, handle: &str, new_name: &str) -> Result<()> {
        let node = self
            .tree
            .get(handle)
            .ok_or_else(|| MegaError::NotFound(format!("no such node: {handle}")))?;
        let key = node
            .key()
            .ok_or_else(|| MegaError::Crypto(format!("no key for node {handle}")))?;

        let mut attributes = node.attributes().clone();
        attributes.name = new_name.to_string();
        let blob = attributes.encrypt(&key.aes_key())?;

        self.api
            .request(json!({"a": "a", "n": handle, "at": blob}))
            .await?;

        self.tree.update_attributes(handle, attributes);
        Ok(())
    }

    /// Move a node under a new parent folder.
    pub async fn move_node(&mut self, handle: &str, new_parent: &str) -> Result<()> {
        self.expect_container(new_parent)?;
        if self.tree.get(handle).is_none() {
            return Err(MegaError::NotFound(format!("no such node: {handle}")));
        }

        self.api
            .request(json!({"a": "m", "n": handle, "t": new_parent}))
            .await?;

        self.tree.reparent(handle, new_parent);
        Ok(())
    }

    /// Delete a node (and, server-side, its subtree).
    pub async fn remove(&mut self, handle: &str) -> Result<()> {
        if self.tree.get(handle).is_none() {
            return Err(MegaError::NotFound(format!("no such node: {handle}")));
        }

        self.api.request(json!({"a": "d", "n": handle})).await?;
        self.tree.remove_subtree(handle);
        Ok(())
    }

    /// Upload a local file into `parent_handle` with default options.
    pub async fn upload(&mut self, path: impl AsRef<Path>, parent_handle: &str) -> Result<Node> {
        self.upload_with(path, parent_handle, UploadOptions::default())
            .await
    }

    /// Upload with explicit options (versioning, attributes, thumbnails,
    /// progress, cancellation).
    pub async fn upload_with(
        &mut self,
        path: impl AsRef<Path>,
        parent_handle: &str,
        options: UploadOptions,
    ) -> Result<Node> {
        self.expect_container(parent_handle)?;

        let ctx = UploadContext {
            api: &self.api,
            http: &self.http,
            config: &self.config,
            master_key: &self.master_key,
            user_handle: &self.user_id,
        };
        let node = upload_file(&ctx, path.as_ref(), parent_handle, options).await?;
        self.tree.add_node(node.clone());
        Ok(node)
    }

    /// Download a file node to a local path, verifying its meta-MAC.
    pub async fn download(
        &self,
        handle: &str,
        dest: impl AsRef<Path>,
        progress: Option<ProgressCallback>,
        cancel: Option<CancellationToken>,
    ) -> Result<()> {
        let node = self
            .tree
            .get(handle)
            .ok_or_else(|| MegaError::NotFound(format!("no such node: {handle}")))?;

        let ctx = DownloadContext {
            api: &self.api,
            http: &self.http,
            config: &self.config,
        };
        download_node(&ctx, node, dest.as_ref(), progress, cancel).await
    }

    /// Copy a folder subtree into another folder through a single `p`
    /// command. Returns the server-assigned handles; call
    /// [`Session::fetch_nodes`] to observe the copies.
    pub async fn import_folder(
        &self,
        source_handle: &str,
        target_handle: &str,
        clear_attributes: bool,
    ) -> Result<Vec<String>> {
        import_folder(
            &self.api,
            &self.master_key,
            &self.tree,
            source_handle,
            target_handle,
            clear_attributes,
        )
        .await
    }

    /// Persist the current session snapshot, when a store is attached.
    pub fn save_snapshot(&self) -> Result<()> {
        if let Some(storage) = &self.storage {
            let snapshot = SessionSnapshot::new(
                &self.email,
                &self.session_id,
                &self.user_id,
                self.user_name.clone(),
                &self.master_key,
                Some(&self.private_key_material),
            );
            storage.save(&snapshot)?;
        }
        Ok(())
    }

    /// Drop transport state but keep any persisted snapshot, so the
    /// session can be resumed later.
    pub fn disconnect(self) {
        debug!("session disconnected, snapshot retained");
    }

    /// Invalidate the session on the server and delete the persisted
    /// snapshot.
    pub async fn logout(self) -> Result<()> {
        // Best effort: an expired session invalidates itself anyway.
        if let Err(err) = self.api.request_immediate(json!({"a": "sml"})).await {
            warn!(%err, "server-side logout failed");
        }
        if let Some(storage) = &self.storage {
            storage.delete()?;
        }
        Ok(())
    }

    fn expect_container(&self, handle: &str) -> Result<&Node> {
        let node = self
            .tree
            .get(handle)
            .ok_or_else(|| MegaError::NotFound(format!("no such node: {handle}")))?;
        if !node.is_folder() {
            return Err(MegaError::Argument(format!(
                "target is not a folder: {}",
                node.name()
            )));
        }
        Ok(node)
    }

    fn parse_created_node(&self, response: &serde_json::Value) -> Result<Node> {
        let record = response
            .get("f")
            .and_then(|v| v.as_array())
            .and_then(|nodes| nodes.first())
            .ok_or_else(|| MegaError::Protocol("`p` response carries no node".to_string()))?;
        parse_node(record, &self.user_id, &self.master_key, &self.share_keys)
            .ok_or_else(|| MegaError::Protocol("unparseable node in `p` response".to_string()))
    }
}
