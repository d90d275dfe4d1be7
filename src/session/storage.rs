//! Persisted session snapshots.
//!
//! A snapshot holds everything needed to resume a session without
//! credentials. Storage is abstracted behind four operations so consumers
//! can plug in an embedded store; the file implementation writes
//! `{session_name}.session` under a base path and serializes writers
//! through a single lock.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::base64::{base64url_decode, base64url_encode};
use crate::error::{MegaError, Result};

/// Complete session state for later restoration. Key material is encoded
/// base64url for the JSON form but is otherwise raw.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub email: String,
    pub session_id: String,
    pub user_id: String,
    pub user_name: Option<String>,
    /// 16-byte master key, base64url.
    pub master_key: String,
    /// Decrypted RSA private key material (MPI-encoded), base64url.
    pub private_key: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SessionSnapshot {
    /// Assemble a snapshot from raw key material, stamping both timestamps
    /// with the current time.
    pub fn new(
        email: impl Into<String>,
        session_id: impl Into<String>,
        user_id: impl Into<String>,
        user_name: Option<String>,
        master_key: &[u8; 16],
        private_key: Option<&[u8]>,
    ) -> Self {
        let now = Utc::now();
        Self {
            email: email.into(),
            session_id: session_id.into(),
            user_id: user_id.into(),
            user_name,
            master_key: base64url_encode(master_key),
            private_key: private_key.map(base64url_encode),
            created_at: now,
            updated_at: now,
        }
    }

    /// Decode the master key.
    pub fn master_key_bytes(&self) -> Result<[u8; 16]> {
        let bytes = base64url_decode(&self.master_key)?;
        bytes
            .as_slice()
            .try_into()
            .map_err(|_| MegaError::Crypto("snapshot master key is not 16 bytes".to_string()))
    }

    /// Decode the private-key material.
    pub fn private_key_bytes(&self) -> Result<Option<Vec<u8>>> {
        match &self.private_key {
            Some(b64) => Ok(Some(base64url_decode(b64)?)),
            None => Ok(None),
        }
    }
}

/// Pluggable snapshot store.
pub trait SessionStorage: Send + Sync {
    fn save(&self, snapshot: &SessionSnapshot) -> Result<()>;
    fn load(&self) -> Result<Option<SessionSnapshot>>;
    fn delete(&self) -> Result<()>;
    fn exists(&self) -> bool;
}

/// File-backed store: `{session_name}.session` under a base path.
pub struct FileSessionStorage {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileSessionStorage {
    /// Create a store for `session_name` under `base_path`. The directory
    /// is created on first save.
    pub fn new(session_name: &str, base_path: impl AsRef<Path>) -> Self {
        Self {
            path: base_path.as_ref().join(format!("{session_name}.session")),
            write_lock: Mutex::new(()),
        }
    }

    /// The backing file path.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SessionStorage for FileSessionStorage {
    fn save(&self, snapshot: &SessionSnapshot) -> Result<()> {
        let _guard = self.write_lock.lock().unwrap();
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut snapshot = snapshot.clone();
        snapshot.updated_at = Utc::now();
        let json = serde_json::to_string_pretty(&snapshot)?;
        std::fs::write(&self.path, json)?;
        Ok(())
    }

    fn load(&self) -> Result<Option<SessionSnapshot>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let json = std::fs::read_to_string(&self.path)?;
        Ok(Some(serde_json::from_str(&json)?))
    }

    fn delete(&self) -> Result<()> {
        let _guard = self.write_lock.lock().unwrap();
        if self.path.exists() {
            std::fs::remove_file(&self.path)?;
        }
        Ok(())
    }

    fn exists(&self) -> bool {
        self.path.exists()
    }
}

/// In-memory store, mostly for tests and ephemeral sessions.
#[derive(Default)]
pub struct MemorySessionStorage {
    slot: Mutex<Option<SessionSnapshot>>,
}

impl MemorySessionStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStorage for MemorySessionStorage {
    fn save(&self, snapshot: &SessionSnapshot) -> Result<()> {
        let mut snapshot = snapshot.clone();
        snapshot.updated_at = Utc::now();
        *self.slot.lock().unwrap() = Some(snapshot);
        Ok(())
    }

    fn load(&self) -> Result<Option<SessionSnapshot>> {
        Ok(self.slot.lock().unwrap().clone())
    }

    fn delete(&self) -> Result<()> {
        *self.slot.lock().unwrap() = None;
        Ok(())
    }

    fn exists(&self) -> bool {
        self.slot.lock().unwrap().is_some()
    }
}
