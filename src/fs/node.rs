//! Filesystem node model.
//!
//! Nodes form an arena keyed by handle; parent/child edges are handle
//! strings resolved through [`crate::fs::tree::Tree`], never language-level
//! pointers.

use crate::attrs::codec::NodeAttributes;
use crate::attrs::media::{decode_media_attributes, fa_fragment, MediaInfo};
use crate::crypto::keys::split_file_key;

/// Node type enumeration matching MEGA's wire values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum NodeKind {
    /// Regular file
    File = 0,
    /// Folder
    Folder = 1,
    /// Cloud drive root
    Root = 2,
    /// Inbox
    Inbox = 3,
    /// Rubbish bin
    Rubbish = 4,
}

impl NodeKind {
    /// Create from the wire integer.
    pub fn from_i64(t: i64) -> Option<Self> {
        match t {
            0 => Some(NodeKind::File),
            1 => Some(NodeKind::Folder),
            2 => Some(NodeKind::Root),
            3 => Some(NodeKind::Inbox),
            4 => Some(NodeKind::Rubbish),
            _ => None,
        }
    }

    /// Whether nodes of this kind can have children.
    pub fn is_container(&self) -> bool {
        !matches!(self, NodeKind::File)
    }

    /// Whether this is one of the account-level roots.
    pub fn is_root_kind(&self) -> bool {
        matches!(self, NodeKind::Root | NodeKind::Inbox | NodeKind::Rubbish)
    }
}

/// A decrypted node key: 16 bytes for folders, 32 for files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeKey {
    Folder([u8; 16]),
    File([u8; 32]),
}

impl NodeKey {
    /// Build from raw decrypted bytes; anything but 16 or 32 bytes is
    /// not a node key.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        match bytes.len() {
            16 => Some(NodeKey::Folder(bytes.try_into().unwrap())),
            32 => Some(NodeKey::File(bytes.try_into().unwrap())),
            _ => None,
        }
    }

    /// The AES key used for attribute and content crypto. For files this
    /// is the XOR of the two halves of the full key.
    pub fn aes_key(&self) -> [u8; 16] {
        match self {
            NodeKey::Folder(key) => *key,
            NodeKey::File(full) => split_file_key(full).0,
        }
    }

    /// File-only parts `(aes_key, nonce, meta_mac)`.
    pub fn file_parts(&self) -> Option<([u8; 16], [u8; 8], [u8; 8])> {
        match self {
            NodeKey::File(full) => Some(split_file_key(full)),
            NodeKey::Folder(_) => None,
        }
    }

    /// The raw key bytes as stored on the wire (pre-wrap).
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            NodeKey::Folder(key) => key,
            NodeKey::File(full) => full,
        }
    }
}

/// A node in the MEGA filesystem.
#[derive(Debug, Clone)]
pub struct Node {
    pub(crate) handle: String,
    pub(crate) parent: Option<String>,
    pub(crate) kind: NodeKind,
    pub(crate) size: u64,
    pub(crate) owner: Option<String>,
    pub(crate) timestamp: i64,
    /// Decrypted key; `None` when no known key could decrypt `k`.
    pub(crate) key: Option<NodeKey>,
    pub(crate) attributes: NodeAttributes,
    pub(crate) fa: Option<String>,
}

impl Node {
    /// Node handle (8-byte base64url identifier).
    pub fn handle(&self) -> &str {
        &self.handle
    }

    /// Parent handle, absent for roots and detached nodes.
    pub fn parent_handle(&self) -> Option<&str> {
        self.parent.as_deref()
    }

    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    /// Decrypted name. Undecryptable nodes show their handle.
    pub fn name(&self) -> &str {
        &self.attributes.name
    }

    /// File size in bytes (0 for containers).
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Owning user id, when the server supplied one.
    pub fn owner(&self) -> Option<&str> {
        self.owner.as_deref()
    }

    /// Server-assigned creation time (Unix seconds).
    pub fn created_at(&self) -> i64 {
        self.timestamp
    }

    /// Full decrypted attributes.
    pub fn attributes(&self) -> &NodeAttributes {
        &self.attributes
    }

    /// Decrypted node key, if resolution succeeded.
    pub fn key(&self) -> Option<&NodeKey> {
        self.key.as_ref()
    }

    /// Raw file-attribute reference string.
    pub fn fa(&self) -> Option<&str> {
        self.fa.as_deref()
    }

    pub fn is_file(&self) -> bool {
        self.kind == NodeKind::File
    }

    pub fn is_folder(&self) -> bool {
        self.kind.is_container()
    }

    /// Whether the node key failed to resolve; such nodes are navigable by
    /// handle but excluded from name matching. Roots carry no key by design
    /// and are never undecryptable.
    pub fn is_undecryptable(&self) -> bool {
        self.key.is_none() && !self.kind.is_root_kind()
    }

    pub fn has_thumbnail(&self) -> bool {
        self.fa.as_deref().and_then(|fa| fa_fragment(fa, 0)).is_some()
    }

    pub fn has_preview(&self) -> bool {
        self.fa.as_deref().and_then(|fa| fa_fragment(fa, 1)).is_some()
    }

    /// Decode media attributes when the node carries attribute 8.
    pub fn media_info(&self) -> Option<MediaInfo> {
        let fa = self.fa.as_deref()?;
        let NodeKey::File(full) = self.key.as_ref()? else {
            return None;
        };
        decode_media_attributes(fa, full)
    }
}
