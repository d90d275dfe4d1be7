//! Decrypted filesystem model: nodes, key resolution, tree navigation.

pub mod keys;
pub mod node;
pub mod tree;

pub use keys::ShareKeys;
pub use node::{Node, NodeKey, NodeKind};
pub use tree::Tree;
