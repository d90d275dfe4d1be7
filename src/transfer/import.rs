//! Folder importer: recursive copy of a subtree through a single `p`
//! command.
//!
//! Source folders receive fresh keys, files keep their existing keys,
//! attributes are re-encrypted under the effective key, and the server
//! remaps handles. Each record's `p` names its *source* parent so the
//! server can rebuild the hierarchy; the subtree root omits `p` and binds
//! to the command's target.

use serde_json::{json, Value};
use tracing::debug;

use crate::api::ApiClient;
use crate::base64::base64url_encode;
use crate::crypto::keys::encrypt_key;
use crate::crypto::random::make_random_key;
use crate::error::{MegaError, Result};
use crate::fs::node::{Node, NodeKey};
use crate::fs::tree::Tree;

/// Attributes dropped from copies: label, favorite, S4 container tag,
/// sensitive flag. The rubbish-restore pointer is removed unconditionally.
const STRIP_ON_CLEAR: [&str; 4] = ["lbl", "fav", "s4", "sen"];

/// Copy `source_handle` (a folder) and its entire subtree into
/// `target_handle`. Returns the handles the server assigned.
pub(crate) async fn import_folder(
    api: &ApiClient,
    master_key: &[u8; 16],
    tree: &Tree,
    source_handle: &str,
    target_handle: &str,
    clear_attributes: bool,
) -> Result<Vec<String>> {
    let source = tree
        .get(source_handle)
        .ok_or_else(|| MegaError::NotFound(format!("no such node: {source_handle}")))?;
    if !source.is_folder() {
        return Err(MegaError::Argument(format!(
            "import source must be a folder: {}",
            source.name()
        )));
    }
    let target = tree
        .get(target_handle)
        .ok_or_else(|| MegaError::NotFound(format!("no such node: {target_handle}")))?;
    if !target.is_folder() {
        return Err(MegaError::Argument(format!(
            "import target must be a folder: {}",
            target.name()
        )));
    }

    // Pre-order collection, the subtree root first.
    let mut nodes: Vec<&Node> = Vec::new();
    collect_subtree(tree, source_handle, &mut nodes);

    let mut records = Vec::with_capacity(nodes.len());
    for node in &nodes {
        records.push(prepare_record(
            node,
            source_handle,
            master_key,
            clear_attributes,
        )?);
    }

    debug!(
        count = records.len(),
        source = source_handle,
        target = target_handle,
        "importing subtree"
    );
    let response = api
        .request(json!({"a": "p", "t": target_handle, "n": records, "sm": 1, "v": 3}))
        .await?;

    let created = response
        .get("f")
        .and_then(|v| v.as_array())
        .ok_or_else(|| MegaError::Protocol("`p` import response carries no nodes".to_string()))?;

    Ok(created
        .iter()
        .filter_map(|n| n.get("h").and_then(|h| h.as_str()))
        .map(String::from)
        .collect())
}

fn collect_subtree<'a>(tree: &'a Tree, handle: &str, out: &mut Vec<&'a Node>) {
    let Some(node) = tree.get(handle) else {
        return;
    };
    out.push(node);
    for child in tree.children_of(handle) {
        collect_subtree(tree, child.handle(), out);
    }
}

/// Build one import record: re-keyed, re-encrypted, stripped.
fn prepare_record(
    node: &Node,
    source_root: &str,
    master_key: &[u8; 16],
    clear_attributes: bool,
) -> Result<Value> {
    // Folders get fresh keys; files keep theirs so the content stays
    // decryptable without re-upload.
    let (key, attr_key): (Vec<u8>, [u8; 16]) = match (node.is_folder(), node.key()) {
        (true, _) => {
            let fresh = make_random_key();
            (fresh.to_vec(), fresh)
        }
        (false, Some(NodeKey::File(full))) => {
            (full.to_vec(), NodeKey::File(*full).aes_key())
        }
        _ => {
            return Err(MegaError::Crypto(format!(
                "cannot copy node without a key: {}",
                node.name()
            )))
        }
    };

    let mut attributes = node.attributes().clone();
    if clear_attributes {
        for key in STRIP_ON_CLEAR {
            attributes.strip(key);
        }
    }
    attributes.strip("rr");

    let mut record = json!({
        "h": node.handle(),
        "t": if node.is_folder() { 1 } else { 0 },
        "a": attributes.encrypt(&attr_key)?,
        "k": base64url_encode(&encrypt_key(&key, master_key)),
    });

    if node.handle() != source_root {
        if let Some(parent) = node.parent_handle() {
            record["p"] = json!(parent);
        }
    }

    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attrs::codec::NodeAttributes;
    use crate::base64::base64url_decode;
    use crate::crypto::aes::aes128_ecb_decrypt;
    use crate::fs::node::NodeKind;

    fn master() -> [u8; 16] {
        [0x11u8; 16]
    }

    fn folder(handle: &str, parent: Option<&str>, name: &str) -> Node {
        Node {
            handle: handle.to_string(),
            parent: parent.map(String::from),
            kind: NodeKind::Folder,
            size: 0,
            owner: None,
            timestamp: 0,
            key: Some(NodeKey::Folder([0x42u8; 16])),
            attributes: NodeAttributes::named(name),
            fa: None,
        }
    }

    fn file(handle: &str, parent: &str, name: &str) -> Node {
        let full: [u8; 32] = core::array::from_fn(|i| (i * 5) as u8);
        let mut attributes = NodeAttributes::named(name);
        attributes.label = Some(3);
        attributes.favorite = true;
        attributes
            .extra
            .insert("rr".to_string(), json!("OLDHANDL"));

        Node {
            handle: handle.to_string(),
            parent: Some(parent.to_string()),
            kind: NodeKind::File,
            size: 10,
            owner: None,
            timestamp: 0,
            key: Some(NodeKey::File(full)),
            attributes,
            fa: None,
        }
    }

    fn sample_tree() -> Tree {
        let mut tree = Tree::new();
        tree.add_node(folder("SRC00000", None, "src"));
        tree.add_node(folder("SUB00000", Some("SRC00000"), "sub"));
        tree.add_node(file("FILE0000", "SUB00000", "data.bin"));
        tree.add_node(folder("DST00000", None, "dst"));
        tree
    }

    #[test]
    fn records_rekey_folders_and_retain_file_keys() {
        let tree = sample_tree();
        let src_folder = tree.get("SUB00000").unwrap();
        let src_file = tree.get("FILE0000").unwrap();

        let folder_rec = prepare_record(src_folder, "SRC00000", &master(), true).unwrap();
        let file_rec = prepare_record(src_file, "SRC00000", &master(), true).unwrap();

        // Folder key is fresh: decrypting it must not reproduce the
        // original folder key.
        let wrapped = base64url_decode(folder_rec["k"].as_str().unwrap()).unwrap();
        let folder_key = aes128_ecb_decrypt(&wrapped, &master());
        assert_eq!(folder_key.len(), 16);
        assert_ne!(folder_key.as_slice(), &[0x42u8; 16]);

        // File key is the original full key, wrapped.
        let wrapped = base64url_decode(file_rec["k"].as_str().unwrap()).unwrap();
        let file_key = aes128_ecb_decrypt(&wrapped, &master());
        let expected: Vec<u8> = (0..32).map(|i| (i * 5) as u8).collect();
        assert_eq!(file_key, expected);

        // Source parents ride along; the attribute blob decrypts under the
        // effective key.
        assert_eq!(file_rec["p"], json!("SUB00000"));
        let attr_key: [u8; 16] = core::array::from_fn(|i| expected[i] ^ expected[i + 16]);
        let attrs =
            NodeAttributes::decrypt(file_rec["a"].as_str().unwrap(), &attr_key).unwrap();
        assert_eq!(attrs.name, "data.bin");
    }

    #[test]
    fn clear_attributes_strips_the_documented_set() {
        let tree = sample_tree();
        let src_file = tree.get("FILE0000").unwrap();

        let record = prepare_record(src_file, "SRC00000", &master(), true).unwrap();
        let full: [u8; 32] = core::array::from_fn(|i| (i * 5) as u8);
        let attr_key: [u8; 16] = core::array::from_fn(|i| full[i] ^ full[i + 16]);
        let attrs = NodeAttributes::decrypt(record["a"].as_str().unwrap(), &attr_key).unwrap();

        assert_eq!(attrs.label, None);
        assert!(!attrs.favorite);
        assert!(attrs.extra.get("rr").is_none());
    }

    #[test]
    fn rr_is_stripped_even_without_clear() {
        let tree = sample_tree();
        let src_file = tree.get("FILE0000").unwrap();

        let record = prepare_record(src_file, "SRC00000", &master(), false).unwrap();
        let full: [u8; 32] = core::array::from_fn(|i| (i * 5) as u8);
        let attr_key: [u8; 16] = core::array::from_fn(|i| full[i] ^ full[i + 16]);
        let attrs = NodeAttributes::decrypt(record["a"].as_str().unwrap(), &attr_key).unwrap();

        // lbl/fav survive, rr never does.
        assert_eq!(attrs.label, Some(3));
        assert!(attrs.favorite);
        assert!(attrs.extra.get("rr").is_none());
    }

    #[test]
    fn subtree_root_omits_parent() {
        let tree = sample_tree();
        let root = tree.get("SRC00000").unwrap();
        let record = prepare_record(root, "SRC00000", &master(), true).unwrap();
        assert!(record.get("p").is_none());
    }

    #[test]
    fn collection_is_preorder() {
        let tree = sample_tree();
        let mut nodes = Vec::new();
        collect_subtree(&tree, "SRC00000", &mut nodes);

        let handles: Vec<&str> = nodes.iter().map(|n| n.handle()).collect();
        assert_eq!(handles, vec!["SRC00000", "SUB00000", "FILE0000"]);
    }

    #[test]
    fn undecryptable_source_is_a_crypto_error() {
        let mut tree = sample_tree();
        let mut broken = file("BROKEN00", "SRC00000", "broken");
        broken.key = None;
        tree.add_node(broken);

        let node = tree.get("BROKEN00").unwrap();
        assert!(matches!(
            prepare_record(node, "SRC00000", &master(), true),
            Err(MegaError::Crypto(_))
        ));
    }

}
