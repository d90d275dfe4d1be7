//! Tree builder and navigator.
//!
//! The server returns nodes as a flat list; the builder resolves each
//! record's key, decrypts its attributes, and links the parent/child graph
//! in a second pass. A node is never attached before its parent exists:
//! children whose parent has not arrived yet wait in a pending list and
//! are adopted when it does.
//!
//! Navigation is case-sensitive. Duplicate sibling names resolve to the
//! first-seen node for paths, while [`Tree::find_all`] returns every match.

use std::collections::{HashMap, HashSet};

use serde_json::Value;
use tracing::{debug, warn};

use crate::attrs::codec::NodeAttributes;
use crate::fs::keys::{resolve_node_key, ShareKeys};
use crate::fs::node::{Node, NodeKind};

/// Display names for the account-level roots.
fn root_name(kind: NodeKind) -> &'static str {
    match kind {
        NodeKind::Root => "Cloud Drive",
        NodeKind::Inbox => "Inbox",
        NodeKind::Rubbish => "Rubbish Bin",
        _ => unreachable!("not a root kind"),
    }
}

/// Parse one wire node record, resolving its key and attributes.
///
/// Records that cannot be decrypted under any known key are kept with
/// their handle as a placeholder name and no key.
pub fn parse_node(
    record: &Value,
    user_handle: &str,
    master_key: &[u8; 16],
    share_keys: &ShareKeys,
) -> Option<Node> {
    let handle = record.get("h")?.as_str()?.to_string();
    let kind = NodeKind::from_i64(record.get("t")?.as_i64()?)?;
    let parent = record
        .get("p")
        .and_then(|v| v.as_str())
        .filter(|p| !p.is_empty())
        .map(|p| p.to_string());
    let owner = record.get("u").and_then(|v| v.as_str()).map(String::from);
    let size = record.get("s").and_then(|v| v.as_u64()).unwrap_or(0);
    let timestamp = record.get("ts").and_then(|v| v.as_i64()).unwrap_or(0);
    let fa = record.get("fa").and_then(|v| v.as_str()).map(String::from);

    if kind.is_root_kind() {
        return Some(Node {
            handle,
            parent,
            kind,
            size,
            owner,
            timestamp,
            key: None,
            attributes: NodeAttributes::named(root_name(kind)),
            fa,
        });
    }

    let raw_k = record.get("k").and_then(|v| v.as_str()).unwrap_or("");
    let key = resolve_node_key(raw_k, user_handle, master_key, share_keys);

    let attributes = match &key {
        Some(key) => {
            let blob = record.get("a").and_then(|v| v.as_str()).unwrap_or("");
            match NodeAttributes::decrypt(blob, &key.aes_key()) {
                Ok(attrs) => attrs,
                Err(err) => {
                    warn!(handle = %handle, %err, "attribute decrypt failed, using placeholder");
                    NodeAttributes::named(handle.clone())
                }
            }
        }
        None => {
            warn!(handle = %handle, "node key unresolvable, node kept undecryptable");
            NodeAttributes::named(handle.clone())
        }
    };

    Some(Node {
        handle,
        parent,
        kind,
        size,
        owner,
        timestamp,
        key,
        attributes,
        fa,
    })
}

/// The decrypted filesystem tree.
#[derive(Debug, Default, Clone)]
pub struct Tree {
    nodes: HashMap<String, Node>,
    children: HashMap<String, Vec<String>>,
    /// Orphans waiting for their parent: parent handle -> child handles.
    pending: HashMap<String, Vec<String>>,
}

impl Tree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the tree from the `f` node array of a fetch response.
    /// Two passes: store every record, then link edges.
    pub fn build(
        records: &[Value],
        user_handle: &str,
        master_key: &[u8; 16],
        share_keys: &ShareKeys,
    ) -> Self {
        let mut tree = Self::new();

        let mut parsed = Vec::with_capacity(records.len());
        for record in records {
            match parse_node(record, user_handle, master_key, share_keys) {
                Some(node) => parsed.push(node),
                None => debug!("skipping malformed node record"),
            }
        }

        for node in &parsed {
            tree.nodes.insert(node.handle.clone(), node.clone());
        }
        for node in parsed {
            tree.link(&node.handle);
        }

        tree
    }

    /// Number of nodes in the arena.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// O(1) lookup by handle.
    pub fn get(&self, handle: &str) -> Option<&Node> {
        self.nodes.get(handle)
    }

    /// The cloud-drive root handle.
    pub fn root_handle(&self) -> Option<&str> {
        self.nodes
            .values()
            .find(|n| n.kind == NodeKind::Root)
            .map(|n| n.handle.as_str())
    }

    /// All account-level roots (cloud drive, inbox, rubbish).
    pub fn roots(&self) -> Vec<&Node> {
        let mut roots: Vec<&Node> = self
            .nodes
            .values()
            .filter(|n| n.kind.is_root_kind())
            .collect();
        roots.sort_by_key(|n| n.kind as u8);
        roots
    }

    /// Handles still waiting for their parent to arrive.
    pub fn orphan_handles(&self) -> Vec<&str> {
        self.pending
            .values()
            .flatten()
            .map(|s| s.as_str())
            .collect()
    }

    /// Direct children in arrival order.
    pub fn children_of(&self, handle: &str) -> Vec<&Node> {
        self.children
            .get(handle)
            .map(|handles| handles.iter().filter_map(|h| self.nodes.get(h)).collect())
            .unwrap_or_default()
    }

    /// First child with the given name (case-sensitive); undecryptable
    /// nodes never match by name.
    pub fn child_by_name(&self, parent: &str, name: &str) -> Option<&Node> {
        self.children_of(parent)
            .into_iter()
            .find(|n| !n.is_undecryptable() && n.name() == name)
    }

    /// Every child with the given name, in arrival order.
    pub fn find_all(&self, parent: &str, name: &str) -> Vec<&Node> {
        self.children_of(parent)
            .into_iter()
            .filter(|n| !n.is_undecryptable() && n.name() == name)
            .collect()
    }

    /// Resolve a `/`-separated path from the cloud-drive root. `.` and
    /// `..` are honored; `..` at the root stays at the root.
    pub fn resolve_path(&self, path: &str) -> Option<&Node> {
        let root = self.root_handle()?;
        self.resolve_path_from(root, path)
    }

    /// Resolve a path relative to the given node.
    pub fn resolve_path_from(&self, from: &str, path: &str) -> Option<&Node> {
        let mut current = from.to_string();

        for segment in path.split('/') {
            match segment {
                "" | "." => continue,
                ".." => {
                    if let Some(parent) = self.get(&current).and_then(|n| n.parent_handle()) {
                        if self.nodes.contains_key(parent) {
                            current = parent.to_string();
                        }
                    }
                }
                name => {
                    let child = self.child_by_name(&current, name)?;
                    current = child.handle.clone();
                }
            }
        }

        self.get(&current)
    }

    /// Share roots the node lives under: every ancestor (including the
    /// node itself) whose handle has a known share key. Outermost first.
    pub fn share_roots_of(&self, handle: &str, share_keys: &ShareKeys) -> Vec<String> {
        let mut chain = Vec::new();
        let mut current = self.get(handle);
        while let Some(node) = current {
            if share_keys.contains(&node.handle) {
                chain.push(node.handle.clone());
            }
            current = node.parent_handle().and_then(|p| self.get(p));
        }
        chain.reverse();
        chain
    }

    /// Absolute path of a node, climbing to its root.
    pub fn path_of(&self, handle: &str) -> Option<String> {
        let mut segments = Vec::new();
        let mut current = self.get(handle)?;

        loop {
            segments.push(current.name().to_string());
            match current.parent_handle().and_then(|p| self.get(p)) {
                Some(parent) => current = parent,
                None => break,
            }
        }

        segments.reverse();
        Some(format!("/{}", segments.join("/")))
    }

    /// Glob over the tree from the cloud-drive root. Supports `*` and `?`
    /// within a segment and `**` for any number of levels.
    pub fn glob(&self, pattern: &str) -> Vec<&Node> {
        let segments: Vec<&str> = pattern
            .split('/')
            .filter(|s| !s.is_empty() && *s != ".")
            .collect();

        let mut seen = HashSet::new();
        let mut matched = Vec::new();
        if let Some(root) = self.root_handle() {
            self.glob_step(root, &segments, &mut seen, &mut matched);
        }

        matched.iter().filter_map(|h| self.get(h)).collect()
    }

    fn glob_step(
        &self,
        handle: &str,
        segments: &[&str],
        seen: &mut HashSet<String>,
        out: &mut Vec<String>,
    ) {
        let Some((first, rest)) = segments.split_first() else {
            if seen.insert(handle.to_string()) {
                out.push(handle.to_string());
            }
            return;
        };

        if *first == "**" {
            // Zero levels consumed.
            self.glob_step(handle, rest, seen, out);
            // One level down, `**` still active.
            for child in self.children_of(handle) {
                self.glob_step(&child.handle, segments, seen, out);
            }
            return;
        }

        for child in self.children_of(handle) {
            if !child.is_undecryptable() && wildcard_match(first, child.name()) {
                self.glob_step(&child.handle, rest, seen, out);
            }
        }
    }

    /// Pre-order walk yielding `(folder, subfolders, files)` per container,
    /// analogous to a POSIX directory walk.
    pub fn walk(&self, from: &str) -> Vec<(&Node, Vec<&Node>, Vec<&Node>)> {
        let mut out = Vec::new();
        if let Some(node) = self.get(from) {
            if node.is_folder() {
                self.walk_rec(node, &mut out);
            }
        }
        out
    }

    fn walk_rec<'a>(&'a self, node: &'a Node, out: &mut Vec<(&'a Node, Vec<&'a Node>, Vec<&'a Node>)>) {
        let children = self.children_of(&node.handle);
        let subfolders: Vec<&Node> = children.iter().copied().filter(|c| c.is_folder()).collect();
        let files: Vec<&Node> = children.iter().copied().filter(|c| c.is_file()).collect();

        out.push((node, subfolders.clone(), files));
        for folder in subfolders {
            self.walk_rec(folder, out);
        }
    }

    /// Render the subtree as an indented listing, descending at most
    /// `max_depth` levels below the starting node.
    pub fn print_tree(&self, from: &str, max_depth: usize) -> String {
        let mut out = String::new();
        if let Some(node) = self.get(from) {
            self.print_rec(node, 0, max_depth, &mut out);
        }
        out
    }

    fn print_rec(&self, node: &Node, depth: usize, max_depth: usize, out: &mut String) {
        let indent = "  ".repeat(depth);
        if node.is_folder() {
            out.push_str(&format!("{indent}{}/\n", node.name()));
        } else {
            out.push_str(&format!("{indent}{} ({} B)\n", node.name(), node.size()));
        }

        if depth >= max_depth {
            return;
        }
        for child in self.children_of(&node.handle) {
            self.print_rec(child, depth + 1, max_depth, out);
        }
    }

    /// Insert a node (e.g. from a `p` response), linking it and adopting
    /// any children that were waiting for it.
    pub fn add_node(&mut self, node: Node) {
        let handle = node.handle.clone();
        self.nodes.insert(handle.clone(), node);
        self.link(&handle);

        if let Some(waiting) = self.pending.remove(&handle) {
            for child in waiting {
                self.children.entry(handle.clone()).or_default().push(child);
            }
        }
    }

    /// Replace a node's attributes (after a rename or attribute update).
    pub fn update_attributes(&mut self, handle: &str, attributes: NodeAttributes) {
        if let Some(node) = self.nodes.get_mut(handle) {
            node.attributes = attributes;
        }
    }

    /// Move a node under a new parent, preserving the never-attached-
    /// before-parent rule.
    pub fn reparent(&mut self, handle: &str, new_parent: &str) {
        let Some(node) = self.nodes.get_mut(handle) else {
            return;
        };
        let old_parent = node.parent.replace(new_parent.to_string());

        if let Some(old) = old_parent {
            if let Some(siblings) = self.children.get_mut(&old) {
                siblings.retain(|h| h != handle);
            }
            if let Some(waiting) = self.pending.get_mut(&old) {
                waiting.retain(|h| h != handle);
            }
        }
        self.link(handle);
    }

    /// Detach and drop a subtree.
    pub fn remove_subtree(&mut self, handle: &str) {
        let mut stack = vec![handle.to_string()];
        let mut doomed = Vec::new();
        while let Some(current) = stack.pop() {
            if let Some(children) = self.children.remove(&current) {
                stack.extend(children);
            }
            doomed.push(current);
        }

        // Detach the subtree root from its parent's child list.
        if let Some(parent) = self.get(handle).and_then(|n| n.parent.clone()) {
            if let Some(siblings) = self.children.get_mut(&parent) {
                siblings.retain(|h| h != handle);
            }
        }

        for handle in doomed {
            self.nodes.remove(&handle);
            self.pending.remove(&handle);
        }
    }

    /// Attach `handle` to its parent, or defer it until the parent shows
    /// up. Roots and parentless nodes become top-level entries.
    fn link(&mut self, handle: &str) {
        let Some(parent) = self.nodes.get(handle).and_then(|n| n.parent.clone()) else {
            return;
        };

        if self.nodes.contains_key(&parent) {
            let entry = self.children.entry(parent).or_default();
            if !entry.iter().any(|h| h == handle) {
                entry.push(handle.to_string());
            }
        } else {
            debug!(handle, parent, "parent not yet present, deferring node");
            self.pending.entry(parent).or_default().push(handle.to_string());
        }
    }
}

/// Single-segment wildcard match supporting `*` and `?`.
fn wildcard_match(pattern: &str, name: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let n: Vec<char> = name.chars().collect();

    let (mut pi, mut ni) = (0usize, 0usize);
    let mut star: Option<(usize, usize)> = None;

    while ni < n.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == n[ni]) {
            pi += 1;
            ni += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some((pi, ni));
            pi += 1;
        } else if let Some((star_pi, star_ni)) = star {
            // Backtrack: let the last * swallow one more character.
            pi = star_pi + 1;
            ni = star_ni + 1;
            star = Some((star_pi, star_ni + 1));
        } else {
            return false;
        }
    }

    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }
    pi == p.len()
}
