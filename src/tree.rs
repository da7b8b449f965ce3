//! Registry tree: maps watched directories to the native watcher covering
//! them, with the minimum number of OS watches.
//!
//! The tree is a trie keyed by path components. Interior nodes carry no
//! watcher; a leaf owns the native watcher for its exact directory plus the
//! set of relative "adopted child paths" served by that watcher on behalf
//! of consumers who asked for something deeper.
//!
//! Every consumer request is a claim, counted per leaf (rooted exactly
//! there) or per adopted child path. Claims are released when the consumer
//! lets go and pruned at zero, so a split never recreates coverage nobody
//! is waiting for.
//!
//! Invariant: no leaf is an ancestor-or-equal of another leaf, so coverage
//! never overlaps.

use std::collections::HashMap;
use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::native::NativeWatcher;

/// Ordered path components, root component included.
pub type Segments = Vec<OsString>;

/// Split an absolute path into trie segments.
pub fn path_segments(path: &Path) -> Segments {
    path.components()
        .map(|c| c.as_os_str().to_os_string())
        .collect()
}

/// Rebuild the absolute path from trie segments.
pub fn segments_path(segments: &[OsString]) -> PathBuf {
    segments.iter().collect()
}

/// Constructs a native watcher for a directory the tree decided to cover.
pub type CreateNative<'a> = &'a dyn Fn(&Path) -> Arc<NativeWatcher>;

enum Node {
    Branch(HashMap<OsString, Node>),
    Leaf(LeafNode),
}

/// A directory with an active native watcher.
pub struct LeafNode {
    pub(crate) native: Arc<NativeWatcher>,
    pub(crate) segments: Segments,
    /// Live consumers rooted exactly at this leaf.
    pub(crate) direct: usize,
    /// Relative paths below this leaf that consumers requested and this
    /// watcher serves instead of a deeper node, with the number of live
    /// consumers claiming each.
    pub(crate) child_paths: HashMap<Segments, usize>,
}

/// How existing coverage relates to a requested path.
enum Coverage {
    /// An ancestor-or-equal leaf covers the request.
    Parent {
        leaf_segments: Segments,
        remainder: Segments,
    },
    /// One or more leaves exist strictly below the request.
    Children(Vec<Segments>),
    Missing,
}

/// Result of claiming coverage for a path.
pub struct Attachment {
    /// The watcher now covering the requested path.
    pub native: Arc<NativeWatcher>,
    /// Absolute directory the watcher is rooted at (ancestor-or-equal of
    /// the request).
    pub root: PathBuf,
    /// Watchers displaced by a merge; already told to reattach, still
    /// running until the caller stops them.
    pub displaced: Vec<Arc<NativeWatcher>>,
}

pub struct RegistryTree {
    root: Node,
}

impl Default for RegistryTree {
    fn default() -> Self {
        Self::new()
    }
}

impl RegistryTree {
    pub fn new() -> Self {
        Self {
            root: Node::Branch(HashMap::new()),
        }
    }

    /// Claim coverage for `segments` on behalf of one consumer,
    /// restructuring as needed.
    ///
    /// Parent coverage is reused (the remainder becomes an adopted child
    /// path). Strictly-deeper leaves are merged into one new watcher rooted
    /// at the request: their consumers are told to reattach and the old
    /// watchers come back as `displaced` for the caller to stop. With no
    /// related coverage, a fresh leaf is created.
    pub fn add(&mut self, segments: &[OsString], create: CreateNative) -> Attachment {
        self.add_claims(segments, create, 1)
    }

    /// [`RegistryTree::add`] carrying `claims` consumers at once, used when
    /// splits and migrations transfer existing claims.
    pub(crate) fn add_claims(
        &mut self,
        segments: &[OsString],
        create: CreateNative,
        claims: usize,
    ) -> Attachment {
        match self.lookup(segments) {
            Coverage::Parent {
                leaf_segments,
                remainder,
            } => {
                let leaf = self
                    .leaf_mut(&leaf_segments)
                    .expect("leaf found by lookup is present");
                if remainder.is_empty() {
                    leaf.direct += claims;
                } else if claims > 0 {
                    *leaf.child_paths.entry(remainder).or_default() += claims;
                }
                Attachment {
                    native: Arc::clone(&leaf.native),
                    root: segments_path(&leaf_segments),
                    displaced: Vec::new(),
                }
            }
            Coverage::Children(child_leaves) => {
                let root = segments_path(segments);
                let native = create(&root);
                let mut child_paths: HashMap<Segments, usize> = HashMap::new();
                let mut displaced = Vec::new();

                for leaf_segments in child_leaves {
                    let Some(leaf) = self.take_leaf(&leaf_segments) else {
                        continue;
                    };
                    let remainder: Segments = leaf.segments[segments.len()..].to_vec();
                    for (adopted, count) in &leaf.child_paths {
                        let mut path = remainder.clone();
                        path.extend(adopted.iter().cloned());
                        *child_paths.entry(path).or_default() += count;
                    }
                    if leaf.direct > 0 {
                        *child_paths.entry(remainder).or_default() += leaf.direct;
                    }
                    leaf.native.reattach_to(Arc::clone(&native), root.clone());
                    displaced.push(leaf.native);
                }

                self.insert_leaf(LeafNode {
                    native: Arc::clone(&native),
                    segments: segments.to_vec(),
                    direct: claims,
                    child_paths,
                });
                crate::debug_event!("tree", "merged", "{} leaves under {}", displaced.len(), root.display());
                Attachment {
                    native,
                    root,
                    displaced,
                }
            }
            Coverage::Missing => {
                let root = segments_path(segments);
                let native = create(&root);
                self.insert_leaf(LeafNode {
                    native: Arc::clone(&native),
                    segments: segments.to_vec(),
                    direct: claims,
                    child_paths: HashMap::new(),
                });
                Attachment {
                    native,
                    root,
                    displaced: Vec::new(),
                }
            }
        }
    }

    /// Release one consumer's claim on `segments`.
    ///
    /// Adopted child paths whose claim count reaches zero are pruned, so a
    /// later split will not recreate them.
    pub fn release(&mut self, segments: &[OsString]) {
        let Coverage::Parent {
            leaf_segments,
            remainder,
        } = self.lookup(segments)
        else {
            return;
        };
        let Some(leaf) = self.leaf_mut(&leaf_segments) else {
            return;
        };
        if remainder.is_empty() {
            leaf.direct = leaf.direct.saturating_sub(1);
        } else if let Some(count) = leaf.child_paths.get_mut(&remainder) {
            *count -= 1;
            if *count == 0 {
                leaf.child_paths.remove(&remainder);
            }
        }
    }

    /// Remove the leaf covering `segments` if no claims and no subscribers
    /// remain, returning its watcher for the caller to stop.
    pub fn reap_idle(&mut self, segments: &[OsString]) -> Option<Arc<NativeWatcher>> {
        let Coverage::Parent { leaf_segments, .. } = self.lookup(segments) else {
            return None;
        };
        let leaf = self.leaf(&leaf_segments)?;
        if leaf.direct > 0 || !leaf.child_paths.is_empty() || leaf.native.subscriber_count() > 0 {
            return None;
        }
        self.take_leaf(&leaf_segments).map(|leaf| leaf.native)
    }

    /// Remove the leaf at `segments` because its watcher is stopping.
    ///
    /// A leaf without adopted claims is deleted along with now-empty
    /// ancestors. Otherwise the leaf is split: coverage is recreated per
    /// claimed child path (shortest first, so a nested child reuses its new
    /// parent), carrying each path's claim count, and the stopping
    /// watcher's consumers are told to reattach. Returns the attachments
    /// created by the split so the caller can start them.
    pub fn remove(&mut self, segments: &[OsString], create: CreateNative) -> Vec<Attachment> {
        let Some(leaf) = self.take_leaf(segments) else {
            return Vec::new();
        };
        if leaf.child_paths.is_empty() {
            return Vec::new();
        }

        let mut children: Vec<(&Segments, usize)> =
            leaf.child_paths.iter().map(|(p, c)| (p, *c)).collect();
        children.sort_unstable_by(|a, b| a.0.len().cmp(&b.0.len()).then_with(|| a.0.cmp(b.0)));

        let mut created = Vec::new();
        for (child, count) in children {
            let mut full = leaf.segments.clone();
            full.extend(child.iter().cloned());
            let attachment = self.add_claims(&full, create, count);
            leaf.native
                .reattach_to(Arc::clone(&attachment.native), attachment.root.clone());
            created.push(attachment);
        }
        crate::debug_event!(
            "tree",
            "split",
            "{} into {} leaves",
            segments_path(segments).display(),
            created.len()
        );
        created
    }

    /// Remove the leaf at `segments` only if it still holds `native`.
    ///
    /// Used to roll back a claimed slot after a failed backend start; no
    /// split is performed because the watcher never delivered coverage.
    pub fn rollback(&mut self, segments: &[OsString], native: &Arc<NativeWatcher>) -> bool {
        let held = match self.leaf_mut(segments) {
            Some(leaf) => Arc::ptr_eq(&leaf.native, native),
            None => false,
        };
        if held {
            self.take_leaf(segments);
        }
        held
    }

    /// The watcher whose directory is an ancestor-or-equal of `segments`,
    /// if any, along with its root.
    pub fn covering(&self, segments: &[OsString]) -> Option<(Arc<NativeWatcher>, PathBuf)> {
        match self.lookup(segments) {
            Coverage::Parent { leaf_segments, .. } => {
                let leaf = self.leaf(&leaf_segments)?;
                Some((Arc::clone(&leaf.native), segments_path(&leaf_segments)))
            }
            _ => None,
        }
    }

    /// Whether `native` still holds the leaf at exactly `segments`.
    pub fn holds(&self, segments: &[OsString], native: &Arc<NativeWatcher>) -> bool {
        self.leaf(segments)
            .is_some_and(|leaf| Arc::ptr_eq(&leaf.native, native))
    }

    /// Remove and return every leaf. Used when live coverage migrates to a
    /// replacement service.
    pub fn drain_leaves(&mut self) -> Vec<LeafNode> {
        let mut paths = Vec::new();
        collect_leaves(&self.root, &mut paths);
        paths
            .into_iter()
            .filter_map(|segments| self.take_leaf(&segments))
            .collect()
    }

    pub fn leaf_count(&self) -> usize {
        let mut paths = Vec::new();
        collect_leaves(&self.root, &mut paths);
        paths.len()
    }

    fn lookup(&self, segments: &[OsString]) -> Coverage {
        let mut node = &self.root;
        let mut depth = 0;
        loop {
            match node {
                Node::Leaf(leaf) => {
                    return Coverage::Parent {
                        leaf_segments: leaf.segments.clone(),
                        remainder: segments[depth..].to_vec(),
                    };
                }
                Node::Branch(children) => {
                    if depth == segments.len() {
                        let mut leaves = Vec::new();
                        collect_leaves(node, &mut leaves);
                        return if leaves.is_empty() {
                            Coverage::Missing
                        } else {
                            Coverage::Children(leaves)
                        };
                    }
                    match children.get(&segments[depth]) {
                        Some(child) => {
                            node = child;
                            depth += 1;
                        }
                        None => return Coverage::Missing,
                    }
                }
            }
        }
    }

    fn leaf(&self, segments: &[OsString]) -> Option<&LeafNode> {
        let mut node = &self.root;
        for segment in segments {
            match node {
                Node::Branch(children) => node = children.get(segment)?,
                Node::Leaf(_) => return None,
            }
        }
        match node {
            Node::Leaf(leaf) => Some(leaf),
            Node::Branch(_) => None,
        }
    }

    fn leaf_mut(&mut self, segments: &[OsString]) -> Option<&mut LeafNode> {
        let mut node = &mut self.root;
        for segment in segments {
            match node {
                Node::Branch(children) => node = children.get_mut(segment)?,
                Node::Leaf(_) => return None,
            }
        }
        match node {
            Node::Leaf(leaf) => Some(leaf),
            Node::Branch(_) => None,
        }
    }

    fn insert_leaf(&mut self, leaf: LeafNode) {
        let segments = leaf.segments.clone();
        let mut node = &mut self.root;
        for segment in &segments {
            let Node::Branch(children) = node else {
                // Never descends through a leaf: callers clear the region
                // before inserting.
                return;
            };
            node = children
                .entry(segment.clone())
                .or_insert_with(|| Node::Branch(HashMap::new()));
        }
        *node = Node::Leaf(leaf);
    }

    /// Detach the leaf at `segments`, pruning emptied ancestors.
    fn take_leaf(&mut self, segments: &[OsString]) -> Option<LeafNode> {
        fn recurse(node: &mut Node, segments: &[OsString]) -> (Option<LeafNode>, bool) {
            if segments.is_empty() {
                if matches!(node, Node::Leaf(_)) {
                    let taken = std::mem::replace(node, Node::Branch(HashMap::new()));
                    if let Node::Leaf(leaf) = taken {
                        return (Some(leaf), true);
                    }
                }
                return (None, false);
            }
            let Node::Branch(children) = node else {
                return (None, false);
            };
            let (head, rest) = (&segments[0], &segments[1..]);
            let Some(child) = children.get_mut(head) else {
                return (None, false);
            };
            let (taken, emptied) = recurse(child, rest);
            if emptied {
                children.remove(head);
            }
            (taken, children.is_empty())
        }

        recurse(&mut self.root, segments).0
    }
}

fn collect_leaves(node: &Node, out: &mut Vec<Segments>) {
    match node {
        Node::Leaf(leaf) => out.push(leaf.segments.clone()),
        Node::Branch(children) => {
            for child in children.values() {
                collect_leaves(child, out);
            }
        }
    }
}

impl fmt::Display for RegistryTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn render(node: &Node, indent: usize, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            match node {
                Node::Leaf(leaf) => {
                    writeln!(
                        f,
                        "{:indent$}[watched {} ({} adopted)]",
                        "",
                        segments_path(&leaf.segments).display(),
                        leaf.child_paths.len(),
                    )
                }
                Node::Branch(children) => {
                    let mut names: Vec<_> = children.keys().collect();
                    names.sort();
                    for name in names {
                        writeln!(f, "{:indent$}{}", "", name.to_string_lossy())?;
                        render(&children[name], indent + 2, f)?;
                    }
                    Ok(())
                }
            }
        }
        render(&self.root, 0, f)
    }
}
