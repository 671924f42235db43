#![forbid(unsafe_code)]
//! Arena-backed virtual directory tree.
//!
//! Nodes are stored in a flat `Vec` and addressed by [`NodeId`]; directories
//! map child names to ids. The tree is immutable once built and is shared
//! between FUSE worker threads without locking.

use crate::decode::Subtree;
use crate::view::FileView;
use fmapfs_error::{FmapfsError, Result};
use fmapfs_types::NodeId;
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug)]
pub enum NodeKind {
    Directory(BTreeMap<String, NodeId>),
    File(Arc<dyn FileView>),
}

#[derive(Debug)]
pub struct Node {
    pub name: String,
    pub parent: NodeId,
    pub kind: NodeKind,
}

impl Node {
    #[must_use]
    pub fn is_dir(&self) -> bool {
        matches!(self.kind, NodeKind::Directory(_))
    }

    /// The file view, or `IsDirectory`.
    pub fn file(&self) -> Result<&Arc<dyn FileView>> {
        match &self.kind {
            NodeKind::File(view) => Ok(view),
            NodeKind::Directory(_) => Err(FmapfsError::IsDirectory),
        }
    }

    /// The child map, or `NotDirectory`.
    pub fn children(&self) -> Result<&BTreeMap<String, NodeId>> {
        match &self.kind {
            NodeKind::Directory(children) => Ok(children),
            NodeKind::File(_) => Err(FmapfsError::NotDirectory),
        }
    }
}

#[derive(Debug)]
pub struct Tree {
    nodes: Vec<Node>,
}

impl Tree {
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get(&self, id: NodeId) -> Result<&Node> {
        id.to_index()
            .and_then(|index| self.nodes.get(index))
            .ok_or_else(|| FmapfsError::NotFound(format!("node {id}")))
    }

    pub fn lookup_child(&self, parent: NodeId, name: &str) -> Result<NodeId> {
        self.get(parent)?
            .children()?
            .get(name)
            .copied()
            .ok_or_else(|| FmapfsError::NotFound(name.to_owned()))
    }

    /// Resolve a slash-separated path from the root. Empty components are
    /// ignored, so `"/areas//GBB/"` and `"areas/GBB"` are the same path.
    pub fn lookup_path(&self, path: &str) -> Result<NodeId> {
        path.split('/')
            .filter(|component| !component.is_empty())
            .try_fold(NodeId::ROOT, |dir, component| {
                self.lookup_child(dir, component)
            })
    }
}

/// Incremental constructor for a [`Tree`].
#[derive(Debug)]
pub struct TreeBuilder {
    nodes: Vec<Node>,
}

impl Default for TreeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl TreeBuilder {
    /// Start with an empty root directory.
    #[must_use]
    pub fn new() -> Self {
        Self {
            nodes: vec![Node {
                name: String::new(),
                parent: NodeId::ROOT,
                kind: NodeKind::Directory(BTreeMap::new()),
            }],
        }
    }

    /// Insert `kind` as `name` under `parent`. An existing entry of the same
    /// name is unlinked and replaced.
    fn insert(&mut self, parent: NodeId, name: &str, kind: NodeKind) -> Result<NodeId> {
        let id = NodeId::from_index(self.nodes.len());
        let slot = parent
            .to_index()
            .ok_or_else(|| FmapfsError::NotFound(format!("node {parent}")))?;
        match self.nodes.get_mut(slot).map(|node| &mut node.kind) {
            Some(NodeKind::Directory(children)) => {
                children.insert(name.to_owned(), id);
            }
            Some(NodeKind::File(_)) => return Err(FmapfsError::NotDirectory),
            None => return Err(FmapfsError::NotFound(format!("node {parent}"))),
        }
        self.nodes.push(Node {
            name: name.to_owned(),
            parent,
            kind,
        });
        Ok(id)
    }

    pub fn add_dir(&mut self, parent: NodeId, name: &str) -> Result<NodeId> {
        self.insert(parent, name, NodeKind::Directory(BTreeMap::new()))
    }

    pub fn add_file(
        &mut self,
        parent: NodeId,
        name: &str,
        view: Arc<dyn FileView>,
    ) -> Result<NodeId> {
        self.insert(parent, name, NodeKind::File(view))
    }

    /// Attach a decoder-produced subtree as `name` under `parent`.
    pub fn graft(&mut self, parent: NodeId, name: &str, subtree: Subtree) -> Result<NodeId> {
        match subtree {
            Subtree::File(view) => self.add_file(parent, name, view),
            Subtree::Dir(entries) => {
                let dir = self.add_dir(parent, name)?;
                for (child, entry) in entries {
                    self.graft(dir, &child, entry)?;
                }
                Ok(dir)
            }
        }
    }

    #[must_use]
    pub fn finish(self) -> Tree {
        Tree { nodes: self.nodes }
    }
}
