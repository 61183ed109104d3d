// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Append-only conversation tree and its newline-delimited JSON persistence.
//!
//! The live representation is an in-memory tree of [`PathNode`]s reachable
//! from a leaf pointer; `get_path` walks leaf-to-root and reverses. Every
//! mutation is also appended to disk as one JSONL record so a crashed
//! session can be replayed from the file alone.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::collections::HashMap;

use anyhow::Context;
use opal_model::Message;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type NodeId = String;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathNode {
    pub id: NodeId,
    pub parent_id: Option<NodeId>,
    pub message: Message,
}

/// One persisted mutation, replayed in order on load.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum PathRecord {
    Append { id: NodeId, parent_id: Option<NodeId>, message: Message },
    Replace { remove_ids: Vec<NodeId>, replacement: PathNode },
}

/// An append-only conversation tree with a single live leaf.
pub struct PathStore {
    nodes: HashMap<NodeId, PathNode>,
    leaf: Option<NodeId>,
    persist_path: Option<PathBuf>,
}

impl PathStore {
    pub fn new() -> Self {
        Self { nodes: HashMap::new(), leaf: None, persist_path: None }
    }

    /// Create an in-memory-only store that also persists every mutation to
    /// `path` (created if absent, appended to otherwise).
    pub fn with_persistence(path: impl Into<PathBuf>) -> Self {
        Self { nodes: HashMap::new(), leaf: None, persist_path: Some(path.into()) }
    }

    /// Replay a session file from disk, discarding a trailing incomplete
    /// record (the "crash after fsync" model — a partial last line is not an
    /// error, just dropped).
    pub fn load_from(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        let mut store = Self { nodes: HashMap::new(), leaf: None, persist_path: Some(path.clone()) };
        if !path.exists() {
            return Ok(store);
        }
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("reading session file {}", path.display()))?;
        let mut lines = content.lines().peekable();
        while let Some(line) = lines.next() {
            if line.trim().is_empty() {
                continue;
            }
            let is_last = lines.peek().is_none();
            match serde_json::from_str::<PathRecord>(line) {
                Ok(record) => store.apply_record(record),
                Err(_) if is_last => break, // truncated trailing record: discard
                Err(e) => return Err(e).context("parsing session file record"),
            }
        }
        Ok(store)
    }

    fn apply_record(&mut self, record: PathRecord) {
        match record {
            PathRecord::Append { id, parent_id, message } => {
                let was_leaf = parent_id == self.leaf;
                self.nodes.insert(id.clone(), PathNode { id: id.clone(), parent_id, message });
                if was_leaf || self.leaf.is_none() {
                    self.leaf = Some(id);
                }
            }
            PathRecord::Replace { remove_ids, replacement } => {
                let leaf_removed = self.leaf.as_ref().map(|l| remove_ids.contains(l)).unwrap_or(false);
                for id in &remove_ids {
                    self.nodes.remove(id);
                }
                for node in self.nodes.values_mut() {
                    if let Some(p) = &node.parent_id {
                        if remove_ids.contains(p) {
                            node.parent_id = Some(replacement.id.clone());
                        }
                    }
                }
                self.nodes.insert(replacement.id.clone(), replacement.clone());
                if leaf_removed {
                    self.leaf = Some(replacement.id);
                }
            }
        }
    }

    fn persist(&mut self, record: PathRecord) -> anyhow::Result<()> {
        let Some(path) = self.persist_path.clone() else { return Ok(()) };
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("opening session file {}", path.display()))?;
        let line = serde_json::to_string(&record).context("serializing session record")?;
        writeln!(file, "{line}").with_context(|| format!("writing session file {}", path.display()))?;
        Ok(())
    }

    /// Append a message as a child of `parent_id` (or of the current leaf, if
    /// `None`). Sets the leaf pointer to the new node when it extends the
    /// current leaf. Returns the new node's id.
    pub fn append(&mut self, parent_id: Option<NodeId>, message: Message) -> anyhow::Result<NodeId> {
        let parent = parent_id.or_else(|| self.leaf.clone());
        if let Some(p) = &parent {
            anyhow::ensure!(self.nodes.contains_key(p), "append: parent {p} does not exist");
        }
        let id = Uuid::new_v4().to_string();
        let becomes_leaf = parent == self.leaf || self.leaf.is_none();
        self.nodes.insert(id.clone(), PathNode { id: id.clone(), parent_id: parent.clone(), message: message.clone() });
        if becomes_leaf {
            self.leaf = Some(id.clone());
        }
        self.persist(PathRecord::Append { id: id.clone(), parent_id: parent, message })?;
        Ok(id)
    }

    /// Node ids from root to leaf, in path order.
    fn path_ids(&self) -> Vec<NodeId> {
        let mut ids = Vec::new();
        let mut cur = self.leaf.clone();
        while let Some(id) = cur {
            let Some(node) = self.nodes.get(&id) else { break };
            cur = node.parent_id.clone();
            ids.push(id);
        }
        ids.reverse();
        ids
    }

    /// Walk from the leaf to the root and reverse, returning the live
    /// conversation in chronological order.
    pub fn get_path(&self) -> Vec<Message> {
        self.path_ids()
            .into_iter()
            .filter_map(|id| self.nodes.get(&id).map(|n| n.message.clone()))
            .collect()
    }

    /// Replace a contiguous root-ward prefix of the current path with a
    /// single `replacement` message (used by compaction to fold the oldest
    /// messages into one summary while leaving the recent tail untouched).
    /// Returns the replacement node's id.
    pub fn replace_path_segment(
        &mut self,
        ids_to_remove: &[NodeId],
        replacement: Message,
    ) -> anyhow::Result<NodeId> {
        if ids_to_remove.is_empty() {
            anyhow::bail!("replace_path_segment: ids_to_remove must be non-empty");
        }
        let path_ids = self.path_ids();
        anyhow::ensure!(
            ids_to_remove.len() <= path_ids.len() && path_ids[..ids_to_remove.len()] == *ids_to_remove,
            "replace_path_segment: ids_to_remove is not a contiguous prefix of the current path"
        );

        let prefix_parent = self.nodes.get(&path_ids[0]).and_then(|n| n.parent_id.clone());
        let new_id = Uuid::new_v4().to_string();
        let new_node = PathNode { id: new_id.clone(), parent_id: prefix_parent, message: replacement };

        for id in ids_to_remove {
            self.nodes.remove(id);
        }
        self.nodes.insert(new_id.clone(), new_node.clone());

        if let Some(next_id) = path_ids.get(ids_to_remove.len()) {
            if let Some(next_node) = self.nodes.get_mut(next_id) {
                next_node.parent_id = Some(new_id.clone());
            }
        } else {
            // The whole path was replaced; the new node is the leaf.
            self.leaf = Some(new_id.clone());
        }

        self.persist(PathRecord::Replace {
            remove_ids: ids_to_remove.to_vec(),
            replacement: new_node,
        })?;
        Ok(new_id)
    }

    pub fn is_empty(&self) -> bool {
        self.leaf.is_none()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }
}

impl Default for PathStore {
    fn default() -> Self {
        Self::new()
    }
}
