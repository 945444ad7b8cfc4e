//! File tree mounted into a fresh sandbox and the entries returned by listings.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Directory contents keyed by entry name.
///
/// Serializes to the nested `{"name": {"file": {"contents": ..}}}` /
/// `{"name": {"directory": {..}}}` shape sandbox mount APIs accept.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileTree {
    entries: BTreeMap<String, FileNode>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileNode {
    File { contents: String },
    Directory(FileTree),
}

impl FileTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(mut self, name: impl Into<String>, contents: impl Into<String>) -> Self {
        self.entries.insert(
            name.into(),
            FileNode::File {
                contents: contents.into(),
            },
        );
        self
    }

    pub fn with_directory(mut self, name: impl Into<String>, tree: FileTree) -> Self {
        self.entries.insert(name.into(), FileNode::Directory(tree));
        self
    }

    pub fn get(&self, name: &str) -> Option<&FileNode> {
        self.entries.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &FileNode)> {
        self.entries
            .iter()
            .map(|(name, node)| (name.as_str(), node))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Top-level entries in the shape a root listing would report them.
    pub fn root_entries(&self) -> Vec<DirEntry> {
        self.iter()
            .map(|(name, node)| DirEntry {
                name: name.to_owned(),
                is_directory: matches!(node, FileNode::Directory(_)),
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    pub name: String,
    pub is_directory: bool,
}

impl DirEntry {
    pub fn file(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            is_directory: false,
        }
    }

    pub fn directory(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            is_directory: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RemoveOptions {
    pub recursive: bool,
}
