use serde::{Deserialize, Serialize};

use crate::snapshot::Attributes;

/// extended attribute (name + value)
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Xattr {
    pub name: String,
    pub value: Vec<u8>,
}

impl Xattr {
    pub fn new(name: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// diff entry change kind
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChangeKind {
    Added,
    Modified,
    Removed,
}

impl std::fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChangeKind::Added => write!(f, "A"),
            ChangeKind::Modified => write!(f, "M"),
            ChangeKind::Removed => write!(f, "D"),
        }
    }
}

/// one classified change of the live rootfs relative to the baseline
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DiffEntry {
    /// path relative to the rootfs, '/' separated, no leading slash
    pub path: String,
    pub kind: ChangeKind,
    /// current attributes; None for removed paths
    pub attrs: Option<Attributes>,
}

impl DiffEntry {
    pub fn added(path: impl Into<String>, attrs: Attributes) -> Self {
        Self {
            path: path.into(),
            kind: ChangeKind::Added,
            attrs: Some(attrs),
        }
    }

    pub fn modified(path: impl Into<String>, attrs: Attributes) -> Self {
        Self {
            path: path.into(),
            kind: ChangeKind::Modified,
            attrs: Some(attrs),
        }
    }

    pub fn removed(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            kind: ChangeKind::Removed,
            attrs: None,
        }
    }
}

impl std::fmt::Display for DiffEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} /{}", self.kind, self.path)
    }
}
