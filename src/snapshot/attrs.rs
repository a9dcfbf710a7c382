use std::collections::BTreeSet;
use std::fs::File;
use std::io;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::digest::{Digest, DigestWriter};
use crate::error::{IoResultExt, Result};
use crate::fs::{read_symlink_target, read_xattrs, FileMetadata, FileType};
use crate::types::Xattr;

/// a tracked attribute of a path
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Keyword {
    #[serde(rename = "type")]
    Type,
    #[serde(rename = "mode")]
    Mode,
    #[serde(rename = "uid")]
    Uid,
    #[serde(rename = "gid")]
    Gid,
    #[serde(rename = "size")]
    Size,
    #[serde(rename = "sha256digest")]
    Sha256Digest,
    #[serde(rename = "link")]
    Link,
    #[serde(rename = "device")]
    Device,
    #[serde(rename = "xattr")]
    Xattrs,
}

impl Keyword {
    pub const ALL: [Keyword; 9] = [
        Keyword::Type,
        Keyword::Mode,
        Keyword::Uid,
        Keyword::Gid,
        Keyword::Size,
        Keyword::Sha256Digest,
        Keyword::Link,
        Keyword::Device,
        Keyword::Xattrs,
    ];
}

/// set of tracked attributes; `type` is always a member
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeywordSet(BTreeSet<Keyword>);

impl KeywordSet {
    /// every keyword this crate knows how to read
    pub fn all() -> Self {
        Self(Keyword::ALL.into_iter().collect())
    }

    pub fn contains(&self, keyword: Keyword) -> bool {
        self.0.contains(&keyword)
    }

    pub fn intersect(&self, other: &KeywordSet) -> KeywordSet {
        let mut set: BTreeSet<_> = self.0.intersection(&other.0).copied().collect();
        set.insert(Keyword::Type);
        Self(set)
    }

    pub fn without(&self, keyword: Keyword) -> KeywordSet {
        if keyword == Keyword::Type {
            return self.clone();
        }
        let mut set = self.0.clone();
        set.remove(&keyword);
        Self(set)
    }

    pub fn iter(&self) -> impl Iterator<Item = Keyword> + '_ {
        self.0.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Default for KeywordSet {
    fn default() -> Self {
        Self::all()
    }
}

impl FromIterator<Keyword> for KeywordSet {
    fn from_iter<I: IntoIterator<Item = Keyword>>(iter: I) -> Self {
        let mut set: BTreeSet<_> = iter.into_iter().collect();
        set.insert(Keyword::Type);
        Self(set)
    }
}

/// attributes the current privilege mode can faithfully observe
///
/// computed once from the rootless flag and applied on both sides of a
/// comparison.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AttrCaps {
    readable: KeywordSet,
    user_xattrs_only: bool,
}

impl AttrCaps {
    pub fn privileged() -> Self {
        Self {
            readable: KeywordSet::all(),
            user_xattrs_only: false,
        }
    }

    /// ownership can't be set without privileges, and only `user.` xattrs
    /// are readable and writable
    pub fn rootless() -> Self {
        Self {
            readable: KeywordSet::all()
                .without(Keyword::Uid)
                .without(Keyword::Gid),
            user_xattrs_only: true,
        }
    }

    pub fn for_rootless(rootless: bool) -> Self {
        if rootless {
            Self::rootless()
        } else {
            Self::privileged()
        }
    }

    /// restrict a requested keyword set to what is observable
    pub fn effective(&self, requested: &KeywordSet) -> KeywordSet {
        requested.intersect(&self.readable)
    }

    /// whether an xattr with this name can be read in this mode
    pub fn observes_xattr(&self, name: &str) -> bool {
        !self.user_xattrs_only || name.starts_with("user.")
    }

    pub fn filter_xattrs(&self, mut xattrs: Vec<Xattr>) -> Vec<Xattr> {
        xattrs.retain(|x| self.observes_xattr(&x.name));
        xattrs
    }

    /// drop what this mode can't observe from recorded attributes
    pub fn restrict(&self, attrs: &Attributes) -> Attributes {
        let mut attrs = attrs.clone();
        if !self.readable.contains(Keyword::Uid) {
            attrs.uid = None;
        }
        if !self.readable.contains(Keyword::Gid) {
            attrs.gid = None;
        }
        if let Some(xattrs) = attrs.xattrs.take() {
            attrs.xattrs = Some(self.filter_xattrs(xattrs));
        }
        attrs
    }
}

/// recorded attributes of one path
///
/// fields are only populated for keywords that were requested and apply to
/// the file type.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attributes {
    #[serde(rename = "type")]
    pub file_type: FileType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<Digest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<(u32, u32)>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub xattrs: Option<Vec<Xattr>>,
}

impl Attributes {
    /// bare attributes carrying only the type
    pub fn of_type(file_type: FileType) -> Self {
        Self {
            file_type,
            mode: None,
            uid: None,
            gid: None,
            size: None,
            sha256: None,
            link: None,
            device: None,
            xattrs: None,
        }
    }

    /// read attributes of a live path (symlinks are not followed)
    pub fn read(path: &Path, keywords: &KeywordSet, caps: &AttrCaps) -> Result<Self> {
        let keywords = caps.effective(keywords);
        let meta = FileMetadata::from_path(path)?;
        let mut attrs = Self::of_type(meta.file_type);

        if keywords.contains(Keyword::Mode) {
            attrs.mode = Some(meta.mode);
        }
        if keywords.contains(Keyword::Uid) {
            attrs.uid = Some(meta.uid);
        }
        if keywords.contains(Keyword::Gid) {
            attrs.gid = Some(meta.gid);
        }

        match meta.file_type {
            FileType::Regular => {
                if keywords.contains(Keyword::Size) {
                    attrs.size = Some(meta.size);
                }
                if keywords.contains(Keyword::Sha256Digest) {
                    attrs.sha256 = Some(hash_file(path)?);
                }
            }
            FileType::Symlink => {
                if keywords.contains(Keyword::Link) {
                    attrs.link = Some(read_symlink_target(path)?);
                }
            }
            FileType::BlockDevice | FileType::CharDevice => {
                if keywords.contains(Keyword::Device) {
                    attrs.device = meta.rdev;
                }
            }
            _ => {}
        }

        // symlink xattrs are not portable across filesystems
        if keywords.contains(Keyword::Xattrs) && meta.file_type != FileType::Symlink {
            attrs.xattrs = Some(read_xattrs(path, caps)?);
        }

        Ok(attrs)
    }

    /// keywords whose values differ between `self` and `other`
    ///
    /// a keyword is only compared when it is in `keywords` and both sides
    /// recorded it. the type is always compared.
    pub fn differences(&self, other: &Attributes, keywords: &KeywordSet) -> Vec<Keyword> {
        fn differs<T: PartialEq>(a: &Option<T>, b: &Option<T>) -> bool {
            matches!((a, b), (Some(a), Some(b)) if a != b)
        }

        let mut out = Vec::new();
        if self.file_type != other.file_type {
            out.push(Keyword::Type);
        }
        for keyword in keywords.iter() {
            let changed = match keyword {
                Keyword::Type => false,
                Keyword::Mode => differs(&self.mode, &other.mode),
                Keyword::Uid => differs(&self.uid, &other.uid),
                Keyword::Gid => differs(&self.gid, &other.gid),
                Keyword::Size => differs(&self.size, &other.size),
                Keyword::Sha256Digest => differs(&self.sha256, &other.sha256),
                Keyword::Link => differs(&self.link, &other.link),
                Keyword::Device => differs(&self.device, &other.device),
                Keyword::Xattrs => differs(&self.xattrs, &other.xattrs),
            };
            if changed {
                out.push(keyword);
            }
        }
        out
    }
}

/// sha256 of a file's content, streamed
fn hash_file(path: &Path) -> Result<Digest> {
    let mut file = File::open(path).with_path(path)?;
    let mut writer = DigestWriter::new(io::sink());
    io::copy(&mut file, &mut writer).with_path(path)?;
    let (_, digest, _) = writer.finish();
    Ok(digest)
}
