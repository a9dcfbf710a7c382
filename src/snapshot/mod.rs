//! baseline snapshots of a rootfs
//!
//! a snapshot records, for every path below a rootfs, the attributes named by
//! its keyword set. entries are kept in depth-first order with siblings
//! sorted bytewise, the same order a sorted directory walk produces, so a
//! snapshot and a live tree can be compared with a single merge pass.
//!
//! on disk a snapshot is CBOR, zstd compressed, stored next to the bundle
//! as `sha256_<hex>.snapshot` after the manifest it was unpacked from.

mod attrs;

use std::cmp::Ordering;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

use crate::cancel::CancelToken;
use crate::digest::Digest;
use crate::error::{Error, IoResultExt, Result};

pub use attrs::{AttrCaps, Attributes, Keyword, KeywordSet};

/// current on-disk format version
pub const SNAPSHOT_VERSION: u32 = 1;

/// file name suffix of snapshot files
pub const SNAPSHOT_SUFFIX: &str = ".snapshot";

/// one recorded path
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotEntry {
    /// path relative to the rootfs, '/' separated
    pub path: String,
    pub attrs: Attributes,
}

/// recorded filesystem tree used as the diff baseline
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub version: u32,
    pub keywords: KeywordSet,
    entries: Vec<SnapshotEntry>,
}

impl Snapshot {
    /// build a snapshot from entries in any order
    pub fn new(keywords: KeywordSet, mut entries: Vec<SnapshotEntry>) -> Self {
        entries.sort_by(|a, b| path_cmp(&a.path, &b.path));
        Self {
            version: SNAPSHOT_VERSION,
            keywords,
            entries,
        }
    }

    /// record the current state of a rootfs
    pub fn capture(
        rootfs: &Path,
        keywords: &KeywordSet,
        caps: &AttrCaps,
        cancel: &CancelToken,
    ) -> Result<Self> {
        let keywords = caps.effective(keywords);
        let mut entries = Vec::new();

        for live in walk_rootfs(rootfs) {
            cancel.check()?;
            let live = live?;
            let attrs = Attributes::read(&live.full_path, &keywords, caps)?;
            entries.push(SnapshotEntry {
                path: live.path,
                attrs,
            });
        }

        tracing::debug!(rootfs = %rootfs.display(), entries = entries.len(), "captured snapshot");

        // the walk is already in path order
        Ok(Self {
            version: SNAPSHOT_VERSION,
            keywords,
            entries,
        })
    }

    /// entries in path order
    pub fn entries(&self) -> &[SnapshotEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// snapshot file name for a bundle unpacked from `manifest`
    pub fn file_name(manifest: &Digest) -> String {
        format!("{}{}", manifest.to_file_stem(), SNAPSHOT_SUFFIX)
    }

    /// read a snapshot file
    pub fn read(path: &Path) -> Result<Self> {
        let compressed = fs::read(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::NoSnapshot(path.to_path_buf())
            } else {
                Error::Io {
                    path: path.to_path_buf(),
                    source: e,
                }
            }
        })?;

        let cbor = zstd::decode_all(&compressed[..]).with_path(path)?;
        let mut snapshot: Snapshot = ciborium::from_reader(&cbor[..])?;

        if snapshot.version != SNAPSHOT_VERSION {
            return Err(Error::SnapshotVersion(snapshot.version));
        }

        // files written by other tools may not be ordered
        snapshot
            .entries
            .sort_by(|a, b| path_cmp(&a.path, &b.path));

        Ok(snapshot)
    }

    /// write a snapshot file atomically
    pub fn write(&self, path: &Path) -> Result<()> {
        let mut cbor = Vec::new();
        ciborium::into_writer(self, &mut cbor)?;

        let compressed = zstd::encode_all(&cbor[..], 3).with_path(path)?;

        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        let tmp_path = dir.join(format!(".snapshot-{}", uuid::Uuid::new_v4()));
        {
            let mut tmp_file = File::create(&tmp_path).with_path(&tmp_path)?;
            tmp_file.write_all(&compressed).with_path(&tmp_path)?;
            tmp_file.sync_all().with_path(&tmp_path)?;
        }
        fs::rename(&tmp_path, path).with_path(path)?;

        Ok(())
    }
}

/// order paths depth-first, siblings bytewise
///
/// compares component by component, so `a/b` sorts before `a.txt` even
/// though `/` > `.` bytewise.
pub fn path_cmp(a: &str, b: &str) -> Ordering {
    a.split('/').cmp(b.split('/'))
}

/// is `path` strictly below `dir`
pub fn is_descendant(path: &str, dir: &str) -> bool {
    path.len() > dir.len() && path.starts_with(dir) && path.as_bytes()[dir.len()] == b'/'
}

/// a path found while walking a live rootfs
#[derive(Debug, Clone)]
pub(crate) struct LiveEntry {
    /// relative, '/' separated
    pub path: String,
    pub full_path: PathBuf,
}

/// walk a rootfs in path order without following symlinks
///
/// the rootfs directory itself is not yielded.
pub(crate) fn walk_rootfs(rootfs: &Path) -> impl Iterator<Item = Result<LiveEntry>> + '_ {
    WalkDir::new(rootfs)
        .min_depth(1)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .map(move |entry| {
            let entry = entry.map_err(|e| {
                let path = e.path().unwrap_or(rootfs).to_path_buf();
                Error::Io {
                    path,
                    source: e.into(),
                }
            })?;
            let rel = entry
                .path()
                .strip_prefix(rootfs)
                .map_err(|_| Error::InvalidEntryName(entry.path().display().to_string()))?;
            let path = rel
                .to_str()
                .ok_or_else(|| Error::NonUtf8Path(entry.path().to_path_buf()))?
                .to_string();
            Ok(LiveEntry {
                path,
                full_path: entry.into_path(),
            })
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::FileType;
    use std::os::unix::fs::symlink;
    use tempfile::tempdir;

    fn entry<'a>(snap: &'a Snapshot, path: &str) -> Option<&'a SnapshotEntry> {
        snap.entries().iter().find(|e| e.path == path)
    }

    fn sample_rootfs(dir: &Path) -> PathBuf {
        let rootfs = dir.join("rootfs");
        fs::create_dir_all(rootfs.join("etc")).unwrap();
        fs::create_dir_all(rootfs.join("var/log")).unwrap();
        fs::write(rootfs.join("etc/hostname"), "box\n").unwrap();
        fs::write(rootfs.join("var/log/x"), "log").unwrap();
        fs::write(rootfs.join("a.txt"), "a").unwrap();
        rootfs
    }

    #[test]
    fn test_path_cmp_is_depth_first() {
        let mut paths = vec!["a.txt", "a/b", "a", "b", "a/b/c", "a-b"];
        paths.sort_by(|a, b| path_cmp(a, b));
        assert_eq!(paths, vec!["a", "a/b", "a/b/c", "a-b", "a.txt", "b"]);
    }

    #[test]
    fn test_is_descendant() {
        assert!(is_descendant("var/log/x", "var/log"));
        assert!(is_descendant("var/log/x", "var"));
        assert!(!is_descendant("var/log", "var/log"));
        assert!(!is_descendant("var/logs", "var/log"));
    }

    #[test]
    fn test_capture_order_and_contents() {
        let dir = tempdir().unwrap();
        let rootfs = sample_rootfs(dir.path());

        let snap = Snapshot::capture(
            &rootfs,
            &KeywordSet::all(),
            &AttrCaps::privileged(),
            &CancelToken::new(),
        )
        .unwrap();

        let paths: Vec<_> = snap.entries().iter().map(|e| e.path.as_str()).collect();
        assert_eq!(
            paths,
            vec!["a.txt", "etc", "etc/hostname", "var", "var/log", "var/log/x"]
        );

        let hostname = entry(&snap, "etc/hostname").unwrap();
        assert_eq!(hostname.attrs.sha256, Some(Digest::sha256_of(b"box\n")));
        assert_eq!(entry(&snap, "var").unwrap().attrs.file_type, FileType::Directory);
        assert!(entry(&snap, "missing").is_none());
    }

    #[test]
    fn test_capture_does_not_follow_symlink_loops() {
        let dir = tempdir().unwrap();
        let rootfs = dir.path().join("rootfs");
        fs::create_dir_all(rootfs.join("d")).unwrap();
        symlink("..", rootfs.join("d/up")).unwrap();
        symlink("/", rootfs.join("root")).unwrap();

        let snap = Snapshot::capture(
            &rootfs,
            &KeywordSet::all(),
            &AttrCaps::privileged(),
            &CancelToken::new(),
        )
        .unwrap();
        assert_eq!(snap.len(), 3);
        assert_eq!(entry(&snap, "d/up").unwrap().attrs.link.as_deref(), Some(".."));
    }

    #[test]
    fn test_write_read_file() {
        let dir = tempdir().unwrap();
        let rootfs = sample_rootfs(dir.path());
        let snap = Snapshot::capture(
            &rootfs,
            &KeywordSet::all(),
            &AttrCaps::privileged(),
            &CancelToken::new(),
        )
        .unwrap();

        let path = dir.path().join(Snapshot::file_name(&Digest::sha256_of(b"manifest")));
        snap.write(&path).unwrap();
        assert!(path.to_string_lossy().ends_with(".snapshot"));
        assert!(path
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("sha256_"));

        let loaded = Snapshot::read(&path).unwrap();
        assert_eq!(loaded, snap);
    }

    #[test]
    fn test_read_missing_snapshot() {
        let dir = tempdir().unwrap();
        let result = Snapshot::read(&dir.path().join("nope.snapshot"));
        assert!(matches!(result, Err(Error::NoSnapshot(_))));
    }

    #[test]
    fn test_capture_cancelled() {
        let dir = tempdir().unwrap();
        let rootfs = sample_rootfs(dir.path());
        let cancel = CancelToken::new();
        cancel.cancel();

        let result = Snapshot::capture(&rootfs, &KeywordSet::all(), &AttrCaps::privileged(), &cancel);
        assert!(matches!(result, Err(Error::Cancelled)));
    }

    #[test]
    fn test_new_sorts_entries() {
        let entries = vec![
            SnapshotEntry {
                path: "b".into(),
                attrs: Attributes::of_type(FileType::Regular),
            },
            SnapshotEntry {
                path: "a/c".into(),
                attrs: Attributes::of_type(FileType::Regular),
            },
            SnapshotEntry {
                path: "a".into(),
                attrs: Attributes::of_type(FileType::Directory),
            },
        ];
        let snap = Snapshot::new(KeywordSet::all(), entries);
        let paths: Vec<_> = snap.entries().iter().map(|e| e.path.as_str()).collect();
        assert_eq!(paths, vec!["a", "a/c", "b"]);
    }

    #[test]
    fn test_non_utf8_name_is_rejected() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let dir = tempdir().unwrap();
        let rootfs = sample_rootfs(dir.path());
        let bad = rootfs.join(OsStr::from_bytes(b"caf\xe9"));
        fs::write(&bad, "x").unwrap();

        let err = Snapshot::capture(
            &rootfs,
            &KeywordSet::all(),
            &AttrCaps::privileged(),
            &CancelToken::new(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::NonUtf8Path(ref p) if p == &bad));
        assert!(err.to_string().contains("must be UTF-8"));
    }
}
