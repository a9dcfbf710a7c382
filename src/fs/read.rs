use std::fs::{self, Metadata};
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::Path;

use nix::libc;
use serde::{Deserialize, Serialize};

use crate::error::{Error, IoResultExt, Result};
use crate::snapshot::AttrCaps;
use crate::types::Xattr;

/// file type enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileType {
    Regular,
    Directory,
    Symlink,
    BlockDevice,
    CharDevice,
    Fifo,
    Socket,
}

impl FileType {
    /// detect file type from metadata
    pub fn from_metadata(meta: &Metadata) -> Self {
        let ft = meta.file_type();
        if ft.is_dir() {
            FileType::Directory
        } else if ft.is_symlink() {
            FileType::Symlink
        } else if ft.is_block_device() {
            FileType::BlockDevice
        } else if ft.is_char_device() {
            FileType::CharDevice
        } else if ft.is_fifo() {
            FileType::Fifo
        } else if ft.is_socket() {
            FileType::Socket
        } else {
            FileType::Regular
        }
    }
}

/// metadata for a filesystem entry
#[derive(Debug, Clone)]
pub struct FileMetadata {
    pub file_type: FileType,
    pub uid: u32,
    pub gid: u32,
    /// permission bits including setuid/setgid/sticky
    pub mode: u32,
    pub size: u64,
    /// modification time, whole seconds
    pub mtime: i64,
    /// device major/minor for block/char devices
    pub rdev: Option<(u32, u32)>,
    /// inode number (for hardlink detection)
    pub ino: u64,
    /// device id (for hardlink detection)
    pub dev: u64,
    /// number of hard links
    pub nlink: u64,
}

impl FileMetadata {
    /// read metadata from path (does not follow symlinks)
    pub fn from_path(path: &Path) -> Result<Self> {
        let meta = fs::symlink_metadata(path).with_path(path)?;
        Ok(Self::from_std_metadata(&meta))
    }

    /// create from std::fs::Metadata
    pub fn from_std_metadata(meta: &Metadata) -> Self {
        let rdev = if meta.file_type().is_block_device() || meta.file_type().is_char_device() {
            let rdev = meta.rdev();
            Some((
                nix::sys::stat::major(rdev) as u32,
                nix::sys::stat::minor(rdev) as u32,
            ))
        } else {
            None
        };

        Self {
            file_type: FileType::from_metadata(meta),
            uid: meta.uid(),
            gid: meta.gid(),
            mode: meta.mode() & 0o7777,
            size: meta.len(),
            mtime: meta.mtime(),
            rdev,
            ino: meta.ino(),
            dev: meta.dev(),
            nlink: meta.nlink(),
        }
    }

    /// check if this could be a hardlink (nlink > 1 for regular files)
    pub fn could_be_hardlink(&self) -> bool {
        self.file_type == FileType::Regular && self.nlink > 1
    }
}

/// read the extended attributes `caps` can observe, sorted by name
///
/// names outside the caps are never fetched. any failure to read a value
/// other than the attribute vanishing is an error.
pub fn read_xattrs(path: &Path, caps: &AttrCaps) -> Result<Vec<Xattr>> {
    let mut xattrs = Vec::new();

    let names: Vec<String> = match xattr::list(path) {
        Ok(iter) => iter.map(|n| n.to_string_lossy().into_owned()).collect(),
        Err(e) => {
            // no xattr support or no xattrs, not an error
            if e.raw_os_error() == Some(libc::ENOTSUP)
                || e.raw_os_error() == Some(libc::ENODATA)
                || e.raw_os_error() == Some(libc::EOPNOTSUPP)
            {
                return Ok(vec![]);
            }
            return Err(Error::Xattr {
                path: path.to_path_buf(),
                message: format!("failed to list: {}", e),
            });
        }
    };

    for name in names.into_iter().filter(|n| caps.observes_xattr(n)) {
        match xattr::get(path, &name) {
            Ok(Some(value)) => xattrs.push(Xattr::new(name, value)),
            // removed between list and get
            Ok(None) => {}
            Err(e) if e.raw_os_error() == Some(libc::ENODATA) => {}
            Err(e) => {
                return Err(Error::Xattr {
                    path: path.to_path_buf(),
                    message: format!("failed to read {}: {}", name, e),
                });
            }
        }
    }

    xattrs.sort_by(|a, b| a.name.cmp(&b.name));

    Ok(xattrs)
}

/// read symlink target
pub fn read_symlink_target(path: &Path) -> Result<String> {
    let target = fs::read_link(path).with_path(path)?;
    target
        .into_os_string()
        .into_string()
        .map_err(|_| Error::NonUtf8Path(path.to_path_buf()))
}
