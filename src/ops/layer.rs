use std::fs::File;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::thread::{self, JoinHandle};

use tar::{EntryType, Header};

use crate::cancel::CancelToken;
use crate::digest::{Digest, DigestWriter};
use crate::error::{Error, IoResultExt, Result};
use crate::fs::{read_symlink_target, read_xattrs, FileMetadata, FileType, HardlinkTracker};
use crate::namespace::MapOptions;
use crate::snapshot::AttrCaps;
use crate::types::{ChangeKind, DiffEntry};

/// name prefix marking a path as deleted in a layer
pub const WHITEOUT_PREFIX: &str = ".wh.";

/// what went into a layer
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LayerSummary {
    /// sha256 of the uncompressed tar
    pub diff_id: Digest,
    /// uncompressed size
    pub size: u64,
    /// content records written
    pub entries: usize,
    /// whiteout records written
    pub whiteouts: usize,
}

/// `dir/.wh.name` for `dir/name`
pub fn whiteout_path(path: &str) -> String {
    match path.rsplit_once('/') {
        Some((parent, name)) => format!("{}/{}{}", parent, WHITEOUT_PREFIX, name),
        None => format!("{}{}", WHITEOUT_PREFIX, path),
    }
}

/// write the tar encoding of `diffs` to `writer`
///
/// removed paths become whiteouts, everything else is read from the live
/// rootfs. ownership is translated to container ids through `map`. the
/// output only depends on the diff list, the tree contents and `map`.
pub fn write_layer<W: Write>(
    rootfs: &Path,
    diffs: &[DiffEntry],
    map: &MapOptions,
    writer: W,
    cancel: &CancelToken,
) -> Result<LayerSummary> {
    let caps = AttrCaps::for_rootless(map.rootless);
    let mut builder = tar::Builder::new(DigestWriter::new(writer));
    let mut hardlinks = HardlinkTracker::new();
    let mut entries = 0;
    let mut whiteouts = 0;

    for diff in diffs {
        cancel.check()?;

        match diff.kind {
            ChangeKind::Removed => {
                append_whiteout(&mut builder, &diff.path)?;
                whiteouts += 1;
            }
            ChangeKind::Added | ChangeKind::Modified => {
                let full_path = rootfs.join(&diff.path);
                if append_path(&mut builder, &full_path, &diff.path, map, &caps, &mut hardlinks)? {
                    entries += 1;
                }
            }
        }
    }

    let writer = builder.into_inner().map_err(Error::LayerStream)?;
    let (mut inner, diff_id, size) = writer.finish();
    inner.flush().map_err(Error::LayerStream)?;

    tracing::debug!(%diff_id, size, entries, whiteouts, "wrote layer");

    Ok(LayerSummary {
        diff_id,
        size,
        entries,
        whiteouts,
    })
}

fn append_whiteout<W: Write>(builder: &mut tar::Builder<W>, path: &str) -> Result<()> {
    let mut header = Header::new_gnu();
    header.set_entry_type(EntryType::Regular);
    header.set_size(0);
    header.set_mode(0);
    header.set_uid(0);
    header.set_gid(0);
    header.set_mtime(0);

    builder
        .append_data(&mut header, whiteout_path(path), io::empty())
        .map_err(Error::LayerStream)
}

/// append one live path, returns false if the type can't be archived
fn append_path<W: Write>(
    builder: &mut tar::Builder<W>,
    full_path: &Path,
    path: &str,
    map: &MapOptions,
    caps: &AttrCaps,
    hardlinks: &mut HardlinkTracker,
) -> Result<bool> {
    let meta = FileMetadata::from_path(full_path)?;

    if meta.file_type == FileType::Socket {
        tracing::warn!(path, "skipping socket, not representable in a layer");
        return Ok(false);
    }

    let mut header = Header::new_gnu();
    header.set_mode(meta.mode);
    header.set_uid(map.uid_to_container(meta.uid)? as u64);
    header.set_gid(map.gid_to_container(meta.gid)? as u64);
    header.set_mtime(meta.mtime.max(0) as u64);
    header.set_size(0);

    // hardlinks share the first path's inode and xattrs
    if meta.could_be_hardlink() {
        if let Some(target) = hardlinks.check(meta.dev, meta.ino, path) {
            header.set_entry_type(EntryType::Link);
            builder
                .append_link(&mut header, path, target)
                .map_err(Error::LayerStream)?;
            return Ok(true);
        }
    }

    if meta.file_type != FileType::Symlink {
        let xattrs = read_xattrs(full_path, caps)?;
        if !xattrs.is_empty() {
            let records: Vec<(String, &[u8])> = xattrs
                .iter()
                .map(|x| (format!("SCHILY.xattr.{}", x.name), x.value.as_slice()))
                .collect();
            builder
                .append_pax_extensions(records.iter().map(|(k, v)| (k.as_str(), *v)))
                .map_err(Error::LayerStream)?;
        }
    }

    match meta.file_type {
        FileType::Regular => {
            header.set_entry_type(EntryType::Regular);
            header.set_size(meta.size);
            let file = File::open(full_path).with_path(full_path)?;
            builder
                .append_data(&mut header, path, file.take(meta.size))
                .with_path(full_path)?;
        }
        FileType::Directory => {
            header.set_entry_type(EntryType::Directory);
            builder
                .append_data(&mut header, path, io::empty())
                .map_err(Error::LayerStream)?;
        }
        FileType::Symlink => {
            let target = read_symlink_target(full_path)?;
            header.set_entry_type(EntryType::Symlink);
            builder
                .append_link(&mut header, path, target)
                .map_err(Error::LayerStream)?;
        }
        FileType::CharDevice | FileType::BlockDevice => {
            let entry_type = if meta.file_type == FileType::CharDevice {
                EntryType::Char
            } else {
                EntryType::Block
            };
            let (major, minor) = meta.rdev.unwrap_or((0, 0));
            header.set_entry_type(entry_type);
            header.set_device_major(major).with_path(full_path)?;
            header.set_device_minor(minor).with_path(full_path)?;
            builder
                .append_data(&mut header, path, io::empty())
                .map_err(Error::LayerStream)?;
        }
        FileType::Fifo => {
            header.set_entry_type(EntryType::Fifo);
            builder
                .append_data(&mut header, path, io::empty())
                .map_err(Error::LayerStream)?;
        }
        FileType::Socket => return Ok(false),
    }

    Ok(true)
}

/// start building a layer on a worker thread
///
/// the tar is produced into a pipe and read back through the returned
/// stream, so the layer never has to fit in memory.
pub fn generate_layer(
    rootfs: &Path,
    diffs: Vec<DiffEntry>,
    map: MapOptions,
    cancel: CancelToken,
) -> Result<LayerStream> {
    let (reader, writer) = io::pipe().map_err(Error::LayerStream)?;
    let rootfs: PathBuf = rootfs.to_path_buf();

    let handle = thread::Builder::new()
        .name("layer-builder".to_string())
        .spawn(move || write_layer(&rootfs, &diffs, &map, writer, &cancel))
        .map_err(Error::LayerStream)?;

    Ok(LayerStream {
        reader: Some(reader),
        handle: Some(handle),
        summary: None,
        failure: None,
    })
}

/// read side of a layer being generated
///
/// reading to EOF waits for the builder. if it failed, the read returns an
/// error and the builder's own error is available from
/// [`LayerStream::take_failure`].
pub struct LayerStream {
    reader: Option<io::PipeReader>,
    handle: Option<JoinHandle<Result<LayerSummary>>>,
    summary: Option<LayerSummary>,
    failure: Option<Error>,
}

impl LayerStream {
    /// diff id of the layer, once the stream has been read to the end
    pub fn diff_id(&self) -> Option<Digest> {
        self.summary.as_ref().map(|s| s.diff_id)
    }

    pub fn summary(&self) -> Option<&LayerSummary> {
        self.summary.as_ref()
    }

    /// the builder's error, if it failed
    pub fn take_failure(&mut self) -> Option<Error> {
        self.failure.take()
    }

    fn join(&mut self) -> io::Result<()> {
        self.reader = None;

        if let Some(handle) = self.handle.take() {
            match handle.join() {
                Ok(Ok(summary)) => self.summary = Some(summary),
                Ok(Err(e)) => self.failure = Some(e),
                Err(_) => {
                    self.failure = Some(Error::LayerStream(io::Error::other(
                        "layer builder panicked",
                    )))
                }
            }
        }

        match &self.failure {
            Some(e) => Err(io::Error::other(e.to_string())),
            None => Ok(()),
        }
    }
}

impl Read for LayerStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let Some(reader) = self.reader.as_mut() else {
            return match &self.failure {
                Some(e) => Err(io::Error::other(e.to_string())),
                None => Ok(0),
            };
        };

        let n = reader.read(buf)?;
        if n == 0 && !buf.is_empty() {
            self.join()?;
        }
        Ok(n)
    }
}

impl Drop for LayerStream {
    fn drop(&mut self) {
        // closing the read side makes a still-running builder fail its
        // next write and exit
        self.reader = None;
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
