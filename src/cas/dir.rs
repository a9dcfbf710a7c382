use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use crate::cas::Engine;
use crate::digest::{Digest, DigestWriter};
use crate::error::{Error, IoResultExt, Result};
use crate::types::Descriptor;

const LAYOUT_FILE: &str = "oci-layout";
const LAYOUT_CONTENT: &str = "{\"imageLayoutVersion\":\"1.0.0\"}";

/// image store kept in a directory
///
/// ```text
/// <root>/oci-layout
/// <root>/blobs/sha256/<hex>
/// <root>/refs/<name>        descriptor JSON
/// <root>/tmp/               staging for atomic writes
/// ```
///
/// every write is a rename of a fully synced staging file, so readers never
/// observe partial blobs or refs and no store lock is taken.
pub struct DirEngine {
    path: PathBuf,
}

impl DirEngine {
    /// create an empty store at the given path
    pub fn create(path: &Path) -> Result<Self> {
        let layout = path.join(LAYOUT_FILE);
        if layout.exists() {
            return Err(Error::StoreExists(path.to_path_buf()));
        }

        fs::create_dir_all(path.join("blobs/sha256")).with_store_path(path)?;
        fs::create_dir_all(path.join("refs")).with_store_path(path)?;
        fs::create_dir_all(path.join("tmp")).with_store_path(path)?;
        fs::write(&layout, LAYOUT_CONTENT).with_store_path(&layout)?;

        Self::open(path)
    }

    /// open an existing store
    ///
    /// opening writes nothing; the staging directory is created on first write.
    pub fn open(path: &Path) -> Result<Self> {
        if !path.join(LAYOUT_FILE).exists() {
            return Err(Error::NoStore(path.to_path_buf()));
        }

        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    /// release the store
    pub fn close(self) {}

    /// path to blobs directory
    pub fn blobs_path(&self) -> PathBuf {
        self.path.join("blobs/sha256")
    }

    /// path to refs directory
    pub fn refs_path(&self) -> PathBuf {
        self.path.join("refs")
    }

    /// path to tmp directory (for atomic writes)
    pub fn tmp_path(&self) -> PathBuf {
        self.path.join("tmp")
    }

    /// filesystem path of a blob
    pub fn blob_path(&self, digest: &Digest) -> PathBuf {
        self.blobs_path().join(digest.to_hex())
    }

    fn ref_path(&self, name: &str) -> PathBuf {
        self.refs_path().join(name)
    }

    fn staging_file(&self) -> Result<PathBuf> {
        // stores created by other tools may lack a staging directory
        let tmp = self.tmp_path();
        fs::create_dir_all(&tmp).with_store_path(&tmp)?;
        Ok(tmp.join(uuid::Uuid::new_v4().to_string()))
    }
}

impl Engine for DirEngine {
    fn put_blob(&self, reader: &mut dyn Read) -> Result<(Digest, u64)> {
        let tmp_path = self.staging_file()?;

        let staged = (|| -> Result<(Digest, u64)> {
            let file = File::create(&tmp_path).with_store_path(&tmp_path)?;
            let mut writer = DigestWriter::new(file);
            io::copy(reader, &mut writer).with_store_path(&tmp_path)?;
            writer.flush().with_store_path(&tmp_path)?;
            let (file, digest, size) = writer.finish();
            file.sync_all().with_store_path(&tmp_path)?;
            Ok((digest, size))
        })();

        let (digest, size) = match staged {
            Ok(v) => v,
            Err(e) => {
                let _ = fs::remove_file(&tmp_path);
                return Err(e);
            }
        };

        let blob_path = self.blob_path(&digest);

        // deduplication: identical content is already stored
        if blob_path.exists() {
            fs::remove_file(&tmp_path).with_store_path(&tmp_path)?;
            return Ok((digest, size));
        }

        fs::rename(&tmp_path, &blob_path).with_store_path(&blob_path)?;
        fsync_dir(&self.blobs_path())?;

        tracing::trace!(%digest, size, "wrote blob");
        Ok((digest, size))
    }

    fn get_blob(&self, digest: &Digest) -> Result<Vec<u8>> {
        let path = self.blob_path(digest);
        let data = fs::read(&path).map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                Error::BlobNotFound(*digest)
            } else {
                Error::StoreIo { path, source: e }
            }
        })?;

        if Digest::sha256_of(&data) != *digest {
            return Err(Error::CorruptBlob(*digest));
        }

        Ok(data)
    }

    fn blob_exists(&self, digest: &Digest) -> Result<bool> {
        Ok(self.blob_path(digest).exists())
    }

    fn get_reference(&self, name: &str) -> Result<Option<Descriptor>> {
        validate_ref_name(name)?;
        let path = self.ref_path(name);

        let content = match fs::read(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::StoreIo { path, source: e }),
        };

        Ok(Some(serde_json::from_slice(&content)?))
    }

    fn put_reference(&self, name: &str, descriptor: &Descriptor) -> Result<()> {
        validate_ref_name(name)?;
        let ref_path = self.ref_path(name);

        if let Some(parent) = ref_path.parent() {
            fs::create_dir_all(parent).with_store_path(parent)?;
        }

        // atomic write: temp -> fsync -> rename
        let tmp_path = self.staging_file()?;
        {
            let mut tmp_file = File::create(&tmp_path).with_store_path(&tmp_path)?;
            serde_json::to_writer(&mut tmp_file, descriptor)?;
            tmp_file.sync_all().with_store_path(&tmp_path)?;
        }

        fs::rename(&tmp_path, &ref_path).with_store_path(&ref_path)?;

        if let Some(parent) = ref_path.parent() {
            fsync_dir(parent)?;
        }

        Ok(())
    }

    fn delete_reference(&self, name: &str) -> Result<bool> {
        validate_ref_name(name)?;
        let path = self.ref_path(name);

        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(Error::StoreIo { path, source: e }),
        }
    }
}

fn fsync_dir(dir: &Path) -> Result<()> {
    let handle = File::open(dir).with_store_path(dir)?;
    handle.sync_all().with_store_path(dir)
}

/// validate a reference name
///
/// names may be hierarchical (`a/b`) but must stay inside the refs directory.
fn validate_ref_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::InvalidRef("empty ref name".to_string()));
    }

    if name.starts_with('/') || name.ends_with('/') {
        return Err(Error::InvalidRef(format!(
            "ref name cannot start or end with '/': {}",
            name
        )));
    }

    if name.contains("//") {
        return Err(Error::InvalidRef(format!(
            "ref name cannot contain '//': {}",
            name
        )));
    }

    if name.contains('\0') {
        return Err(Error::InvalidRef(format!(
            "ref name cannot contain null byte: {}",
            name
        )));
    }

    for component in name.split('/') {
        if component == "." || component == ".." {
            return Err(Error::InvalidRef(format!(
                "ref name cannot contain '.' or '..': {}",
                name
            )));
        }
    }

    Ok(())
}
