//! unpacked bundle layout
//!
//! ```text
//! <bundle>/repack.json              metadata, see [`BundleMeta`]
//! <bundle>/rootfs/                  the tree being edited
//! <bundle>/sha256_<hex>.snapshot    baseline recorded at unpack time
//! ```

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, IoResultExt, Result};
use crate::namespace::MapOptions;
use crate::snapshot::Snapshot;
use crate::types::Descriptor;

/// metadata file name in the bundle root
pub const META_FILE: &str = "repack.json";

/// supported metadata schema
pub const META_VERSION: &str = "1";

/// rootfs directory name in the bundle root
pub const ROOTFS_DIR: &str = "rootfs";

/// what a bundle was unpacked from, and how
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleMeta {
    pub schema_version: String,
    /// manifest the rootfs was unpacked from
    pub from_descriptor: Descriptor,
    #[serde(default)]
    pub map_options: MapOptions,
}

impl BundleMeta {
    pub fn new(from_descriptor: Descriptor, map_options: MapOptions) -> Self {
        Self {
            schema_version: META_VERSION.to_string(),
            from_descriptor,
            map_options,
        }
    }

    /// read `repack.json` from a bundle
    pub fn load(bundle: &Path) -> Result<Self> {
        let path = bundle.join(META_FILE);
        let content = fs::read(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::NoBundleMeta(path.clone())
            } else {
                Error::Io {
                    path: path.clone(),
                    source: e,
                }
            }
        })?;

        let meta: BundleMeta = serde_json::from_slice(&content)?;
        if meta.schema_version != META_VERSION {
            return Err(Error::BundleVersion(meta.schema_version));
        }
        meta.map_options.validate()?;

        Ok(meta)
    }

    /// write `repack.json` into a bundle
    pub fn save(&self, bundle: &Path) -> Result<()> {
        let path = bundle.join(META_FILE);
        let tmp_path = bundle.join(format!(".{}-{}", META_FILE, uuid::Uuid::new_v4()));
        {
            let mut file = File::create(&tmp_path).with_path(&tmp_path)?;
            serde_json::to_writer_pretty(&mut file, self)?;
            file.write_all(b"\n").with_path(&tmp_path)?;
            file.sync_all().with_path(&tmp_path)?;
        }
        fs::rename(&tmp_path, &path).with_path(&path)?;
        Ok(())
    }

    /// baseline snapshot recorded for this bundle
    pub fn snapshot_path(&self, bundle: &Path) -> PathBuf {
        bundle.join(Snapshot::file_name(&self.from_descriptor.digest))
    }
}

/// rootfs of a bundle
pub fn rootfs_path(bundle: &Path) -> PathBuf {
    bundle.join(ROOTFS_DIR)
}
