//! read base image -> append layers -> commit
//!
//! the mutator only ever appends: base layers, diff ids and history records
//! are kept as they are and the new blobs are written next to them. nothing
//! is visible through a reference until the caller points one at the
//! descriptor returned by [`Mutator::commit`].

use std::fmt;
use std::io::Read;
use std::str::FromStr;

use flate2::{Compression, GzBuilder};
use serde::{Deserialize, Serialize};

use crate::cas::Engine;
use crate::digest::DigestReader;
use crate::error::{Error, Result};
use crate::types::{media_type, Descriptor, History, ImageConfig, ImageMeta, Manifest};

/// how new layer blobs are stored
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LayerCompression {
    #[default]
    Gzip,
    None,
}

impl LayerCompression {
    pub fn media_type(&self) -> &'static str {
        match self {
            LayerCompression::Gzip => media_type::LAYER_TAR_GZIP,
            LayerCompression::None => media_type::LAYER_TAR,
        }
    }
}

impl FromStr for LayerCompression {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "gzip" => Ok(LayerCompression::Gzip),
            "none" => Ok(LayerCompression::None),
            other => Err(format!("unknown layer compression '{}' (gzip, none)", other)),
        }
    }
}

impl fmt::Display for LayerCompression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LayerCompression::Gzip => f.write_str("gzip"),
            LayerCompression::None => f.write_str("none"),
        }
    }
}

/// in-memory view of an image being extended
pub struct Mutator<'a, E: Engine + ?Sized> {
    engine: &'a E,
    manifest: Manifest,
    config: ImageConfig,
}

impl<'a, E: Engine + ?Sized> Mutator<'a, E> {
    /// load the manifest and config behind `base`
    ///
    /// only single-platform image manifests can be mutated; indexes and
    /// manifest lists are rejected.
    pub fn open(engine: &'a E, base: &Descriptor) -> Result<Self> {
        if !base.is_manifest() {
            return Err(Error::UnsupportedMediaType(base.media_type.clone()));
        }

        let manifest_bytes = read_described(engine, base)?;
        let manifest: Manifest = serde_json::from_slice(&manifest_bytes)?;
        if let Some(mt) = &manifest.media_type {
            if mt != media_type::IMAGE_MANIFEST {
                return Err(Error::UnsupportedMediaType(mt.clone()));
            }
        }

        let config_bytes = read_described(engine, &manifest.config)?;
        let config: ImageConfig = serde_json::from_slice(&config_bytes)?;

        tracing::debug!(
            manifest = %base.digest,
            layers = manifest.layers.len(),
            "opened base image"
        );

        Ok(Self {
            engine,
            manifest,
            config,
        })
    }

    /// author, creation time and platform of the base image
    pub fn meta(&self) -> ImageMeta {
        ImageMeta::from(&self.config)
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    pub fn config(&self) -> &ImageConfig {
        &self.config
    }

    /// append a layer read from an uncompressed tar stream
    ///
    /// the diff id is computed over the uncompressed bytes. on failure the
    /// in-memory image is left unchanged; a partially written blob is never
    /// referenced.
    pub fn add(
        &mut self,
        reader: &mut dyn Read,
        history: History,
        compression: LayerCompression,
    ) -> Result<Descriptor> {
        let mut hashed = DigestReader::new(reader);

        let (digest, size) = match compression {
            LayerCompression::Gzip => {
                // no mtime or file name in the header
                let mut gz = GzBuilder::new().read(&mut hashed, Compression::default());
                self.engine.put_blob(&mut gz)?
            }
            LayerCompression::None => self.engine.put_blob(&mut hashed)?,
        };

        let (diff_id, raw_size) = hashed.finish();
        let layer = Descriptor::new(compression.media_type(), digest, size);

        tracing::debug!(
            %digest,
            %diff_id,
            size,
            uncompressed = raw_size,
            "added layer"
        );

        self.manifest.layers.push(layer.clone());
        self.config.rootfs.diff_ids.push(diff_id);
        self.config.history.push(history);

        Ok(layer)
    }

    /// write the config, then the manifest that references it
    pub fn commit(&mut self) -> Result<Descriptor> {
        let config_bytes = serde_json::to_vec(&self.config)?;
        let (config_digest, config_size) = self.engine.put_blob(&mut &config_bytes[..])?;

        let mut manifest = self.manifest.clone();
        manifest.config.digest = config_digest;
        manifest.config.size = config_size;

        let manifest_bytes = serde_json::to_vec(&manifest)?;
        let (digest, size) = self.engine.put_blob(&mut &manifest_bytes[..])?;

        self.manifest = manifest;

        tracing::debug!(manifest = %digest, config = %config_digest, "committed image");
        Ok(Descriptor::new(media_type::IMAGE_MANIFEST, digest, size))
    }
}

/// fetch a blob and check it against its descriptor
fn read_described<E: Engine + ?Sized>(engine: &E, descriptor: &Descriptor) -> Result<Vec<u8>> {
    let data = engine.get_blob(&descriptor.digest)?;
    if data.len() as u64 != descriptor.size {
        return Err(Error::SizeMismatch {
            digest: descriptor.digest,
            expected: descriptor.size,
            actual: data.len() as u64,
        });
    }
    Ok(data)
}
