use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::digest::Digest;

/// OCI media types used by the pipeline
pub mod media_type {
    pub const IMAGE_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
    pub const IMAGE_INDEX: &str = "application/vnd.oci.image.index.v1+json";
    pub const IMAGE_CONFIG: &str = "application/vnd.oci.image.config.v1+json";
    pub const LAYER_TAR: &str = "application/vnd.oci.image.layer.v1.tar";
    pub const LAYER_TAR_GZIP: &str = "application/vnd.oci.image.layer.v1.tar+gzip";
}

/// content-addressed pointer to a blob
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    pub media_type: String,
    pub digest: Digest,
    pub size: u64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

impl Descriptor {
    pub fn new(media_type: impl Into<String>, digest: Digest, size: u64) -> Self {
        Self {
            media_type: media_type.into(),
            digest,
            size,
            annotations: BTreeMap::new(),
        }
    }

    /// does this point at a single-platform image manifest
    pub fn is_manifest(&self) -> bool {
        self.media_type == media_type::IMAGE_MANIFEST
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_json_field_names() {
        let d = Descriptor::new(media_type::IMAGE_MANIFEST, Digest::sha256_of(b"m"), 7);
        let json = serde_json::to_value(&d).unwrap();
        assert_eq!(json["mediaType"], media_type::IMAGE_MANIFEST);
        assert_eq!(json["size"], 7);
        assert!(json["digest"].as_str().unwrap().starts_with("sha256:"));
        assert!(json.get("annotations").is_none());
    }

    #[test]
    fn test_manifest_detection() {
        let digest = Digest::sha256_of(b"i");
        assert!(Descriptor::new(media_type::IMAGE_MANIFEST, digest, 1).is_manifest());
        assert!(!Descriptor::new(media_type::IMAGE_INDEX, digest, 1).is_manifest());
        assert!(!Descriptor::new(
            "application/vnd.docker.distribution.manifest.list.v2+json",
            digest,
            1
        )
        .is_manifest());
    }
}
