use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::digest::Digest;
use crate::types::Descriptor;

/// single-platform image manifest
///
/// fields this crate does not interpret are kept in `extra` and written back
/// unchanged.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub schema_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    pub config: Descriptor,
    #[serde(default)]
    pub layers: Vec<Descriptor>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// image configuration blob
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ImageConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default)]
    pub architecture: String,
    #[serde(default)]
    pub os: String,
    pub rootfs: RootFs,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub history: Vec<History>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// layer chain of an image, as uncompressed layer digests
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootFs {
    #[serde(rename = "type")]
    pub fs_type: String,
    #[serde(default)]
    pub diff_ids: Vec<Digest>,
}

impl Default for RootFs {
    fn default() -> Self {
        Self {
            fs_type: "layers".to_string(),
            diff_ids: vec![],
        }
    }
}

/// one history record, 1:1 with a layer unless `empty_layer` is set
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct History {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub empty_layer: bool,
}

/// summary of the base image used to default history fields
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ImageMeta {
    pub author: Option<String>,
    pub created: Option<String>,
    pub architecture: String,
    pub os: String,
}

impl From<&ImageConfig> for ImageMeta {
    fn from(config: &ImageConfig) -> Self {
        Self {
            author: config.author.clone(),
            created: config.created.clone(),
            architecture: config.architecture.clone(),
            os: config.os.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::media_type;

    const CONFIG: &str = r#"{
        "architecture": "amd64",
        "os": "linux",
        "author": "base author",
        "config": {"Env": ["PATH=/usr/bin"], "WorkingDir": "/"},
        "rootfs": {"type": "layers", "diff_ids": []},
        "history": [{"created_by": "bootstrap", "empty_layer": true}]
    }"#;

    #[test]
    fn test_config_keeps_unknown_fields() {
        let config: ImageConfig = serde_json::from_str(CONFIG).unwrap();
        assert_eq!(config.author.as_deref(), Some("base author"));
        assert_eq!(config.history.len(), 1);
        assert!(config.history[0].empty_layer);
        assert!(config.extra.contains_key("config"));

        let out = serde_json::to_value(&config).unwrap();
        assert_eq!(out["config"]["WorkingDir"], "/");
        assert_eq!(out["rootfs"]["type"], "layers");
    }

    #[test]
    fn test_history_skips_defaults() {
        let h = History {
            created_by: Some("repack".into()),
            ..Default::default()
        };
        let out = serde_json::to_value(&h).unwrap();
        assert_eq!(out, serde_json::json!({"created_by": "repack"}));
    }

    #[test]
    fn test_manifest_roundtrip_with_annotations() {
        let json = serde_json::json!({
            "schemaVersion": 2,
            "mediaType": media_type::IMAGE_MANIFEST,
            "config": {
                "mediaType": media_type::IMAGE_CONFIG,
                "digest": Digest::sha256_of(b"c").to_string(),
                "size": 1
            },
            "layers": [],
            "annotations": {"org.opencontainers.image.ref.name": "v1"}
        });
        let manifest: Manifest = serde_json::from_value(json.clone()).unwrap();
        assert!(manifest.layers.is_empty());
        assert_eq!(serde_json::to_value(&manifest).unwrap(), json);
    }

    #[test]
    fn test_image_meta_from_config() {
        let config: ImageConfig = serde_json::from_str(CONFIG).unwrap();
        let meta = ImageMeta::from(&config);
        assert_eq!(meta.author.as_deref(), Some("base author"));
        assert_eq!(meta.os, "linux");
    }
}
