use std::path::{Path, PathBuf};

use chrono::{DateTime, SecondsFormat, Utc};

use crate::bundle::{rootfs_path, BundleMeta};
use crate::cancel::CancelToken;
use crate::cas::{DirEngine, Engine};
use crate::config::{Config, DEFAULT_CREATED_BY};
use crate::error::{Error, Result, Stage, StageResultExt};
use crate::mutate::{LayerCompression, Mutator};
use crate::ops::detect::detect_changes;
use crate::ops::layer::{generate_layer, LayerSummary};
use crate::snapshot::{AttrCaps, KeywordSet, Snapshot};
use crate::types::{Descriptor, History, ImageMeta};

/// tag used when an image argument names none
pub const DEFAULT_TAG: &str = "latest";

/// caller-supplied history fields; each one replaces the default
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HistoryOverrides {
    pub author: Option<String>,
    pub comment: Option<String>,
    /// RFC 3339 timestamp
    pub created: Option<String>,
    pub created_by: Option<String>,
}

impl HistoryOverrides {
    fn validate(&self) -> Result<()> {
        if let Some(created) = &self.created {
            DateTime::parse_from_rfc3339(created)
                .map_err(|_| Error::InvalidTimestamp(created.clone()))?;
        }
        Ok(())
    }
}

/// everything a repack needs, fixed before it starts
#[derive(Clone, Debug)]
pub struct RepackOptions {
    /// image store directory
    pub image: PathBuf,
    /// reference to point at the new manifest
    pub tag: String,
    /// unpacked bundle directory
    pub bundle: PathBuf,
    pub history: HistoryOverrides,
    pub compression: LayerCompression,
    /// created_by when not overridden
    pub created_by: String,
    /// attributes compared against the baseline
    pub keywords: KeywordSet,
}

impl RepackOptions {
    pub fn new(image: impl Into<PathBuf>, tag: impl Into<String>, bundle: impl Into<PathBuf>) -> Self {
        Self {
            image: image.into(),
            tag: tag.into(),
            bundle: bundle.into(),
            history: HistoryOverrides::default(),
            compression: LayerCompression::default(),
            created_by: DEFAULT_CREATED_BY.to_string(),
            keywords: KeywordSet::all(),
        }
    }

    /// take defaults from a config file; explicit overrides still win
    pub fn with_config(mut self, config: &Config) -> Self {
        if self.history.author.is_none() {
            self.history.author = config.history.author.clone();
        }
        self.created_by = config.history.created_by.clone();
        self.compression = config.layer.compression;
        self
    }
}

/// result of a successful repack
#[derive(Clone, Debug)]
pub struct RepackOutcome {
    /// new manifest, now referenced by the tag
    pub manifest: Descriptor,
    /// appended layer
    pub layer: Descriptor,
    pub summary: LayerSummary,
    /// what the tag pointed at before, if anything
    pub previous: Option<Descriptor>,
}

/// split `path[:tag]`, defaulting the tag to `latest`
pub fn parse_image_arg(arg: &str) -> Result<(PathBuf, String)> {
    let (path, tag) = match arg.rsplit_once(':') {
        // a ':' inside a directory component is part of the path
        Some((path, tag)) if !tag.contains('/') => (path, tag),
        _ => (arg, DEFAULT_TAG),
    };

    if path.is_empty() {
        return Err(Error::NoStore(PathBuf::from(arg)));
    }
    if tag.is_empty() {
        return Err(Error::InvalidRef(format!("empty tag in '{}'", arg)));
    }

    Ok((PathBuf::from(path), tag.to_string()))
}

/// fold the bundle's rootfs changes into the image as a new layer
///
/// on success the tag points at the new manifest. on any failure, or if
/// cancelled, the tag is left as it was; blobs already written stay in the
/// store unreferenced.
pub fn repack(opts: &RepackOptions, cancel: &CancelToken) -> Result<RepackOutcome> {
    opts.history.validate().at(Stage::ValidateOptions)?;

    let meta = BundleMeta::load(&opts.bundle).at(Stage::LoadMetadata)?;
    tracing::debug!(
        bundle = %opts.bundle.display(),
        from = %meta.from_descriptor.digest,
        rootless = meta.map_options.rootless,
        "loaded bundle metadata"
    );

    // refuse manifest lists before touching the store
    if !meta.from_descriptor.is_manifest() {
        return Err(Error::UnsupportedMediaType(meta.from_descriptor.media_type.clone()))
            .at(Stage::LoadMetadata);
    }

    cancel.check().at(Stage::OpenStore)?;
    let engine = DirEngine::open(&opts.image).at(Stage::OpenStore)?;

    let outcome = repack_with(&engine, &meta, opts, cancel)?;
    engine.close();
    Ok(outcome)
}

/// the pipeline from opening the base image on, against any store
pub fn repack_with<E: Engine + ?Sized>(
    engine: &E,
    meta: &BundleMeta,
    opts: &RepackOptions,
    cancel: &CancelToken,
) -> Result<RepackOutcome> {
    opts.history.validate().at(Stage::ValidateOptions)?;

    cancel.check().at(Stage::OpenMutator)?;
    let mut mutator = Mutator::open(engine, &meta.from_descriptor).at(Stage::OpenMutator)?;

    cancel.check().at(Stage::LoadSnapshot)?;
    let snapshot_path = meta.snapshot_path(&opts.bundle);
    let snapshot = Snapshot::read(&snapshot_path).at(Stage::LoadSnapshot)?;
    tracing::debug!(path = %snapshot_path.display(), entries = snapshot.len(), "parsed snapshot");

    cancel.check().at(Stage::DetectChanges)?;
    let rootfs = rootfs_path(&opts.bundle);
    let caps = AttrCaps::for_rootless(meta.map_options.rootless);
    let diffs = detect_changes(&rootfs, &snapshot, &opts.keywords, &caps, cancel)
        .at(Stage::DetectChanges)?;
    tracing::debug!(ndiff = diffs.len(), "checked rootfs for changes");

    cancel.check().at(Stage::BuildLayer)?;
    let mut stream = generate_layer(&rootfs, diffs, meta.map_options.clone(), cancel.clone())
        .at(Stage::BuildLayer)?;

    let history = build_history(&opts.history, &opts.created_by, &mutator.meta(), Utc::now());
    let layer = match mutator.add(&mut stream, history, opts.compression) {
        Ok(layer) => layer,
        // a failed builder shows up as a read error inside the store write
        Err(e) => {
            return Err(match stream.take_failure() {
                Some(failure) => failure.at(Stage::BuildLayer),
                None => e.at(Stage::AddLayer),
            })
        }
    };
    let summary = match (stream.summary().cloned(), stream.take_failure()) {
        (_, Some(failure)) => return Err(failure.at(Stage::BuildLayer)),
        (Some(summary), None) => summary,
        (None, None) => {
            return Err(Error::LayerStream(std::io::Error::other(
                "layer stream ended before the builder finished",
            )))
            .at(Stage::BuildLayer)
        }
    };
    drop(stream);

    cancel.check().at(Stage::Commit)?;
    let manifest = mutator.commit().at(Stage::Commit)?;

    // last chance to back out: after this the tag moves
    cancel.check().at(Stage::SwapReference)?;
    let previous = swap_reference(engine, &opts.tag, &manifest).at(Stage::SwapReference)?;

    tracing::info!(
        manifest = %manifest.digest,
        tag = %opts.tag,
        layer = %layer.digest,
        entries = summary.entries,
        whiteouts = summary.whiteouts,
        "created new image"
    );

    Ok(RepackOutcome {
        manifest,
        layer,
        summary,
        previous,
    })
}

/// point `tag` at `manifest`, returning what it pointed at before
///
/// the old reference is deleted before the new one is written, so a crash
/// in between leaves the tag absent.
fn swap_reference<E: Engine + ?Sized>(
    engine: &E,
    tag: &str,
    manifest: &Descriptor,
) -> Result<Option<Descriptor>> {
    let previous = engine.get_reference(tag)?;
    if let Some(old) = &previous {
        tracing::warn!(tag, old = %old.digest, new = %manifest.digest, "replacing existing tag");
    }

    engine.delete_reference(tag)?;
    engine.put_reference(tag, manifest)?;
    Ok(previous)
}

/// history record for the new layer
fn build_history(
    overrides: &HistoryOverrides,
    created_by: &str,
    base: &ImageMeta,
    now: DateTime<Utc>,
) -> History {
    History {
        author: overrides.author.clone().or_else(|| base.author.clone()),
        created: Some(
            overrides
                .created
                .clone()
                .unwrap_or_else(|| now.to_rfc3339_opts(SecondsFormat::Secs, true)),
        ),
        created_by: Some(
            overrides
                .created_by
                .clone()
                .unwrap_or_else(|| created_by.to_string()),
        ),
        comment: overrides.comment.clone(),
        empty_layer: false,
    }
}

/// record the baseline snapshot of a bundle as it is now
pub fn snapshot_bundle(bundle: &Path, keywords: &KeywordSet, cancel: &CancelToken) -> Result<PathBuf> {
    let meta = BundleMeta::load(bundle).at(Stage::LoadMetadata)?;
    let caps = AttrCaps::for_rootless(meta.map_options.rootless);

    let snapshot = Snapshot::capture(&rootfs_path(bundle), keywords, &caps, cancel)?;
    let path = meta.snapshot_path(bundle);
    snapshot.write(&path)?;

    tracing::debug!(path = %path.display(), entries = snapshot.len(), "wrote snapshot");
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn base_meta() -> ImageMeta {
        ImageMeta {
            author: Some("base author".into()),
            created: Some("2020-01-01T00:00:00Z".into()),
            architecture: "amd64".into(),
            os: "linux".into(),
        }
    }

    #[test]
    fn test_parse_image_arg() {
        assert_eq!(
            parse_image_arg("/srv/image:v2").unwrap(),
            (PathBuf::from("/srv/image"), "v2".to_string())
        );
        assert_eq!(
            parse_image_arg("/srv/image").unwrap(),
            (PathBuf::from("/srv/image"), "latest".to_string())
        );
        assert_eq!(
            parse_image_arg("/srv/a:b/image").unwrap(),
            (PathBuf::from("/srv/a:b/image"), "latest".to_string())
        );
        assert!(matches!(parse_image_arg("/srv/image:"), Err(Error::InvalidRef(_))));
        assert!(parse_image_arg(":tag").is_err());
    }

    #[test]
    fn test_history_defaults() {
        let now = Utc.with_ymd_and_hms(2024, 5, 6, 7, 8, 9).unwrap();
        let history = build_history(&HistoryOverrides::default(), "repack", &base_meta(), now);

        assert_eq!(history.author.as_deref(), Some("base author"));
        assert_eq!(history.created.as_deref(), Some("2024-05-06T07:08:09Z"));
        assert_eq!(history.created_by.as_deref(), Some("repack"));
        assert_eq!(history.comment, None);
        assert!(!history.empty_layer);
    }

    #[test]
    fn test_history_overrides() {
        let overrides = HistoryOverrides {
            author: Some("me".into()),
            comment: Some("tweak".into()),
            created: Some("2001-02-03T04:05:06Z".into()),
            created_by: Some("make image".into()),
        };
        let history = build_history(&overrides, "repack", &base_meta(), Utc::now());

        assert_eq!(history.author.as_deref(), Some("me"));
        assert_eq!(history.comment.as_deref(), Some("tweak"));
        assert_eq!(history.created.as_deref(), Some("2001-02-03T04:05:06Z"));
        assert_eq!(history.created_by.as_deref(), Some("make image"));
    }

    #[test]
    fn test_invalid_created() {
        let overrides = HistoryOverrides {
            created: Some("yesterday".into()),
            ..Default::default()
        };
        assert!(matches!(overrides.validate(), Err(Error::InvalidTimestamp(_))));
    }

    #[test]
    fn test_invalid_created_fails_before_bundle_is_read() {
        let dir = tempfile::tempdir().unwrap();
        let mut opts = RepackOptions::new(dir.path().join("image"), "latest", dir.path().join("bundle"));
        opts.history.created = Some("2024-13-40".into());

        let err = repack(&opts, &CancelToken::new()).unwrap_err();
        assert_eq!(err.stage(), Some(Stage::ValidateOptions));
        assert_eq!(err.kind(), crate::ErrorKind::Config);
        assert!(err.to_string().starts_with("validate repack options: invalid timestamp"));
    }

    #[test]
    fn test_options_with_config() {
        let mut config = Config::default();
        config.history.author = Some("from config".into());
        config.history.created_by = "ci".into();
        config.layer.compression = LayerCompression::None;

        let opts = RepackOptions::new("/image", "latest", "/bundle").with_config(&config);
        assert_eq!(opts.history.author.as_deref(), Some("from config"));
        assert_eq!(opts.created_by, "ci");
        assert_eq!(opts.compression, LayerCompression::None);

        let mut explicit = RepackOptions::new("/image", "latest", "/bundle");
        explicit.history.author = Some("cli".into());
        let explicit = explicit.with_config(&config);
        assert_eq!(explicit.history.author.as_deref(), Some("cli"));
    }
}
