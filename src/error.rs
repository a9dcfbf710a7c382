use std::fmt;
use std::path::PathBuf;

use crate::digest::Digest;

/// broad classification of a failure, used by callers to decide what to do
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// missing or invalid bundle metadata, snapshot or config file
    Config,
    /// input the pipeline deliberately does not handle (manifest lists)
    UnsupportedInput,
    /// reading the live rootfs failed
    Filesystem,
    /// reading or writing the image store failed
    Store,
    /// updating the tag reference failed
    Reference,
    /// the caller cancelled the operation
    Cancelled,
}

/// pipeline stage, attached to errors raised by the repack orchestrator
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    ValidateOptions,
    LoadMetadata,
    OpenStore,
    OpenMutator,
    LoadSnapshot,
    DetectChanges,
    BuildLayer,
    AddLayer,
    Commit,
    SwapReference,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::ValidateOptions => "validate repack options",
            Stage::LoadMetadata => "read bundle metadata",
            Stage::OpenStore => "open image store",
            Stage::OpenMutator => "create mutator for base image",
            Stage::LoadSnapshot => "load baseline snapshot",
            Stage::DetectChanges => "detect rootfs changes",
            Stage::BuildLayer => "generate diff layer",
            Stage::AddLayer => "add diff layer",
            Stage::Commit => "commit mutated image",
            Stage::SwapReference => "update tag reference",
        };
        f.write_str(s)
    }
}

/// error type for repack operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{stage}: {source}")]
    Stage {
        stage: Stage,
        #[source]
        source: Box<Error>,
    },

    #[error("image store not found at {0}")]
    NoStore(PathBuf),

    #[error("image store already exists at {0}")]
    StoreExists(PathBuf),

    #[error("bundle metadata not found at {0}")]
    NoBundleMeta(PathBuf),

    #[error("unsupported bundle metadata schema version: {0}")]
    BundleVersion(String),

    #[error("baseline snapshot not found at {0}")]
    NoSnapshot(PathBuf),

    #[error("unsupported snapshot format version: {0}")]
    SnapshotVersion(u32),

    #[error("invalid reference name: {0}")]
    InvalidRef(String),

    #[error("blob not found: {0}")]
    BlobNotFound(Digest),

    #[error("corrupt blob: digest mismatch for {0}")]
    CorruptBlob(Digest),

    #[error("descriptor size mismatch for {digest}: expected {expected}, got {actual}")]
    SizeMismatch {
        digest: Digest,
        expected: u64,
        actual: u64,
    },

    #[error("descriptor does not point to an image manifest: not implemented: {0}")]
    UnsupportedMediaType(String),

    #[error("invalid timestamp '{0}': expected RFC 3339")]
    InvalidTimestamp(String),

    #[error("invalid id mapping: {0}")]
    InvalidMapping(String),

    #[error("invalid digest: {0}")]
    InvalidDigest(String),

    #[error("invalid path in rootfs: {0}")]
    InvalidEntryName(String),

    #[error("non-UTF-8 name in rootfs (layer entries must be UTF-8): {}", .0.display())]
    NonUtf8Path(PathBuf),

    #[error("uid {0} not mapped in namespace")]
    UnmappedUid(u32),

    #[error("gid {0} not mapped in namespace")]
    UnmappedGid(u32),

    #[error("operation cancelled")]
    Cancelled,

    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("store io error at {path}: {source}")]
    StoreIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("layer stream error: {0}")]
    LayerStream(#[source] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("cbor serialization error: {0}")]
    CborEncode(#[from] ciborium::ser::Error<std::io::Error>),

    #[error("cbor deserialization error: {0}")]
    CborDecode(#[from] ciborium::de::Error<std::io::Error>),

    #[error("config error: {0}")]
    Config(#[from] toml::de::Error),

    #[error("cannot read config file {path}: {source}")]
    ConfigFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("config serialization error: {0}")]
    ConfigSerialize(#[from] toml::ser::Error),

    #[error("xattr error on {path}: {message}")]
    Xattr { path: PathBuf, message: String },
}

impl Error {
    /// wrap this error with the pipeline stage it was raised in
    pub fn at(self, stage: Stage) -> Self {
        Error::Stage {
            stage,
            source: Box::new(self),
        }
    }

    /// stage that failed, if the error was raised by the orchestrator
    pub fn stage(&self) -> Option<Stage> {
        match self {
            Error::Stage { stage, .. } => Some(*stage),
            _ => None,
        }
    }

    /// classify the error
    ///
    /// stage-wrapped errors take their kind from the stage, except that
    /// cancellation and unsupported input always keep their own kind.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Stage { stage, source } => match source.kind() {
                k @ (ErrorKind::Cancelled | ErrorKind::UnsupportedInput) => k,
                inner => match stage {
                    Stage::ValidateOptions | Stage::LoadMetadata | Stage::LoadSnapshot => {
                        ErrorKind::Config
                    }
                    Stage::DetectChanges | Stage::BuildLayer => ErrorKind::Filesystem,
                    Stage::OpenStore | Stage::AddLayer | Stage::Commit => ErrorKind::Store,
                    Stage::OpenMutator => match inner {
                        ErrorKind::Config => ErrorKind::Config,
                        _ => ErrorKind::Store,
                    },
                    Stage::SwapReference => ErrorKind::Reference,
                },
            },
            Error::NoBundleMeta(_)
            | Error::BundleVersion(_)
            | Error::NoSnapshot(_)
            | Error::SnapshotVersion(_)
            | Error::Config(_)
            | Error::ConfigFile { .. }
            | Error::ConfigSerialize(_)
            | Error::CborDecode(_)
            | Error::CborEncode(_)
            | Error::Json(_)
            | Error::InvalidTimestamp(_)
            | Error::InvalidMapping(_) => ErrorKind::Config,
            Error::UnsupportedMediaType(_) => ErrorKind::UnsupportedInput,
            Error::Io { .. }
            | Error::Xattr { .. }
            | Error::InvalidEntryName(_)
            | Error::NonUtf8Path(_)
            | Error::UnmappedUid(_)
            | Error::UnmappedGid(_)
            | Error::LayerStream(_) => ErrorKind::Filesystem,
            Error::NoStore(_)
            | Error::StoreExists(_)
            | Error::BlobNotFound(_)
            | Error::CorruptBlob(_)
            | Error::SizeMismatch { .. }
            | Error::InvalidDigest(_)
            | Error::StoreIo { .. } => ErrorKind::Store,
            Error::InvalidRef(_) => ErrorKind::Reference,
            Error::Cancelled => ErrorKind::Cancelled,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// attach the failing pipeline stage to an error result
pub trait StageResultExt<T> {
    fn at(self, stage: Stage) -> Result<T>;
}

impl<T> StageResultExt<T> for Result<T> {
    fn at(self, stage: Stage) -> Result<T> {
        self.map_err(|e| e.at(stage))
    }
}

/// helper to wrap io errors with path context
pub trait IoResultExt<T> {
    /// io failure on the live filesystem
    fn with_path(self, path: impl Into<PathBuf>) -> Result<T>;

    /// io failure inside the image store
    fn with_store_path(self, path: impl Into<PathBuf>) -> Result<T>;
}

impl<T> IoResultExt<T> for std::io::Result<T> {
    fn with_path(self, path: impl Into<PathBuf>) -> Result<T> {
        self.map_err(|source| Error::Io {
            path: path.into(),
            source,
        })
    }

    fn with_store_path(self, path: impl Into<PathBuf>) -> Result<T> {
        self.map_err(|source| Error::StoreIo {
            path: path.into(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_wrapping_keeps_chain() {
        let err = Error::BlobNotFound(Digest::sha256_of(b"x")).at(Stage::Commit);
        assert_eq!(err.stage(), Some(Stage::Commit));
        assert_eq!(err.kind(), ErrorKind::Store);

        let msg = err.to_string();
        assert!(msg.starts_with("commit mutated image: blob not found"));
    }

    #[test]
    fn test_unsupported_input_survives_stage() {
        let err = Error::UnsupportedMediaType("application/vnd.oci.image.index.v1+json".into())
            .at(Stage::OpenMutator);
        assert_eq!(err.kind(), ErrorKind::UnsupportedInput);
    }

    #[test]
    fn test_cancelled_survives_stage() {
        let err = Error::Cancelled.at(Stage::DetectChanges);
        assert_eq!(err.kind(), ErrorKind::Cancelled);
    }

    #[test]
    fn test_stage_decides_kind_for_io() {
        let io = || std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let fs_err = Err::<(), _>(io()).with_path("/rootfs/etc").unwrap_err();
        assert_eq!(fs_err.kind(), ErrorKind::Filesystem);
        assert_eq!(fs_err.at(Stage::SwapReference).kind(), ErrorKind::Reference);

        let store_err = Err::<(), _>(io()).with_store_path("/image/blobs").unwrap_err();
        assert_eq!(store_err.kind(), ErrorKind::Store);
    }

    #[test]
    fn test_missing_snapshot_is_config() {
        let err = Error::NoSnapshot(PathBuf::from("/bundle/sha256_ab.snapshot")).at(Stage::LoadSnapshot);
        assert_eq!(err.kind(), ErrorKind::Config);
    }
}
