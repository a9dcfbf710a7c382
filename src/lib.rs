//! repack - fold bundle changes back into an OCI image
//!
//! an image is unpacked into a bundle (a rootfs plus metadata and a
//! baseline snapshot), edited in place, and repacked: the edits become one
//! new layer appended to the original image, and a tag is pointed at the
//! resulting manifest. the base image's blobs are never rewritten.
//!
//! # Pipeline
//!
//! 1. read `repack.json` from the bundle (base manifest, id mappings)
//! 2. open the image store and the base manifest
//! 3. compare the rootfs with the baseline snapshot
//! 4. stream the changes as a tar layer, removed paths as `.wh.` whiteouts
//! 5. append the layer and a history record, write config then manifest
//! 6. move the tag to the new manifest
//!
//! # Example usage
//!
//! ```no_run
//! use repack::{ops, CancelToken};
//!
//! let opts = ops::RepackOptions::new("/var/lib/images/app", "latest", "/tmp/bundle");
//! let outcome = ops::repack(&opts, &CancelToken::new()).unwrap();
//! println!("{}", outcome.manifest.digest);
//! ```

mod cancel;
mod config;
mod digest;
mod error;
mod namespace;

pub mod bundle;
pub mod cas;
pub mod fs;
pub mod mutate;
pub mod ops;
pub mod snapshot;
pub mod types;

pub use bundle::BundleMeta;
pub use cancel::CancelToken;
pub use cas::{DirEngine, Engine};
pub use config::{Config, HistoryDefaults, LayerDefaults, DEFAULT_CREATED_BY};
pub use digest::{Digest, DigestReader, DigestWriter};
pub use error::{Error, ErrorKind, Result, Stage};
pub use mutate::{LayerCompression, Mutator};
pub use namespace::{host_to_container, IdMapping, MapOptions};
pub use snapshot::{AttrCaps, Keyword, KeywordSet, Snapshot};
pub use types::{ChangeKind, Descriptor, DiffEntry, History, ImageConfig, Manifest, Xattr};
