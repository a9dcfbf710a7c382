mod descriptor;
mod image;
mod metadata;

pub use descriptor::{media_type, Descriptor};
pub use image::{History, ImageConfig, ImageMeta, Manifest, RootFs};
pub use metadata::{ChangeKind, DiffEntry, Xattr};
