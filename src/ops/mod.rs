//! high-level operations on bundles and images

mod detect;
mod layer;
mod repack;

pub use detect::detect_changes;
pub use layer::{generate_layer, whiteout_path, write_layer, LayerStream, LayerSummary, WHITEOUT_PREFIX};
pub use repack::{
    parse_image_arg, repack, repack_with, snapshot_bundle, HistoryOverrides, RepackOptions,
    RepackOutcome, DEFAULT_TAG,
};
