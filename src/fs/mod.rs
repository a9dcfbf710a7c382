pub mod hardlink;
pub mod read;

pub use hardlink::HardlinkTracker;
pub use read::{read_symlink_target, read_xattrs, FileMetadata, FileType};
