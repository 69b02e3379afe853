//! Zip-backed virtual filesystem with a copy-on-write overlay.
//!
//! The lower layer is an immutable tree built once from a zip archive's
//! central directory, carrying the UNIX ownership and timestamps encoded in
//! the archive's extra fields. The upper layer is a plain scratch directory
//! on the host; anything written through the overlay lands there and shadows
//! the lower entry of the same name.

pub mod error;
pub mod file;
pub mod node;
pub mod overlay;
pub mod zipfs;

pub use error::{Result, VfsError};
pub use file::ZipEntry;
pub use node::{clean_path, FileKind, Metadata};
pub use overlay::{FileHandle, OpenMode, OverlayFs};
pub use zipfs::ZipFs;
