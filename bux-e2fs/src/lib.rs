//! Pure-Rust ext4 filesystem image builder and reader.
//!
//! Builds a single read-only (from the guest's point of view) ext4 image
//! out of a tar/tar.gz rootfs layer stream, and reads files back out of it
//! without mounting — the host has no kernel ext4 driver to lean on, so this
//! crate implements just enough of the on-disk format to write and walk one.
//!
//! No journal, no HTree directory index, no `sparse_super`, no extended
//! attributes. Every file's data lives in extents; short symlinks are
//! inlined into the inode itself.

mod dirent;
mod extent;
mod format;
mod inode;
mod layout;
mod reader;
mod superblock;

pub use format::{
    Formatter, create_from_dir, create_from_layers, estimate_image_size, estimate_layers_size,
};
pub use reader::Reader;

/// Block size used for every image this crate produces. Not configurable:
/// the layout math throughout this crate assumes 4096.
pub const BLOCK_SIZE: u32 = 4096;

/// Root directory inode number, fixed by the ext4 format.
pub const ROOT_INO: u32 = 2;
/// First inode number available for allocation (1-10 are reserved by the
/// format; this crate does not populate the reserved inodes beyond root).
pub const FIRST_FREE_INO: u32 = 11;

/// Maximum symlink depth resolved before giving up.
pub const MAX_SYMLINK_DEPTH: u32 = 40;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("requested image size is too small to hold a valid filesystem")]
    TooSmall,
    #[error("ran out of space while writing the image")]
    OutOfSpace,
    #[error("path not found: {0}")]
    NotFound(String),
    #[error("not a regular file: {0}")]
    NotAFile(String),
    #[error("is a directory: {0}")]
    IsDirectory(String),
    #[error("not a directory: {0}")]
    NotADirectory(String),
    #[error("too many symlinks while resolving {0}")]
    SymlinkLoop(String),
    #[error("invalid path: {0}")]
    InvalidPath(String),
    #[error("corrupt image: bad superblock magic")]
    BadMagic,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
