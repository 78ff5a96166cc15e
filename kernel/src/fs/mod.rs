//! Virtual filesystem and per-task file handles.

pub mod fd;
pub mod vfs;

pub use fd::FileHandle;
pub use vfs::{FsError, Vfs, VfsNode};
