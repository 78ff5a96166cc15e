//! Open-file handles owned by a task.

use alloc::sync::Arc;

use super::vfs::{FsError, VfsNode};

/// One open file: a shared node plus this handle's cursor and fd number.
pub struct FileHandle {
    fd: i32,
    offset: usize,
    node: Arc<dyn VfsNode>,
}

impl FileHandle {
    pub fn new(fd: i32, node: Arc<dyn VfsNode>) -> Self {
        FileHandle {
            fd,
            offset: 0,
            node,
        }
    }

    pub fn fd(&self) -> i32 {
        self.fd
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Reads from the cursor and advances it. A short (or zero) count means
    /// end of file.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize, FsError> {
        let n = self.node.read_at(self.offset, buf)?;
        self.offset += n;
        Ok(n)
    }

    /// Absolute seek; returns the new offset.
    pub fn seek(&mut self, offset: i32) -> Result<i32, FsError> {
        if offset < 0 {
            return Err(FsError::Invalid);
        }
        self.offset = offset as usize;
        Ok(offset)
    }
}
