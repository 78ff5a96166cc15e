//! VFS node traits and the path registry.

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use lazy_static::lazy_static;
use spin::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    NotFound,
    Invalid,
}

/// A file-like object reachable through the VFS. Nodes are shared between
/// every handle opened on them, so reads are positionless; the cursor lives
/// in the handle.
pub trait VfsNode: Send + Sync + core::fmt::Debug {
    fn read_at(&self, offset: usize, buf: &mut [u8]) -> Result<usize, FsError>;
    fn size(&self) -> usize;
}

/// `/dev/null`: reads see end-of-file immediately.
#[derive(Debug)]
pub struct NullDevice;

impl VfsNode for NullDevice {
    fn read_at(&self, _offset: usize, _buf: &mut [u8]) -> Result<usize, FsError> {
        Ok(0)
    }

    fn size(&self) -> usize {
        0
    }
}

/// Read-only file backed by kernel memory.
#[derive(Debug)]
pub struct MemFile {
    data: Vec<u8>,
}

impl MemFile {
    pub fn new(data: Vec<u8>) -> Self {
        MemFile { data }
    }
}

impl VfsNode for MemFile {
    fn read_at(&self, offset: usize, buf: &mut [u8]) -> Result<usize, FsError> {
        if offset >= self.data.len() {
            return Ok(0);
        }
        let n = (self.data.len() - offset).min(buf.len());
        buf[..n].copy_from_slice(&self.data[offset..offset + n]);
        Ok(n)
    }

    fn size(&self) -> usize {
        self.data.len()
    }
}

/// Path-to-node registry.
pub struct Vfs {
    nodes: BTreeMap<String, Arc<dyn VfsNode>>,
}

impl Vfs {
    pub fn new() -> Self {
        Vfs {
            nodes: BTreeMap::new(),
        }
    }

    pub fn register(&mut self, path: &str, node: Arc<dyn VfsNode>) {
        self.nodes.insert(String::from(path), node);
    }

    pub fn open(&self, path: &str) -> Result<Arc<dyn VfsNode>, FsError> {
        self.nodes.get(path).cloned().ok_or(FsError::NotFound)
    }
}

lazy_static! {
    /// Global VFS instance. Mounted with the builtin devices at boot.
    pub static ref VFS: Mutex<Vfs> = Mutex::new(Vfs::new());
}

/// Registers the builtin nodes.
pub fn init() {
    let mut vfs = VFS.lock();
    vfs.register("/dev/null", Arc::new(NullDevice));
    crate::serial_println!("[VFS] mounted builtin devices");
}
