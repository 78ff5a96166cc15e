//! Physical zones and the memory-manager contract the scheduler relies on.

use alloc::sync::Arc;
use alloc::vec::Vec;

use super::PhysicalAddress;
use crate::task::Task;

/// A physical backing allocation of one or more page frames.
///
/// Zones are created by the memory manager and handed out behind `Arc`: a
/// zone stays alive for as long as any region of any task still points at
/// it, and the frames are returned to the allocator when the last reference
/// drops.
#[derive(Debug)]
pub struct Zone {
    frames: Vec<PhysicalAddress>,
    size: u32,
}

impl Zone {
    pub fn new(frames: Vec<PhysicalAddress>, size: u32) -> Self {
        Zone { frames, size }
    }

    pub fn frames(&self) -> &[PhysicalAddress] {
        &self.frames
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn page_count(&self) -> usize {
        self.frames.len()
    }
}

impl Drop for Zone {
    fn drop(&mut self) {
        // Last holder gone; frames go back to the pool.
        for &frame in &self.frames {
            super::physical::free_frame(frame);
        }
    }
}

/// The page-directory side of the kernel, as seen by the task layer.
///
/// The scheduler treats `map_regions_for` and `unmap_regions_for` as
/// must-succeed; a `false` return is fatal. Tests substitute a fake.
pub trait MemoryManager {
    /// Allocates a zone backed by enough frames to cover `size` bytes.
    fn create_zone(&mut self, size: u32) -> Option<Arc<Zone>>;

    /// Copies `len` bytes from `src` into the start of the zone's frames.
    fn copy_to_zone(&mut self, zone: &Zone, src: *const u8, len: usize) -> bool;

    /// Installs all regions of `task` into the active page directory.
    fn map_regions_for(&mut self, task: &Task) -> bool;

    /// Removes all regions of `task` from the active page directory.
    fn unmap_regions_for(&mut self, task: &Task) -> bool;

    /// Physical base of the page directory new tasks inherit as `cr3`.
    fn page_directory_base(&self) -> PhysicalAddress;
}
