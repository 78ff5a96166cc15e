//! 32-bit Task State Segment image.
//!
//! One TSS per task holds the full register image the CPU saves and restores
//! on a hardware task switch, plus the ring-0 stack (`ss0:esp0`) used when a
//! ring-3 task takes an interrupt.

/// Architectural 32-bit TSS layout. The `_rsvd` halves pad the 16-bit
/// selector fields out to their 32-bit slots.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct Tss {
    pub backlink: u16,
    _rsvd_backlink: u16,
    pub esp0: u32,
    pub ss0: u16,
    _rsvd_ss0: u16,
    pub esp1: u32,
    pub ss1: u16,
    _rsvd_ss1: u16,
    pub esp2: u32,
    pub ss2: u16,
    _rsvd_ss2: u16,
    pub cr3: u32,
    pub eip: u32,
    pub eflags: u32,
    pub eax: u32,
    pub ecx: u32,
    pub edx: u32,
    pub ebx: u32,
    pub esp: u32,
    pub ebp: u32,
    pub esi: u32,
    pub edi: u32,
    pub es: u16,
    _rsvd_es: u16,
    pub cs: u16,
    _rsvd_cs: u16,
    pub ss: u16,
    _rsvd_ss: u16,
    pub ds: u16,
    _rsvd_ds: u16,
    pub fs: u16,
    _rsvd_fs: u16,
    pub gs: u16,
    _rsvd_gs: u16,
    pub ldt: u16,
    _rsvd_ldt: u16,
    pub trap: u16,
    pub iomap_base: u16,
}

impl Tss {
    pub const fn zeroed() -> Self {
        // SAFETY: every field of Tss is a plain integer; all-zero is valid.
        unsafe { core::mem::zeroed() }
    }
}
