pub mod address_space;
pub mod anon;
pub mod fault;
pub mod file_backed;
pub mod frame_table;
pub mod mmap;
pub mod page;
pub mod replacement;
pub mod spt;
pub mod swap;
pub mod uninit;

use core::ptr::NonNull;
use kidneyos_shared::mem::PAGE_FRAME_SIZE;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

/// The contents of one page, as plain bytes.
#[repr(C)]
#[derive(FromZeroes, FromBytes, AsBytes)]
pub struct FrameData(pub [u8; PAGE_FRAME_SIZE]);

/// Index of a frame in the frame table.
pub type FrameId = usize;

/// One physical page handed out by a [`PhysicalPool`]: its physical address
/// (what goes into page table entries) and the kernel's view of its bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PhysFrame {
    pub paddr: usize,
    pub kva: NonNull<FrameData>,
}

// SAFETY: a `PhysFrame` is an address pair. Whoever dereferences `kva` is
// responsible for synchronizing access to the bytes behind it.
unsafe impl Send for PhysFrame {}
// SAFETY: see above.
unsafe impl Sync for PhysFrame {}

/// The physical page allocator the frame table draws user frames from.
///
/// # Safety
///
/// `alloc_page` must return frames whose `kva` is valid for reads and writes of
/// a whole [`FrameData`] and that nobody else uses until they are handed back
/// through `free_page`. `paddr` must be page-aligned and below 4 GiB.
pub unsafe trait PhysicalPool: Send + Sync {
    fn alloc_page(&self) -> Option<PhysFrame>;

    /// # Safety
    ///
    /// `frame` must have come from `alloc_page` on this pool and must no longer
    /// be referenced.
    unsafe fn free_page(&self, frame: PhysFrame);
}
