//! In-memory stand-ins for the disk, the filesystem and physical memory, plus
//! helpers that play the MMU for user accesses.

use crate::block::{Block, BlockDevice, BlockError, BlockSector, BlockType, BLOCK_SECTOR_SIZE};
use crate::error::Result;
use crate::file::{FileError, MappedFile};
use crate::mem::{
    address_space::AddressSpace, fault::PageFault, swap::SECTORS_PER_PAGE, FrameData, PhysFrame,
    PhysicalPool,
};
use crate::paging::{PageManager, SoftPageManager};
use crate::sync::mutex::Mutex;
use crate::sync::scheduler::{Scheduler, Tid};
use crate::user_program::elf::{ELF_HEADER_SIZE, PROGRAM_HEADER_SIZE};
use crate::vm::{Vm, VmConfig};
use alloc::{boxed::Box, collections::BTreeMap, sync::Arc, vec, vec::Vec};
use core::cmp::min;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use kidneyos_shared::mem::{page_offset, PAGE_FRAME_SIZE};
use zerocopy::FromZeroes;

struct DiskState {
    bytes: Mutex<Vec<u8>>,
    writes: AtomicUsize,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
}

/// A RAM disk. Clones share the same sectors.
#[derive(Clone)]
pub struct MemDisk {
    state: Arc<DiskState>,
}

impl MemDisk {
    pub fn new(sectors: usize) -> Self {
        Self {
            state: Arc::new(DiskState {
                bytes: Mutex::new(vec![0; sectors * BLOCK_SECTOR_SIZE]),
                writes: AtomicUsize::new(0),
                fail_reads: AtomicBool::new(false),
                fail_writes: AtomicBool::new(false),
            }),
        }
    }

    /// Sector writes that reached the disk.
    pub fn writes(&self) -> usize {
        self.state.writes.load(Ordering::SeqCst)
    }

    pub fn fail_reads(&self, fail: bool) {
        self.state.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn fail_writes(&self, fail: bool) {
        self.state.fail_writes.store(fail, Ordering::SeqCst);
    }
}

impl BlockDevice for MemDisk {
    fn read(&self, sector: BlockSector, buf: &mut [u8]) -> core::result::Result<(), BlockError> {
        if self.state.fail_reads.load(Ordering::SeqCst) {
            return Err(BlockError::ReadError);
        }
        let start = sector as usize * BLOCK_SECTOR_SIZE;
        buf.copy_from_slice(&self.state.bytes.lock()[start..start + BLOCK_SECTOR_SIZE]);
        Ok(())
    }

    fn write(&self, sector: BlockSector, buf: &[u8]) -> core::result::Result<(), BlockError> {
        if self.state.fail_writes.load(Ordering::SeqCst) {
            return Err(BlockError::WriteError);
        }
        let start = sector as usize * BLOCK_SECTOR_SIZE;
        self.state.bytes.lock()[start..start + BLOCK_SECTOR_SIZE].copy_from_slice(buf);
        self.state.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn size(&self) -> BlockSector {
        (self.state.bytes.lock().len() / BLOCK_SECTOR_SIZE) as BlockSector
    }
}

/// A file held in memory. Counts read and write calls.
pub struct MemFile {
    bytes: Mutex<Vec<u8>>,
    reads: AtomicUsize,
    writes: AtomicUsize,
}

impl MemFile {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self {
            bytes: Mutex::new(bytes),
            reads: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
        }
    }

    pub fn contents(&self) -> Vec<u8> {
        self.bytes.lock().clone()
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn truncate(&self, len: usize) {
        self.bytes.lock().truncate(len);
    }
}

impl MappedFile for MemFile {
    fn read_at(&self, offset: usize, buf: &mut [u8]) -> core::result::Result<usize, FileError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let bytes = self.bytes.lock();
        let start = min(offset, bytes.len());
        let n = min(buf.len(), bytes.len() - start);
        buf[..n].copy_from_slice(&bytes[start..start + n]);
        Ok(n)
    }

    fn write_at(&self, offset: usize, buf: &[u8]) -> core::result::Result<usize, FileError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        let mut bytes = self.bytes.lock();
        let start = min(offset, bytes.len());
        let n = min(buf.len(), bytes.len() - start);
        bytes[start..start + n].copy_from_slice(&buf[..n]);
        Ok(n)
    }

    fn len(&self) -> usize {
        self.bytes.lock().len()
    }
}

struct PoolFrames {
    all: Vec<PhysFrame>,
    free: Mutex<Vec<PhysFrame>>,
}

impl Drop for PoolFrames {
    fn drop(&mut self) {
        for frame in &self.all {
            // SAFETY: every frame was leaked from a box in `HeapPool::new`, and
            // the pool outlives every frame table it was handed to.
            drop(unsafe { Box::from_raw(frame.kva.as_ptr()) });
        }
    }
}

/// Physical memory carved out of the heap, with made-up physical addresses.
#[derive(Clone)]
pub struct HeapPool {
    frames: Arc<PoolFrames>,
}

impl HeapPool {
    const BASE: usize = 0x0010_0000;

    pub fn new(frames: usize) -> Self {
        let all: Vec<PhysFrame> = (0..frames)
            .map(|i| PhysFrame {
                paddr: Self::BASE + i * PAGE_FRAME_SIZE,
                kva: NonNull::from(Box::leak(FrameData::new_box_zeroed())),
            })
            .collect();
        let free = all.iter().rev().copied().collect();

        Self {
            frames: Arc::new(PoolFrames {
                all,
                free: Mutex::new(free),
            }),
        }
    }

    pub fn available(&self) -> usize {
        self.frames.free.lock().len()
    }
}

// SAFETY: frames are distinct heap pages that stay allocated as long as any
// handle to the pool exists.
unsafe impl PhysicalPool for HeapPool {
    fn alloc_page(&self) -> Option<PhysFrame> {
        self.frames.free.lock().pop()
    }

    unsafe fn free_page(&self, frame: PhysFrame) {
        self.frames.free.lock().push(frame);
    }
}

/// Host threads as kernel threads. Ids are handed out on first use and a
/// sleeping thread is parked.
pub struct ThreadScheduler;

static NEXT_TID: AtomicU32 = AtomicU32::new(1);
static THREADS: Mutex<BTreeMap<Tid, std::thread::Thread>> = Mutex::new(BTreeMap::new());

std::thread_local! {
    static TID: Tid = {
        let tid = NEXT_TID.fetch_add(1, Ordering::Relaxed);
        THREADS.lock().insert(tid, std::thread::current());
        tid
    };
}

impl Scheduler for ThreadScheduler {
    fn current(&self) -> Tid {
        TID.with(|tid| *tid)
    }

    fn sleep(&self) {
        // An unpark that came first makes this return at once.
        std::thread::park();
    }

    fn wakeup(&self, tid: Tid) {
        if let Some(thread) = THREADS.lock().get(&tid) {
            thread.unpark();
        }
    }
}

/// An MMU whose next `map` calls fail, as when a page table cannot be
/// allocated.
#[derive(Default)]
pub struct FlakyMmu {
    inner: SoftPageManager,
    failures: AtomicUsize,
}

impl FlakyMmu {
    pub fn fail_maps(&self, count: usize) {
        self.failures.store(count, Ordering::SeqCst);
    }
}

impl PageManager for FlakyMmu {
    fn map(&self, va: usize, pa: usize, writable: bool) -> bool {
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        !failing && self.inner.map(va, pa, writable)
    }

    fn unmap(&self, va: usize) {
        self.inner.unmap(va)
    }

    fn translate(&self, va: usize) -> Option<usize> {
        self.inner.translate(va)
    }

    fn is_writable(&self, va: usize) -> bool {
        self.inner.is_writable(va)
    }

    fn is_dirty(&self, va: usize) -> bool {
        self.inner.is_dirty(va)
    }

    fn set_dirty(&self, va: usize, dirty: bool) {
        self.inner.set_dirty(va, dirty)
    }

    fn is_accessed(&self, va: usize) -> bool {
        self.inner.is_accessed(va)
    }

    fn set_accessed(&self, va: usize, accessed: bool) {
        self.inner.set_accessed(va, accessed)
    }
}

pub struct Fixture {
    pub vm: Vm,
    pub space: AddressSpace,
    pub mmu: Arc<SoftPageManager>,
    pub disk: MemDisk,
}

/// A VM with `frames` user frames and, if `swap_pages` is nonzero, a swap
/// device of that many slots, plus one empty address space.
pub fn fixture(frames: usize, swap_pages: usize) -> Fixture {
    fixture_with(frames, swap_pages, VmConfig::default())
}

pub fn fixture_with(frames: usize, swap_pages: usize, config: VmConfig) -> Fixture {
    let vm = Vm::new(
        Box::new(HeapPool::new(frames)),
        frames,
        config,
        Arc::new(ThreadScheduler),
    );
    let disk = MemDisk::new(swap_pages * SECTORS_PER_PAGE);
    if swap_pages > 0 {
        let block = Block::new(BlockType::Swap, "swap", Box::new(disk.clone()));
        vm.attach_swap(block).expect("attach swap");
    }

    let mmu = Arc::new(SoftPageManager::new());
    let space = AddressSpace::new(mmu.clone());
    Fixture {
        vm,
        space,
        mmu,
        disk,
    }
}

/// `len` bytes that differ from page to page.
pub fn patterned(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 % 251) as u8).collect()
}

/// One user access at `va`, faulting as the MMU would until it succeeds.
/// Returns the physical address.
fn access(vm: &Vm, space: &AddressSpace, va: usize, write: bool) -> Result<usize> {
    let mmu = space.mmu();
    loop {
        match mmu.translate(va) {
            Some(pa) if !write || mmu.is_writable(va) => {
                mmu.set_accessed(va, true);
                if write {
                    mmu.set_dirty(va, true);
                }
                return Ok(pa);
            }
            translation => {
                let fault = PageFault {
                    addr: va,
                    stack_pointer: va,
                    write,
                    user: true,
                    not_present: translation.is_none(),
                };
                vm.handle_fault(space, &fault)?;
            }
        }
    }
}

#[allow(clippy::mut_from_ref)]
fn frame_bytes(vm: &Vm, pa: usize) -> &mut [u8] {
    let frame = vm.frames().frame_of(pa).expect("address maps to a user frame");
    // SAFETY: tests drive one access at a time.
    unsafe { &mut vm.frames().data_mut(frame).0[page_offset(pa)..] }
}

pub fn user_write(vm: &Vm, space: &AddressSpace, va: usize, bytes: &[u8]) -> Result<()> {
    let mut done = 0;
    while done < bytes.len() {
        let addr = va + done;
        let chunk = min(bytes.len() - done, PAGE_FRAME_SIZE - page_offset(addr));
        let pa = access(vm, space, addr, true)?;
        frame_bytes(vm, pa)[..chunk].copy_from_slice(&bytes[done..done + chunk]);
        done += chunk;
    }
    Ok(())
}

pub fn user_read(vm: &Vm, space: &AddressSpace, va: usize, buf: &mut [u8]) -> Result<()> {
    let mut done = 0;
    while done < buf.len() {
        let addr = va + done;
        let chunk = min(buf.len() - done, PAGE_FRAME_SIZE - page_offset(addr));
        let pa = access(vm, space, addr, false)?;
        buf[done..done + chunk].copy_from_slice(&frame_bytes(vm, pa)[..chunk]);
        done += chunk;
    }
    Ok(())
}

fn put_u16(image: &mut [u8], at: usize, value: u16) {
    image[at..at + 2].copy_from_slice(&value.to_le_bytes());
}

fn put_u32(image: &mut [u8], at: usize, value: u32) {
    image[at..at + 4].copy_from_slice(&value.to_le_bytes());
}

/// A little-endian i386 executable with one `PT_LOAD` per
/// `(vaddr, bytes, memory_size, flags)`. Segment `i` starts in file page
/// `i + 1` at the same page offset as its address.
pub fn elf_image(entry: u32, segments: &[(u32, &[u8], u32, u32)]) -> Vec<u8> {
    let table_end = ELF_HEADER_SIZE + segments.len() * PROGRAM_HEADER_SIZE;
    let mut image = vec![0u8; table_end];

    image[..7].copy_from_slice(&[0x7F, b'E', b'L', b'F', 1, 1, 1]);
    put_u16(&mut image, 16, 2);
    put_u16(&mut image, 18, 3);
    put_u32(&mut image, 20, 1);
    put_u32(&mut image, 24, entry);
    put_u32(&mut image, 28, ELF_HEADER_SIZE as u32);
    put_u16(&mut image, 40, ELF_HEADER_SIZE as u16);
    put_u16(&mut image, 42, PROGRAM_HEADER_SIZE as u16);
    put_u16(&mut image, 44, segments.len() as u16);

    for (i, &(vaddr, bytes, memory_size, flags)) in segments.iter().enumerate() {
        let offset = (i + 1) * PAGE_FRAME_SIZE + page_offset(vaddr as usize);
        let at = ELF_HEADER_SIZE + i * PROGRAM_HEADER_SIZE;
        put_u32(&mut image, at, 1);
        put_u32(&mut image, at + 4, offset as u32);
        put_u32(&mut image, at + 8, vaddr);
        put_u32(&mut image, at + 12, vaddr);
        put_u32(&mut image, at + 16, bytes.len() as u32);
        put_u32(&mut image, at + 20, memory_size);
        put_u32(&mut image, at + 24, flags);
        put_u32(&mut image, at + 28, PAGE_FRAME_SIZE as u32);

        if image.len() < offset + bytes.len() {
            image.resize(offset + bytes.len(), 0);
        }
        image[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    image
}
