//! Every physical frame the VM can give to user pages.
//!
//! Frames are pulled from the physical pool once, at construction, and are
//! recycled from then on. The core map tracks which are handed out and which
//! are pinned (mid-claim or mid-eviction, so not evictable). Each frame keeps
//! weak references to the pages mapping it: one normally, several while shared
//! copy-on-write.

use super::{
    page::Page,
    replacement::{FrameCheck, ReplacementPolicy},
    swap::SwapStore,
    FrameData, FrameId, PhysFrame, PhysicalPool,
};
use crate::error::{Result, VmError};
use crate::sync::mutex::Mutex;
use alloc::{
    boxed::Box,
    sync::{Arc, Weak},
    vec::Vec,
};
use bitbybit::bitfield;
use core::ptr;

#[bitfield(u8, default = 0)]
pub struct CoreMapEntry {
    #[bit(0, rw)]
    allocated: bool,
    #[bit(1, rw)]
    pinned: bool,
    #[bit(2, rw)]
    shared: bool,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FrameStats {
    pub total: usize,
    pub in_use: usize,
    pub pinned: usize,
    pub shared: usize,
    pub evictions: usize,
}

struct Inner {
    core_map: Box<[CoreMapEntry]>,
    owners: Box<[Vec<Weak<Page>>]>,
    /// Where the next-fit scan for a free frame starts.
    position: usize,
    policy: Box<dyn ReplacementPolicy>,
    in_use: usize,
    evictions: usize,
}

impl Inner {
    fn next_free(&mut self) -> Option<FrameId> {
        let total = self.core_map.len();
        let frame = (0..total)
            .map(|i| (self.position + i) % total)
            .find(|&frame| !self.core_map[frame].allocated())?;
        self.position = (frame + 1) % total;
        Some(frame)
    }
}

fn check_frame(
    core_map: &[CoreMapEntry],
    owners: &[Vec<Weak<Page>>],
    frame: FrameId,
) -> FrameCheck {
    let entry = core_map[frame];
    if !entry.allocated() || entry.pinned() || entry.shared() {
        return FrameCheck::Skip;
    }

    let Some(page) = owners[frame].first().and_then(Weak::upgrade) else {
        return FrameCheck::Skip;
    };

    let mmu = page.mmu();
    if mmu.is_accessed(page.va()) {
        mmu.set_accessed(page.va(), false);
        FrameCheck::Referenced
    } else {
        FrameCheck::Candidate
    }
}

fn is_owner(owner: &Weak<Page>, page: &Page) -> bool {
    ptr::eq(owner.as_ptr(), page)
}

pub struct FrameTable {
    frames: Box<[PhysFrame]>,
    pool: Box<dyn PhysicalPool>,
    inner: Mutex<Inner>,
}

impl FrameTable {
    /// Takes up to `max_frames` frames out of `pool`.
    pub fn new(
        pool: Box<dyn PhysicalPool>,
        max_frames: usize,
        policy: Box<dyn ReplacementPolicy>,
    ) -> Self {
        let frames: Box<[PhysFrame]> = (0..max_frames)
            .map_while(|_| pool.alloc_page())
            .collect();
        let total = frames.len();
        log::info!("frame table: {total} user frames");

        Self {
            frames,
            pool,
            inner: Mutex::new(Inner {
                core_map: (0..total).map(|_| CoreMapEntry::DEFAULT).collect(),
                owners: (0..total).map(|_| Vec::new()).collect(),
                position: 0,
                policy,
                in_use: 0,
                evictions: 0,
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn paddr(&self, frame: FrameId) -> usize {
        self.frames[frame].paddr
    }

    /// The frame whose physical page contains `paddr`.
    pub fn frame_of(&self, paddr: usize) -> Option<FrameId> {
        let base = kidneyos_shared::mem::page_round_down(paddr);
        self.frames.iter().position(|frame| frame.paddr == base)
    }

    /// # Safety
    ///
    /// The caller must hold the lock of a page bound to `frame`, or have
    /// `frame` pinned, and nobody may be writing to it.
    pub(crate) unsafe fn data(&self, frame: FrameId) -> &FrameData {
        // SAFETY: the pool guarantees `kva` is valid; the caller guarantees
        // there is no concurrent writer.
        unsafe { self.frames[frame].kva.as_ref() }
    }

    /// # Safety
    ///
    /// The caller must hold the lock of the only page bound to `frame`, or
    /// have `frame` pinned with no page bound yet.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn data_mut(&self, frame: FrameId) -> &mut FrameData {
        // SAFETY: the pool guarantees `kva` is valid; the caller guarantees
        // exclusive access.
        unsafe { &mut *self.frames[frame].kva.as_ptr() }
    }

    /// Hands out a pinned frame with no page bound to it, evicting one if none
    /// is free.
    ///
    /// Victim pages are only `try_lock`ed: a page busy with its own fault,
    /// copy or teardown is passed over. The victim stays locked while it is
    /// written out, so its owner cannot fault it back in half-way.
    pub(crate) fn acquire(&self, swap: Option<&SwapStore>) -> Result<FrameId> {
        let mut inner = self.inner.lock();
        if let Some(frame) = inner.next_free() {
            inner.core_map[frame] = CoreMapEntry::DEFAULT
                .with_allocated(true)
                .with_pinned(true);
            inner.in_use += 1;
            return Ok(frame);
        }

        for _ in 0..=2 * self.frames.len() {
            let Inner {
                core_map,
                owners,
                policy,
                ..
            } = &mut *inner;
            let victim = policy
                .select_victim(self.frames.len(), &mut |frame| {
                    check_frame(core_map, owners, frame)
                })
                .ok_or(VmError::OutOfFrames)?;

            let Some(page) = owners[victim].first().and_then(Weak::upgrade) else {
                continue;
            };
            let Some(mut state) = page.try_lock() else {
                continue;
            };
            if state.frame != Some(victim) {
                continue;
            }

            core_map[victim] = core_map[victim].with_pinned(true);
            drop(inner);

            // SAFETY: the victim's page is locked and the frame is pinned.
            let data = unsafe { self.data(victim) };
            let result = page.evict(&mut state, swap, data, self.paddr(victim));

            let mut inner = self.inner.lock();
            return match result {
                Ok(()) => {
                    state.frame = None;
                    inner.owners[victim].clear();
                    inner.policy.released(victim);
                    inner.evictions += 1;
                    Ok(victim)
                }
                Err(e) => {
                    inner.core_map[victim] = inner.core_map[victim].with_pinned(false);
                    Err(e)
                }
            };
        }

        Err(VmError::OutOfFrames)
    }

    /// Records `page` as the occupant of a freshly acquired frame.
    pub(crate) fn bind(&self, frame: FrameId, page: &Arc<Page>) {
        let mut inner = self.inner.lock();
        assert!(inner.core_map[frame].allocated() && inner.core_map[frame].pinned());
        assert!(inner.owners[frame].is_empty(), "frame {frame} already bound");

        inner.owners[frame].push(Arc::downgrade(page));
        inner.policy.bound(frame);
    }

    /// Adds `page` as another sharer of a resident frame. Fails if the frame
    /// is in the middle of a claim or an eviction.
    pub(crate) fn share(&self, frame: FrameId, page: &Arc<Page>) -> bool {
        let mut inner = self.inner.lock();
        let entry = inner.core_map[frame];
        if !entry.allocated() || entry.pinned() || inner.owners[frame].is_empty() {
            return false;
        }

        inner.owners[frame].push(Arc::downgrade(page));
        inner.core_map[frame] = entry.with_shared(true);
        true
    }

    pub(crate) fn sharers(&self, frame: FrameId) -> usize {
        self.inner.lock().owners[frame].len()
    }

    /// Drops `page` from the frame's occupants. Once nobody is left the
    /// frame is free again; returns whether that happened.
    pub(crate) fn release(&self, frame: FrameId, page: &Page) -> bool {
        let mut inner = self.inner.lock();
        let owners = &mut inner.owners[frame];
        let before = owners.len();
        owners.retain(|owner| !is_owner(owner, page));
        debug_assert_eq!(owners.len() + 1, before, "page does not occupy frame {frame}");

        match owners.len() {
            0 => {
                inner.core_map[frame] = CoreMapEntry::DEFAULT;
                inner.in_use -= 1;
                inner.policy.released(frame);
                true
            }
            1 => {
                inner.core_map[frame] = inner.core_map[frame].with_shared(false);
                false
            }
            _ => false,
        }
    }

    pub(crate) fn unpin(&self, frame: FrameId) {
        let mut inner = self.inner.lock();
        inner.core_map[frame] = inner.core_map[frame].with_pinned(false);
    }

    /// The page occupying `frame`, or the first sharer if it is shared.
    pub fn occupant(&self, frame: FrameId) -> Option<Arc<Page>> {
        self.inner.lock().owners[frame]
            .first()
            .and_then(Weak::upgrade)
    }

    pub fn stats(&self) -> FrameStats {
        let inner = self.inner.lock();
        FrameStats {
            total: self.frames.len(),
            in_use: inner.in_use,
            pinned: inner.core_map.iter().filter(|e| e.pinned()).count(),
            shared: inner.core_map.iter().filter(|e| e.shared()).count(),
            evictions: inner.evictions,
        }
    }

    /// Gives every frame back to the pool.
    pub fn shutdown(self) {
        let in_use = self.inner.lock().in_use;
        if in_use != 0 {
            log::warn!("frame table: shutting down with {in_use} frames in use");
        }

        for frame in self.frames.iter() {
            // SAFETY: every frame came from this pool and the table, which is
            // the only thing handing out references to them, is gone after this.
            unsafe { self.pool.free_page(*frame) };
        }
        log::info!("frame table: returned {} frames", self.frames.len());
    }
}
