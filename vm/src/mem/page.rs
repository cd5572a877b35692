//! One virtual page of one address space.
//!
//! Everything mutable about a page sits behind its own mutex, so a faulting
//! thread and an evicting thread that meet on the same page serialize there.
//! The holder may be waiting on the disk, so the mutex puts contenders to
//! sleep. The frame table only ever `try_lock`s a victim's page.

use super::{
    anon::AnonPage, file_backed::FileMapping, swap::SwapSlot, swap::SwapStore,
    uninit::PageInitializer, FrameData, FrameId,
};
use crate::error::{Result, VmError};
use crate::paging::PageManager;
use crate::sync::mutex::{SleepMutex, SleepMutexGuard};
use crate::sync::scheduler::Scheduler;
use alloc::sync::Arc;
use core::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PageType {
    Uninit,
    Anon,
    File,
}

/// Where a page's contents come from, and go to when it loses its frame.
pub enum Backing {
    /// Never populated. Becomes the initializer's target on first fault.
    Uninit(PageInitializer),
    /// Zero-filled on first use, swapped out under pressure.
    Anon(AnonPage),
    /// A window onto a file; dirty contents go back to the file.
    File(FileMapping),
}

impl Backing {
    pub fn page_type(&self) -> PageType {
        match self {
            Backing::Uninit(_) => PageType::Uninit,
            Backing::Anon(_) => PageType::Anon,
            Backing::File(_) => PageType::File,
        }
    }
}

pub(crate) struct PageState {
    pub(crate) backing: Backing,
    pub(crate) frame: Option<FrameId>,
    /// Mapped read-only on a frame that may be shared with another address
    /// space; the first write gets a private copy.
    pub(crate) cow: bool,
    /// Removed from its address space. Nothing may give it a frame again.
    pub(crate) destroyed: bool,
}

pub struct Page {
    va: usize,
    writable: bool,
    mmu: Arc<dyn PageManager>,
    state: SleepMutex<PageState>,
}

impl Page {
    pub(crate) fn new(
        va: usize,
        writable: bool,
        mmu: Arc<dyn PageManager>,
        backing: Backing,
        scheduler: Arc<dyn Scheduler>,
    ) -> Arc<Self> {
        Arc::new(Self {
            va,
            writable,
            mmu,
            state: SleepMutex::new(
                PageState {
                    backing,
                    frame: None,
                    cow: false,
                    destroyed: false,
                },
                scheduler,
            ),
        })
    }

    pub fn va(&self) -> usize {
        self.va
    }

    pub fn writable(&self) -> bool {
        self.writable
    }

    pub(crate) fn mmu(&self) -> &dyn PageManager {
        &*self.mmu
    }

    pub(crate) fn lock(&self) -> SleepMutexGuard<'_, PageState> {
        self.state.lock()
    }

    pub(crate) fn try_lock(&self) -> Option<SleepMutexGuard<'_, PageState>> {
        self.state.try_lock()
    }

    pub fn page_type(&self) -> PageType {
        self.lock().backing.page_type()
    }

    /// The type the page has or will have once populated.
    pub fn target_type(&self) -> PageType {
        match &self.lock().backing {
            Backing::Uninit(init) => init.target().page_type(),
            backing => backing.page_type(),
        }
    }

    pub fn frame(&self) -> Option<FrameId> {
        self.lock().frame
    }

    pub fn swap_slot(&self) -> Option<SwapSlot> {
        match &self.lock().backing {
            Backing::Anon(anon) => anon.swap_slot(),
            _ => None,
        }
    }

    pub fn is_cow(&self) -> bool {
        self.lock().cow
    }

    /// Points the hardware mapping at `paddr`. Copy-on-write pages stay
    /// read-only.
    pub(crate) fn install(&self, state: &PageState, paddr: usize) -> Result<()> {
        let writable = self.writable && !state.cow;
        if self.mmu.map(self.va, paddr, writable) {
            Ok(())
        } else {
            Err(VmError::MapFailed)
        }
    }

    /// Fills a freshly acquired frame. Leaves the backing as it was, so a
    /// claim that fails later still finds the contents where they were.
    pub(crate) fn populate(
        &self,
        state: &PageState,
        swap: Option<&SwapStore>,
        frame: &mut FrameData,
    ) -> Result<()> {
        match &state.backing {
            Backing::Uninit(init) => init.load(self.va, frame),
            Backing::Anon(anon) => anon.swap_in(swap, frame),
            Backing::File(mapping) => mapping.read_in(frame),
        }
    }

    /// Called once the populated frame is mapped. An uninitialized page becomes
    /// its target type and a swapped-out page gives up its slot.
    pub(crate) fn commit(&self, state: &mut PageState, swap: Option<&SwapStore>) {
        match &mut state.backing {
            Backing::Uninit(init) => {
                let backing = init.backing();
                log::trace!("page {:#x}: uninit -> {:?}", self.va, backing.page_type());
                state.backing = backing;
            }
            Backing::Anon(anon) => anon.swapped_in(swap),
            Backing::File(_) => {}
        }
    }

    /// Saves the contents of `frame` wherever this page keeps them while not
    /// resident and removes the hardware mapping. On failure the mapping is put
    /// back and the page keeps its frame.
    pub(crate) fn evict(
        &self,
        state: &mut PageState,
        swap: Option<&SwapStore>,
        frame: &FrameData,
        paddr: usize,
    ) -> Result<()> {
        // Unmap first so the owner cannot write behind our back.
        let dirty = self.mmu.is_dirty(self.va);
        self.mmu.unmap(self.va);

        let result = match &mut state.backing {
            Backing::Anon(anon) => anon.swap_out(swap, frame),
            Backing::File(mapping) if dirty => mapping.write_back(frame),
            Backing::File(_) => Ok(()),
            Backing::Uninit(_) => Err(VmError::NotPresent),
        };

        if let Err(e) = result {
            log::warn!("page {:#x}: eviction failed: {e}", self.va);
            if self.install(state, paddr).is_ok() && dirty {
                self.mmu.set_dirty(self.va, true);
            }
            return Err(e);
        }

        log::debug!("page {:#x}: evicted", self.va);
        Ok(())
    }

    /// Releases what the backing holds outside the frame. A dirty resident
    /// file page is written back first. Does not touch the frame itself.
    pub(crate) fn destroy(
        &self,
        state: &mut PageState,
        swap: Option<&SwapStore>,
        frame: Option<&FrameData>,
    ) {
        match &mut state.backing {
            Backing::Anon(anon) => anon.destroy(swap),
            Backing::File(mapping) => {
                if let Some(frame) = frame.filter(|_| self.mmu.is_dirty(self.va)) {
                    if let Err(e) = mapping.write_back(frame) {
                        log::warn!("page {:#x}: write-back on unmap failed: {e}", self.va);
                    }
                }
            }
            Backing::Uninit(_) => {}
        }
    }
}

impl fmt::Debug for Page {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Page")
            .field("va", &format_args!("{:#x}", self.va))
            .field("writable", &self.writable)
            .finish_non_exhaustive()
    }
}
