//! The supplemental page table: per address space, the source of truth for
//! what should be mapped where, whether or not it is resident.

use super::{
    address_space::AddressSpace,
    anon::AnonPage,
    page::{Backing, Page, PageState, PageType},
    uninit::PageInitializer,
    FrameData,
};
use crate::error::{Result, VmError};
use crate::sync::mutex::Mutex;
use crate::vm::Vm;
use alloc::{collections::BTreeMap, sync::Arc, vec::Vec};
use core::mem;
use kidneyos_shared::mem::{is_user_vaddr, page_offset, page_round_down, PAGE_FRAME_SIZE};

#[derive(Default)]
pub struct SupplementalPageTable {
    pages: Mutex<BTreeMap<usize, Arc<Page>>>,
}

impl SupplementalPageTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// The page containing `addr`, which need not be page-aligned.
    pub fn find(&self, addr: usize) -> Option<Arc<Page>> {
        self.pages.lock().get(&page_round_down(addr)).cloned()
    }

    pub fn insert(&self, page: Arc<Page>) -> Result<()> {
        let mut pages = self.pages.lock();
        if pages.contains_key(&page.va()) {
            return Err(VmError::AlreadyMapped);
        }
        pages.insert(page.va(), page);
        Ok(())
    }

    /// Whether any page lies in `[start, start + len)`.
    pub fn overlaps(&self, start: usize, len: usize) -> bool {
        let end = start.saturating_add(len);
        self.pages.lock().range(start..end).next().is_some()
    }

    pub fn len(&self) -> usize {
        self.pages.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.lock().is_empty()
    }

    /// Snapshot of every page, in address order.
    pub fn pages(&self) -> Vec<Arc<Page>> {
        self.pages.lock().values().cloned().collect()
    }

    fn take(&self, addr: usize) -> Option<Arc<Page>> {
        self.pages.lock().remove(&page_round_down(addr))
    }

    fn take_all(&self) -> BTreeMap<usize, Arc<Page>> {
        mem::take(&mut *self.pages.lock())
    }
}

impl Vm {
    /// Reserves the page at `va` without touching memory. Its contents are
    /// produced by `init` on the first fault.
    pub fn map_lazy(
        &self,
        space: &AddressSpace,
        va: usize,
        writable: bool,
        init: PageInitializer,
    ) -> Result<()> {
        if page_offset(va) != 0 || va == 0 || !is_user_vaddr(va) {
            return Err(VmError::InvalidMapping);
        }

        let page = Page::new(
            va,
            writable,
            space.mmu().clone(),
            Backing::Uninit(init),
            self.scheduler().clone(),
        );
        space.spt().insert(page)?;
        log::trace!("map_lazy: {va:#x} writable={writable}");
        Ok(())
    }

    /// Populates the page at `va` now instead of on its first fault.
    pub fn claim(&self, space: &AddressSpace, va: usize) -> Result<()> {
        let page = space.spt().find(va).ok_or(VmError::NotMapped)?;
        self.claim_page(&page)
    }

    /// Removes the page at `va`, writing it back if it is a dirty file page
    /// and giving up its frame and swap slot.
    pub fn unmap(&self, space: &AddressSpace, va: usize) -> Result<()> {
        let page = space.spt().take(va).ok_or(VmError::NotMapped)?;
        self.destroy_page(&page);
        Ok(())
    }

    /// Removes every page of `space`. Calling it again does nothing.
    pub fn teardown(&self, space: &AddressSpace) {
        let pages = space.spt().take_all();
        space.regions().clear();
        if pages.is_empty() {
            return;
        }

        log::debug!("teardown: {} pages", pages.len());
        for page in pages.values() {
            self.destroy_page(page);
        }
    }

    /// Duplicates `src` into the empty `dst`, as for `fork`.
    ///
    /// Untouched pages share their initializer. Resident anonymous pages
    /// share their frame copy-on-write if that is enabled; everything else
    /// that has contents gets a private copy right away. On error `dst` is
    /// left partially filled and should be torn down.
    pub fn copy(&self, dst: &AddressSpace, src: &AddressSpace) -> Result<()> {
        for src_page in src.spt().pages() {
            self.copy_page(dst, &src_page)?;
        }

        let regions = src.regions().clone();
        *dst.regions() = regions;
        Ok(())
    }

    fn copy_page(&self, dst: &AddressSpace, src_page: &Arc<Page>) -> Result<()> {
        let va = src_page.va();
        let mut src_state = src_page.lock();
        if src_state.destroyed {
            // Unmapped from `src` since the snapshot was taken.
            return Ok(());
        }

        let backing = match &src_state.backing {
            Backing::Uninit(init) => Backing::Uninit(init.clone()),
            Backing::Anon(_) => Backing::Anon(AnonPage::default()),
            Backing::File(mapping) => Backing::File(mapping.clone()),
        };
        let page = Page::new(
            va,
            src_page.writable(),
            dst.mmu().clone(),
            backing,
            self.scheduler().clone(),
        );
        dst.spt().insert(page.clone())?;

        let resident = src_state.frame;
        let slot = match &src_state.backing {
            Backing::Anon(anon) => anon.swap_slot(),
            _ => None,
        };

        match (src_state.backing.page_type(), resident) {
            (PageType::Uninit, _) => Ok(()),
            (PageType::Anon, Some(frame))
                if self.config().copy_on_write && self.frames().share(frame, &page) =>
            {
                let paddr = self.frames().paddr(frame);
                let mut state = page.lock();
                state.frame = Some(frame);
                state.cow = true;
                src_state.cow = true;
                src_page.install(&src_state, paddr)?;
                page.install(&state, paddr)?;
                log::trace!("copy: {va:#x} shared copy-on-write");
                Ok(())
            }
            (kind, Some(frame)) => {
                let mut state = page.lock();
                self.fill_frame(&page, &mut state, |_, data| {
                    // SAFETY: the source page is locked; its frame is at most
                    // shared read-only.
                    let src = unsafe { self.frames().data(frame) };
                    data.0.copy_from_slice(&src.0);
                    Ok(())
                })?;
                if kind == PageType::File && src_page.mmu().is_dirty(va) {
                    page.mmu().set_dirty(va, true);
                }
                Ok(())
            }
            (_, None) => match slot {
                Some(slot) => {
                    let swap = self.swap().ok_or(VmError::SwapUnavailable)?;
                    let mut state = page.lock();
                    self.fill_frame(&page, &mut state, |_, data| swap.read_slot(slot, data))
                }
                None => Ok(()),
            },
        }
    }

    pub(crate) fn claim_page(&self, page: &Arc<Page>) -> Result<()> {
        let mut state = page.lock();
        if state.destroyed {
            return Err(VmError::NotMapped);
        }
        if state.frame.is_some() {
            // Someone else faulted it in while we waited for the lock.
            return Ok(());
        }

        let swap = self.swap();
        self.fill_frame(page, &mut state, |state, data| page.populate(state, swap, data))?;
        page.commit(&mut state, swap);
        Ok(())
    }

    /// Gives the locked, non-resident `page` a frame, fills it with `fill`
    /// and maps it. On failure the frame is released again and the page is
    /// left without one.
    pub(crate) fn fill_frame(
        &self,
        page: &Arc<Page>,
        state: &mut PageState,
        fill: impl FnOnce(&PageState, &mut FrameData) -> Result<()>,
    ) -> Result<()> {
        debug_assert!(state.frame.is_none());

        let frame = self.frames().acquire(self.swap())?;
        self.frames().bind(frame, page);
        state.frame = Some(frame);
        state.cow = false;

        // SAFETY: the frame is pinned and bound to `page` alone, which is locked.
        let data = unsafe { self.frames().data_mut(frame) };
        let result = fill(&*state, data)
            .and_then(|()| page.install(state, self.frames().paddr(frame)));

        match result {
            Ok(()) => {
                self.frames().unpin(frame);
                log::trace!("page {:#x}: claimed frame {frame}", page.va());
                Ok(())
            }
            Err(e) => {
                state.frame = None;
                self.frames().release(frame, page);
                log::debug!("page {:#x}: claim failed: {e}", page.va());
                Err(e)
            }
        }
    }

    fn destroy_page(&self, page: &Arc<Page>) {
        let mut state = page.lock();
        state.destroyed = true;
        // SAFETY: the page is locked; a shared frame is only ever read.
        let data = state.frame.map(|frame| unsafe { self.frames().data(frame) });
        page.destroy(&mut state, self.swap(), data);

        if let Some(frame) = state.frame.take() {
            page.mmu().unmap(page.va());
            self.frames().release(frame, page);
        }
    }
}

/// `[start, start + pages * PAGE_FRAME_SIZE)`, or [`None`] on overflow.
pub(crate) fn page_range(start: usize, pages: usize) -> Option<core::ops::Range<usize>> {
    let len = pages.checked_mul(PAGE_FRAME_SIZE)?;
    Some(start..start.checked_add(len)?)
}
