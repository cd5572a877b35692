//! Page fault resolution.

use super::{
    address_space::AddressSpace,
    anon::AnonPage,
    page::{Backing, Page},
};
use crate::error::{Result, VmError};
use crate::vm::Vm;
use alloc::sync::Arc;
use bitbybit::bitfield;
use core::{fmt, sync::atomic::Ordering};
use kidneyos_shared::mem::{is_kernel_vaddr, page_round_down, PAGE_FRAME_SIZE};

/// The error code the CPU pushes for a page fault.
#[bitfield(u32, default = 0)]
pub struct PageFaultErrorCode {
    /// Clear if the page was not present, set on a protection violation.
    #[bit(0, rw)]
    present: bool,
    #[bit(1, rw)]
    write: bool,
    #[bit(2, rw)]
    user: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PageFault {
    /// The faulting address (CR2).
    pub addr: usize,
    /// The user stack pointer at the time of the fault. For faults taken in
    /// kernel mode this must be the one saved on entry from user mode.
    pub stack_pointer: usize,
    pub write: bool,
    pub user: bool,
    pub not_present: bool,
}

impl PageFault {
    pub fn from_error_code(code: u32, addr: usize, stack_pointer: usize) -> Self {
        let code = PageFaultErrorCode::new_with_raw_value(code);
        Self {
            addr,
            stack_pointer,
            write: code.write(),
            user: code.user(),
            not_present: !code.present(),
        }
    }
}

impl fmt::Display for PageFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "page fault at {:#x}: {} error {} page in {} context",
            self.addr,
            if self.not_present { "not present" } else { "rights violation" },
            if self.write { "writing" } else { "reading" },
            if self.user { "user" } else { "kernel" },
        )
    }
}

impl Vm {
    /// Resolves a page fault in `space`. `Ok` means the access can be
    /// retried; any error means the access was illegal or could not be
    /// satisfied, and the caller should kill the process.
    pub fn handle_fault(&self, space: &AddressSpace, fault: &PageFault) -> Result<()> {
        self.counters().faults.fetch_add(1, Ordering::Relaxed);
        log::trace!("{fault}");

        let addr = fault.addr;
        if is_kernel_vaddr(addr) {
            return Err(VmError::KernelAddress);
        }
        if addr < PAGE_FRAME_SIZE {
            return Err(VmError::BadAddress);
        }

        if !fault.not_present {
            return if fault.write {
                self.break_cow(space, addr)
            } else {
                Err(VmError::ProtectionViolation)
            };
        }

        let page = match space.spt().find(addr) {
            Some(page) => page,
            None if self.is_stack_access(fault) => self.grow_stack(space, addr)?,
            None => return Err(VmError::BadAddress),
        };

        if fault.write && !page.writable() {
            return Err(VmError::ProtectionViolation);
        }

        match self.claim_page(&page) {
            // Unmapped by another thread while we waited for the page.
            Err(VmError::NotMapped) => Err(VmError::BadAddress),
            result => result,
        }
    }

    fn is_stack_access(&self, fault: &PageFault) -> bool {
        let stack = &self.config().stack;
        let bottom = stack.top.saturating_sub(stack.max_size);
        (bottom..stack.top).contains(&fault.addr)
            && fault.addr >= fault.stack_pointer.saturating_sub(stack.slack)
    }

    fn grow_stack(&self, space: &AddressSpace, addr: usize) -> Result<Arc<Page>> {
        let va = page_round_down(addr);
        let page = Page::new(
            va,
            true,
            space.mmu().clone(),
            Backing::Anon(AnonPage::default()),
            self.scheduler().clone(),
        );

        match space.spt().insert(page.clone()) {
            Ok(()) => {
                self.counters().stack_growths.fetch_add(1, Ordering::Relaxed);
                log::debug!("stack grew to {va:#x}");
                Ok(page)
            }
            // Another thread grew it first.
            Err(VmError::AlreadyMapped) => space.spt().find(va).ok_or(VmError::BadAddress),
            Err(e) => Err(e),
        }
    }

    /// A write hit a present read-only page. That is only legal on a
    /// copy-on-write page, which then gets a frame of its own.
    fn break_cow(&self, space: &AddressSpace, addr: usize) -> Result<()> {
        let page = space.spt().find(addr).ok_or(VmError::BadAddress)?;
        if !page.writable() {
            return Err(VmError::ProtectionViolation);
        }

        let mut state = page.lock();
        if state.destroyed {
            return Err(VmError::BadAddress);
        }
        let Some(old) = state.frame.filter(|_| state.cow) else {
            // Already resolved, or evicted since; retrying will sort it out.
            return Ok(());
        };

        if self.frames().sharers(old) == 1 {
            state.cow = false;
            page.install(&state, self.frames().paddr(old))?;
            log::trace!("page {:#x}: last sharer, write access restored", page.va());
            return Ok(());
        }

        let new = self.frames().acquire(self.swap())?;
        self.frames().bind(new, &page);
        // SAFETY: `new` is pinned and bound to the locked `page` alone; `old`
        // is shared read-only.
        unsafe {
            let src = self.frames().data(old);
            self.frames().data_mut(new).0.copy_from_slice(&src.0);
        }

        state.frame = Some(new);
        state.cow = false;
        if let Err(e) = page.install(&state, self.frames().paddr(new)) {
            state.frame = Some(old);
            state.cow = true;
            self.frames().release(new, &page);
            return Err(e);
        }

        self.frames().release(old, &page);
        self.frames().unpin(new);
        self.counters().cow_breaks.fetch_add(1, Ordering::Relaxed);
        log::debug!("page {:#x}: copied out of shared frame {old}", page.va());
        Ok(())
    }
}
