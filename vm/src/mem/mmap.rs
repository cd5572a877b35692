//! File mappings.
//!
//! `mmap` only records one lazy file-backed page per page of the region; the
//! file is read on first touch. `munmap` (and teardown) write dirty pages back.

use super::{
    address_space::AddressSpace, file_backed::FileMapping, spt::page_range,
    uninit::PageInitializer,
};
use crate::error::{Result, VmError};
use crate::file::MappedFile;
use crate::vm::Vm;
use alloc::sync::Arc;
use core::cmp::min;
use kidneyos_shared::mem::{is_user_vaddr, page_offset, PAGE_FRAME_SIZE};

impl Vm {
    /// Maps `length` bytes of `file`, starting at `offset`, at `addr`.
    /// Returns the start of the mapping.
    ///
    /// Bytes past the end of the file read as zero and are never written
    /// back. The mapping keeps its own reference to the file.
    pub fn mmap(
        &self,
        space: &AddressSpace,
        addr: usize,
        length: usize,
        writable: bool,
        file: Arc<dyn MappedFile>,
        offset: usize,
    ) -> Result<usize> {
        if addr == 0 || page_offset(addr) != 0 || page_offset(offset) != 0 || length == 0 {
            return Err(VmError::InvalidMapping);
        }
        let file_len = file.len();
        if file_len <= offset {
            return Err(VmError::InvalidMapping);
        }

        let pages = length
            .checked_add(PAGE_FRAME_SIZE - 1)
            .ok_or(VmError::InvalidMapping)?
            / PAGE_FRAME_SIZE;
        let range = page_range(addr, pages).ok_or(VmError::InvalidMapping)?;
        if !is_user_vaddr(range.end - 1) {
            return Err(VmError::InvalidMapping);
        }
        if space.spt().overlaps(range.start, range.len()) {
            return Err(VmError::InvalidMapping);
        }

        let mapped = min(length, file_len - offset);
        for i in 0..pages {
            let va = addr + i * PAGE_FRAME_SIZE;
            let read_bytes = min(PAGE_FRAME_SIZE, mapped.saturating_sub(i * PAGE_FRAME_SIZE));
            let mapping = FileMapping::new(file.clone(), offset + i * PAGE_FRAME_SIZE, read_bytes);

            if let Err(e) = self.map_lazy(space, va, writable, PageInitializer::file(mapping)) {
                // Lost a race with another mapping; undo what we added.
                for done in 0..i {
                    let _ = self.unmap(space, addr + done * PAGE_FRAME_SIZE);
                }
                return Err(e);
            }
        }

        space.regions().insert(addr, pages);
        log::debug!("mmap: {addr:#x}, {pages} pages at file offset {offset:#x}");
        Ok(addr)
    }

    /// Unmaps the region `mmap` returned `addr` for.
    pub fn munmap(&self, space: &AddressSpace, addr: usize) -> Result<()> {
        let pages = space.regions().remove(&addr).ok_or(VmError::NotMapped)?;

        for i in 0..pages {
            let va = addr + i * PAGE_FRAME_SIZE;
            if let Err(e) = self.unmap(space, va) {
                log::warn!("munmap: page {va:#x} vanished: {e}");
            }
        }

        log::debug!("munmap: {addr:#x}, {pages} pages");
        Ok(())
    }
}
