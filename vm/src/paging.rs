//! The hardware page table, as seen by the VM.
//!
//! The VM only ever touches user mappings through [`PageManager`]. On hosted
//! builds (and in tests) [`SoftPageManager`] keeps real x86 two-level tables in
//! memory; whoever plays the MMU sets the accessed and dirty bits.

use crate::sync::mutex::Mutex;
use alloc::{boxed::Box, collections::BTreeMap};
use kidneyos_shared::{
    mem::page_offset,
    paging::{PageTable, PageTableEntry, VirtualAddress},
};

pub trait PageManager: Send + Sync {
    /// Installs a user mapping from the page at `va` to the frame at `pa`,
    /// replacing any existing one. Returns false if the mapping could not be
    /// created.
    #[must_use]
    fn map(&self, va: usize, pa: usize, writable: bool) -> bool;

    /// Removes the mapping for `va`, if any.
    fn unmap(&self, va: usize);

    /// The physical address `va` currently translates to.
    fn translate(&self, va: usize) -> Option<usize>;

    fn is_writable(&self, va: usize) -> bool;

    fn is_dirty(&self, va: usize) -> bool;
    fn set_dirty(&self, va: usize, dirty: bool);
    fn is_accessed(&self, va: usize) -> bool;
    fn set_accessed(&self, va: usize, accessed: bool);
}

#[derive(Default)]
pub struct SoftPageManager {
    tables: Mutex<BTreeMap<u16, Box<PageTable>>>,
}

impl SoftPageManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_entry<R>(&self, va: usize, f: impl FnOnce(&mut PageTableEntry) -> R) -> Option<R> {
        let addr = VirtualAddress::from_usize(va);
        let mut tables = self.tables.lock();
        let table = tables.get_mut(&addr.page_directory_index().value())?;
        let entry = &mut table[usize::from(addr.page_table_index().value())];
        entry.present().then(|| f(entry))
    }

    /// Number of present user mappings.
    pub fn mapped_count(&self) -> usize {
        self.tables
            .lock()
            .values()
            .map(|table| table.iter().filter(|entry| entry.present()).count())
            .sum()
    }
}

impl PageManager for SoftPageManager {
    fn map(&self, va: usize, pa: usize, writable: bool) -> bool {
        let addr = VirtualAddress::from_usize(va);
        let mut tables = self.tables.lock();
        let table = tables
            .entry(addr.page_directory_index().value())
            .or_insert_with(Box::default);
        table[usize::from(addr.page_table_index().value())] = PageTableEntry::user(pa, writable);
        true
    }

    fn unmap(&self, va: usize) {
        self.with_entry(va, |entry| *entry = PageTableEntry::DEFAULT);
    }

    fn translate(&self, va: usize) -> Option<usize> {
        self.with_entry(va, |entry| entry.phys_addr() + page_offset(va))
    }

    fn is_writable(&self, va: usize) -> bool {
        self.with_entry(va, |entry| entry.read_write())
            .unwrap_or(false)
    }

    fn is_dirty(&self, va: usize) -> bool {
        self.with_entry(va, |entry| entry.dirty()).unwrap_or(false)
    }

    fn set_dirty(&self, va: usize, dirty: bool) {
        self.with_entry(va, |entry| *entry = entry.with_dirty(dirty));
    }

    fn is_accessed(&self, va: usize) -> bool {
        self.with_entry(va, |entry| entry.accessed())
            .unwrap_or(false)
    }

    fn set_accessed(&self, va: usize, accessed: bool) {
        self.with_entry(va, |entry| *entry = entry.with_accessed(accessed));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_translate_and_bits() {
        let mmu = SoftPageManager::new();
        assert_eq!(mmu.translate(0x40_0000), None);

        assert!(mmu.map(0x40_0000, 0x0020_0000, true));
        assert_eq!(mmu.translate(0x40_0123), Some(0x0020_0123));
        assert!(mmu.is_writable(0x40_0000));
        assert!(!mmu.is_accessed(0x40_0000));

        mmu.set_accessed(0x40_0000, true);
        mmu.set_dirty(0x40_0000, true);
        assert!(mmu.is_accessed(0x40_0000) && mmu.is_dirty(0x40_0000));
        mmu.set_accessed(0x40_0000, false);
        assert!(!mmu.is_accessed(0x40_0000) && mmu.is_dirty(0x40_0000));
    }

    #[test]
    fn remap_replaces_entry() {
        let mmu = SoftPageManager::new();
        assert!(mmu.map(0x1000, 0x3000, true));
        mmu.set_dirty(0x1000, true);
        assert!(mmu.map(0x1000, 0x3000, false));
        assert!(!mmu.is_writable(0x1000));
        assert!(!mmu.is_dirty(0x1000));
        assert!(!mmu.is_writable(0x2000));
    }

    #[test]
    fn unmap_clears_entry() {
        let mmu = SoftPageManager::new();
        assert!(mmu.map(0x1000, 0x3000, true));
        assert!(mmu.map(0x0080_0000, 0x4000, true));
        assert_eq!(mmu.mapped_count(), 2);
        mmu.unmap(0x1000);
        assert_eq!(mmu.translate(0x1000), None);
        assert!(!mmu.is_dirty(0x1000));
        assert_eq!(mmu.mapped_count(), 1);
    }
}
