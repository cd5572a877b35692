use super::spt::SupplementalPageTable;
use crate::paging::PageManager;
use crate::sync::mutex::{Mutex, MutexGuard};
use alloc::{collections::BTreeMap, sync::Arc};

/// Start address of a live `mmap` region -> number of pages in it.
pub(crate) type MmapRegions = BTreeMap<usize, usize>;

/// Everything the VM knows about one process's user address space.
pub struct AddressSpace {
    mmu: Arc<dyn PageManager>,
    spt: SupplementalPageTable,
    regions: Mutex<MmapRegions>,
}

impl AddressSpace {
    pub fn new(mmu: Arc<dyn PageManager>) -> Self {
        Self {
            mmu,
            spt: SupplementalPageTable::new(),
            regions: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn mmu(&self) -> &Arc<dyn PageManager> {
        &self.mmu
    }

    pub fn spt(&self) -> &SupplementalPageTable {
        &self.spt
    }

    pub(crate) fn regions(&self) -> MutexGuard<'_, MmapRegions> {
        self.regions.lock()
    }

    /// Number of live `mmap` regions.
    pub fn region_count(&self) -> usize {
        self.regions.lock().len()
    }
}
