//! Page-sized slots on the swap device.
//!
//! Slot `n` lives in sectors `n * SECTORS_PER_PAGE ..` of the device. The
//! occupancy bitmap is the only bookkeeping; slots know nothing about the pages
//! that own them.

use super::FrameData;
use crate::block::{Block, BlockSector, BlockType, BLOCK_SECTOR_SIZE};
use crate::error::{Result, VmError};
use crate::sync::mutex::Mutex;
use core::fmt;
use kidneyos_shared::{bit_array::Bitmap, mem::PAGE_FRAME_SIZE};
use zerocopy::AsBytes;

pub const SECTORS_PER_PAGE: usize = PAGE_FRAME_SIZE / BLOCK_SECTOR_SIZE;

/// Index of one page-sized slot on the swap device.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct SwapSlot(usize);

impl SwapSlot {
    pub fn index(self) -> usize {
        self.0
    }

    #[allow(clippy::cast_possible_truncation)]
    fn sector(self, i: usize) -> BlockSector {
        (self.0 * SECTORS_PER_PAGE + i) as BlockSector
    }
}

impl fmt::Display for SwapSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "slot {}", self.0)
    }
}

pub struct SwapStore {
    block: Block,
    used: Mutex<Bitmap>,
}

impl SwapStore {
    /// Takes over `block`, which must be the swap device.
    pub fn new(block: Block) -> Result<Self> {
        if block.get_type() != BlockType::Swap {
            return Err(VmError::InvalidMapping);
        }

        let slots = block.get_size() as usize / SECTORS_PER_PAGE;
        log::info!("swap: {block}, {slots} page slots");

        Ok(Self {
            block,
            used: Mutex::new(Bitmap::new(slots)),
        })
    }

    pub fn slot_count(&self) -> usize {
        self.used.lock().len()
    }

    pub fn used_slots(&self) -> usize {
        self.used.lock().count_ones()
    }

    pub fn is_occupied(&self, slot: SwapSlot) -> bool {
        self.used.lock().get(slot.0)
    }

    pub fn device(&self) -> &Block {
        &self.block
    }

    pub fn reserve_slot(&self) -> Result<SwapSlot> {
        self.used
            .lock()
            .scan_and_flip()
            .map(SwapSlot)
            .ok_or(VmError::SwapExhausted)
    }

    /// Marks `slot` free. Freeing a free slot does nothing.
    pub fn free_slot(&self, slot: SwapSlot) {
        let mut used = self.used.lock();
        if slot.0 < used.len() {
            used.set(slot.0, false);
        }
    }

    /// Writes one page into a reserved slot.
    pub fn write_slot(&self, slot: SwapSlot, data: &FrameData) -> Result<()> {
        debug_assert!(self.is_occupied(slot), "writing to unreserved {slot}");

        for (i, chunk) in data.as_bytes().chunks_exact(BLOCK_SECTOR_SIZE).enumerate() {
            self.block.write(slot.sector(i), chunk)?;
        }

        log::debug!("swap: wrote {slot}");
        Ok(())
    }

    /// Reads one page out of an occupied slot. The slot stays reserved.
    pub fn read_slot(&self, slot: SwapSlot, out: &mut FrameData) -> Result<()> {
        debug_assert!(self.is_occupied(slot), "reading from free {slot}");

        for (i, chunk) in out
            .as_bytes_mut()
            .chunks_exact_mut(BLOCK_SECTOR_SIZE)
            .enumerate()
        {
            self.block.read(slot.sector(i), chunk)?;
        }

        log::debug!("swap: read {slot}");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemDisk;
    use alloc::boxed::Box;
    use zerocopy::FromZeroes;

    fn store(pages: usize) -> (SwapStore, MemDisk) {
        let disk = MemDisk::new(pages * SECTORS_PER_PAGE);
        let block = Block::new(BlockType::Swap, "swap", Box::new(disk.clone()));
        (SwapStore::new(block).expect("swap store"), disk)
    }

    #[test]
    fn slot_count_follows_device() {
        let disk = MemDisk::new(3 * SECTORS_PER_PAGE + 5);
        let block = Block::new(BlockType::Swap, "swap", Box::new(disk));
        let swap = SwapStore::new(block).expect("swap store");
        assert_eq!(swap.slot_count(), 3);
    }

    #[test]
    fn rejects_non_swap_device() {
        let block = Block::new(BlockType::FileSystem, "fs", Box::new(MemDisk::new(8)));
        assert!(matches!(SwapStore::new(block), Err(VmError::InvalidMapping)));
    }

    #[test]
    fn reserve_until_exhausted() {
        let (swap, _) = store(2);
        let a = swap.reserve_slot().expect("first slot");
        let b = swap.reserve_slot().expect("second slot");
        assert_ne!(a, b);
        assert_eq!(swap.reserve_slot(), Err(VmError::SwapExhausted));

        swap.free_slot(a);
        swap.free_slot(a);
        assert_eq!(swap.used_slots(), 1);
        assert_eq!(swap.reserve_slot(), Ok(a));
    }

    #[test]
    fn page_round_trip() {
        let (swap, disk) = store(4);
        let mut page = FrameData::new_box_zeroed();
        for (i, byte) in page.0.iter_mut().enumerate() {
            *byte = (i % 251) as u8;
        }

        let _ = swap.reserve_slot().expect("slot 0");
        let slot = swap.reserve_slot().expect("slot 1");
        swap.write_slot(slot, &page).expect("write");
        assert_eq!(disk.writes(), SECTORS_PER_PAGE);

        let mut out = FrameData::new_box_zeroed();
        swap.read_slot(slot, &mut out).expect("read");
        assert_eq!(out.0[..], page.0[..]);
        assert!(swap.is_occupied(slot));
    }

    #[test]
    fn io_failure_is_not_exhaustion() {
        let (swap, disk) = store(1);
        let slot = swap.reserve_slot().expect("slot");
        disk.fail_writes(true);
        let page = FrameData::new_box_zeroed();
        assert!(matches!(swap.write_slot(slot, &page), Err(VmError::Block(_))));
    }
}
