//! Anonymous memory: no file behind it, so it lives in swap when evicted.

use super::{
    swap::{SwapSlot, SwapStore},
    FrameData,
};
use crate::error::{Result, VmError};
use zerocopy::FromZeroes;

/// A page either holds a frame or a swap slot, never both.
#[derive(Debug, Default)]
pub struct AnonPage {
    slot: Option<SwapSlot>,
}

impl AnonPage {
    pub fn swap_slot(&self) -> Option<SwapSlot> {
        self.slot
    }

    /// Brings the page back from swap, or zero-fills it if it was never
    /// swapped out. The slot stays reserved until [`swapped_in`](Self::swapped_in).
    pub(crate) fn swap_in(&self, swap: Option<&SwapStore>, frame: &mut FrameData) -> Result<()> {
        let Some(slot) = self.slot else {
            frame.zero();
            return Ok(());
        };

        let swap = swap.ok_or(VmError::SwapUnavailable)?;
        swap.read_slot(slot, frame)
    }

    /// The page is resident again and mapped; its slot can go.
    pub(crate) fn swapped_in(&mut self, swap: Option<&SwapStore>) {
        if let (Some(slot), Some(swap)) = (self.slot.take(), swap) {
            swap.free_slot(slot);
        }
    }

    pub(crate) fn swap_out(&mut self, swap: Option<&SwapStore>, frame: &FrameData) -> Result<()> {
        debug_assert!(self.slot.is_none(), "resident page already owns a slot");

        let swap = swap.ok_or(VmError::SwapUnavailable)?;
        let slot = swap.reserve_slot()?;
        if let Err(e) = swap.write_slot(slot, frame) {
            swap.free_slot(slot);
            return Err(e);
        }

        self.slot = Some(slot);
        Ok(())
    }

    pub(crate) fn destroy(&mut self, swap: Option<&SwapStore>) {
        if let (Some(slot), Some(swap)) = (self.slot.take(), swap) {
            swap.free_slot(slot);
        }
    }
}
