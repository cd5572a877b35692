//! The VM context: the frame table, the swap store once one is attached, and
//! policy. There is one per kernel; it is passed by reference to everything
//! that needs it.

use crate::block::Block;
use crate::error::{Result, VmError};
use crate::mem::{
    frame_table::{FrameStats, FrameTable},
    replacement::{Clock, Fifo, ReplacementPolicy},
    swap::SwapStore,
    PhysicalPool,
};
use crate::sync::scheduler::Scheduler;
use alloc::{boxed::Box, sync::Arc};
use core::sync::atomic::{AtomicUsize, Ordering};
use kidneyos_shared::mem::{STACK_GROWTH_SLACK, USER_STACK_LIMIT, USER_STACK_TOP};
use once_cell::race::OnceBox;

/// Which faults below the lowest stack page count as stack growth.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StackPolicy {
    /// One past the highest stack address.
    pub top: usize,
    /// How far below `top` the stack may grow.
    pub max_size: usize,
    /// How far below the stack pointer an access may land.
    pub slack: usize,
}

impl Default for StackPolicy {
    fn default() -> Self {
        Self {
            top: USER_STACK_TOP,
            max_size: USER_STACK_LIMIT,
            slack: STACK_GROWTH_SLACK,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ReplacementKind {
    #[default]
    Clock,
    Fifo,
}

impl ReplacementKind {
    fn policy(self) -> Box<dyn ReplacementPolicy> {
        match self {
            ReplacementKind::Clock => Box::<Clock>::default(),
            ReplacementKind::Fifo => Box::<Fifo>::default(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VmConfig {
    pub stack: StackPolicy,
    pub replacement: ReplacementKind,
    /// Share resident anonymous pages on `copy` instead of copying them.
    pub copy_on_write: bool,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            stack: StackPolicy::default(),
            replacement: ReplacementKind::default(),
            copy_on_write: true,
        }
    }
}

#[derive(Default)]
pub(crate) struct Counters {
    pub(crate) faults: AtomicUsize,
    pub(crate) stack_growths: AtomicUsize,
    pub(crate) cow_breaks: AtomicUsize,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct VmStats {
    pub frames: FrameStats,
    pub swap_slots: usize,
    pub swap_used: usize,
    pub faults: usize,
    pub stack_growths: usize,
    pub cow_breaks: usize,
}

pub struct Vm {
    frames: FrameTable,
    swap: OnceBox<SwapStore>,
    config: VmConfig,
    counters: Counters,
    scheduler: Arc<dyn Scheduler>,
}

impl Vm {
    /// Builds the frame table out of up to `max_frames` frames of `pool`.
    /// Threads that contend for a page are put to sleep through `scheduler`.
    pub fn new(
        pool: Box<dyn PhysicalPool>,
        max_frames: usize,
        config: VmConfig,
        scheduler: Arc<dyn Scheduler>,
    ) -> Self {
        log::info!("vm: {config:?}");
        Self {
            frames: FrameTable::new(pool, max_frames, config.replacement.policy()),
            swap: OnceBox::new(),
            config,
            counters: Counters::default(),
            scheduler,
        }
    }

    /// Starts swapping anonymous pages to `block`. Only one swap device is
    /// ever attached.
    pub fn attach_swap(&self, block: Block) -> Result<()> {
        let store = SwapStore::new(block)?;
        self.swap
            .set(Box::new(store))
            .map_err(|_| VmError::SwapAlreadyAttached)
    }

    pub fn swap(&self) -> Option<&SwapStore> {
        self.swap.get()
    }

    pub fn frames(&self) -> &FrameTable {
        &self.frames
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    pub fn scheduler(&self) -> &Arc<dyn Scheduler> {
        &self.scheduler
    }

    pub(crate) fn counters(&self) -> &Counters {
        &self.counters
    }

    pub fn stats(&self) -> VmStats {
        let swap = self.swap();
        VmStats {
            frames: self.frames.stats(),
            swap_slots: swap.map_or(0, SwapStore::slot_count),
            swap_used: swap.map_or(0, SwapStore::used_slots),
            faults: self.counters.faults.load(Ordering::Relaxed),
            stack_growths: self.counters.stack_growths.load(Ordering::Relaxed),
            cow_breaks: self.counters.cow_breaks.load(Ordering::Relaxed),
        }
    }

    /// Returns every frame to the physical pool. Address spaces must have
    /// been torn down first.
    pub fn shutdown(self) {
        let stats = self.stats();
        log::info!(
            "vm: shutting down after {} faults, {} evictions",
            stats.faults,
            stats.frames.evictions
        );
        self.frames.shutdown();
    }
}
