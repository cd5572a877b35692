//! Demand-paged virtual memory for KidneyOS user processes.
//!
//! [`Vm`] owns the physical frames handed to user pages and the swap device.
//! Each process has an [`AddressSpace`] whose supplemental page table records
//! every page it may touch; pages are populated on first fault and evicted
//! under memory pressure.

#![cfg_attr(target_os = "none", no_std)]

extern crate alloc;

pub mod block;
pub mod error;
pub mod file;
pub mod mem;
pub mod paging;
pub mod sync;
pub mod user_program;
pub mod vm;

#[cfg(test)]
mod testing;

pub use error::VmError;
pub use mem::{address_space::AddressSpace, fault::PageFault};
pub use vm::{Vm, VmConfig};
