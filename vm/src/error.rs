use crate::block::BlockError;
use crate::file::FileError;
use crate::user_program::elf_loader::ElfError;
use core::error::Error;
use core::fmt::{self, Debug, Display, Formatter};

/// Everything that can go wrong inside the VM.
///
/// None of these terminate anything by themselves: they propagate to the trap
/// or syscall layer, which decides whether the offending process dies.
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum VmError {
    /// No page is mapped at the address and it is not a legal stack access
    BadAddress,
    /// The address belongs to the kernel
    KernelAddress,
    /// A write to a read-only page, or a protection fault with no copy-on-write to resolve
    ProtectionViolation,
    /// A page that must be resident for the operation has no frame
    NotPresent,
    /// A page already exists at that virtual page
    AlreadyMapped,
    /// No page or mapping exists at that address
    NotMapped,
    /// Arguments describe an impossible mapping (unaligned, empty, overlapping, ...)
    InvalidMapping,
    /// Every frame is pinned or shared and nothing can be evicted
    OutOfFrames,
    /// Every swap slot is occupied
    SwapExhausted,
    /// An anonymous page had to be swapped out, but no swap device is attached
    SwapUnavailable,
    /// A swap device was already attached
    SwapAlreadyAttached,
    /// The hardware page table refused the mapping
    MapFailed,
    /// The swap device failed
    Block(BlockError),
    /// The backing file failed
    File(FileError),
    /// The executable was rejected
    Elf(ElfError),
}

/// Coarse classification of a [`VmError`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// Illegal access; the faulting process must be killed.
    Fault,
    /// Out of frames or swap.
    Exhaustion,
    /// An underlying device or file failed mid-transfer.
    Io,
    /// The caller broke an API contract.
    Contract,
}

impl VmError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            VmError::BadAddress
            | VmError::KernelAddress
            | VmError::ProtectionViolation
            | VmError::NotPresent => ErrorKind::Fault,
            VmError::OutOfFrames | VmError::SwapExhausted | VmError::SwapUnavailable => {
                ErrorKind::Exhaustion
            }
            VmError::Block(_) | VmError::File(_) | VmError::MapFailed => ErrorKind::Io,
            VmError::AlreadyMapped
            | VmError::NotMapped
            | VmError::InvalidMapping
            | VmError::SwapAlreadyAttached
            | VmError::Elf(_) => ErrorKind::Contract,
        }
    }
}

impl Debug for VmError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            VmError::BadAddress => write!(f, "BadAddress"),
            VmError::KernelAddress => write!(f, "KernelAddress"),
            VmError::ProtectionViolation => write!(f, "ProtectionViolation"),
            VmError::NotPresent => write!(f, "NotPresent"),
            VmError::AlreadyMapped => write!(f, "AlreadyMapped"),
            VmError::NotMapped => write!(f, "NotMapped"),
            VmError::InvalidMapping => write!(f, "InvalidMapping"),
            VmError::OutOfFrames => write!(f, "OutOfFrames"),
            VmError::SwapExhausted => write!(f, "SwapExhausted"),
            VmError::SwapUnavailable => write!(f, "SwapUnavailable"),
            VmError::SwapAlreadyAttached => write!(f, "SwapAlreadyAttached"),
            VmError::MapFailed => write!(f, "MapFailed"),
            VmError::Block(e) => write!(f, "Block({e:?})"),
            VmError::File(e) => write!(f, "File({e:?})"),
            VmError::Elf(e) => write!(f, "Elf({e:?})"),
        }
    }
}

impl Display for VmError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            VmError::BadAddress => f.write_str("access to an unmapped address"),
            VmError::KernelAddress => f.write_str("access to a kernel address"),
            VmError::ProtectionViolation => f.write_str("write to a read-only page"),
            VmError::NotPresent => f.write_str("page is not resident"),
            VmError::AlreadyMapped => f.write_str("virtual page is already mapped"),
            VmError::NotMapped => f.write_str("virtual page is not mapped"),
            VmError::InvalidMapping => f.write_str("invalid mapping request"),
            VmError::OutOfFrames => f.write_str("no frame can be freed"),
            VmError::SwapExhausted => f.write_str("swap space exhausted"),
            VmError::SwapUnavailable => f.write_str("no swap device attached"),
            VmError::SwapAlreadyAttached => f.write_str("a swap device is already attached"),
            VmError::MapFailed => f.write_str("page table rejected the mapping"),
            VmError::Block(e) => write!(f, "swap I/O failed: {e}"),
            VmError::File(e) => write!(f, "file I/O failed: {e}"),
            VmError::Elf(e) => write!(f, "bad executable: {e}"),
        }
    }
}

impl Error for VmError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            VmError::Block(e) => Some(e),
            VmError::File(e) => Some(e),
            VmError::Elf(e) => Some(e),
            _ => None,
        }
    }
}

impl From<BlockError> for VmError {
    fn from(e: BlockError) -> Self {
        VmError::Block(e)
    }
}

impl From<FileError> for VmError {
    fn from(e: FileError) -> Self {
        VmError::File(e)
    }
}

impl From<ElfError> for VmError {
    fn from(e: ElfError) -> Self {
        VmError::Elf(e)
    }
}

pub type Result<T> = core::result::Result<T, VmError>;
