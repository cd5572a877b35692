//! What the VM needs from the filesystem: positional reads and writes on an
//! open file. Mappings hold their own reference, so closing the descriptor
//! that created a mapping does not tear it down.

use core::error::Error;
use core::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileError {
    /// The filesystem failed to read
    ReadError,
    /// The filesystem failed to write
    WriteError,
    /// Fewer bytes came back than the mapping requires
    ShortRead,
    /// Fewer bytes were written than the page holds
    ShortWrite,
}

impl fmt::Display for FileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            FileError::ReadError => "error reading from the file",
            FileError::WriteError => "error writing to the file",
            FileError::ShortRead => "file ended before the mapped range",
            FileError::ShortWrite => "file accepted fewer bytes than written",
        };
        f.write_str(msg)
    }
}

impl Error for FileError {}

pub trait MappedFile: Send + Sync {
    /// Reads up to `buf.len()` bytes starting at `offset`, returning how many
    /// were read. Reads past the end of the file return fewer bytes.
    fn read_at(&self, offset: usize, buf: &mut [u8]) -> Result<usize, FileError>;

    /// Writes `buf` at `offset`, returning how many bytes were written. Files
    /// never grow through a mapping.
    fn write_at(&self, offset: usize, buf: &[u8]) -> Result<usize, FileError>;

    /// Current file length in bytes.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
