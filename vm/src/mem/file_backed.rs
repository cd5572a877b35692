//! Pages that mirror part of a file.

use super::FrameData;
use crate::error::Result;
use crate::file::{FileError, MappedFile};
use alloc::sync::Arc;
use core::fmt;
use kidneyos_shared::mem::PAGE_FRAME_SIZE;

/// `read_bytes` bytes of `file` starting at `offset`; the rest of the page
/// is zero and is never written back.
#[derive(Clone)]
pub struct FileMapping {
    file: Arc<dyn MappedFile>,
    offset: usize,
    read_bytes: usize,
}

impl FileMapping {
    pub fn new(file: Arc<dyn MappedFile>, offset: usize, read_bytes: usize) -> Self {
        assert!(read_bytes <= PAGE_FRAME_SIZE);
        Self {
            file,
            offset,
            read_bytes,
        }
    }

    pub fn file(&self) -> &Arc<dyn MappedFile> {
        &self.file
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn read_bytes(&self) -> usize {
        self.read_bytes
    }

    pub fn zero_bytes(&self) -> usize {
        PAGE_FRAME_SIZE - self.read_bytes
    }

    /// Reads the mapped range. Anything the file no longer has is zero.
    pub(crate) fn read_in(&self, frame: &mut FrameData) -> Result<()> {
        let read = self
            .file
            .read_at(self.offset, &mut frame.0[..self.read_bytes])?;
        frame.0[read..].fill(0);
        Ok(())
    }

    pub(crate) fn write_back(&self, frame: &FrameData) -> Result<()> {
        if self.read_bytes == 0 {
            return Ok(());
        }

        let written = self
            .file
            .write_at(self.offset, &frame.0[..self.read_bytes])?;
        if written != self.read_bytes {
            return Err(FileError::ShortWrite.into());
        }

        log::debug!("file page at offset {:#x}: wrote back {written} bytes", self.offset);
        Ok(())
    }
}

impl fmt::Debug for FileMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileMapping")
            .field("offset", &self.offset)
            .field("read_bytes", &self.read_bytes)
            .finish_non_exhaustive()
    }
}
