//! Pages that have never been touched.
//!
//! An uninitialized page carries everything needed to produce its first
//! contents: the type it turns into, and optionally a loader that fills the
//! frame (executable segments use one). Without a loader the target's own
//! populate runs: anonymous pages are zeroed, file pages are read.

use super::{
    anon::AnonPage,
    file_backed::FileMapping,
    page::{Backing, PageType},
    FrameData,
};
use crate::error::Result;
use alloc::sync::Arc;
use zerocopy::FromZeroes;

/// Fills a frame with the first contents of the page at `va`.
pub trait PageLoader: Send + Sync {
    fn load(&self, va: usize, frame: &mut FrameData) -> Result<()>;
}

impl<F> PageLoader for F
where
    F: Fn(usize, &mut FrameData) -> Result<()> + Send + Sync,
{
    fn load(&self, va: usize, frame: &mut FrameData) -> Result<()> {
        self(va, frame)
    }
}

/// What an uninitialized page becomes.
#[derive(Clone, Debug)]
pub enum PageTarget {
    Anon,
    File(FileMapping),
}

impl PageTarget {
    pub fn page_type(&self) -> PageType {
        match self {
            PageTarget::Anon => PageType::Anon,
            PageTarget::File(_) => PageType::File,
        }
    }

    fn into_backing(self) -> Backing {
        match self {
            PageTarget::Anon => Backing::Anon(AnonPage::default()),
            PageTarget::File(mapping) => Backing::File(mapping),
        }
    }
}

/// Cloning shares the loader, which is how a forked address space inherits
/// pages its parent never touched.
#[derive(Clone)]
pub struct PageInitializer {
    target: PageTarget,
    loader: Option<Arc<dyn PageLoader>>,
}

impl PageInitializer {
    /// A zero-filled anonymous page.
    pub fn anon() -> Self {
        Self {
            target: PageTarget::Anon,
            loader: None,
        }
    }

    /// A page read from `mapping` and written back to it.
    pub fn file(mapping: FileMapping) -> Self {
        Self {
            target: PageTarget::File(mapping),
            loader: None,
        }
    }

    pub fn with_loader(target: PageTarget, loader: Arc<dyn PageLoader>) -> Self {
        Self {
            target,
            loader: Some(loader),
        }
    }

    pub fn target(&self) -> &PageTarget {
        &self.target
    }

    pub(crate) fn load(&self, va: usize, frame: &mut FrameData) -> Result<()> {
        match (&self.loader, &self.target) {
            (Some(loader), _) => loader.load(va, frame),
            (None, PageTarget::Anon) => {
                frame.zero();
                Ok(())
            }
            (None, PageTarget::File(mapping)) => mapping.read_in(frame),
        }
    }

    /// The backing the page switches to once its first contents are mapped.
    pub(crate) fn backing(&self) -> Backing {
        self.target.clone().into_backing()
    }
}
