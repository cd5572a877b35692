//! Lazy loading of 32-bit x86 executables.
//!
//! Nothing of the image is read beyond its headers: every page of every
//! loadable segment becomes an uninitialized page whose loader reads its
//! part of the file on first touch.

use super::elf::{
    Elf, ElfArchitecture, ElfEndianness, ElfHeader, ElfProgramHeader, ElfProgramType, ElfUsage,
    ELF_HEADER_SIZE, ELF_MAGIC_NUMBER, PROGRAM_HEADER_SIZE,
};
use crate::error::{Result, VmError};
use crate::file::{FileError, MappedFile};
use crate::mem::{
    address_space::AddressSpace,
    uninit::{PageInitializer, PageLoader, PageTarget},
    FrameData,
};
use crate::vm::Vm;
use alloc::{sync::Arc, vec};
use core::{cmp::min, error::Error, fmt};
use kidneyos_shared::mem::{is_user_vaddr, page_offset, page_round_down, page_round_up, PAGE_FRAME_SIZE};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ElfError {
    InvalidMagicNumber,
    UnsupportedClass,
    UnsupportedEndianess,
    UnsupportedVersion,
    UnsupportedType,
    UnsupportedMachine,
    /// Truncated or inconsistent headers
    Malformed,
    /// Needs a dynamic loader
    Dynamic,
    SegmentError(ElfSegmentError),
}

// Error types that will arise when we try to validate segment
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ElfSegmentError {
    DifferentPageOffset,
    OffsetOutOfRange,
    MemSizeLesserThanFileSize,
    EmptyMemSize,
    VMRegionOutOfRange,
    VMRegionWrapAround,
    PageZeroMapping,
}

impl fmt::Display for ElfError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ElfError::InvalidMagicNumber => f.write_str("not an ELF file"),
            ElfError::UnsupportedClass => f.write_str("not a 32-bit ELF file"),
            ElfError::UnsupportedEndianess => f.write_str("not little endian"),
            ElfError::UnsupportedVersion => f.write_str("unknown ELF version"),
            ElfError::UnsupportedType => f.write_str("not an executable"),
            ElfError::UnsupportedMachine => f.write_str("not an x86 executable"),
            ElfError::Malformed => f.write_str("malformed headers"),
            ElfError::Dynamic => f.write_str("dynamically linked"),
            ElfError::SegmentError(e) => write!(f, "bad segment: {e:?}"),
        }
    }
}

impl Error for ElfError {}

// Limit on the program header count, so a hostile header cannot make us
// read an enormous table.
const MAX_PROGRAM_HEADERS: u16 = 1024;

/// Where the new process starts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LoadedImage {
    pub entry: usize,
    pub stack_pointer: usize,
}

/// Fills a page of a loadable segment: `read_bytes` bytes of the file at
/// `offset`, then zeros.
pub struct SegmentLoader {
    file: Arc<dyn MappedFile>,
    offset: usize,
    read_bytes: usize,
}

impl SegmentLoader {
    pub fn new(file: Arc<dyn MappedFile>, offset: usize, read_bytes: usize) -> Self {
        assert!(read_bytes <= PAGE_FRAME_SIZE);
        Self {
            file,
            offset,
            read_bytes,
        }
    }
}

impl PageLoader for SegmentLoader {
    fn load(&self, va: usize, frame: &mut FrameData) -> Result<()> {
        let read = self
            .file
            .read_at(self.offset, &mut frame.0[..self.read_bytes])?;
        if read != self.read_bytes {
            log::warn!("segment page {va:#x}: file ended after {read} bytes");
            return Err(FileError::ShortRead.into());
        }

        frame.0[self.read_bytes..].fill(0);
        Ok(())
    }
}

fn read_exact(file: &dyn MappedFile, offset: usize, len: usize) -> Result<vec::Vec<u8>> {
    let mut bytes = vec![0; len];
    if file.read_at(offset, &mut bytes)? != len {
        return Err(ElfError::Malformed.into());
    }
    Ok(bytes)
}

fn read_elf(file: &dyn MappedFile) -> Result<Elf> {
    let header_bytes = read_exact(file, 0, ELF_HEADER_SIZE)?;

    if header_bytes[..4] != ELF_MAGIC_NUMBER {
        return Err(ElfError::InvalidMagicNumber.into());
    }
    // Check ELF class (e_ident[4]), 1 for 32-bit
    if header_bytes[4] != 1 {
        return Err(ElfError::UnsupportedClass.into());
    }

    let (_, header) = ElfHeader::parse(&header_bytes).map_err(|_| ElfError::Malformed)?;
    verify_elf_header(&header)?;

    let table_len = usize::from(header.program_header_count) * PROGRAM_HEADER_SIZE;
    let table = read_exact(file, header.program_headers_offset as usize, table_len)?;
    let (_, elf) = Elf::parse(&header_bytes, &table).map_err(|_| ElfError::Malformed)?;
    Ok(elf)
}

// Function to verify ELF header
fn verify_elf_header(header: &ElfHeader) -> core::result::Result<(), ElfError> {
    if header.endianness != ElfEndianness::Little {
        return Err(ElfError::UnsupportedEndianess);
    }

    // Must be 1 for original ELF version
    if header.header_version != 1 || header.elf_version != 1 {
        return Err(ElfError::UnsupportedVersion);
    }

    if header.usage != ElfUsage::Executable {
        return Err(ElfError::UnsupportedType);
    }

    if header.architecture != ElfArchitecture::X86 {
        return Err(ElfError::UnsupportedMachine);
    }

    if usize::from(header.program_header_entry_size) != PROGRAM_HEADER_SIZE
        || header.program_header_count > MAX_PROGRAM_HEADERS
    {
        return Err(ElfError::Malformed);
    }

    Ok(())
}

fn validate_segment(
    phdr: &ElfProgramHeader,
    file_len: usize,
) -> core::result::Result<(), ElfSegmentError> {
    // p_offset and p_vaddr must have the same page offset.
    if page_offset(phdr.file_offset as usize) != page_offset(phdr.virtual_address as usize) {
        return Err(ElfSegmentError::DifferentPageOffset);
    }

    // p_offset must point within FILE.
    if phdr.file_offset as usize > file_len {
        return Err(ElfSegmentError::OffsetOutOfRange);
    }

    // p_memsz must be at least as big as p_filesz.
    if phdr.memory_size < phdr.file_size {
        return Err(ElfSegmentError::MemSizeLesserThanFileSize);
    }

    // The segment must not be empty.
    if phdr.memory_size == 0 {
        return Err(ElfSegmentError::EmptyMemSize);
    }

    // The virtual memory region must both start and end within the
    // user address space range.
    if !is_user_vaddr(phdr.virtual_address as usize) {
        return Err(ElfSegmentError::VMRegionOutOfRange);
    }

    // The region cannot "wrap around" across the kernel virtual
    // address space.
    let end = phdr
        .virtual_address
        .checked_add(phdr.memory_size)
        .ok_or(ElfSegmentError::VMRegionWrapAround)?;
    if !is_user_vaddr(end as usize - 1) {
        return Err(ElfSegmentError::VMRegionOutOfRange);
    }

    // Disallow mapping page 0.
    if (phdr.virtual_address as usize) < PAGE_FRAME_SIZE {
        return Err(ElfSegmentError::PageZeroMapping);
    }

    Ok(())
}

/// Maps every page of one loadable segment lazily.
fn load_segment(
    vm: &Vm,
    space: &AddressSpace,
    file: &Arc<dyn MappedFile>,
    phdr: &ElfProgramHeader,
) -> Result<()> {
    let vaddr = phdr.virtual_address as usize;
    let file_size = phdr.file_size as usize;
    let memory_size = phdr.memory_size as usize;
    let offset_in_page = page_offset(vaddr);

    // Bytes to read from the file, counted from the start of the first page.
    let mut read_bytes = if file_size > 0 {
        offset_in_page + file_size
    } else {
        0
    };
    let pages = page_round_up(offset_in_page + memory_size) / PAGE_FRAME_SIZE;
    let mut file_offset = page_round_down(phdr.file_offset as usize);

    for i in 0..pages {
        let va = page_round_down(vaddr) + i * PAGE_FRAME_SIZE;
        let page_read = min(read_bytes, PAGE_FRAME_SIZE);

        let init = if page_read == 0 {
            PageInitializer::anon()
        } else {
            let loader = SegmentLoader::new(file.clone(), file_offset, page_read);
            PageInitializer::with_loader(PageTarget::Anon, Arc::new(loader))
        };
        vm.map_lazy(space, va, phdr.writable, init)?;

        read_bytes -= page_read;
        file_offset += PAGE_FRAME_SIZE;
    }

    log::debug!(
        "elf: segment {vaddr:#x}, {pages} pages, {file_size} bytes from file, writable={}",
        phdr.writable
    );
    Ok(())
}

/// Gives `space` its first stack page, populated right away.
fn setup_stack(vm: &Vm, space: &AddressSpace) -> Result<usize> {
    let top = vm.config().stack.top;
    let va = top - PAGE_FRAME_SIZE;
    vm.map_lazy(space, va, true, PageInitializer::anon())?;
    vm.claim(space, va)?;
    Ok(top)
}

/// Maps the executable in `file` into the empty `space` and sets up its
/// stack. On error `space` may hold some of the image and should be torn
/// down.
pub fn load_elf(vm: &Vm, space: &AddressSpace, file: Arc<dyn MappedFile>) -> Result<LoadedImage> {
    let elf = read_elf(&*file)?;

    for phdr in &elf.program_headers {
        match phdr.program_type {
            ElfProgramType::Load => {
                validate_segment(phdr, file.len()).map_err(ElfError::SegmentError)?;
                load_segment(vm, space, &file, phdr)?;
            }
            ElfProgramType::Dynamic
            | ElfProgramType::Interpret
            | ElfProgramType::SharedLibrary => return Err(VmError::Elf(ElfError::Dynamic)),
            _ => {}
        }
    }

    let stack_pointer = setup_stack(vm, space)?;
    let entry = elf.header.program_entry as usize;
    log::info!("elf: loaded, entry {entry:#x}, {} pages mapped", space.spt().len());

    Ok(LoadedImage {
        entry,
        stack_pointer,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::page::PageType;
    use crate::testing::{elf_image, fixture, user_read, Fixture, MemFile};
    use kidneyos_shared::mem::USER_STACK_TOP;

    const TEXT: usize = 0x0804_8000;
    const DATA: usize = 0x0804_a100;

    fn segment(vaddr: u32, file_offset: u32, file_size: u32, memory_size: u32) -> ElfProgramHeader {
        ElfProgramHeader {
            program_type: ElfProgramType::Load,
            file_offset,
            virtual_address: vaddr,
            file_size,
            memory_size,
            executable: false,
            writable: true,
            readable: true,
        }
    }

    #[test]
    fn segment_validation() {
        let len = 0x10000;
        assert_eq!(validate_segment(&segment(0x0804_8000, 0x1000, 16, 32), len), Ok(()));
        assert_eq!(
            validate_segment(&segment(0x0804_8010, 0x1000, 16, 32), len),
            Err(ElfSegmentError::DifferentPageOffset)
        );
        assert_eq!(
            validate_segment(&segment(0x0804_8000, 0x20000, 16, 32), len),
            Err(ElfSegmentError::OffsetOutOfRange)
        );
        assert_eq!(
            validate_segment(&segment(0x0804_8000, 0x1000, 64, 32), len),
            Err(ElfSegmentError::MemSizeLesserThanFileSize)
        );
        assert_eq!(
            validate_segment(&segment(0x0804_8000, 0x1000, 0, 0), len),
            Err(ElfSegmentError::EmptyMemSize)
        );
        assert_eq!(
            validate_segment(&segment(0x8000_0000, 0x0, 0, 16), len),
            Err(ElfSegmentError::VMRegionOutOfRange)
        );
        assert_eq!(
            validate_segment(&segment(0x7FFF_F000, 0x0, 0, 0x2000), len),
            Err(ElfSegmentError::VMRegionOutOfRange)
        );
        assert_eq!(
            validate_segment(&segment(0x0000_0000, 0x0, 0, 16), len),
            Err(ElfSegmentError::PageZeroMapping)
        );
    }

    #[test]
    fn loads_lazily() {
        let Fixture { vm, space, .. } = fixture(8, 0);
        let text = [0x90u8; 100];
        let image = elf_image(
            TEXT as u32,
            &[
                (TEXT as u32, &text[..], 100, 0b101),
                (DATA as u32, &b"initialized"[..], 0x2000, 0b110),
            ],
        );
        let file = Arc::new(MemFile::new(image));

        let loaded = load_elf(&vm, &space, file.clone()).expect("load");
        assert_eq!(loaded.entry, TEXT);
        assert_eq!(loaded.stack_pointer, USER_STACK_TOP);

        // One text page, three data pages, one stack page; only the stack is
        // resident.
        assert_eq!(space.spt().len(), 5);
        assert_eq!(vm.stats().frames.in_use, 1);
        let text_page = space.spt().find(TEXT).expect("text page");
        assert_eq!(text_page.page_type(), PageType::Uninit);
        assert!(!text_page.writable());

        let mut code = [0u8; 101];
        user_read(&vm, &space, TEXT, &mut code).expect("read text");
        assert_eq!(code[..100], text[..]);
        assert_eq!(code[100], 0);

        let mut data = [0u8; 11];
        user_read(&vm, &space, DATA, &mut data).expect("read data");
        assert_eq!(&data, b"initialized");

        let mut bss = [0xFFu8; 16];
        user_read(&vm, &space, DATA + 0x1f00, &mut bss).expect("read bss");
        assert_eq!(bss, [0; 16]);
        assert_eq!(space.spt().find(TEXT).expect("text").page_type(), PageType::Anon);
    }

    #[test]
    fn rejects_non_elf() {
        let Fixture { vm, space, .. } = fixture(4, 0);
        let file = Arc::new(MemFile::new(vec![0u8; 128]));
        assert_eq!(
            load_elf(&vm, &space, file),
            Err(VmError::Elf(ElfError::InvalidMagicNumber))
        );

        let short = Arc::new(MemFile::new(ELF_MAGIC_NUMBER.to_vec()));
        assert_eq!(
            load_elf(&vm, &space, short),
            Err(VmError::Elf(ElfError::Malformed))
        );
        assert!(space.spt().is_empty());
    }

    #[test]
    fn rejects_wrong_machine() {
        let Fixture { vm, space, .. } = fixture(4, 0);
        let mut image = elf_image(TEXT as u32, &[]);
        // e_machine = x86-64
        image[18] = 0x3E;
        let file = Arc::new(MemFile::new(image));
        assert_eq!(
            load_elf(&vm, &space, file),
            Err(VmError::Elf(ElfError::UnsupportedMachine))
        );
    }

    #[test]
    fn truncated_segment_fails_on_fault() {
        let Fixture { vm, space, .. } = fixture(4, 0);
        let image = elf_image(TEXT as u32, &[(TEXT as u32, &[0xCC; 64][..], 64, 0b101)]);
        let file = Arc::new(MemFile::new(image));
        load_elf(&vm, &space, file.clone()).expect("load");

        file.truncate(file.len() - 32);
        let mut byte = [0u8; 1];
        assert_eq!(
            user_read(&vm, &space, TEXT, &mut byte),
            Err(VmError::File(FileError::ShortRead))
        );
        assert_eq!(
            space.spt().find(TEXT).expect("text").page_type(),
            PageType::Uninit
        );
    }
}
