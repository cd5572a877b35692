use nom::bytes::complete::{tag, take};
use nom::combinator::{map, map_opt};
use nom::number::complete::{u16, u32, u8};
use nom::number::Endianness;
use nom::IResult;

use alloc::vec::Vec;

pub const ELF_MAGIC_NUMBER: [u8; 4] = [0x7F, b'E', b'L', b'F'];
pub const ELF_HEADER_SIZE: usize = 52;
pub const PROGRAM_HEADER_SIZE: usize = 32;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ElfEndianness {
    Little,
    Big,
}

impl ElfEndianness {
    pub fn to_nom(self) -> Endianness {
        match self {
            ElfEndianness::Little => Endianness::Little,
            ElfEndianness::Big => Endianness::Big,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ElfUsage {
    Relocatable,
    Executable,
    Shared,
    Core,
}

/// `e_machine`. Only x86 executables are ever loaded; anything else is kept
/// as its raw value so the loader can reject it by name.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ElfArchitecture {
    X86,
    X8664,
    Other(u16),
}

/// The fields of the ELF header the loader checks or uses. Section headers
/// are skipped entirely.
#[derive(Copy, Clone, Debug)]
pub struct ElfHeader {
    pub endianness: ElfEndianness,
    pub header_version: u8,
    pub usage: ElfUsage,
    pub architecture: ElfArchitecture,
    pub elf_version: u32,
    pub program_entry: u32,
    pub program_headers_offset: u32,
    pub program_header_entry_size: u16,
    pub program_header_count: u16,
}

impl ElfHeader {
    pub fn parse(bytes: &[u8]) -> IResult<&[u8], ElfHeader> {
        let (bytes, _) = tag(&ELF_MAGIC_NUMBER[..])(bytes)?;

        // 32-bit only.
        let (bytes, _) = tag(&[1u8][..])(bytes)?;

        let (bytes, endianness) = map_opt(u8, |value| match value {
            1 => Some(ElfEndianness::Little),
            2 => Some(ElfEndianness::Big),
            _ => None,
        })(bytes)?;
        let endian = endianness.to_nom();

        let (bytes, header_version) = u8(bytes)?;
        // OS ABI and padding.
        let (bytes, _) = take(9usize)(bytes)?;

        let (bytes, usage) = map_opt(u16(endian), |value| match value {
            1 => Some(ElfUsage::Relocatable),
            2 => Some(ElfUsage::Executable),
            3 => Some(ElfUsage::Shared),
            4 => Some(ElfUsage::Core),
            _ => None,
        })(bytes)?;

        let (bytes, architecture) = map(u16(endian), |value| match value {
            0x03 => ElfArchitecture::X86,
            0x3E => ElfArchitecture::X8664,
            other => ElfArchitecture::Other(other),
        })(bytes)?;

        let (bytes, elf_version) = u32(endian)(bytes)?;
        let (bytes, program_entry) = u32(endian)(bytes)?;
        let (bytes, program_headers_offset) = u32(endian)(bytes)?;
        // e_shoff, e_flags, e_ehsize.
        let (bytes, _) = take(10usize)(bytes)?;
        let (bytes, program_header_entry_size) = u16(endian)(bytes)?;
        let (bytes, program_header_count) = u16(endian)(bytes)?;
        // e_shentsize, e_shnum, e_shstrndx.
        let (bytes, _) = take(6usize)(bytes)?;

        Ok((
            bytes,
            ElfHeader {
                endianness,
                header_version,
                usage,
                architecture,
                elf_version,
                program_entry,
                program_headers_offset,
                program_header_entry_size,
                program_header_count,
            },
        ))
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ElfProgramType {
    Ignore,
    Load,
    Dynamic,
    Interpret,
    Note,
    SharedLibrary,
    ProgramHeaders,
    OsSpecific(u32),
}

/// A program header. The segment's bytes stay in the file: pages are read
/// from `file_offset` when they are first touched.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ElfProgramHeader {
    pub program_type: ElfProgramType,
    pub file_offset: u32,
    pub virtual_address: u32,
    pub file_size: u32,
    pub memory_size: u32,
    pub executable: bool,
    pub writable: bool,
    pub readable: bool,
}

impl ElfProgramHeader {
    pub fn parse(bytes: &[u8], endian: Endianness) -> IResult<&[u8], Self> {
        let (bytes, program_type) = map_opt(u32(endian), |value| match value {
            0 => Some(ElfProgramType::Ignore),
            1 => Some(ElfProgramType::Load),
            2 => Some(ElfProgramType::Dynamic),
            3 => Some(ElfProgramType::Interpret),
            4 => Some(ElfProgramType::Note),
            5 => Some(ElfProgramType::SharedLibrary),
            6 => Some(ElfProgramType::ProgramHeaders),
            0x6000_0000.. => Some(ElfProgramType::OsSpecific(value)),
            _ => None,
        })(bytes)?;

        let (bytes, file_offset) = u32(endian)(bytes)?;
        let (bytes, virtual_address) = u32(endian)(bytes)?;
        // p_paddr is meaningless for user programs.
        let (bytes, _) = take(4usize)(bytes)?;
        let (bytes, file_size) = u32(endian)(bytes)?;
        let (bytes, memory_size) = u32(endian)(bytes)?;
        let (bytes, flags) = u32(endian)(bytes)?;
        // p_align: segments are mapped page by page regardless.
        let (bytes, _) = take(4usize)(bytes)?;

        Ok((
            bytes,
            ElfProgramHeader {
                program_type,
                file_offset,
                virtual_address,
                file_size,
                memory_size,
                executable: flags & 1 != 0,
                writable: flags & 2 != 0,
                readable: flags & 4 != 0,
            },
        ))
    }
}

#[derive(Clone, Debug)]
pub struct Elf {
    pub header: ElfHeader,
    pub program_headers: Vec<ElfProgramHeader>,
}

impl Elf {
    /// Parses the ELF header at the start of `header_bytes` and
    /// `header.program_header_count` program headers from `table_bytes`, which
    /// holds the program header table.
    pub fn parse<'a>(header_bytes: &'a [u8], table_bytes: &'a [u8]) -> IResult<&'a [u8], Elf> {
        let (bytes, header) = ElfHeader::parse(header_bytes)?;

        let mut program_header_bytes = table_bytes;
        let mut program_headers = Vec::with_capacity(header.program_header_count as usize);

        for _ in 0..header.program_header_count {
            let (_, program_header) =
                ElfProgramHeader::parse(program_header_bytes, header.endianness.to_nom())?;

            program_headers.push(program_header);

            (program_header_bytes, _) =
                take(header.program_header_entry_size)(program_header_bytes)?;
        }

        Ok((
            bytes,
            Elf {
                header,
                program_headers,
            },
        ))
    }
}
