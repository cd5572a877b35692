pub mod elf;
pub mod elf_loader;
