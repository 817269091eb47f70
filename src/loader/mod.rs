//! ELF image loading.

pub mod elf;

pub use elf::load;
