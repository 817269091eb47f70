//! Minimal ELF64 loader: parses the ELF header, copies `PT_LOAD` segments
//! to their `p_paddr`, zero-fills bss, and returns the entry point. No PIE
//! relocation support — supported guests are statically linked, so
//! physical == virtual under the identity mapping they run under.

use crate::bus::Bus;
use crate::error::{EmuError, EmuResult};

const ELF_MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];
const ELFCLASS64: u8 = 2;
const ELFDATA2LSB: u8 = 1;
const EM_RISCV: u16 = 243;
const PT_LOAD: u32 = 1;

struct ProgramHeader {
    p_type: u32,
    p_offset: u64,
    p_paddr: u64,
    p_filesz: u64,
    p_memsz: u64,
}

fn read_u16(buf: &[u8], off: usize) -> u16 {
    u16::from_le_bytes(buf[off..off + 2].try_into().unwrap())
}

fn read_u32(buf: &[u8], off: usize) -> u32 {
    u32::from_le_bytes(buf[off..off + 4].try_into().unwrap())
}

fn read_u64(buf: &[u8], off: usize) -> u64 {
    u64::from_le_bytes(buf[off..off + 8].try_into().unwrap())
}

/// Loads `image` (a full ELF64 file) into `bus`-backed RAM, returning the
/// entry point. Fails with [`EmuError::MalformedElf`] on a bad magic,
/// non-64-bit class, big-endian data, non-RISC-V machine, or a `PT_LOAD`
/// segment that doesn't fit the mapped RAM.
pub fn load(bus: &mut Bus, image: &[u8]) -> EmuResult<u64> {
    if image.len() < 64 {
        return Err(EmuError::MalformedElf("file shorter than an ELF64 header".into()));
    }
    if image[0..4] != ELF_MAGIC {
        return Err(EmuError::MalformedElf("bad ELF magic".into()));
    }
    if image[4] != ELFCLASS64 {
        return Err(EmuError::MalformedElf("only ELF64 is supported".into()));
    }
    if image[5] != ELFDATA2LSB {
        return Err(EmuError::MalformedElf("only little-endian ELF is supported".into()));
    }
    let e_machine = read_u16(image, 18);
    if e_machine != EM_RISCV {
        return Err(EmuError::MalformedElf(format!("e_machine {e_machine} is not RISC-V")));
    }

    let e_entry = read_u64(image, 24);
    let e_phoff = read_u64(image, 32) as usize;
    let e_phentsize = read_u16(image, 54) as usize;
    let e_phnum = read_u16(image, 56) as usize;

    if e_phoff == 0 || e_phnum == 0 {
        return Err(EmuError::MalformedElf("no program headers".into()));
    }

    for i in 0..e_phnum {
        let base = e_phoff + i * e_phentsize;
        if base + 56 > image.len() {
            return Err(EmuError::MalformedElf(format!("program header {i} out of file bounds")));
        }
        let ph = ProgramHeader {
            p_type: read_u32(image, base),
            p_offset: read_u64(image, base + 8),
            p_paddr: read_u64(image, base + 24),
            p_filesz: read_u64(image, base + 32),
            p_memsz: read_u64(image, base + 40),
        };
        if ph.p_type != PT_LOAD {
            continue;
        }
        load_segment(bus, image, &ph)?;
    }

    Ok(e_entry)
}

fn load_segment(bus: &mut Bus, image: &[u8], ph: &ProgramHeader) -> EmuResult<()> {
    let file_end = ph.p_offset as usize + ph.p_filesz as usize;
    if file_end > image.len() {
        return Err(EmuError::MalformedElf("PT_LOAD segment exceeds file size".into()));
    }
    let data = &image[ph.p_offset as usize..file_end];
    if !bus.ram_write_bytes(ph.p_paddr, data) {
        return Err(EmuError::MalformedElf(format!(
            "PT_LOAD segment at {:#x} (filesz {:#x}) doesn't fit mapped RAM",
            ph.p_paddr, ph.p_filesz
        )));
    }
    if ph.p_memsz > ph.p_filesz {
        let bss_len = (ph.p_memsz - ph.p_filesz) as usize;
        let zeros = vec![0u8; bss_len];
        if !bus.ram_write_bytes(ph.p_paddr + ph.p_filesz, &zeros) {
            return Err(EmuError::MalformedElf(format!(
                "PT_LOAD bss at {:#x} (len {:#x}) doesn't fit mapped RAM",
                ph.p_paddr + ph.p_filesz,
                bss_len
            )));
        }
    }
    Ok(())
}
