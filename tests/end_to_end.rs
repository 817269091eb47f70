//! End-to-end scenarios driven through the public `System` API rather
//! than individual module internals.

use rv64_system_emu::cpu::csr;
use rv64_system_emu::devices::uart::HostIo;
use rv64_system_emu::{MachineConfig, System};

struct NullHost;
impl HostIo for NullHost {
    fn write(&mut self, _byte: u8) {}
    fn read_nonblocking(&mut self) -> Option<u8> {
        None
    }
}

fn boot_system(ram_size: u64) -> System {
    let config = MachineConfig::default().with_ram_size(ram_size);
    System::new(&config, Vec::new(), Box::new(NullHost)).unwrap()
}

fn encode_r(funct7: u32, rs2: u32, rs1: u32, funct3: u32, rd: u32, opcode: u32) -> u32 {
    (funct7 << 25) | (rs2 << 20) | (rs1 << 15) | (funct3 << 12) | (rd << 7) | opcode
}

fn encode_i(imm: u32, rs1: u32, funct3: u32, rd: u32, opcode: u32) -> u32 {
    ((imm & 0xfff) << 20) | (rs1 << 15) | (funct3 << 12) | (rd << 7) | opcode
}

fn encode_s(imm: u32, rs2: u32, rs1: u32, funct3: u32, opcode: u32) -> u32 {
    let imm_lo = imm & 0x1f;
    let imm_hi = (imm >> 5) & 0x7f;
    (imm_hi << 25) | (rs2 << 20) | (rs1 << 15) | (funct3 << 12) | (imm_lo << 7) | opcode
}

#[test]
fn scenario_addition_through_system_step() {
    let mut system = boot_system(4096);
    let base = system.harts[0].pc;
    // addi x5, x0, 3 ; addi x6, x0, 4 ; add x7, x5, x6
    let program = [
        encode_i(3, 0, 0, 5, 0x13),
        encode_i(4, 0, 0, 6, 0x13),
        encode_r(0, 6, 5, 0, 7, 0x33),
    ];
    for (i, w) in program.iter().enumerate() {
        system.bus.write(base + (i as u64 * 4), *w as u64, 4);
    }
    system.step();
    system.step();
    system.step();
    assert_eq!(system.harts[0].regs.read(7), 7);
}

/// Builds a full 3-level Sv39 identity mapping of VA 0's page, rooted at
/// `root_table`, down through `mid_table`/`leaf_table` to a single 4KiB
/// leaf at `leaf_page`, with the given R/W/X leaf permission bits.
fn map_va_zero(system: &mut System, root_table: u64, mid_table: u64, leaf_table: u64, leaf_page: u64, leaf_rwx: u64) {
    let non_leaf = |ppn: u64| (ppn << 10) | 0x1;
    system.bus.write(root_table, non_leaf(mid_table >> 12), 8);
    system.bus.write(mid_table, non_leaf(leaf_table >> 12), 8);
    let leaf_pte = ((leaf_page >> 12) << 10) | leaf_rwx | 0x1; // V + permissions
    system.bus.write(leaf_table, leaf_pte, 8);
}

#[test]
fn scenario_sv39_store_reaches_mapped_physical_page() {
    let mut system = boot_system(1 << 20);
    let base = system.harts[0].pc;
    let root_table = base + 0x1000;
    let mid_table = base + 0x2000;
    let leaf_table = base + 0x3000;
    let leaf_page = base + 0x4000;

    map_va_zero(&mut system, root_table, mid_table, leaf_table, leaf_page, 0b1110); // R|W|X

    let satp = (8u64 << 60) | (root_table >> 12);
    system.harts[0].csrs.write_raw(csr::addr::SATP, satp);
    system.harts[0].privilege = rv64_system_emu::cpu::csr::Privilege::Supervisor;

    let result = system.harts[0].write_memory(&mut system.bus, 0, 0xdead_beef, 4);
    assert!(result.is_ok());
    assert_eq!(system.bus.read(leaf_page, 4), 0xdead_beef);
}

#[test]
fn scenario_store_to_read_only_page_faults() {
    let mut system = boot_system(1 << 20);
    let base = system.harts[0].pc;
    let root_table = base + 0x1000;
    let mid_table = base + 0x2000;
    let leaf_table = base + 0x3000;
    let leaf_page = base + 0x4000;

    map_va_zero(&mut system, root_table, mid_table, leaf_table, leaf_page, 0b0010); // R only

    let satp = (8u64 << 60) | (root_table >> 12);
    system.harts[0].csrs.write_raw(csr::addr::SATP, satp);
    system.harts[0].privilege = rv64_system_emu::cpu::csr::Privilege::Supervisor;

    let result = system.harts[0].write_memory(&mut system.bus, 0, 0x42, 4);
    assert!(result.is_err());
}

#[test]
fn scenario_store_instruction_advances_pc_in_bare_mode() {
    let mut system = boot_system(1 << 20);
    let base = system.harts[0].pc;
    // sw x0, 0(x0) at pc=base: with satp still in Bare mode this must
    // succeed as a plain identity-mapped store (sanity check that the
    // step pipeline round-trips store instructions end to end).
    let sw = encode_s(0, 0, 0, 0b010, 0x23);
    system.bus.write(base, sw as u64, 4);
    system.step();
    assert_eq!(system.harts[0].pc, base + 4);
}
