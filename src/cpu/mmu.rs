//! Sv39 page-table walker.
//!
//! PTE bit layout follows the standard Sv39 `PageTableEntry` (bit
//! positions V/R/W/X/U/G/A/D, RSW, PPN) but this walker reads/writes PTEs
//! through [`crate::bus::Bus`] against guest physical memory rather than
//! treating them as a native struct — there is no MMU hardware to read.

use crate::bus::Bus;
use crate::cpu::csr::{satp, status, Privilege};
use crate::cpu::trap::Exception;

pub const PAGE_SHIFT: u32 = 12;
pub const PAGE_SIZE: u64 = 1 << PAGE_SHIFT;
const LEVELS: u32 = 3;
const PTE_SIZE: u64 = 8;

bitflags::bitflags! {
    /// Sv39 page table entry flags (low 8 bits of the PTE; PPN and the two
    /// reserved-for-software bits live outside this set).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PteFlags: u64 {
        /// Valid
        const V = 1 << 0;
        /// Readable
        const R = 1 << 1;
        /// Writable
        const W = 1 << 2;
        /// Executable
        const X = 1 << 3;
        /// User accessible
        const U = 1 << 4;
        /// Global mapping
        const G = 1 << 5;
        /// Accessed
        const A = 1 << 6;
        /// Dirty
        const D = 1 << 7;
    }
}

static_assertions::const_assert_eq!(PteFlags::all().bits(), 0xFF);

const PPN_SHIFT: u64 = 10;
const PPN_MASK: u64 = ((1u64 << 44) - 1) << PPN_SHIFT;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessKind {
    Fetch,
    Load,
    Store,
}

/// The outcome of a successful walk: the resulting physical address plus
/// enough of the leaf PTE for the TLB to cache.
#[derive(Debug, Clone, Copy)]
pub struct Translation {
    pub phys_addr: u64,
    pub vpn: u64,
    pub ppn: u64,
    pub leaf_level: u32,
    pub readable: bool,
    pub writable: bool,
    pub executable: bool,
    pub user: bool,
    pub global: bool,
}

fn vpn_part(va: u64, level: u32) -> u64 {
    (va >> (PAGE_SHIFT + 9 * level)) & 0x1ff
}

/// Walks the Sv39 page table rooted at `satp`'s PPN, applying the seven
/// ordered permission/validity checks the ISA manual specifies. `bus` is
/// used for the PTE reads/writes (A/D-bit update) since the page table
/// itself lives in guest physical memory.
pub fn translate(
    bus: &mut Bus,
    satp_value: u64,
    va: u64,
    privilege: Privilege,
    access: AccessKind,
    mstatus: u64,
) -> Result<Translation, Exception> {
    if satp::mode(satp_value) == satp::MODE_BARE {
        return Ok(Translation {
            phys_addr: va,
            vpn: va >> PAGE_SHIFT,
            ppn: va >> PAGE_SHIFT,
            leaf_level: 0,
            readable: true,
            writable: true,
            executable: true,
            user: true,
            global: false,
        });
    }

    let fault = |va: u64| match access {
        AccessKind::Fetch => Exception::InstructionPageFault(va),
        AccessKind::Load => Exception::LoadPageFault(va),
        AccessKind::Store => Exception::StorePageFault(va),
    };

    let mut table_ppn = satp::ppn(satp_value);
    let mut level = LEVELS - 1;

    loop {
        let pte_addr = (table_ppn << PAGE_SHIFT) + vpn_part(va, level) * PTE_SIZE;
        // A bus miss reads as 0, which has V=0 and naturally faults below —
        // no separate out-of-range case needed here.
        let pte = bus.read(pte_addr, 8);

        let flags = PteFlags::from_bits_truncate(pte);
        let valid = flags.contains(PteFlags::V);
        let readable = flags.contains(PteFlags::R);
        let writable = flags.contains(PteFlags::W);

        if !valid || (!readable && writable) {
            return Err(fault(va)); // rule 1
        }

        let is_leaf = readable || flags.contains(PteFlags::X);
        if !is_leaf {
            if level == 0 {
                return Err(fault(va)); // rule 2: ran out of levels
            }
            table_ppn = (pte & PPN_MASK) >> PPN_SHIFT;
            level -= 1;
            continue;
        }

        // rule 3: U/S permission
        let user_page = flags.contains(PteFlags::U);
        match privilege {
            Privilege::User if !user_page => return Err(fault(va)),
            Privilege::Supervisor if user_page => {
                let sum = mstatus & status::SUM != 0;
                if access == AccessKind::Fetch || !sum {
                    return Err(fault(va));
                }
            }
            _ => {}
        }

        // rule 4/5: R/W/X requirement, MXR
        let executable = flags.contains(PteFlags::X);
        let mxr = mstatus & status::MXR != 0;
        let effective_readable = readable || (mxr && executable);
        match access {
            AccessKind::Fetch if !executable => return Err(fault(va)),
            AccessKind::Load if !effective_readable => return Err(fault(va)),
            AccessKind::Store if !writable => return Err(fault(va)),
            _ => {}
        }

        // rule 6: superpage alignment
        if level > 0 {
            let low_mask = (1u64 << (9 * level)) - 1;
            let ppn_all = (pte & PPN_MASK) >> PPN_SHIFT;
            if ppn_all & low_mask != 0 {
                return Err(fault(va));
            }
        }

        // rule 7: walker sets A/D atomically (this build always sets them
        // on first touch, never faults for a missing A/D bit).
        let need_dirty = access == AccessKind::Store && !flags.contains(PteFlags::D);
        let need_accessed = !flags.contains(PteFlags::A);
        if need_accessed || need_dirty {
            let mut updated_flags = flags | PteFlags::A;
            if need_dirty {
                updated_flags |= PteFlags::D;
            }
            let updated = (pte & !PteFlags::all().bits()) | updated_flags.bits();
            bus.write(pte_addr, updated, 8);
        }

        let ppn_all = (pte & PPN_MASK) >> PPN_SHIFT;
        let page_ppn = if level > 0 {
            // Superpage: low-level PPN bits come from the VA, high bits from the PTE.
            let mut combined = ppn_all;
            for l in 0..level {
                let shift = 9 * l;
                let va_vpn = vpn_part(va, l);
                combined = (combined & !(0x1ff << shift)) | (va_vpn << shift);
            }
            combined
        } else {
            ppn_all
        };

        let phys_addr = (page_ppn << PAGE_SHIFT) | (va & (PAGE_SIZE - 1));
        return Ok(Translation {
            phys_addr,
            vpn: va >> PAGE_SHIFT,
            ppn: page_ppn,
            leaf_level: level,
            readable,
            writable,
            executable,
            user: user_page,
            global: flags.contains(PteFlags::G),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::Bus;
    use crate::memory::Memory;

    fn bus_with_ram(size: u64) -> Bus {
        let mut bus = Bus::new();
        bus.register_ram(0, Memory::new(size));
        bus
    }

    #[test]
    fn sv39_four_kib_leaf_walk() {
        let mut bus = bus_with_ram(1 << 20);
        // Root table at physical 0x1000 (PPN 1). Level-2 index for VA bit 30
        // selects entry 1, pointing at a level-1 table at PPN 2.
        let root_ppn = 1u64;
        let l1_ppn = 2u64;
        let leaf_ppn = 0x55u64;

        let root_addr = root_ppn << PAGE_SHIFT;
        let l1_addr = l1_ppn << PAGE_SHIFT;

        let va = (1u64 << 30) | (2u64 << 21) | 0x123;

        // Level 2 entry (vpn[2]=1): pointer to l1 table.
        let ptr_pte = (l1_ppn << PPN_SHIFT) | PteFlags::V.bits();
        bus.write(root_addr + 1 * 8, ptr_pte, 8);

        // Level 1 entry (vpn[1]=2): leaf.
        let leaf_pte = (leaf_ppn << PPN_SHIFT)
            | (PteFlags::V | PteFlags::R | PteFlags::W | PteFlags::A | PteFlags::D).bits();
        bus.write(l1_addr + 2 * 8, leaf_pte, 8);

        let satp_value = satp::MODE_SV39 << satp::MODE_SHIFT | root_ppn;
        let t = translate(&mut bus, satp_value, va, Privilege::Supervisor, AccessKind::Load, 0)
            .expect("translation should succeed");
        assert_eq!(t.phys_addr, (leaf_ppn << PAGE_SHIFT) | 0x123);
    }

    #[test]
    fn write_to_read_only_page_faults() {
        let mut bus = bus_with_ram(1 << 20);
        let root_ppn = 1u64;
        let leaf_ppn = 0x10u64;
        let root_addr = root_ppn << PAGE_SHIFT;

        // A level-2 leaf (1 GiB superpage) directly at vpn[2].
        let leaf_pte = (leaf_ppn << PPN_SHIFT) | (PteFlags::V | PteFlags::R | PteFlags::A).bits();
        bus.write(root_addr + 0 * 8, leaf_pte, 8);

        let satp_value = satp::MODE_SV39 << satp::MODE_SHIFT | root_ppn;
        let err = translate(&mut bus, satp_value, 0x123, Privilege::Supervisor, AccessKind::Store, 0)
            .unwrap_err();
        assert_eq!(err.cause(), crate::cpu::csr::exception::STORE_PAGE_FAULT);
    }

    #[test]
    fn repeated_walk_is_idempotent() {
        let mut bus = bus_with_ram(1 << 20);
        let root_ppn = 1u64;
        // Low 18 bits must be zero: this is a level-2 (1 GiB) superpage leaf.
        let leaf_ppn = 0x4_0000u64;
        let root_addr = root_ppn << PAGE_SHIFT;
        let leaf_pte = (leaf_ppn << PPN_SHIFT) | (PteFlags::V | PteFlags::R | PteFlags::A).bits();
        bus.write(root_addr, leaf_pte, 8);
        let satp_value = satp::MODE_SV39 << satp::MODE_SHIFT | root_ppn;

        let first = translate(&mut bus, satp_value, 0x42, Privilege::Machine, AccessKind::Load, 0)
            .unwrap()
            .phys_addr;
        let second = translate(&mut bus, satp_value, 0x42, Privilege::Machine, AccessKind::Load, 0)
            .unwrap()
            .phys_addr;
        assert_eq!(first, second);
    }

    #[test]
    fn bare_mode_is_identity() {
        let mut bus = bus_with_ram(1 << 20);
        let t = translate(&mut bus, satp::MODE_BARE, 0x8000_1234, Privilege::Machine, AccessKind::Load, 0)
            .unwrap();
        assert_eq!(t.phys_addr, 0x8000_1234);
    }
}
