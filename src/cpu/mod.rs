//! Hart: one interpreter context driving fetch/decode/execute/trap.

pub mod csr;
pub mod decode;
pub mod exec;
pub mod mmu;
pub mod regs;
pub mod tlb;
pub mod trap;

use log::{debug, trace};

use crate::bus::Bus;
use csr::{CsrFile, Privilege};
use decode::{Instruction, Width};
use mmu::AccessKind;
use regs::{FpRegs, IntRegs};
use tlb::Tlb;
use trap::{enter, leave, select_pending_interrupt, Exception, TrapState};

/// Reservation record for LR/SC. Tracked for completeness; `SC` in this
/// build always succeeds since there is no multi-hart contention to
/// invalidate it against.
#[derive(Debug, Clone, Copy, Default)]
pub struct Reservation {
    pub addr: Option<u64>,
}

pub struct Hart {
    pub pc: u64,
    pub regs: IntRegs,
    pub fp_regs: FpRegs,
    pub csrs: CsrFile,
    pub privilege: Privilege,
    pub tlb: Tlb,
    pub hart_id: u64,
    pub halted: bool,
    pub running: bool,
    pub cycle: u64,
    pub instret: u64,
    pub reservation: Reservation,
}

impl Hart {
    pub fn new(hart_id: u64, tlb_size: usize, reset_pc: u64) -> Self {
        Self {
            pc: reset_pc,
            regs: IntRegs::default(),
            fp_regs: FpRegs::default(),
            csrs: CsrFile::new(hart_id),
            privilege: Privilege::Machine,
            tlb: Tlb::new(tlb_size),
            hart_id,
            halted: false,
            running: true,
            cycle: 0,
            instret: 0,
            reservation: Reservation::default(),
        }
    }

    fn satp(&self) -> u64 {
        self.csrs.satp()
    }

    fn mstatus(&self) -> u64 {
        self.csrs.mstatus()
    }

    /// Translate + read through the TLB, falling back to the full walker
    /// on a miss.
    fn translate(&mut self, bus: &mut Bus, va: u64, access: AccessKind) -> Result<u64, Exception> {
        let satp_value = self.satp();
        if csr::satp::mode(satp_value) == csr::satp::MODE_BARE {
            return Ok(va);
        }
        let vpn = va >> mmu::PAGE_SHIFT;
        let asid = csr::satp::asid(satp_value);

        if let Some(hit) = self.tlb.lookup(vpn, asid) {
            let permitted = match access {
                AccessKind::Fetch => hit.executable,
                AccessKind::Load => hit.readable || (self.mstatus() & csr::status::MXR != 0 && hit.executable),
                AccessKind::Store => hit.writable,
            };
            let user_ok = match self.privilege {
                Privilege::User => hit.user,
                Privilege::Supervisor => !hit.user || self.mstatus() & csr::status::SUM != 0,
                Privilege::Machine => true,
            };
            if permitted && user_ok {
                trace!("tlb hit vpn={vpn:#x} -> ppn={:#x}", hit.ppn);
                return Ok((hit.ppn << mmu::PAGE_SHIFT) | (va & (mmu::PAGE_SIZE - 1)));
            }
        }

        let t = mmu::translate(bus, satp_value, va, self.privilege, access, self.mstatus())?;
        self.tlb.insert(
            t.vpn,
            asid,
            t.global,
            t.ppn,
            t.readable,
            t.writable,
            t.executable,
            t.user,
        );
        Ok(t.phys_addr)
    }

    pub fn read_memory(&mut self, bus: &mut Bus, va: u64, size: u8) -> Result<u64, Exception> {
        // Misaligned loads/stores are permitted; only AMO enforces
        // alignment, which is checked in exec.rs before calling this path.
        let pa = self.translate(bus, va, AccessKind::Load)?;
        Ok(bus.read(pa, size))
    }

    pub fn write_memory(&mut self, bus: &mut Bus, va: u64, value: u64, size: u8) -> Result<(), Exception> {
        let pa = self.translate(bus, va, AccessKind::Store)?;
        bus.write(pa, value, size);
        Ok(())
    }

    fn fetch_and_decode(&mut self, bus: &mut Bus) -> Result<(Instruction, u64), Exception> {
        let fetch_pc = self.pc;
        let pa_lo = self.translate(bus, fetch_pc, AccessKind::Fetch)?;
        let lo = bus.read(pa_lo, 2) as u16;
        if lo & 0b11 == 0b11 {
            let pa_hi = self.translate(bus, fetch_pc + 2, AccessKind::Fetch)?;
            let hi = bus.read(pa_hi, 2) as u16;
            let raw = ((hi as u32) << 16) | lo as u32;
            Ok((decode::decode(raw, Width::Normal), 4))
        } else {
            Ok((decode::decode(lo as u32, Width::Compressed), 2))
        }
    }

    /// One emulated step: interrupt check, fetch, decode,
    /// execute, catch trap, advance counters.
    pub fn step(&mut self, bus: &mut Bus) {
        if self.halted || !self.running {
            return;
        }

        if let Some((interrupt, target)) =
            self.pending_interrupt()
        {
            self.take_interrupt(interrupt, target);
            self.tick_counters();
            return;
        }

        let outcome = self.fetch_and_decode(bus).and_then(|(instr, len)| {
            if matches!(instr, Instruction::Mret) {
                return self.handle_xret(Privilege::Machine).map(|pc| {
                    self.pc = pc;
                });
            }
            if matches!(instr, Instruction::Sret) {
                if self.mstatus() & csr::status::TSR != 0 && self.privilege == Privilege::Supervisor {
                    return Err(Exception::IllegalInstruction(0x1020_0073));
                }
                return self.handle_xret(Privilege::Supervisor).map(|pc| {
                    self.pc = pc;
                });
            }
            let pc_before = self.pc;
            let next = exec::execute(self, bus, instr, pc_before, len)?;
            self.pc = next;
            Ok(())
        });

        if let Err(exception) = outcome {
            self.take_exception(exception);
        }

        self.tick_counters();
    }

    fn handle_xret(&mut self, from: Privilege) -> Result<u64, Exception> {
        let mut privilege = self.privilege;
        let mut state = TrapState { csrs: &mut self.csrs, privilege: &mut privilege };
        let pc = leave(&mut state, from);
        self.privilege = privilege;
        debug!("{from:?}-mode xRET -> pc={pc:#x}, new privilege={:?}", self.privilege);
        Ok(pc)
    }

    fn pending_interrupt(&self) -> Option<(trap::Interrupt, Privilege)> {
        let mip = self.csrs.read_raw(csr::addr::MIP);
        let mie = self.csrs.read_raw(csr::addr::MIE);
        let mideleg = self.csrs.read_raw(csr::addr::MIDELEG);
        select_pending_interrupt(mip, mie, mideleg, self.privilege, self.mstatus())
    }

    fn take_interrupt(&mut self, interrupt: trap::Interrupt, target: Privilege) {
        let cause = interrupt.cause() | csr::CAUSE_INTERRUPT_BIT;
        let epc = self.pc;
        let mut privilege = self.privilege;
        let mut state = TrapState { csrs: &mut self.csrs, privilege: &mut privilege };
        let pc = enter(&mut state, target, cause, 0, epc);
        self.privilege = privilege;
        self.pc = pc;
        debug!("interrupt {interrupt:?} delivered to {target:?}, pc={pc:#x}");
    }

    fn take_exception(&mut self, exception: Exception) {
        let cause = exception.cause();
        let medeleg = self.csrs.read_raw(csr::addr::MEDELEG);
        let target = if medeleg & (1 << cause) != 0 && self.privilege <= Privilege::Supervisor {
            Privilege::Supervisor
        } else {
            Privilege::Machine
        };
        let epc = self.pc;
        let tval = exception.tval();
        let mut privilege = self.privilege;
        let mut state = TrapState { csrs: &mut self.csrs, privilege: &mut privilege };
        let pc = enter(&mut state, target, cause, tval, epc);
        self.privilege = privilege;
        self.pc = pc;
        debug!("exception {exception:?} delivered to {target:?}, pc={pc:#x}");
    }

    fn tick_counters(&mut self) {
        self.cycle = self.cycle.wrapping_add(1);
        self.instret = self.instret.wrapping_add(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::Memory;

    fn bus_with_program(words: &[u32]) -> Bus {
        let mut bus = Bus::new();
        let mut mem = Memory::new(4096);
        for (i, w) in words.iter().enumerate() {
            mem.write((i * 4) as u64, *w as u64, 4).unwrap();
        }
        bus.register_ram(0, mem);
        bus
    }

    #[test]
    fn addition_scenario() {
        // add x7, x5, x6
        let inst: u32 = (0 << 25) | (6 << 20) | (5 << 15) | (0 << 12) | (7 << 7) | 0x33;
        let mut bus = bus_with_program(&[inst]);
        let mut hart = Hart::new(0, 8, 0);
        hart.regs.write(5, 3);
        hart.regs.write(6, 4);
        hart.step(&mut bus);
        assert_eq!(hart.regs.read(7), 7);
        assert_eq!(hart.pc, 4);
    }

    #[test]
    fn mret_restores_privilege() {
        let mret: u32 = 0x3020_0073;
        let mut bus = bus_with_program(&[mret]);
        let mut hart = Hart::new(0, 8, 0);
        hart.privilege = Privilege::Machine;
        hart.csrs.set_mstatus(
            (Privilege::Supervisor.encoding() << csr::status::MPP_SHIFT) | csr::status::MPIE,
        );
        hart.csrs.write_raw(csr::addr::MEPC, 0x8000_0200);
        hart.step(&mut bus);
        assert_eq!(hart.privilege, Privilege::Supervisor);
        assert_eq!(hart.pc, 0x8000_0200);
    }

    #[test]
    fn ecall_from_u_traps_to_delegated_s() {
        let ecall: u32 = 0x0000_0073;
        let mut bus = bus_with_program(&[ecall]);
        let mut hart = Hart::new(0, 8, 0);
        hart.privilege = Privilege::User;
        hart.csrs.write_raw(csr::addr::MEDELEG, 1 << csr::exception::ECALL_FROM_U);
        hart.csrs.write_raw(csr::addr::STVEC, 0x8000_0100);
        hart.step(&mut bus);
        assert_eq!(hart.privilege, Privilege::Supervisor);
        assert_eq!(hart.pc, 0x8000_0100);
        assert_eq!(hart.csrs.read_raw(csr::addr::SCAUSE), 8);
        assert_eq!(hart.csrs.read_raw(csr::addr::SEPC), 0);
    }

    #[test]
    fn x0_always_reads_zero_after_step() {
        // addi x0, x0, 5 -- discarded write
        let inst: u32 = (5 << 20) | (0 << 15) | (0 << 12) | (0 << 7) | 0x13;
        let mut bus = bus_with_program(&[inst]);
        let mut hart = Hart::new(0, 8, 0);
        hart.step(&mut bus);
        assert_eq!(hart.regs.read(0), 0);
    }
}
