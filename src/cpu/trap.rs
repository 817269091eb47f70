//! Guest-visible faults and the trap entry/exit state machine.
//!
//! `Exception` is the in-band, guest-visible fault type: it is caught
//! entirely inside [`crate::cpu::Hart::step`] and turned into a trap. It is
//! intentionally not a `std::error::Error` — see `crate::error` for why.

use super::csr::{self, addr, status, Privilege};

/// A synchronous exception raised by fetch, decode, execute, or memory
/// access. Each variant carries exactly the information needed to populate
/// `xcause`/`xtval` on trap entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exception {
    InstructionAddressMisaligned(u64),
    InstructionAccessFault(u64),
    IllegalInstruction(u32),
    Breakpoint,
    LoadAddressMisaligned(u64),
    LoadAccessFault(u64),
    StoreAddressMisaligned(u64),
    StoreAccessFault(u64),
    EnvCallFromU,
    EnvCallFromS,
    EnvCallFromM,
    InstructionPageFault(u64),
    LoadPageFault(u64),
    StorePageFault(u64),
}

impl Exception {
    /// The exception-cause code (bit 63 is always clear for these).
    pub fn cause(self) -> u64 {
        use Exception::*;
        match self {
            InstructionAddressMisaligned(_) => csr::exception::INSTRUCTION_MISALIGNED,
            InstructionAccessFault(_) => csr::exception::INSTRUCTION_ACCESS_FAULT,
            IllegalInstruction(_) => csr::exception::ILLEGAL_INSTRUCTION,
            Breakpoint => csr::exception::BREAKPOINT,
            LoadAddressMisaligned(_) => csr::exception::LOAD_MISALIGNED,
            LoadAccessFault(_) => csr::exception::LOAD_ACCESS_FAULT,
            StoreAddressMisaligned(_) => csr::exception::STORE_MISALIGNED,
            StoreAccessFault(_) => csr::exception::STORE_ACCESS_FAULT,
            EnvCallFromU => csr::exception::ECALL_FROM_U,
            EnvCallFromS => csr::exception::ECALL_FROM_S,
            EnvCallFromM => csr::exception::ECALL_FROM_M,
            InstructionPageFault(_) => csr::exception::INSTRUCTION_PAGE_FAULT,
            LoadPageFault(_) => csr::exception::LOAD_PAGE_FAULT,
            StorePageFault(_) => csr::exception::STORE_PAGE_FAULT,
        }
    }

    /// `xtval`: the faulting address/instruction, or 0 for exceptions with
    /// no natural payload.
    pub fn tval(self) -> u64 {
        use Exception::*;
        match self {
            InstructionAddressMisaligned(a)
            | InstructionAccessFault(a)
            | LoadAddressMisaligned(a)
            | LoadAccessFault(a)
            | StoreAddressMisaligned(a)
            | StoreAccessFault(a)
            | InstructionPageFault(a)
            | LoadPageFault(a)
            | StorePageFault(a) => a,
            IllegalInstruction(raw) => raw as u64,
            Breakpoint | EnvCallFromU | EnvCallFromS | EnvCallFromM => 0,
        }
    }
}

/// A pending interrupt, already filtered by `mie`/delegation. Ordered by
/// `RANK` so `Ord` gives the standard priority (MEI > MSI > MTI > SEI >
/// SSI > STI).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interrupt {
    MachineExternal,
    MachineSoftware,
    MachineTimer,
    SupervisorExternal,
    SupervisorSoftware,
    SupervisorTimer,
}

impl Interrupt {
    pub fn cause(self) -> u64 {
        use Interrupt::*;
        match self {
            SupervisorSoftware => csr::irq_cause::SUPERVISOR_SOFTWARE,
            MachineSoftware => csr::irq_cause::MACHINE_SOFTWARE,
            SupervisorTimer => csr::irq_cause::SUPERVISOR_TIMER,
            MachineTimer => csr::irq_cause::MACHINE_TIMER,
            SupervisorExternal => csr::irq_cause::SUPERVISOR_EXTERNAL,
            MachineExternal => csr::irq_cause::MACHINE_EXTERNAL,
        }
    }

    fn pending_bit(self) -> u64 {
        use Interrupt::*;
        match self {
            SupervisorSoftware => csr::interrupt::SSIP,
            MachineSoftware => csr::interrupt::MSIP,
            SupervisorTimer => csr::interrupt::STIP,
            MachineTimer => csr::interrupt::MTIP,
            SupervisorExternal => csr::interrupt::SEIP,
            MachineExternal => csr::interrupt::MEIP,
        }
    }

    /// Priority order: lower = higher priority.
    const ORDER: [Interrupt; 6] = [
        Interrupt::MachineExternal,
        Interrupt::MachineSoftware,
        Interrupt::MachineTimer,
        Interrupt::SupervisorExternal,
        Interrupt::SupervisorSoftware,
        Interrupt::SupervisorTimer,
    ];
}

/// Selects the highest-priority deliverable interrupt given raw `mip`,
/// `mie`, `mideleg`, current privilege, and the M/S global-enable bits.
/// Returns `(interrupt, target_privilege)`.
pub fn select_pending_interrupt(
    mip: u64,
    mie: u64,
    mideleg: u64,
    privilege: Privilege,
    mstatus: u64,
) -> Option<(Interrupt, Privilege)> {
    let m_global_enabled = privilege < Privilege::Machine || (mstatus & status::MIE != 0);
    // A delegated S-interrupt is only deliverable from U-mode, or from
    // S-mode with sstatus.SIE set; it must never preempt M-mode, even
    // though SIE itself is untouched by M-mode trap entry.
    let s_global_enabled = matches!(privilege, Privilege::User)
        || (privilege == Privilege::Supervisor && mstatus & status::SIE != 0);

    for &candidate in Interrupt::ORDER.iter() {
        let bit = candidate.pending_bit();
        if mip & mie & bit == 0 {
            continue;
        }
        let delegated = mideleg & bit != 0;
        let target = if delegated { Privilege::Supervisor } else { Privilege::Machine };
        let enabled = match target {
            Privilege::Machine => m_global_enabled,
            Privilege::Supervisor => s_global_enabled,
            Privilege::User => true,
        };
        if enabled {
            return Some((candidate, target));
        }
    }
    None
}

/// Mutable view of the CSR/privilege state the trap entry/exit sequence
/// reads and writes. Kept separate from `CsrFile` so `trap::enter`/`leave`
/// stay unit-testable without a full `Hart`.
pub struct TrapState<'a> {
    pub csrs: &'a mut csr::CsrFile,
    pub privilege: &'a mut Privilege,
}

/// Trap entry. `cause` already encodes the interrupt bit (bit 63) when
/// applicable; `tval` and `epc` are the fault-specific value and the
/// resume/faulting PC respectively.
pub fn enter(state: &mut TrapState<'_>, target: Privilege, cause: u64, tval: u64, epc: u64) -> u64 {
    let mstatus = state.csrs.mstatus();
    let current_priv = *state.privilege;

    match target {
        Privilege::Machine => {
            state.csrs.write_raw(addr::MEPC, epc);
            state.csrs.write_raw(addr::MCAUSE, cause);
            state.csrs.write_raw(addr::MTVAL, tval);

            let mpie = (mstatus & status::MIE != 0) as u64;
            let mut new_status = mstatus & !(status::MPIE | status::MIE | status::MPP_MASK);
            new_status |= mpie * status::MPIE;
            new_status |= (current_priv.encoding()) << status::MPP_SHIFT;
            state.csrs.set_mstatus(new_status);

            *state.privilege = Privilege::Machine;
            vectored_target(state.csrs.read_raw(addr::MTVEC), cause)
        }
        Privilege::Supervisor => {
            state.csrs.write_raw(addr::SEPC, epc);
            state.csrs.write_raw(addr::SCAUSE, cause);
            state.csrs.write_raw(addr::STVAL, tval);

            let spie = (mstatus & status::SIE != 0) as u64;
            let mut new_status = mstatus & !(status::SPIE | status::SIE | status::SPP);
            new_status |= spie * status::SPIE;
            new_status |= (current_priv.encoding() & 1) << status::SPP_SHIFT;
            state.csrs.set_mstatus(new_status);

            *state.privilege = Privilege::Supervisor;
            vectored_target(state.csrs.read_raw(addr::STVEC), cause)
        }
        Privilege::User => unreachable!("traps never target U-mode"),
    }
}

fn vectored_target(tvec: u64, cause: u64) -> u64 {
    let base = tvec & csr::tvec::BASE_MASK;
    let mode = tvec & csr::tvec::MODE_MASK;
    let is_interrupt = cause & csr::CAUSE_INTERRUPT_BIT != 0;
    if is_interrupt && mode == csr::tvec::MODE_VECTORED {
        let code = cause & !csr::CAUSE_INTERRUPT_BIT;
        base + 4 * code
    } else {
        base
    }
}

/// `MRET`/`SRET`. Returns the resume PC.
pub fn leave(state: &mut TrapState<'_>, from: Privilege) -> u64 {
    let mstatus = state.csrs.mstatus();
    match from {
        Privilege::Machine => {
            let mpie = (mstatus & status::MPIE != 0) as u64;
            let mpp = Privilege::from_encoding((mstatus & status::MPP_MASK) >> status::MPP_SHIFT);

            let mut new_status = mstatus & !(status::MIE | status::MPIE | status::MPP_MASK);
            new_status |= mpie * status::MIE;
            new_status |= status::MPIE; // MPIE always set to 1 on mret
            // MPP reset to U (least-privileged) after use.
            new_status |= Privilege::User.encoding() << status::MPP_SHIFT;
            state.csrs.set_mstatus(new_status);

            *state.privilege = mpp;
            state.csrs.read_raw(addr::MEPC)
        }
        Privilege::Supervisor => {
            let spie = (mstatus & status::SPIE != 0) as u64;
            let spp_bit = (mstatus & status::SPP) >> status::SPP_SHIFT;
            let spp = if spp_bit == 1 { Privilege::Supervisor } else { Privilege::User };

            let mut new_status = mstatus & !(status::SIE | status::SPIE | status::SPP);
            new_status |= spie * status::SIE;
            new_status |= status::SPIE;
            // SPP reset to U, mirroring mret's MPP handling.
            state.csrs.set_mstatus(new_status);

            *state.privilege = spp;
            state.csrs.read_raw(addr::SEPC)
        }
        Privilege::User => unreachable!("xRET never executes from U-mode"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh() -> (csr::CsrFile, Privilege) {
        (csr::CsrFile::new(0), Privilege::Machine)
    }

    #[test]
    fn mret_restores_privilege_and_pc() {
        let (mut csrs, mut priv_) = fresh();
        csrs.set_mstatus(
            (csr::Privilege::Supervisor.encoding() << status::MPP_SHIFT) | status::MPIE,
        );
        csrs.write_raw(addr::MEPC, 0x8000_0200);
        let mut state = TrapState { csrs: &mut csrs, privilege: &mut priv_ };
        let pc = leave(&mut state, Privilege::Machine);
        assert_eq!(pc, 0x8000_0200);
        assert_eq!(*state.privilege, Privilege::Supervisor);
        assert_ne!(state.csrs.mstatus() & status::MIE, 0);
        assert_ne!(state.csrs.mstatus() & status::MPIE, 0);
        assert_eq!(
            (state.csrs.mstatus() & status::MPP_MASK) >> status::MPP_SHIFT,
            Privilege::User.encoding()
        );
    }

    #[test]
    fn ecall_from_u_delegated_to_s() {
        let (mut csrs, mut priv_) = fresh();
        priv_ = Privilege::User;
        csrs.write_raw(addr::STVEC, 0x8000_0100);
        let mut state = TrapState { csrs: &mut csrs, privilege: &mut priv_ };
        let pc = enter(
            &mut state,
            Privilege::Supervisor,
            Exception::EnvCallFromU.cause(),
            0,
            0x1000,
        );
        assert_eq!(pc, 0x8000_0100);
        assert_eq!(*state.privilege, Privilege::Supervisor);
        assert_eq!(state.csrs.read_raw(addr::SEPC), 0x1000);
        assert_eq!(state.csrs.read_raw(addr::SCAUSE), 8);
        assert_eq!((state.csrs.mstatus() & status::SPP) >> status::SPP_SHIFT, 0);
    }

    #[test]
    fn interrupt_priority_external_before_timer() {
        let mip = csr::interrupt::MTIP | csr::interrupt::MEIP;
        let mie = csr::interrupt::MTIP | csr::interrupt::MEIP;
        let got = select_pending_interrupt(mip, mie, 0, Privilege::Machine, status::MIE);
        assert_eq!(got, Some((Interrupt::MachineExternal, Privilege::Machine)));
    }

    #[test]
    fn interrupt_masked_by_mie_global() {
        let mip = csr::interrupt::MTIP;
        let mie = csr::interrupt::MTIP;
        // M-mode with mstatus.MIE=0 masks M-targeted interrupts while in M.
        let got = select_pending_interrupt(mip, mie, 0, Privilege::Machine, 0);
        assert_eq!(got, None);
    }
}
