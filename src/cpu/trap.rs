//! Trap handling (exceptions and interrupts)
//!
//! A trap is resolved at the end of every tick: a synchronous exception
//! raised by the instruction wins over pending interrupts, interrupts are
//! selected in a fixed priority order, and delivery honours the
//! medeleg/mideleg (and sedeleg/sideleg) delegation chain.

use super::csr::*;
use super::{Cpu, InsResult, PrivilegeLevel};
use crate::memory::Bus;
use log::debug;

/// Interrupt causes have the high bit of xCAUSE set.
pub const INTERRUPT_OFFSET: u32 = 0x8000_0000;

/// Exception or interrupt cause, carrying the trap value where one exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trap {
    // Exceptions (synchronous)
    InstructionAddressMisaligned(u32),
    InstructionAccessFault(u32),
    IllegalInstruction(u32),
    Breakpoint(u32),
    LoadAddressMisaligned(u32),
    LoadAccessFault(u32),
    StoreAddressMisaligned(u32),
    StoreAccessFault(u32),
    EnvironmentCallFromU(u32),
    EnvironmentCallFromS(u32),
    EnvironmentCallFromM(u32),
    InstructionPageFault(u32),
    LoadPageFault(u32),
    StorePageFault(u32),

    // Interrupts (asynchronous)
    UserSoftwareInterrupt,
    SupervisorSoftwareInterrupt,
    MachineSoftwareInterrupt,
    UserTimerInterrupt,
    SupervisorTimerInterrupt,
    MachineTimerInterrupt,
    UserExternalInterrupt,
    SupervisorExternalInterrupt,
    MachineExternalInterrupt,
}

impl Trap {
    /// Value written to xCAUSE on delivery.
    pub fn cause(&self) -> u32 {
        match self {
            Trap::InstructionAddressMisaligned(_) => 0,
            Trap::InstructionAccessFault(_) => 1,
            Trap::IllegalInstruction(_) => 2,
            Trap::Breakpoint(_) => 3,
            Trap::LoadAddressMisaligned(_) => 4,
            Trap::LoadAccessFault(_) => 5,
            Trap::StoreAddressMisaligned(_) => 6,
            Trap::StoreAccessFault(_) => 7,
            Trap::EnvironmentCallFromU(_) => 8,
            Trap::EnvironmentCallFromS(_) => 9,
            Trap::EnvironmentCallFromM(_) => 11,
            Trap::InstructionPageFault(_) => 12,
            Trap::LoadPageFault(_) => 13,
            Trap::StorePageFault(_) => 15,

            Trap::UserSoftwareInterrupt => INTERRUPT_OFFSET,
            Trap::SupervisorSoftwareInterrupt => INTERRUPT_OFFSET | 1,
            Trap::MachineSoftwareInterrupt => INTERRUPT_OFFSET | 3,
            Trap::UserTimerInterrupt => INTERRUPT_OFFSET | 4,
            Trap::SupervisorTimerInterrupt => INTERRUPT_OFFSET | 5,
            Trap::MachineTimerInterrupt => INTERRUPT_OFFSET | 7,
            Trap::UserExternalInterrupt => INTERRUPT_OFFSET | 8,
            Trap::SupervisorExternalInterrupt => INTERRUPT_OFFSET | 9,
            Trap::MachineExternalInterrupt => INTERRUPT_OFFSET | 11,
        }
    }

    /// Value written to xTVAL on delivery.
    pub fn value(&self) -> u32 {
        match self {
            Trap::InstructionAddressMisaligned(v)
            | Trap::InstructionAccessFault(v)
            | Trap::IllegalInstruction(v)
            | Trap::Breakpoint(v)
            | Trap::LoadAddressMisaligned(v)
            | Trap::LoadAccessFault(v)
            | Trap::StoreAddressMisaligned(v)
            | Trap::StoreAccessFault(v)
            | Trap::EnvironmentCallFromU(v)
            | Trap::EnvironmentCallFromS(v)
            | Trap::EnvironmentCallFromM(v)
            | Trap::InstructionPageFault(v)
            | Trap::LoadPageFault(v)
            | Trap::StorePageFault(v) => *v,
            _ => 0,
        }
    }

    pub fn is_interrupt(&self) -> bool {
        self.cause() & INTERRUPT_OFFSET != 0
    }

    /// The per-cause enable bit in MIE/SIE/UIE gating this interrupt.
    fn enable_bit(&self) -> Option<u32> {
        match self {
            Trap::UserSoftwareInterrupt => Some(1 << 0),
            Trap::SupervisorSoftwareInterrupt => Some(1 << 1),
            Trap::MachineSoftwareInterrupt => Some(1 << 3),
            Trap::UserTimerInterrupt => Some(1 << 4),
            Trap::SupervisorTimerInterrupt => Some(1 << 5),
            Trap::MachineTimerInterrupt => Some(1 << 7),
            Trap::UserExternalInterrupt => Some(1 << 8),
            Trap::SupervisorExternalInterrupt => Some(1 << 9),
            Trap::MachineExternalInterrupt => Some(1 << 11),
            _ => None,
        }
    }
}

/// Deliver `trap`, honouring delegation and interrupt masking.
///
/// Returns the new pc on delivery, or `None` when a masked interrupt is
/// left pending. Exceptions are always delivered.
pub fn handle_trap(cpu: &mut Cpu, bus: &Bus, trap: &Trap, pc_next: u32) -> Option<u32> {
    let is_interrupt = trap.is_interrupt();
    let cause = trap.cause();
    let pos = cause & 0xffff;
    let current_privilege = cpu.csr.privilege;

    let mdeleg = cpu.read_csr_raw(bus, if is_interrupt { CSR_MIDELEG } else { CSR_MEDELEG });
    let sdeleg = cpu.read_csr_raw(bus, if is_interrupt { CSR_SIDELEG } else { CSR_SEDELEG });

    let new_privilege = if (mdeleg >> pos) & 1 == 0 {
        PrivilegeLevel::Machine
    } else if (sdeleg >> pos) & 1 == 0 {
        PrivilegeLevel::Supervisor
    } else {
        PrivilegeLevel::User
    };

    let mstatus = cpu.read_csr_raw(bus, CSR_MSTATUS);
    let sstatus = cpu.read_csr_raw(bus, CSR_SSTATUS);
    let current_status = match current_privilege {
        PrivilegeLevel::Machine => mstatus,
        PrivilegeLevel::Supervisor => sstatus,
        PrivilegeLevel::User => cpu.read_csr_raw(bus, CSR_USTATUS),
    };

    if is_interrupt {
        // A target below the current privilege never preempts it; a target
        // at the current privilege requires the global xIE bit.
        if new_privilege < current_privilege {
            return None;
        }
        if new_privilege == current_privilege {
            let enabled = match current_privilege {
                PrivilegeLevel::Machine => (current_status >> 3) & 1,
                PrivilegeLevel::Supervisor => (current_status >> 1) & 1,
                PrivilegeLevel::User => current_status & 1,
            };
            if enabled == 0 {
                return None;
            }
        }

        let ie = match new_privilege {
            PrivilegeLevel::Machine => cpu.read_csr_raw(bus, CSR_MIE),
            PrivilegeLevel::Supervisor => cpu.read_csr_raw(bus, CSR_SIE),
            PrivilegeLevel::User => cpu.read_csr_raw(bus, CSR_UIE),
        };
        if let Some(bit) = trap.enable_bit() {
            if ie & bit == 0 {
                return None;
            }
        }
    }

    cpu.csr.privilege = new_privilege;

    let (epc_addr, cause_addr, tval_addr, tvec_addr) = match new_privilege {
        PrivilegeLevel::Machine => (CSR_MEPC, CSR_MCAUSE, CSR_MTVAL, CSR_MTVEC),
        PrivilegeLevel::Supervisor => (CSR_SEPC, CSR_SCAUSE, CSR_STVAL, CSR_STVEC),
        PrivilegeLevel::User => (CSR_UEPC, CSR_UCAUSE, CSR_UTVAL, CSR_UTVEC),
    };

    // Interrupts resume at the instruction that would have executed next;
    // exceptions restart the faulting instruction.
    let epc = if is_interrupt { pc_next } else { cpu.pc };
    cpu.write_csr_raw(epc_addr, epc);
    cpu.write_csr_raw(cause_addr, cause);
    cpu.write_csr_raw(tval_addr, trap.value());

    let mut vector = cpu.read_csr_raw(bus, tvec_addr);
    if vector & 0x3 != 0 {
        vector = (vector & !0x3).wrapping_add(4 * pos);
    }

    if new_privilege == PrivilegeLevel::Machine {
        let mie = (mstatus >> 3) & 1;
        let new_status =
            (mstatus & !0x1888) | (mie << 7) | ((current_privilege as u32) << 11);
        cpu.write_csr_raw(CSR_MSTATUS, new_status);
    } else {
        let sie = (sstatus >> 1) & 1;
        let new_status =
            (sstatus & !0x122) | (sie << 5) | (((current_privilege as u32) & 1) << 8);
        cpu.write_csr_raw(CSR_SSTATUS, new_status);
    }

    cpu.reservation = None;

    debug!(
        "trap: cause={:08x} value={:08x} irq={} pc {:08x} -> {:08x} ({})",
        cause,
        trap.value(),
        is_interrupt,
        cpu.pc,
        vector,
        new_privilege as u32,
    );

    Some(vector)
}

/// End-of-tick resolution: take the instruction's exception if there is
/// one, otherwise scan `mip & mie` for the highest-priority pending
/// interrupt, and deliver.
pub fn handle_irq_and_trap(cpu: &mut Cpu, bus: &Bus, ret: &mut InsResult) {
    let mut mip_reset = None;
    let mut trap = ret.trap;

    if trap.is_none() {
        let mirq = cpu.read_csr_raw(bus, CSR_MIP) & cpu.read_csr_raw(bus, CSR_MIE);
        let prioritized = [
            (MIP_MEIP, Trap::MachineExternalInterrupt),
            (MIP_MSIP, Trap::MachineSoftwareInterrupt),
            (MIP_MTIP, Trap::MachineTimerInterrupt),
            (MIP_SEIP, Trap::SupervisorExternalInterrupt),
            (MIP_SSIP, Trap::SupervisorSoftwareInterrupt),
            (MIP_STIP, Trap::SupervisorTimerInterrupt),
        ];
        for (bit, irq) in prioritized {
            if mirq & bit != 0 {
                mip_reset = Some(bit);
                trap = Some(irq);
                break;
            }
        }
    }

    if let Some(t) = trap {
        if let Some(vector) = handle_trap(cpu, bus, &t, ret.pc_next) {
            ret.trap = Some(t);
            ret.pc_next = vector;
            // Software and external pending bits clear on delivery; the
            // timer bits clear only when mtimecmp is written.
            if let Some(bit) = mip_reset {
                if bit & (MIP_MEIP | MIP_MSIP | MIP_SEIP | MIP_SSIP) != 0 {
                    let mip = cpu.csr.raw(CSR_MIP);
                    cpu.csr.set_raw(CSR_MIP, mip & !bit);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::Bus;

    fn cpu_and_bus() -> (Cpu, Bus) {
        (Cpu::new(), Bus::new(1024 * 1024))
    }

    #[test]
    fn exception_goes_to_machine_by_default() {
        let (mut cpu, bus) = cpu_and_bus();
        cpu.pc = 0x8000_0100;
        cpu.write_csr_raw(CSR_MTVEC, 0x8000_0400);

        let t = Trap::IllegalInstruction(0xdead_beef);
        let vector = handle_trap(&mut cpu, &bus, &t, 0x8000_0104).unwrap();

        assert_eq!(vector, 0x8000_0400);
        assert_eq!(cpu.read_csr_raw(&bus, CSR_MEPC), 0x8000_0100);
        assert_eq!(cpu.read_csr_raw(&bus, CSR_MCAUSE), 2);
        assert_eq!(cpu.read_csr_raw(&bus, CSR_MTVAL), 0xdead_beef);
        assert_eq!(cpu.csr.privilege, PrivilegeLevel::Machine);
    }

    #[test]
    fn delegated_exception_lands_in_supervisor() {
        let (mut cpu, bus) = cpu_and_bus();
        cpu.csr.privilege = PrivilegeLevel::Supervisor;
        cpu.pc = 0x1000;
        cpu.write_csr_raw(CSR_MEDELEG, 1 << 12);
        cpu.write_csr_raw(CSR_STVEC, 0x8000_2000);

        let t = Trap::InstructionPageFault(0x1000);
        let vector = handle_trap(&mut cpu, &bus, &t, 0x1004).unwrap();

        assert_eq!(vector, 0x8000_2000);
        assert_eq!(cpu.read_csr_raw(&bus, CSR_SEPC), 0x1000);
        assert_eq!(cpu.read_csr_raw(&bus, CSR_SCAUSE), 12);
        assert_eq!(cpu.read_csr_raw(&bus, CSR_STVAL), 0x1000);
        assert_eq!(cpu.csr.privilege, PrivilegeLevel::Supervisor);
    }

    #[test]
    fn machine_interrupt_respects_global_mie() {
        let (mut cpu, bus) = cpu_and_bus();
        cpu.write_csr_raw(CSR_MIE, MIP_MTIP);
        cpu.write_csr_raw(CSR_MTVEC, 0x8000_0400);

        // MIE clear: delivery refused at the same privilege level.
        assert!(handle_trap(&mut cpu, &bus, &Trap::MachineTimerInterrupt, 0x8000_0004).is_none());

        cpu.write_csr_raw(CSR_MSTATUS, MSTATUS_MIE);
        let vector =
            handle_trap(&mut cpu, &bus, &Trap::MachineTimerInterrupt, 0x8000_0004).unwrap();
        assert_eq!(vector, 0x8000_0400);
        // Interrupts capture the pc of the next instruction.
        assert_eq!(cpu.read_csr_raw(&bus, CSR_MEPC), 0x8000_0004);
        assert_eq!(cpu.read_csr_raw(&bus, CSR_MCAUSE), INTERRUPT_OFFSET | 7);

        // MPIE holds the old MIE, MIE is cleared, MPP is Machine.
        let mstatus = cpu.read_csr_raw(&bus, CSR_MSTATUS);
        assert_eq!(mstatus & MSTATUS_MIE, 0);
        assert_ne!(mstatus & MSTATUS_MPIE, 0);
        assert_eq!((mstatus >> 11) & 3, 3);
    }

    #[test]
    fn vectored_mode_offsets_by_cause() {
        let (mut cpu, bus) = cpu_and_bus();
        cpu.write_csr_raw(CSR_MSTATUS, MSTATUS_MIE);
        cpu.write_csr_raw(CSR_MIE, MIP_MTIP);
        cpu.write_csr_raw(CSR_MTVEC, 0x8000_0401);

        let vector =
            handle_trap(&mut cpu, &bus, &Trap::MachineTimerInterrupt, 0x8000_0004).unwrap();
        assert_eq!(vector, 0x8000_0400 + 4 * 7);
    }

    #[test]
    fn irq_resolution_prefers_exceptions_then_priority_order() {
        let (mut cpu, bus) = cpu_and_bus();
        cpu.write_csr_raw(CSR_MSTATUS, MSTATUS_MIE);
        cpu.write_csr_raw(CSR_MIE, MIP_ALL);
        cpu.write_csr_raw(CSR_MTVEC, 0x8000_0400);
        cpu.csr.set_raw(CSR_MIP, MIP_MSIP | MIP_MTIP);

        let mut ret = cpu.noop_result();
        handle_irq_and_trap(&mut cpu, &bus, &mut ret);

        // MSIP outranks MTIP and is cleared on delivery.
        assert_eq!(cpu.read_csr_raw(&bus, CSR_MCAUSE), INTERRUPT_OFFSET | 3);
        assert_eq!(cpu.csr.raw(CSR_MIP) & MIP_MSIP, 0);
        assert_ne!(cpu.csr.raw(CSR_MIP) & MIP_MTIP, 0);
    }
}
