//! RV32IMA hart
//!
//! Implements the RISC-V 32-bit base integer instruction set with the M
//! (multiply/divide) and A (atomic) extensions, Zicsr, and the U/S/M
//! privilege architecture with Sv32 virtual memory.

pub mod csr;
pub mod decode;
mod execute;
pub mod mmu;
pub mod trap;

pub use csr::Csr;
pub use mmu::{Access, AddressingMode, MmuState};
pub use trap::Trap;

use crate::memory::Bus;
use csr::*;
use log::trace;
use serde::{Deserialize, Serialize};

/// Privilege levels
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, Serialize, Deserialize)]
#[repr(u8)]
pub enum PrivilegeLevel {
    User = 0,
    Supervisor = 1,
    Machine = 3,
}

impl From<u8> for PrivilegeLevel {
    fn from(val: u8) -> Self {
        match val & 3 {
            0 => PrivilegeLevel::User,
            1 => PrivilegeLevel::Supervisor,
            _ => PrivilegeLevel::Machine,
        }
    }
}

/// Result of executing one instruction, applied by the commit phase.
///
/// `write_reg == 0` means no register write (x0 is hard-wired to zero) and
/// `csr_write == 0` means no CSR write. A trap suppresses both commits.
#[derive(Debug, Clone, Copy)]
pub struct InsResult {
    pub write_reg: u32,
    pub write_val: u32,
    pub pc_next: u32,
    pub csr_write: u32,
    pub csr_val: u32,
    pub trap: Option<Trap>,
}

/// CPU state
#[derive(Serialize, Deserialize)]
pub struct Cpu {
    /// Tick counter, also visible as the cycle/mcycle CSRs.
    pub clock: u32,
    /// General purpose registers (x0-x31)
    pub xreg: [u32; 32],
    /// Program counter
    pub pc: u32,
    /// Control and Status Registers
    pub csr: Csr,
    /// Address translation state derived from satp
    pub mmu: MmuState,
    /// Reservation established by LR.W
    pub reservation: Option<u32>,
    /// Permit ECALL with a7 == 93 to terminate the emulator (test harness)
    pub allow_guest_exit: bool,
    /// Exit status requested by the guest, if any
    pub exit_request: Option<u32>,
}

impl Cpu {
    pub fn new() -> Self {
        let mut cpu = Cpu {
            clock: 0,
            xreg: [0u32; 32],
            pc: 0x8000_0000,
            csr: Csr::new(),
            mmu: MmuState::new(),
            reservation: None,
            allow_guest_exit: false,
            exit_request: None,
        };
        // Boot convention: a1 points at the DTB window.
        cpu.xreg[11] = 0x1020;
        cpu
    }

    /// Register read; the commit phase guarantees x0 stays zero.
    #[inline(always)]
    pub fn reg(&self, r: u32) -> u32 {
        self.xreg[(r & 0x1f) as usize]
    }

    /// An `InsResult` that retires to the next sequential instruction.
    pub fn noop_result(&self) -> InsResult {
        InsResult {
            write_reg: 0,
            write_val: 0,
            pc_next: self.pc.wrapping_add(4),
            csr_write: 0,
            csr_val: 0,
            trap: None,
        }
    }

    /// Raw CSR read with architectural aliasing applied.
    pub fn read_csr_raw(&self, bus: &Bus, addr: u32) -> u32 {
        match addr {
            CSR_SSTATUS => self.csr.raw(CSR_MSTATUS) & SSTATUS_MASK,
            CSR_SIE => self.csr.raw(CSR_MIE) & SI_MASK,
            CSR_SIP => self.csr.raw(CSR_MIP) & SI_MASK,
            CSR_CYCLE | CSR_MCYCLE => self.clock,
            CSR_TIME => bus.clint.mtime_lo,
            CSR_SATP => {
                let mode = match self.mmu.mode {
                    AddressingMode::Off => 0,
                    AddressingMode::Sv32 => 1,
                };
                (mode << 31) | self.mmu.ppn
            }
            CSR_MHARTID => 0,
            CSR_NET_TX_BUF_ADDR => crate::memory::NET_TX_BASE,
            CSR_NET_RX_BUF_ADDR => crate::memory::NET_RX_BASE,
            CSR_NET_RX_BUF_READY => bus.net.rx_ready,
            _ => self.csr.raw(addr),
        }
    }

    /// Raw CSR write with architectural aliasing applied.
    pub fn write_csr_raw(&mut self, addr: u32, value: u32) {
        match addr {
            CSR_SSTATUS => {
                let mstatus = self.csr.raw(CSR_MSTATUS);
                self.csr
                    .set_raw(CSR_MSTATUS, (mstatus & !SSTATUS_MASK) | (value & SSTATUS_MASK));
            }
            CSR_SIE => {
                let mie = self.csr.raw(CSR_MIE);
                self.csr.set_raw(CSR_MIE, (mie & !SI_MASK) | (value & SI_MASK));
            }
            CSR_SIP => {
                let mip = self.csr.raw(CSR_MIP);
                self.csr.set_raw(CSR_MIP, (mip & !SI_MASK) | (value & SI_MASK));
            }
            CSR_MIDELEG => self.csr.set_raw(addr, value & MIDELEG_MASK),
            // Counter shadows ignore writes.
            CSR_TIME | CSR_MCYCLE => {}
            _ => self.csr.set_raw(addr, value),
        }
    }

    /// CSR read for the CSR instructions: privilege-checked.
    pub fn get_csr(&self, bus: &Bus, addr: u32) -> Result<u32, Trap> {
        if !self.csr.has_access(addr) {
            return Err(Trap::IllegalInstruction(self.pc));
        }
        let value = self.read_csr_raw(bus, addr);
        trace!("csr read  @{:03x} = {:08x}", addr, value);
        Ok(value)
    }

    /// CSR write commit: privilege- and read-only-checked, with satp routed
    /// through the MMU and the custom network CSRs through the bus.
    pub fn set_csr(&mut self, bus: &mut Bus, addr: u32, value: u32) -> Result<(), Trap> {
        if !self.csr.has_access(addr) || Csr::is_read_only(addr) {
            return Err(Trap::IllegalInstruction(self.pc));
        }
        trace!("csr write @{:03x} = {:08x}", addr, value);
        match addr {
            CSR_SATP => self.mmu_update(value),
            CSR_NET_TX_BUF_SIZE_AND_SEND => bus.net.send(value),
            CSR_NET_RX_BUF_READY => bus.net.rx_ready = value,
            _ => self.write_csr_raw(addr, value),
        }
        Ok(())
    }

    /// Print the full register file, for the single-step debugger.
    pub fn dump(&self) {
        eprintln!("DUMP: CPU state @{}:", self.clock);
        for i in (0..32).step_by(4) {
            eprintln!(
                "DUMP: x{:02} = {:08x}  x{:02} = {:08x}  x{:02} = {:08x}  x{:02} = {:08x}",
                i,
                self.xreg[i],
                i + 1,
                self.xreg[i + 1],
                i + 2,
                self.xreg[i + 2],
                i + 3,
                self.xreg[i + 3]
            );
        }
        eprintln!("DUMP: pc  = {:08x}", self.pc);
    }
}

impl Default for Cpu {
    fn default() -> Self {
        Cpu::new()
    }
}
