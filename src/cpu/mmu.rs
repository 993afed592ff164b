//! Sv32 address translation
//!
//! Two-level page-table walk with 4 KiB pages and 4 MiB superpages. The
//! walker checks permissions and the preset A/D bits but never writes the
//! page tables back; the guest is expected to preset A (and D for writable
//! mappings) itself.

use super::csr::{CSR_MSTATUS, MSTATUS_MPRV, MSTATUS_MXR, MSTATUS_SUM};
use super::trap::Trap;
use super::{Cpu, PrivilegeLevel};
use crate::memory::Bus;
use serde::{Deserialize, Serialize};

/// Memory access type, selecting the permission bit and the fault cause.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Fetch,
    Read,
    Write,
}

/// satp.MODE values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AddressingMode {
    Off,
    Sv32,
}

/// MMU state derived from the last satp write.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MmuState {
    pub mode: AddressingMode,
    /// Root page-table physical page number (22 bits).
    pub ppn: u32,
}

impl MmuState {
    pub fn new() -> Self {
        MmuState {
            mode: AddressingMode::Off,
            ppn: 0,
        }
    }
}

impl Default for MmuState {
    fn default() -> Self {
        MmuState::new()
    }
}

struct Pte {
    v: bool,
    r: bool,
    w: bool,
    x: bool,
    u: bool,
    a: bool,
    d: bool,
    ppn0: u32,
    ppn1: u32,
}

impl Pte {
    fn decode(pte: u32) -> Self {
        Pte {
            v: pte & 1 != 0,
            r: pte & 2 != 0,
            w: pte & 4 != 0,
            x: pte & 8 != 0,
            u: pte & 16 != 0,
            a: pte & 64 != 0,
            d: pte & 128 != 0,
            ppn0: (pte >> 10) & 0x3ff,
            ppn1: (pte >> 20) & 0xfff,
        }
    }
}

fn page_fault(access: Access, vaddr: u32) -> Trap {
    match access {
        Access::Fetch => Trap::InstructionPageFault(vaddr),
        Access::Read => Trap::LoadPageFault(vaddr),
        Access::Write => Trap::StorePageFault(vaddr),
    }
}

impl Cpu {
    /// Install a new translation mode from a satp write.
    pub fn mmu_update(&mut self, satp: u32) {
        self.mmu.mode = if satp >> 31 != 0 {
            AddressingMode::Sv32
        } else {
            AddressingMode::Off
        };
        self.mmu.ppn = satp & 0x3f_ffff;
    }

    /// Translate a virtual address, or fault with the page fault matching
    /// the access type and `tval` set to the original virtual address.
    pub fn translate(&self, bus: &mut Bus, vaddr: u32, access: Access) -> Result<u32, Trap> {
        if self.mmu.mode == AddressingMode::Off {
            return Ok(vaddr);
        }

        let mstatus = self.csr.raw(CSR_MSTATUS);

        // MPRV redirects loads and stores (never fetches) to the privilege
        // saved in MPP.
        let mut privilege = self.csr.privilege;
        if access != Access::Fetch && mstatus & MSTATUS_MPRV != 0 {
            privilege = PrivilegeLevel::from(((mstatus >> 11) & 3) as u8);
        }
        if privilege == PrivilegeLevel::Machine {
            return Ok(vaddr);
        }

        let vpn1 = (vaddr >> 22) & 0x3ff;
        let vpn0 = (vaddr >> 12) & 0x3ff;
        let offset = vaddr & 0xfff;

        let pte_addr = self
            .mmu
            .ppn
            .wrapping_mul(4096)
            .wrapping_add(vpn1 * 4);
        let pte = Pte::decode(bus.read32(pte_addr));
        if !pte.v || (!pte.r && pte.w) {
            return Err(page_fault(access, vaddr));
        }

        let superpage = pte.r || pte.x;
        let pte = if superpage {
            pte
        } else {
            let next = ((pte.ppn1 << 10) | pte.ppn0).wrapping_mul(4096);
            let pte = Pte::decode(bus.read32(next.wrapping_add(vpn0 * 4)));
            if !pte.v || (!pte.r && pte.w) || (!pte.r && !pte.x) {
                return Err(page_fault(access, vaddr));
            }
            pte
        };

        let permitted = match privilege {
            PrivilegeLevel::Machine => true,
            PrivilegeLevel::User => pte.u,
            PrivilegeLevel::Supervisor => !pte.u || mstatus & MSTATUS_SUM != 0,
        };
        if !permitted {
            return Err(page_fault(access, vaddr));
        }

        let allowed = match access {
            Access::Fetch => pte.x,
            Access::Read => pte.r || (pte.x && mstatus & MSTATUS_MXR != 0),
            Access::Write => pte.w,
        };
        if !allowed {
            return Err(page_fault(access, vaddr));
        }

        if superpage && pte.ppn0 != 0 {
            return Err(page_fault(access, vaddr));
        }

        if !pte.a || (access == Access::Write && !pte.d) {
            return Err(page_fault(access, vaddr));
        }

        let middle = if superpage {
            vaddr & 0x003f_f000
        } else {
            pte.ppn0 << 12
        };
        Ok(((pte.ppn1 & 0x3ff) << 22) | middle | offset)
    }
}
