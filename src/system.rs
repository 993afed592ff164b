//! System orchestrator
//!
//! Owns the hart and the bus and advances them in lockstep. Each tick is:
//! clock, fetch (through the MMU), decode/execute, CSR commit, register
//! commit, CLINT, UART, IRQ/trap resolution, pc commit. Device state the
//! guest can observe always reflects exactly this ordering.

use crate::cpu::csr::{CSR_MIP, MIP_MSIP, MIP_MTIP, MIP_SEIP, MIP_STIP};
use crate::cpu::mmu::Access;
use crate::cpu::trap::{handle_irq_and_trap, Trap};
use crate::cpu::Cpu;
use crate::memory::{Bus, SYSCON_POWEROFF};
use log::trace;

/// The whole machine: one hart plus the memory/MMIO fabric.
pub struct System {
    pub cpu: Cpu,
    pub bus: Bus,
    /// Emit a per-instruction trace line (single-step debugging).
    pub trace: bool,
}

impl System {
    /// Build a machine with `ram_size_mb` MiB of RAM.
    pub fn new(ram_size_mb: u32) -> Self {
        System {
            cpu: Cpu::new(),
            bus: Bus::new((ram_size_mb as usize) * 1024 * 1024),
            trace: false,
        }
    }

    /// Advance the machine by one instruction (or faulted fetch) and one
    /// tick of device time. Returns the exit status once the guest asks to
    /// stop (gated ECALL exit or SYSCON poweroff).
    pub fn tick(&mut self) -> Option<u32> {
        let cpu = &mut self.cpu;
        cpu.clock = cpu.clock.wrapping_add(1);

        let mut ret = if cpu.pc & 0x3 == 0 {
            match cpu.translate(&mut self.bus, cpu.pc, Access::Fetch) {
                Ok(paddr) => {
                    let word = self.bus.read32(paddr);
                    if self.trace {
                        trace!("pc={:08x} ins={:08x}", cpu.pc, word);
                    }
                    let mut ret = cpu.execute(&mut self.bus, word);
                    if ret.trap.is_none() && ret.csr_write != 0 {
                        if let Err(trap) = cpu.set_csr(&mut self.bus, ret.csr_write, ret.csr_val) {
                            ret.trap = Some(trap);
                        }
                    }
                    if ret.trap.is_none() && ret.write_reg != 0 && ret.write_reg < 32 {
                        cpu.xreg[ret.write_reg as usize] = ret.write_val;
                    }
                    ret
                }
                Err(trap) => {
                    let mut ret = cpu.noop_result();
                    ret.trap = Some(trap);
                    ret
                }
            }
        } else {
            let mut ret = cpu.noop_result();
            ret.trap = Some(Trap::InstructionAddressMisaligned(cpu.pc));
            ret
        };

        // Device phase. msip mirrors into MIP, mtime advances, a fresh
        // mtimecmp write drops the timer pending bits before the compare
        // re-asserts them.
        if self.bus.clint.msip {
            let mip = cpu.csr.raw(CSR_MIP);
            cpu.csr.set_raw(CSR_MIP, mip | MIP_MSIP);
        }
        self.bus.clint.tick();
        if self.bus.clint.take_mtimecmp_write() {
            let mip = cpu.csr.raw(CSR_MIP);
            cpu.csr.set_raw(CSR_MIP, mip & !(MIP_MTIP | MIP_STIP));
        }
        if self.bus.clint.timer_pending() {
            let mip = cpu.csr.raw(CSR_MIP);
            cpu.csr.set_raw(CSR_MIP, mip | MIP_MTIP);
        }

        self.bus.uart.tick(cpu.clock);
        if self.bus.uart.interrupting {
            let mip = cpu.csr.raw(CSR_MIP);
            cpu.csr.set_raw(CSR_MIP, mip | MIP_SEIP);
        }
        if self.bus.net.take_rx_pending() {
            let mip = cpu.csr.raw(CSR_MIP);
            cpu.csr.set_raw(CSR_MIP, mip | MIP_SEIP);
        }

        handle_irq_and_trap(cpu, &self.bus, &mut ret);

        cpu.pc = ret.pc_next;

        if let Some(status) = cpu.exit_request.take() {
            return Some(status);
        }
        if self.bus.syscon_cmd == SYSCON_POWEROFF {
            return Some(0);
        }
        None
    }

    /// Run up to `max_ticks` ticks; stops early on a guest exit request.
    /// Returns the ticks executed and the exit status if one was raised.
    pub fn run(&mut self, max_ticks: u32) -> (u32, Option<u32>) {
        for n in 0..max_ticks {
            if let Some(status) = self.tick() {
                return (n + 1, Some(status));
            }
        }
        (max_ticks, None)
    }

    /// Queue one byte of host terminal input for the UART.
    pub fn uart_input(&mut self, byte: u8) {
        self.bus.uart.queue_input(byte);
    }

    /// Drain the UART's transmitted bytes for the host terminal.
    pub fn uart_output(&mut self) -> Vec<u8> {
        self.bus.uart.take_output()
    }

    /// Poll the network transport for a received frame.
    pub fn poll_net(&mut self) {
        self.bus.net.poll();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::csr::*;

    fn small_system() -> System {
        let mut system = System::new(1);
        system.cpu.pc = 0x8000_0000;
        system
    }

    #[test]
    fn clock_advances_once_per_tick() {
        let mut system = small_system();
        // jal x0, 0 : spin in place without trapping.
        system.bus.write32(0x8000_0000, 0x0000_006f);
        for expected in 1..=5 {
            system.tick();
            assert_eq!(system.cpu.clock, expected);
            assert_eq!(system.cpu.xreg[0], 0);
        }
    }

    #[test]
    fn straightline_code_advances_pc_by_four() {
        let mut system = small_system();
        // addi x1, x0, 1 ; addi x2, x0, 2
        system.bus.write32(0x8000_0000, 0x0010_0093);
        system.bus.write32(0x8000_0004, 0x0020_0113);
        system.tick();
        assert_eq!(system.cpu.pc, 0x8000_0004);
        assert_eq!(system.cpu.xreg[1], 1);
        system.tick();
        assert_eq!(system.cpu.pc, 0x8000_0008);
        assert_eq!(system.cpu.xreg[2], 2);
    }

    #[test]
    fn misaligned_fetch_traps_with_pc_as_tval() {
        let mut system = small_system();
        system.cpu.pc = 0x8000_0002;
        system.cpu.write_csr_raw(CSR_MTVEC, 0x8000_0100);
        system.tick();
        assert_eq!(system.cpu.pc, 0x8000_0100);
        assert_eq!(system.cpu.csr.raw(CSR_MCAUSE), 0);
        assert_eq!(system.cpu.csr.raw(CSR_MTVAL), 0x8000_0002);
        assert_eq!(system.cpu.csr.raw(CSR_MEPC), 0x8000_0002);
    }

    #[test]
    fn illegal_instruction_reports_the_raw_word() {
        let mut system = small_system();
        system.bus.write32(0x8000_0000, 0xffff_ffff);
        system.cpu.write_csr_raw(CSR_MTVEC, 0x8000_0100);
        system.tick();
        assert_eq!(system.cpu.pc, 0x8000_0100);
        assert_eq!(system.cpu.csr.raw(CSR_MCAUSE), 2);
        assert_eq!(system.cpu.csr.raw(CSR_MTVAL), 0xffff_ffff);
    }

    #[test]
    fn guest_exit_stops_the_run() {
        let mut system = small_system();
        system.cpu.allow_guest_exit = true;
        system.cpu.xreg[17] = 93;
        system.cpu.xreg[10] = 7 << 1;
        system.bus.write32(0x8000_0000, 0x0000_0073); // ecall
        let (ticks, status) = system.run(100);
        assert_eq!(ticks, 1);
        assert_eq!(status, Some(7));
    }

    #[test]
    fn syscon_poweroff_stops_the_run() {
        let mut system = small_system();
        // lui x1, 0x11100 ; lui x2, 0x5 ; addi x2, x2, 0x555 ; sw x2, 0(x1) ; j .
        system.bus.write32(0x8000_0000, 0x1110_00b7);
        system.bus.write32(0x8000_0004, 0x0000_5137);
        system.bus.write32(0x8000_0008, 0x5551_0113);
        system.bus.write32(0x8000_000c, 0x0020_a023);
        system.bus.write32(0x8000_0010, 0x0000_006f);
        let (_, status) = system.run(100);
        assert_eq!(status, Some(0));
    }
}
