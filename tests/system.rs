//! Whole-machine tests driving a `System` tick by tick.

use kestrel::cpu::csr::*;
use kestrel::cpu::PrivilegeLevel;
use kestrel::System;

fn system() -> System {
    System::new(1)
}

#[test]
fn auipc_addi_sequence() {
    let mut sys = system();
    // auipc x1, 0x0 ; addi x1, x1, 8
    sys.bus.write32(0x8000_0000, 0x0000_0097);
    sys.bus.write32(0x8000_0004, 0x0080_8093);

    sys.tick();
    sys.tick();

    assert_eq!(sys.cpu.xreg[1], 0x8000_0008);
    assert_eq!(sys.cpu.pc, 0x8000_0008);
}

#[test]
fn beq_taken_skips_ahead() {
    let mut sys = system();
    sys.cpu.pc = 0x8000_0100;
    sys.cpu.xreg[2] = 5;
    sys.cpu.xreg[3] = 5;
    // beq x2, x3, +8
    sys.bus.write32(0x8000_0100, 0x0031_0463);

    sys.tick();

    assert_eq!(sys.cpu.pc, 0x8000_0108);
}

#[test]
fn lr_sc_success_then_failure() {
    let mut sys = system();
    sys.cpu.xreg[1] = 0x8000_1000;
    sys.cpu.xreg[4] = 0xbeef;
    sys.bus.write32(0x8000_1000, 0xdead);

    // lr.w x2, (x1) ; sc.w x3, x4, (x1) ; sc.w x3, x4, (x1)
    sys.bus.write32(0x8000_0000, 0x1000_a12f);
    sys.bus.write32(0x8000_0004, 0x1840_a1af);
    sys.bus.write32(0x8000_0008, 0x1840_a1af);

    sys.tick();
    assert_eq!(sys.cpu.xreg[2], 0xdead);

    sys.tick();
    assert_eq!(sys.cpu.xreg[3], 0);
    assert_eq!(sys.bus.read32(0x8000_1000), 0xbeef);

    // The reservation is gone: the second sc.w fails and stores nothing.
    sys.cpu.xreg[4] = 0x1111;
    sys.tick();
    assert_eq!(sys.cpu.xreg[3], 1);
    assert_eq!(sys.bus.read32(0x8000_1000), 0xbeef);
}

#[test]
fn timer_interrupt_fires_and_mtimecmp_write_clears_mtip() {
    let mut sys = system();
    // Idle loops at both the run address and the trap vector.
    sys.bus.write32(0x8000_0000, 0x0000_006f);
    sys.bus.write32(0x8000_0400, 0x0000_006f);

    sys.bus.write32(0x0200_4000, 10); // mtimecmp = 10
    sys.cpu.write_csr_raw(CSR_MSTATUS, MSTATUS_MIE);
    sys.cpu.write_csr_raw(CSR_MIE, MIP_MTIP);
    sys.cpu.write_csr_raw(CSR_MTVEC, 0x8000_0400);

    let mut took_interrupt = false;
    for _ in 0..50 {
        sys.tick();
        if sys.cpu.pc == 0x8000_0400 {
            took_interrupt = true;
            break;
        }
    }
    assert!(took_interrupt);
    assert!(sys.cpu.clock >= 10);
    assert_eq!(sys.cpu.csr.raw(CSR_MCAUSE), 0x8000_0007);
    // The interrupted loop would have executed 0x80000000 next.
    assert_eq!(sys.cpu.csr.raw(CSR_MEPC), 0x8000_0000);
    assert_ne!(sys.cpu.csr.raw(CSR_MIP) & MIP_MTIP, 0);

    // Pushing mtimecmp out clears the pending timer bit.
    sys.bus.write32(0x0200_4000, 0xffff_ffff);
    sys.bus.write32(0x0200_4004, 0xffff_ffff);
    sys.tick();
    assert_eq!(sys.cpu.csr.raw(CSR_MIP) & MIP_MTIP, 0);
}

#[test]
fn fetch_page_fault_delegated_to_supervisor() {
    let mut sys = system();
    // Root page table full of zeroes: every walk hits V=0.
    let root: u32 = 0x8001_0000;
    sys.cpu.mmu_update((1 << 31) | (root >> 12));
    sys.cpu.csr.privilege = PrivilegeLevel::Supervisor;
    sys.cpu.write_csr_raw(CSR_MEDELEG, 1 << 12);
    sys.cpu.write_csr_raw(CSR_STVEC, 0x8000_2000);
    sys.cpu.pc = 0x1000;

    sys.tick();

    assert_eq!(sys.cpu.csr.raw(CSR_SCAUSE), 12);
    assert_eq!(sys.cpu.csr.raw(CSR_STVAL), 0x1000);
    assert_eq!(sys.cpu.csr.raw(CSR_SEPC), 0x1000);
    assert_eq!(sys.cpu.pc, 0x8000_2000);
    assert_eq!(sys.cpu.csr.privilege, PrivilegeLevel::Supervisor);
}

#[test]
fn uart_echo_reaches_the_host() {
    let mut sys = system();
    sys.bus.write32(0x8000_0000, 0x0000_006f);

    // Enable the THRE interrupt, then transmit 'A'.
    sys.bus.write8(0x1000_0001, 0x2);
    sys.bus.write8(0x1000_0000, 0x41);

    let mut output = Vec::new();
    for _ in 0..64 {
        sys.tick();
        output.extend(sys.uart_output());
        if !output.is_empty() {
            break;
        }
    }

    assert_eq!(output, b"A");
    assert_ne!(sys.bus.read8(0x1000_0005) & 0x60, 0); // LSR: THRE|TEMT
    assert_eq!(sys.bus.read8(0x1000_0002), 0x2); // IIR: THR empty
    // The UART raises the external interrupt line into MIP.SEIP.
    assert_ne!(sys.cpu.csr.raw(CSR_MIP) & MIP_SEIP, 0);
}

#[test]
fn uart_receive_path_delivers_keyboard_bytes() {
    let mut sys = system();
    // lbu x5, 0(x6) with x6 = UART base reads RBR.
    sys.cpu.xreg[6] = 0x1000_0000;
    sys.bus.write32(0x8000_0000, 0x0003_4283);
    sys.uart_input(b'k');

    // The first receive slot is clock % 0x38400 == 0; tick 0 already
    // passed, so prime rbr by ticking the device directly at a slot.
    sys.bus.uart.tick(0);
    sys.tick();

    assert_eq!(sys.cpu.xreg[5], b'k' as u32);
}

#[test]
fn initial_register_file_matches_boot_protocol() {
    let sys = system();
    assert_eq!(sys.cpu.pc, 0x8000_0000);
    assert_eq!(sys.cpu.xreg[11], 0x1020);
    assert_eq!(sys.cpu.csr.raw(CSR_MISA), 0x4014_1101);
    assert!(sys.cpu.xreg.iter().enumerate().all(|(i, &v)| i == 11 || v == 0));
}

#[test]
fn x0_stays_zero_across_writes() {
    let mut sys = system();
    // addi x0, x0, 123 ; beq x0, x0, 0 (would loop) -- just check x0.
    sys.bus.write32(0x8000_0000, 0x07b0_0013);
    sys.tick();
    assert_eq!(sys.cpu.xreg[0], 0);
    assert_eq!(sys.cpu.pc, 0x8000_0004);
}

#[test]
fn csr_round_trip_through_guest_instructions() {
    let mut sys = system();
    // csrrw x0, mscratch, x1 ; csrrs x2, mscratch, x0
    sys.cpu.xreg[1] = 0x5a5a_5a5a;
    sys.bus.write32(0x8000_0000, 0x3400_9073);
    sys.bus.write32(0x8000_0004, 0x3400_2173);
    sys.tick();
    sys.tick();
    assert_eq!(sys.cpu.xreg[2], 0x5a5a_5a5a);
}

#[test]
fn sv32_mapped_user_page_supports_read_write() {
    let mut sys = system();
    let root: u32 = 0x8001_0000;
    let second: u32 = 0x8001_1000;
    let frame: u32 = 0x8002_0000;

    // Map virtual page 0 to `frame` with full user permissions, A and D
    // preset.
    sys.bus.write32(root, ((second >> 12) << 10) | 1);
    sys.bus.write32(second, ((frame >> 12) << 10) | 0xdf);

    sys.cpu.mmu_update((1 << 31) | (root >> 12));
    sys.cpu.csr.privilege = PrivilegeLevel::User;

    let pa = sys
        .cpu
        .translate(&mut sys.bus, 0x104, kestrel::cpu::Access::Write)
        .unwrap();
    assert_eq!(pa, frame | 0x104);
    sys.bus.write32(pa, 0x0bad_f00d);
    let pa = sys
        .cpu
        .translate(&mut sys.bus, 0x104, kestrel::cpu::Access::Read)
        .unwrap();
    assert_eq!(sys.bus.read32(pa), 0x0bad_f00d);
}

#[test]
fn snapshot_round_trip_resumes_execution() {
    let mut sys = system();
    // addi x1, x0, 1 ; addi x1, x1, 1 ; j .
    sys.bus.write32(0x8000_0000, 0x0010_0093);
    sys.bus.write32(0x8000_0004, 0x0010_8093);
    sys.bus.write32(0x8000_0008, 0x0000_006f);

    sys.tick();
    let blob = sys.save_state().unwrap();

    // Divergence after the snapshot point...
    sys.tick();
    assert_eq!(sys.cpu.xreg[1], 2);

    // ...is unwound by restoring.
    let mut restored = System::new(1);
    restored.load_state(&blob).unwrap();
    assert_eq!(restored.cpu.xreg[1], 1);
    assert_eq!(restored.cpu.pc, 0x8000_0004);
    restored.tick();
    assert_eq!(restored.cpu.xreg[1], 2);
    assert_eq!(restored.cpu.pc, 0x8000_0008);
}
