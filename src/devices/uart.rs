//! 16550-compatible UART
//!
//! Each sub-register is its own 8-bit field. Transmission and reception
//! happen on the device tick, paced off the emulator clock: transmit when
//! `clock & 0x16 == 0`, sample host input every 0x38400 ticks. The host
//! feeds keyboard bytes into `queue_input` and drains transmitted bytes
//! with `take_output`.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

// IER bits
pub const IER_RXINT_BIT: u8 = 0x1;
pub const IER_THREINT_BIT: u8 = 0x2;

// IIR codes
pub const IIR_THR_EMPTY: u8 = 0x2;
pub const IIR_RD_AVAILABLE: u8 = 0x4;
pub const IIR_NO_INTERRUPT: u8 = 0x7;

// LSR bits
pub const LSR_DATA_AVAILABLE: u8 = 0x1;
/// THRE | TEMT: the transmitter is fully idle. Linux's wait_for_xmitr
/// polls for both bits.
pub const LSR_THR_EMPTY: u8 = 0x60;

/// UART device state
#[derive(Serialize, Deserialize)]
pub struct Uart {
    rbr: u8,
    thr: u8,
    ier: u8,
    iir: u8,
    lcr: u8,
    mcr: u8,
    lsr: u8,
    scr: u8,
    thre_ip: bool,
    /// Level sampled by the tick loop to assert MIP.SEIP.
    pub interrupting: bool,

    /// Pending host input, drained one byte per receive slot.
    rx_queue: VecDeque<u8>,
    /// Transmitted bytes awaiting the host's stdout flush.
    tx_output: Vec<u8>,
}

impl Uart {
    pub fn new() -> Self {
        Uart {
            rbr: 0,
            thr: 0,
            ier: 0,
            iir: 0,
            lcr: 0,
            mcr: 0,
            lsr: LSR_THR_EMPTY,
            scr: 0,
            thre_ip: false,
            interrupting: false,
            rx_queue: VecDeque::new(),
            tx_output: Vec::new(),
        }
    }

    fn dlab(&self) -> bool {
        self.lcr & 0x80 != 0
    }

    fn update_iir(&mut self) {
        let rx_ip = self.ier & IER_RXINT_BIT != 0 && self.rbr != 0;
        let thre_ip = self.ier & IER_THREINT_BIT != 0 && self.thr == 0;
        self.iir = if rx_ip {
            IIR_RD_AVAILABLE
        } else if thre_ip {
            IIR_THR_EMPTY
        } else {
            IIR_NO_INTERRUPT
        };
    }

    /// Queue a byte of host input (keyboard / pty).
    pub fn queue_input(&mut self, byte: u8) {
        self.rx_queue.push_back(byte);
    }

    /// Drain the transmitted bytes.
    pub fn take_output(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.tx_output)
    }

    /// MMIO read at `offset` from the UART base.
    pub fn read8(&mut self, offset: u32) -> u8 {
        match offset {
            0 => {
                if !self.dlab() {
                    let rbr = self.rbr;
                    self.rbr = 0;
                    self.lsr &= !LSR_DATA_AVAILABLE;
                    self.update_iir();
                    rbr
                } else {
                    0
                }
            }
            1 => {
                if !self.dlab() {
                    self.ier
                } else {
                    0
                }
            }
            2 => self.iir,
            3 => self.lcr,
            4 => self.mcr,
            5 => self.lsr,
            7 => self.scr,
            _ => 0,
        }
    }

    /// MMIO write at `offset` from the UART base.
    pub fn write8(&mut self, offset: u32, value: u8) {
        match offset {
            0 => {
                if !self.dlab() {
                    self.thr = value;
                    self.lsr &= !LSR_THR_EMPTY;
                    self.update_iir();
                }
            }
            1 => {
                if !self.dlab() {
                    // Enabling THREINT with an idle transmitter raises the
                    // interrupt immediately.
                    if self.ier & IER_THREINT_BIT == 0
                        && value & IER_THREINT_BIT != 0
                        && self.thr == 0
                    {
                        self.thre_ip = true;
                    }
                    self.ier = value;
                    self.update_iir();
                }
            }
            3 => self.lcr = value,
            4 => self.mcr = value,
            7 => self.scr = value,
            // FCR writes are accepted and ignored.
            _ => {}
        }
    }

    /// Per-tick device work, paced off the emulator clock.
    pub fn tick(&mut self, clock: u32) {
        let mut rx_ip = false;

        if clock % 0x38400 == 0 && self.rbr == 0 {
            if let Some(value) = self.rx_queue.pop_front() {
                if value != 0 {
                    self.rbr = value;
                    self.lsr |= LSR_DATA_AVAILABLE;
                    self.update_iir();
                    if self.ier & IER_RXINT_BIT != 0 {
                        rx_ip = true;
                    }
                }
            }
        }

        if clock & 0x16 == 0 && self.thr != 0 {
            self.tx_output.push(self.thr);
            self.thr = 0;
            self.lsr |= LSR_THR_EMPTY;
            self.update_iir();
            if self.ier & IER_THREINT_BIT != 0 {
                self.thre_ip = true;
            }
        }

        if self.thre_ip || rx_ip {
            self.interrupting = true;
            self.thre_ip = false;
        } else {
            self.interrupting = false;
        }
    }
}

impl Default for Uart {
    fn default() -> Self {
        Uart::new()
    }
}
