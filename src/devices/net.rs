//! Network DMA device
//!
//! Two 4 KiB DMA buffers mapped into the physical address space, driven by
//! the custom CSRs: the guest fills the TX buffer with ordinary stores and
//! writes the byte count to the send CSR; received frames land in the RX
//! buffer. Frames travel over a Unix stream socket with a 4-byte
//! little-endian length prefix. Without a connected transport every
//! operation is a no-op so the emulator runs standalone.

use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::io::{ErrorKind, Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::Path;

/// DMA buffer size (one page each for TX and RX).
pub const NET_BUF_SIZE: usize = 4096;

/// Incremental receive state: the length prefix and payload both arrive in
/// arbitrarily small non-blocking chunks.
#[derive(Default)]
struct RecvState {
    len_buf: [u8; 4],
    len_got: usize,
    payload: Vec<u8>,
    payload_got: usize,
}

/// Framed non-blocking transport over a Unix stream socket.
pub struct NetTransport {
    stream: UnixStream,
    recv: RecvState,
}

impl NetTransport {
    /// Connect to a listening peer.
    pub fn connect<P: AsRef<Path>>(path: P) -> std::io::Result<Self> {
        let stream = UnixStream::connect(path)?;
        stream.set_nonblocking(true)?;
        info!("net: connected");
        Ok(NetTransport {
            stream,
            recv: RecvState::default(),
        })
    }

    /// Bind, wait for one peer, then switch to non-blocking operation.
    pub fn listen<P: AsRef<Path>>(path: P) -> std::io::Result<Self> {
        let path = path.as_ref();
        let _ = std::fs::remove_file(path);
        let listener = UnixListener::bind(path)?;
        info!("net: waiting for client on {}", path.display());
        let (stream, _) = listener.accept()?;
        stream.set_nonblocking(true)?;
        info!("net: client connected");
        Ok(NetTransport {
            stream,
            recv: RecvState::default(),
        })
    }

    fn send_frame(&mut self, data: &[u8]) -> std::io::Result<()> {
        self.stream.write_all(&(data.len() as u32).to_le_bytes())?;
        self.stream.write_all(data)
    }

    /// Pull at most one complete frame off the socket.
    fn try_recv(&mut self) -> std::io::Result<Option<Vec<u8>>> {
        while self.recv.len_got < 4 {
            let mut byte = [0u8; 1];
            match self.stream.read(&mut byte) {
                Ok(0) => return Ok(None),
                Ok(_) => {
                    self.recv.len_buf[self.recv.len_got] = byte[0];
                    self.recv.len_got += 1;
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(None),
                Err(e) => return Err(e),
            }
        }

        if self.recv.payload.is_empty() && self.recv.payload_got == 0 {
            let len = u32::from_le_bytes(self.recv.len_buf) as usize;
            self.recv.payload = vec![0u8; len];
        }

        while self.recv.payload_got < self.recv.payload.len() {
            let got = self.recv.payload_got;
            match self.stream.read(&mut self.recv.payload[got..]) {
                Ok(0) => return Ok(None),
                Ok(n) => self.recv.payload_got += n,
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(None),
                Err(e) => return Err(e),
            }
        }

        let frame = std::mem::take(&mut self.recv.payload);
        self.recv = RecvState::default();
        Ok(Some(frame))
    }
}

/// Network device: DMA buffers plus the optional transport.
#[derive(Serialize, Deserialize)]
pub struct NetDma {
    tx: Vec<u8>,
    rx: Vec<u8>,
    /// Guest-written readiness word (custom CSR 0x0c3).
    pub rx_ready: u32,
    rx_pending: bool,
    #[serde(skip)]
    transport: Option<NetTransport>,
}

impl NetDma {
    pub fn new() -> Self {
        NetDma {
            tx: vec![0u8; NET_BUF_SIZE],
            rx: vec![0u8; NET_BUF_SIZE],
            rx_ready: 0,
            rx_pending: false,
            transport: None,
        }
    }

    pub fn attach(&mut self, transport: NetTransport) {
        self.transport = Some(transport);
    }

    pub fn read_tx(&self, offset: u32) -> u8 {
        self.tx[(offset as usize) & (NET_BUF_SIZE - 1)]
    }

    pub fn write_tx(&mut self, offset: u32, value: u8) {
        self.tx[(offset as usize) & (NET_BUF_SIZE - 1)] = value;
    }

    pub fn read_rx(&self, offset: u32) -> u8 {
        self.rx[(offset as usize) & (NET_BUF_SIZE - 1)]
    }

    pub fn write_rx(&mut self, offset: u32, value: u8) {
        self.rx[(offset as usize) & (NET_BUF_SIZE - 1)] = value;
    }

    /// Transmit `len` bytes from the TX buffer (the send-CSR write).
    pub fn send(&mut self, len: u32) {
        let len = (len as usize).min(NET_BUF_SIZE);
        match &mut self.transport {
            Some(transport) => {
                let tx = &self.tx[..len];
                if let Err(e) = transport.send_frame(tx) {
                    warn!("net: send failed: {}", e);
                }
            }
            None => warn!("net: send of {} bytes with no transport attached", len),
        }
    }

    /// Poll the transport; a completed frame is copied into the RX buffer
    /// and flagged for interrupt delivery.
    pub fn poll(&mut self) {
        let Some(transport) = &mut self.transport else {
            return;
        };
        match transport.try_recv() {
            Ok(Some(frame)) => {
                let len = frame.len().min(NET_BUF_SIZE);
                self.rx[..len].copy_from_slice(&frame[..len]);
                self.rx_pending = true;
            }
            Ok(None) => {}
            Err(e) => {
                warn!("net: receive failed: {}", e);
                self.transport = None;
            }
        }
    }

    /// Consume the frame-delivered edge.
    pub fn take_rx_pending(&mut self) -> bool {
        std::mem::replace(&mut self.rx_pending, false)
    }
}

impl Default for NetDma {
    fn default() -> Self {
        NetDma::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffers_wrap_at_four_kilobytes() {
        let mut net = NetDma::new();
        net.write_tx(0, 0xaa);
        net.write_tx(4096, 0xbb); // aliases offset 0
        assert_eq!(net.read_tx(0), 0xbb);
        net.write_rx(4095, 0xcc);
        assert_eq!(net.read_rx(4095), 0xcc);
    }

    #[test]
    fn send_without_transport_is_a_noop() {
        let mut net = NetDma::new();
        net.send(128);
        net.poll();
        assert!(!net.take_rx_pending());
    }

    #[test]
    fn frames_cross_a_socketpair() {
        let (a, b) = UnixStream::pair().unwrap();
        a.set_nonblocking(true).unwrap();
        b.set_nonblocking(true).unwrap();

        let mut net = NetDma::new();
        net.attach(NetTransport {
            stream: a,
            recv: RecvState::default(),
        });
        let mut peer = NetTransport {
            stream: b,
            recv: RecvState::default(),
        };

        // Guest -> peer.
        for (i, byte) in b"hello".iter().enumerate() {
            net.write_tx(i as u32, *byte);
        }
        net.send(5);
        let frame = loop {
            if let Some(f) = peer.try_recv().unwrap() {
                break f;
            }
        };
        assert_eq!(frame, b"hello");

        // Peer -> guest RX buffer.
        peer.send_frame(b"world").unwrap();
        while !net.take_rx_pending() {
            net.poll();
        }
        assert_eq!(
            (0..5).map(|i| net.read_rx(i)).collect::<Vec<u8>>(),
            b"world".to_vec()
        );
    }
}
