//! Whole-machine snapshots
//!
//! Serializes the hart and bus state with bincode and compresses with
//! zstd. The network transport handle is skipped: a restored machine comes
//! up with no peer attached and must reconnect.

use crate::cpu::Cpu;
use crate::memory::Bus;
use crate::system::System;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Snapshot format version, bumped on layout changes.
const SNAPSHOT_VERSION: u32 = 1;

/// zstd level; 3 keeps large RAM images quick to compress.
const COMPRESSION_LEVEL: i32 = 3;

#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("snapshot encode failed: {0}")]
    Encode(#[from] bincode::Error),
    #[error("snapshot compression failed: {0}")]
    Compression(#[from] std::io::Error),
    #[error("snapshot version {0} is not supported")]
    Version(u32),
}

#[derive(Deserialize)]
struct Snapshot {
    version: u32,
    cpu: Cpu,
    bus: Bus,
}

#[derive(Serialize)]
struct SnapshotRef<'a> {
    version: u32,
    cpu: &'a Cpu,
    bus: &'a Bus,
}

impl System {
    /// Serialize the full machine state to a compressed blob.
    pub fn save_state(&self) -> Result<Vec<u8>, SnapshotError> {
        let snapshot = SnapshotRef {
            version: SNAPSHOT_VERSION,
            cpu: &self.cpu,
            bus: &self.bus,
        };
        let encoded = bincode::serialize(&snapshot)?;
        Ok(zstd::stream::encode_all(&encoded[..], COMPRESSION_LEVEL)?)
    }

    /// Restore machine state from a blob produced by [`save_state`].
    ///
    /// [`save_state`]: System::save_state
    pub fn load_state(&mut self, data: &[u8]) -> Result<(), SnapshotError> {
        let decoded = zstd::stream::decode_all(data)?;
        let snapshot: Snapshot = bincode::deserialize(&decoded)?;
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(SnapshotError::Version(snapshot.version));
        }
        self.cpu = snapshot.cpu;
        self.bus = snapshot.bus;
        Ok(())
    }
}
