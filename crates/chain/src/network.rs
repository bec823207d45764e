//! Network epoch parameters and slot/time conversion.
//!
//! A ledger's clock is an affine map between slot numbers and POSIX
//! milliseconds, fixed by three parameters: the time of the epoch origin,
//! the slot number at that origin, and the slot length. Conversions before
//! the origin are errors.

use std::time::{SystemTime, UNIX_EPOCH};

use chrono::DateTime;
use serde::{Deserialize, Serialize};
use tracing::debug;

use feedline_core::{PosixTime, SlotNo};

use crate::ChainError;

/// Slot length bounds, milliseconds.
pub const MIN_SLOT_LENGTH_MS: u64 = 200;
pub const MAX_SLOT_LENGTH_MS: u64 = 10_000;

/// Well-known networks plus a locally parameterized one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NetworkKind {
    Mainnet,
    Preview,
    Preprod,
    Custom,
    Devnet,
}

/// The affine slot/time mapping for one network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkEpoch {
    /// POSIX milliseconds at the epoch origin.
    pub zero_time: PosixTime,
    /// Slot number at the epoch origin.
    pub zero_slot: SlotNo,
    /// Milliseconds per slot.
    pub slot_length: u64,
}

impl NetworkEpoch {
    pub fn new(zero_time: PosixTime, zero_slot: SlotNo, slot_length: u64) -> Result<Self, ChainError> {
        if !(MIN_SLOT_LENGTH_MS..=MAX_SLOT_LENGTH_MS).contains(&slot_length) {
            return Err(ChainError::Config(format!(
                "slot_length must be between {MIN_SLOT_LENGTH_MS} and {MAX_SLOT_LENGTH_MS} ms, got {slot_length}"
            )));
        }
        Ok(NetworkEpoch { zero_time, zero_slot, slot_length })
    }

    /// Epoch parameters for a well-known network.
    ///
    /// `Devnet` has no static parameters; use [`fetch_devnet_epoch`].
    pub fn for_network(kind: NetworkKind) -> Result<Self, ChainError> {
        match kind {
            NetworkKind::Mainnet => NetworkEpoch::new(1_596_059_091_000, 4_492_800, 1_000),
            NetworkKind::Preview => NetworkEpoch::new(1_666_656_000_000, 0, 1_000),
            NetworkKind::Preprod => NetworkEpoch::new(1_655_769_600_000, 86_400, 1_000),
            NetworkKind::Custom => NetworkEpoch::new(0, 0, 1_000),
            NetworkKind::Devnet => Err(ChainError::Config(
                "devnet epoch must be fetched from the local cluster".into(),
            )),
        }
    }

    /// Converts a slot number to POSIX milliseconds.
    pub fn slot_to_posix(&self, slot: SlotNo) -> Result<PosixTime, ChainError> {
        if slot < self.zero_slot {
            return Err(ChainError::Time(format!(
                "slot {slot} is before network start at slot {}",
                self.zero_slot
            )));
        }
        Ok(self.zero_time + (slot - self.zero_slot) * self.slot_length)
    }

    /// Converts POSIX milliseconds to the slot containing them.
    pub fn posix_to_slot(&self, posix_ms: PosixTime) -> Result<SlotNo, ChainError> {
        if posix_ms < self.zero_time {
            return Err(ChainError::Time(format!(
                "timestamp {posix_ms} is before network start at {}",
                self.zero_time
            )));
        }
        Ok(self.zero_slot + (posix_ms - self.zero_time) / self.slot_length)
    }
}

#[derive(Deserialize)]
struct ShelleyGenesis {
    #[serde(rename = "systemStart")]
    system_start: String,
}

/// Fetches the devnet epoch from a local cluster's genesis endpoint.
///
/// The endpoint serves the Shelley genesis; only `systemStart` matters, the
/// devnet slot parameters are fixed.
pub async fn fetch_devnet_epoch(base_url: &str) -> Result<NetworkEpoch, ChainError> {
    let url = format!("{base_url}/local-cluster/api/admin/devnet/genesis/shelley");
    debug!(%url, "fetching devnet genesis");
    let genesis: ShelleyGenesis = reqwest::Client::new()
        .get(&url)
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;

    let start = DateTime::parse_from_rfc3339(&genesis.system_start)
        .map_err(|e| ChainError::Config(format!("invalid devnet systemStart: {e}")))?;
    let zero_time = start.timestamp_millis();
    if zero_time < 0 {
        return Err(ChainError::Config("devnet systemStart precedes the POSIX epoch".into()));
    }
    NetworkEpoch::new(zero_time as u64, 1_000, 1_000)
}

/// Current-time source: wall clock or slot-aligned network time.
#[derive(Debug, Clone, Copy)]
pub struct NetworkTime {
    pub epoch: NetworkEpoch,
    pub use_wall_clock: bool,
}

impl NetworkTime {
    pub fn new(epoch: NetworkEpoch, use_wall_clock: bool) -> Self {
        NetworkTime { epoch, use_wall_clock }
    }

    /// Current POSIX milliseconds. With `use_wall_clock` off the result is
    /// aligned down to the containing slot boundary.
    pub fn now_ms(&self) -> PosixTime {
        let wall = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        if self.use_wall_clock {
            return wall;
        }
        if wall <= self.epoch.zero_time {
            return self.epoch.zero_time;
        }
        let since_zero = wall - self.epoch.zero_time;
        self.epoch.zero_time + (since_zero / self.epoch.slot_length) * self.epoch.slot_length
    }

    pub fn current_slot(&self) -> Result<SlotNo, ChainError> {
        self.epoch.posix_to_slot(self.now_ms())
    }
}
