//! Boundary to the radio.
//!
//! The manager drives a [`Transport`] and is fed [`TransportEvent`]s by
//! whoever owns the radio callbacks. Timeouts are the transport's business;
//! a timed-out read comes back as an ordinary error.

use crate::error::{Result, SatelliteError, Status};
use crate::indexes::CollectionIndexes;
use crate::satellite::{Advertisement, SatelliteId, SatelliteState};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AdapterState {
    #[default]
    Unknown,
    Resetting,
    Unsupported,
    Unauthorized,
    PoweredOff,
    PoweredOn,
}

impl AdapterState {
    pub fn is_powered_on(self) -> bool {
        self == AdapterState::PoweredOn
    }
}

impl core::fmt::Display for AdapterState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let name = match self {
            AdapterState::Unknown => "Unknown",
            AdapterState::Resetting => "Resetting",
            AdapterState::Unsupported => "Unsupported",
            AdapterState::Unauthorized => "Unauthorized",
            AdapterState::PoweredOff => "PoweredOff",
            AdapterState::PoweredOn => "PoweredOn",
        };
        f.write_str(name)
    }
}

/// Hardware protocol version the caller speaks. Passed through to the
/// transport untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardwareVersion {
    pub major: u8,
    pub minor: u8,
}

impl HardwareVersion {
    pub const fn new(major: u8, minor: u8) -> Self {
        Self { major, minor }
    }
}

impl Default for HardwareVersion {
    fn default() -> Self {
        Self::new(10, 0)
    }
}

impl core::fmt::Display for HardwareVersion {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Payload pushed to a satellite by the update policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SatelliteUpdate {
    Firmware {
        version: (u8, u8),
        #[serde(with = "serde_bytes")]
        image: Vec<u8>,
    },
    SensorConfig {
        #[serde(with = "serde_bytes")]
        config: Vec<u8>,
    },
}

impl SatelliteUpdate {
    pub fn kind(&self) -> &'static str {
        match self {
            SatelliteUpdate::Firmware { .. } => "firmware",
            SatelliteUpdate::SensorConfig { .. } => "sensor-config",
        }
    }
}

/// Everything the radio reports to the manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    AdapterStateChanged(AdapterState),
    Advertisement(Advertisement),
    Connected(SatelliteId),
    ConnectionFailed {
        id: SatelliteId,
        error: SatelliteError,
    },
    Disconnected {
        id: SatelliteId,
        error: Option<SatelliteError>,
    },
    /// A fresh state report; replaces the previous state wholesale.
    StateUpdated {
        id: SatelliteId,
        state: SatelliteState,
        collections: CollectionIndexes,
    },
    /// The radio stopped scanning on its own.
    ScanFailed(SatelliteError),
}

impl TransportEvent {
    /// Satellite this event concerns, if any.
    pub fn satellite_id(&self) -> Option<&SatelliteId> {
        match self {
            TransportEvent::Advertisement(advertisement) => Some(&advertisement.id),
            TransportEvent::Connected(id)
            | TransportEvent::ConnectionFailed { id, .. }
            | TransportEvent::Disconnected { id, .. }
            | TransportEvent::StateUpdated { id, .. } => Some(id),
            TransportEvent::AdapterStateChanged(_) | TransportEvent::ScanFailed(_) => None,
        }
    }
}

/// Radio operations the manager needs. Implementations must bound every
/// call in time.
pub trait Transport: Send + Sync {
    fn adapter_state(&self) -> AdapterState;
    fn start_scan(&self) -> Status;
    fn stop_scan(&self) -> Status;
    /// Starts connecting; completion arrives as [`TransportEvent::Connected`].
    fn connect(&self, id: &SatelliteId, version: HardwareVersion) -> Status;
    fn disconnect(&self, id: &SatelliteId) -> Status;
    fn read_collection(&self, id: &SatelliteId, index: u16) -> Result<Vec<u8>>;
    fn write_update(&self, id: &SatelliteId, update: &SatelliteUpdate) -> Status;
}
