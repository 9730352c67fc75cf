use crate::error::SatelliteError;
use crate::indexes::CollectionIndexes;
use crate::transfer::{PendingCollections, TransferSession, TransferState};
use heapless::Vec as BoundedVec;
use serde::{Deserialize, Serialize};

pub const MAX_FAILURE_HISTORY: usize = 16;

/// Stable identifier of a physical satellite, derived from its transport
/// address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SatelliteId(String);

impl SatelliteId {
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for SatelliteId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ManufacturerData {
    /// Coarse hash of the persistent state, used for user matching before
    /// a connection exists.
    pub persistent_state_fingerprint: u32,
    pub truncated_collection_count: u8,
}

/// Broadcast payload seen while scanning. Only lives as long as the
/// admission decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Advertisement {
    pub id: SatelliteId,
    pub name: Option<String>,
    pub rssi: i16,
    pub manufacturer_data: ManufacturerData,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PlatformVersions {
    pub firmware_version_major: u8,
    pub firmware_version_minor: u8,
    pub hardware_version_major: u8,
    pub hardware_version_minor: u8,
}

/// State that survives reconnects. Always replaced as a whole.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PersistentState {
    pub serial_number: String,
    pub platform_versions: PlatformVersions,
    #[serde(with = "serde_bytes")]
    pub application_data: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TransientState {
    pub is_moving: bool,
    pub in_collection_state: bool,
    pub is_dark: bool,
    pub needs_servicing: bool,
    pub has_debug_info: bool,
    /// Collection count modulo 256, not a running total.
    pub truncated_collection_count: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum OperatingMode {
    #[default]
    Normal,
    /// Degraded mode; must be serviced regardless of permissions.
    FailSafe,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SatelliteState {
    pub persistent: PersistentState,
    pub transient: TransientState,
    pub mode: OperatingMode,
}

impl SatelliteState {
    pub fn is_in_fail_safe_mode(&self) -> bool {
        self.mode == OperatingMode::FailSafe
    }

    pub fn truncated_collection_count(&self) -> u8 {
        self.transient.truncated_collection_count
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

/// One per-index failure reported to the transfer policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferFailure {
    pub index: u16,
    pub error: SatelliteError,
    pub attempts: u8,
}

/// Everything the manager knows about one discovered device.
#[derive(Debug, Clone)]
pub struct Satellite {
    id: SatelliteId,
    name: Option<String>,
    rssi: i16,
    manufacturer_data: ManufacturerData,
    state: Option<SatelliteState>,
    collections: Option<CollectionIndexes>,
    connection: ConnectionState,
    pub(crate) transfer_state: TransferState,
    pub(crate) session: Option<TransferSession>,
    pub(crate) backlog: PendingCollections,
    pub(crate) frontier: Option<u16>,
    pub(crate) suppressed: bool,
    pub(crate) updates_offered: bool,
    pub(crate) generation: u64,
    failures: BoundedVec<TransferFailure, MAX_FAILURE_HISTORY>,
}

impl Satellite {
    pub fn new(advertisement: &Advertisement) -> Self {
        Self {
            id: advertisement.id.clone(),
            name: advertisement.name.clone(),
            rssi: advertisement.rssi,
            manufacturer_data: advertisement.manufacturer_data,
            state: None,
            collections: None,
            connection: ConnectionState::Disconnected,
            transfer_state: TransferState::Idle,
            session: None,
            backlog: PendingCollections::new(),
            frontier: None,
            suppressed: false,
            updates_offered: false,
            generation: 0,
            failures: BoundedVec::new(),
        }
    }

    pub fn id(&self) -> &SatelliteId {
        &self.id
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn rssi(&self) -> i16 {
        self.rssi
    }

    pub fn manufacturer_data(&self) -> ManufacturerData {
        self.manufacturer_data
    }

    /// Last state reported by the device, if it has been connected.
    pub fn state(&self) -> Option<&SatelliteState> {
        self.state.as_ref()
    }

    pub fn collections(&self) -> Option<CollectionIndexes> {
        self.collections
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection
    }

    pub fn is_connected(&self) -> bool {
        self.connection == ConnectionState::Connected
    }

    pub fn transfer_state(&self) -> TransferState {
        self.transfer_state
    }

    pub fn is_in_fail_safe_mode(&self) -> bool {
        self.state
            .as_ref()
            .map(SatelliteState::is_in_fail_safe_mode)
            .unwrap_or(false)
    }

    /// Indexes still owed by this satellite: the active session's pending
    /// set while transferring, otherwise the retained backlog.
    pub fn pending_collections(&self) -> Vec<u16> {
        match &self.session {
            Some(session) => session.pending().iter().collect(),
            None => self.backlog.iter().collect(),
        }
    }

    pub fn is_suppressed(&self) -> bool {
        self.suppressed
    }

    pub fn recent_failures(&self) -> &[TransferFailure] {
        &self.failures
    }

    /// Updates the advertisement-derived fields. Returns `true` when the
    /// persistent-state fingerprint changed.
    pub(crate) fn apply_advertisement(&mut self, advertisement: &Advertisement) -> bool {
        let fingerprint_changed = self.manufacturer_data.persistent_state_fingerprint
            != advertisement.manufacturer_data.persistent_state_fingerprint;
        if advertisement.name.is_some() {
            self.name = advertisement.name.clone();
        }
        self.rssi = advertisement.rssi;
        self.manufacturer_data = advertisement.manufacturer_data;
        fingerprint_changed
    }

    /// Replaces the reported state wholesale.
    pub(crate) fn replace_state(&mut self, state: SatelliteState, collections: CollectionIndexes) {
        self.state = Some(state);
        self.collections = Some(collections);
    }

    pub(crate) fn set_connection_state(&mut self, connection: ConnectionState) {
        self.connection = connection;
    }

    /// Keeps at most `limit` (itself capped at [`MAX_FAILURE_HISTORY`]) of
    /// the most recent failures.
    pub(crate) fn record_failure(&mut self, failure: TransferFailure, limit: usize) {
        let limit = limit.min(MAX_FAILURE_HISTORY);
        if limit == 0 {
            return;
        }
        while self.failures.len() >= limit {
            self.failures.remove(0);
        }
        let _ = self.failures.push(failure);
    }

    /// The running session if it belongs to `generation`.
    pub(crate) fn active_session(&mut self, generation: u64) -> Option<&mut TransferSession> {
        self.session
            .as_mut()
            .filter(|session| session.generation() == generation)
    }

    /// Ends any active session, folding its unconfirmed indexes into the
    /// backlog. Returns `true` if a session was interrupted.
    pub(crate) fn interrupt_transfer(&mut self) -> bool {
        self.generation = self.generation.wrapping_add(1);
        let interrupted = match self.session.take() {
            Some(session) => {
                self.backlog = session.into_pending();
                true
            }
            None => false,
        };
        self.transfer_state = TransferState::Idle;
        interrupted
    }

    /// One-line human readable status.
    pub fn summary(&self) -> String {
        let Some(state) = &self.state else {
            return format!(
                "[advertising] | rssi {} | {} collections",
                self.rssi, self.manufacturer_data.truncated_collection_count
            );
        };

        let movement = if state.transient.in_collection_state {
            "collecting"
        } else if state.transient.is_moving {
            "moving"
        } else {
            "still"
        };

        let mut icons = vec![if state.transient.is_dark { "☾" } else { "☀" }];
        if state.transient.needs_servicing {
            icons.push("⚠");
        }
        if state.transient.has_debug_info {
            icons.push("☠");
        }

        format!(
            "[{}] | FW:{}.{} | {} | {} collections",
            movement,
            state.persistent.platform_versions.firmware_version_major,
            state.persistent.platform_versions.firmware_version_minor,
            icons.join(" "),
            state.truncated_collection_count()
        )
    }
}
