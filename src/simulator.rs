//! In-memory transport for demos and tests.
//!
//! [`SimulatedTransport`] keeps a set of simulated satellites, answers the
//! [`Transport`] calls against them and emits the resulting
//! [`TransportEvent`]s into a tokio channel, the way a radio callback layer
//! would. Read failures are injected by a seeded LCG so runs are repeatable.

use crate::error::{Result, SatelliteError, Status};
use crate::events::lock_unpoisoned;
use crate::indexes::CollectionIndexes;
use crate::satellite::{Advertisement, OperatingMode, SatelliteId, SatelliteState};
use crate::transport::{AdapterState, HardwareVersion, SatelliteUpdate, Transport, TransportEvent};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, warn};

const DEFAULT_SEED: u64 = 0x1234_5678_9ABC_DEF0;
const COLLECTION_PAYLOAD_LEN: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulatorConfig {
    /// Chance, in percent, that a single collection read fails.
    pub failure_rate_percent: u8,
    /// Chance, in percent, that a connect attempt fails.
    pub connect_failure_rate_percent: u8,
    pub seed: u64,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            failure_rate_percent: 0,
            connect_failure_rate_percent: 0,
            seed: DEFAULT_SEED,
        }
    }
}

/// One device behind the simulated radio.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimulatedSatellite {
    pub advertisement: Advertisement,
    pub state: SatelliteState,
    pub collections: CollectionIndexes,
}

impl SimulatedSatellite {
    pub fn new(advertisement: Advertisement, state: SatelliteState, collections: CollectionIndexes) -> Self {
        Self {
            advertisement,
            state,
            collections,
        }
    }

    pub fn id(&self) -> &SatelliteId {
        &self.advertisement.id
    }
}

/// Every call the manager made, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCall {
    StartScan,
    StopScan,
    Connect(SatelliteId, HardwareVersion),
    Disconnect(SatelliteId),
    ReadCollection(SatelliteId, u16),
    WriteUpdate(SatelliteId, &'static str),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimulatorStats {
    pub scans_started: u32,
    pub connects: u32,
    pub connect_failures: u32,
    pub disconnects: u32,
    pub reads: u32,
    pub read_failures: u32,
    pub updates_written: u32,
}

#[derive(Debug)]
struct SimState {
    adapter: AdapterState,
    scanning: bool,
    satellites: HashMap<SatelliteId, SimulatedSatellite>,
    connected: HashSet<SatelliteId>,
    rng_state: u64,
    calls: Vec<TransportCall>,
    stats: SimulatorStats,
}

impl SimState {
    fn next_random(&mut self) -> u64 {
        self.rng_state = self.rng_state.wrapping_mul(1664525).wrapping_add(1013904223);
        self.rng_state
    }

    fn roll(&mut self, rate_percent: u8) -> bool {
        rate_percent > 0 && ((self.next_random() >> 33) % 100) < u64::from(rate_percent)
    }
}

pub struct SimulatedTransport {
    config: SimulatorConfig,
    events: mpsc::UnboundedSender<TransportEvent>,
    state: Mutex<SimState>,
}

impl SimulatedTransport {
    /// Creates a transport with a powered-on adapter and the receiving end
    /// of its event stream.
    pub fn new(config: SimulatorConfig) -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        let (events, receiver) = mpsc::unbounded_channel();
        let transport = Self {
            config,
            events,
            state: Mutex::new(SimState {
                adapter: AdapterState::PoweredOn,
                scanning: false,
                satellites: HashMap::new(),
                connected: HashSet::new(),
                rng_state: config.seed,
                calls: Vec::new(),
                stats: SimulatorStats::default(),
            }),
        };
        (transport, receiver)
    }

    pub fn config(&self) -> SimulatorConfig {
        self.config
    }

    /// Adds (or replaces) a device; it advertises at once if a scan is running.
    pub fn add_satellite(&self, satellite: SimulatedSatellite) {
        let advertisement = satellite.advertisement.clone();
        let scanning = {
            let mut state = lock_unpoisoned(&self.state);
            state.satellites.insert(satellite.id().clone(), satellite);
            state.scanning
        };
        if scanning {
            self.emit(TransportEvent::Advertisement(advertisement));
        }
    }

    /// Re-broadcasts every advertisement while scanning. Returns how many were sent.
    pub fn advertise_all(&self) -> usize {
        let advertisements: Vec<Advertisement> = {
            let state = lock_unpoisoned(&self.state);
            if !state.scanning {
                return 0;
            }
            state
                .satellites
                .values()
                .map(|satellite| satellite.advertisement.clone())
                .collect()
        };
        let count = advertisements.len();
        for advertisement in advertisements {
            self.emit(TransportEvent::Advertisement(advertisement));
        }
        count
    }

    pub fn set_adapter_state(&self, adapter: AdapterState) {
        let dropped: Vec<SatelliteId> = {
            let mut state = lock_unpoisoned(&self.state);
            state.adapter = adapter;
            if adapter.is_powered_on() {
                Vec::new()
            } else {
                state.scanning = false;
                state.connected.drain().collect()
            }
        };
        self.emit(TransportEvent::AdapterStateChanged(adapter));
        for id in dropped {
            self.emit(TransportEvent::Disconnected {
                id,
                error: Some(SatelliteError::Disconnected),
            });
        }
    }

    /// Appends `count` new collections and reports the new state to a
    /// connected manager.
    pub fn add_collections(&self, id: &SatelliteId, count: u16) -> Status {
        let report = {
            let mut state = lock_unpoisoned(&self.state);
            let connected = state.connected.contains(id);
            let satellite = state
                .satellites
                .get_mut(id)
                .ok_or_else(|| SatelliteError::UnknownSatellite(id.clone()))?;
            satellite.collections.end_index = satellite.collections.end_index.wrapping_add(count);
            let transient = &mut satellite.state.transient;
            transient.truncated_collection_count = transient.truncated_collection_count.wrapping_add(count as u8);
            satellite.advertisement.manufacturer_data.truncated_collection_count =
                transient.truncated_collection_count;
            connected.then(|| state_report(satellite))
        };
        if let Some(event) = report {
            self.emit(event);
        }
        Ok(())
    }

    pub fn set_fail_safe(&self, id: &SatelliteId, fail_safe: bool) -> Status {
        let mut state = lock_unpoisoned(&self.state);
        let satellite = state
            .satellites
            .get_mut(id)
            .ok_or_else(|| SatelliteError::UnknownSatellite(id.clone()))?;
        satellite.state.mode = if fail_safe {
            OperatingMode::FailSafe
        } else {
            OperatingMode::Normal
        };
        Ok(())
    }

    /// Simulates a link loss initiated by the device.
    pub fn drop_connection(&self, id: &SatelliteId) -> bool {
        let dropped = lock_unpoisoned(&self.state).connected.remove(id);
        if dropped {
            self.emit(TransportEvent::Disconnected {
                id: id.clone(),
                error: Some(SatelliteError::Disconnected),
            });
        }
        dropped
    }

    pub fn satellite(&self, id: &SatelliteId) -> Option<SimulatedSatellite> {
        lock_unpoisoned(&self.state).satellites.get(id).cloned()
    }

    pub fn is_connected(&self, id: &SatelliteId) -> bool {
        lock_unpoisoned(&self.state).connected.contains(id)
    }

    pub fn calls(&self) -> Vec<TransportCall> {
        lock_unpoisoned(&self.state).calls.clone()
    }

    pub fn stats(&self) -> SimulatorStats {
        lock_unpoisoned(&self.state).stats
    }

    fn emit(&self, event: TransportEvent) {
        if self.events.send(event).is_err() {
            debug!("Simulator event receiver dropped");
        }
    }
}

fn state_report(satellite: &SimulatedSatellite) -> TransportEvent {
    TransportEvent::StateUpdated {
        id: satellite.id().clone(),
        state: satellite.state.clone(),
        collections: satellite.collections,
    }
}

/// Deterministic payload: the index followed by serial number bytes.
pub fn collection_payload(serial_number: &str, index: u16) -> Vec<u8> {
    let mut payload = Vec::with_capacity(COLLECTION_PAYLOAD_LEN);
    payload.extend_from_slice(&index.to_le_bytes());
    payload.extend(serial_number.bytes().cycle().take(COLLECTION_PAYLOAD_LEN - 2));
    payload
}

impl Transport for SimulatedTransport {
    fn adapter_state(&self) -> AdapterState {
        lock_unpoisoned(&self.state).adapter
    }

    fn start_scan(&self) -> Status {
        let advertisements: Vec<Advertisement> = {
            let mut state = lock_unpoisoned(&self.state);
            state.calls.push(TransportCall::StartScan);
            if !state.adapter.is_powered_on() {
                return Err(SatelliteError::AdapterNotReady(state.adapter));
            }
            state.scanning = true;
            state.stats.scans_started += 1;
            state
                .satellites
                .values()
                .map(|satellite| satellite.advertisement.clone())
                .collect()
        };
        for advertisement in advertisements {
            self.emit(TransportEvent::Advertisement(advertisement));
        }
        Ok(())
    }

    fn stop_scan(&self) -> Status {
        let mut state = lock_unpoisoned(&self.state);
        state.calls.push(TransportCall::StopScan);
        state.scanning = false;
        Ok(())
    }

    fn connect(&self, id: &SatelliteId, version: HardwareVersion) -> Status {
        let rate = self.config.connect_failure_rate_percent;
        let outcome = {
            let mut state = lock_unpoisoned(&self.state);
            state.calls.push(TransportCall::Connect(id.clone(), version));
            if !state.adapter.is_powered_on() {
                return Err(SatelliteError::AdapterNotReady(state.adapter));
            }
            let Some(satellite) = state.satellites.get(id).cloned() else {
                return Err(SatelliteError::UnknownSatellite(id.clone()));
            };
            if state.roll(rate) {
                state.stats.connect_failures += 1;
                None
            } else {
                state.stats.connects += 1;
                state.connected.insert(id.clone());
                Some(satellite)
            }
        };

        match outcome {
            Some(satellite) => {
                self.emit(TransportEvent::Connected(id.clone()));
                self.emit(state_report(&satellite));
            }
            None => {
                warn!(satellite = %id, "Simulated connection failure");
                self.emit(TransportEvent::ConnectionFailed {
                    id: id.clone(),
                    error: SatelliteError::ConnectionFailed("simulated link failure".to_string()),
                });
            }
        }
        Ok(())
    }

    fn disconnect(&self, id: &SatelliteId) -> Status {
        let was_connected = {
            let mut state = lock_unpoisoned(&self.state);
            state.calls.push(TransportCall::Disconnect(id.clone()));
            let was_connected = state.connected.remove(id);
            if was_connected {
                state.stats.disconnects += 1;
            }
            was_connected
        };
        if was_connected {
            self.emit(TransportEvent::Disconnected {
                id: id.clone(),
                error: None,
            });
        }
        Ok(())
    }

    fn read_collection(&self, id: &SatelliteId, index: u16) -> Result<Vec<u8>> {
        let rate = self.config.failure_rate_percent;
        let mut state = lock_unpoisoned(&self.state);
        state.calls.push(TransportCall::ReadCollection(id.clone(), index));
        state.stats.reads += 1;
        if !state.connected.contains(id) {
            return Err(SatelliteError::Disconnected);
        }
        let satellite = state
            .satellites
            .get(id)
            .ok_or_else(|| SatelliteError::UnknownSatellite(id.clone()))?;
        if !satellite.collections.contains(index) {
            return Err(SatelliteError::TransferFailed {
                index,
                reason: "collection not resident".to_string(),
            });
        }
        let payload = collection_payload(&satellite.state.persistent.serial_number, index);
        if state.roll(rate) {
            state.stats.read_failures += 1;
            return Err(SatelliteError::Timeout);
        }
        Ok(payload)
    }

    fn write_update(&self, id: &SatelliteId, update: &SatelliteUpdate) -> Status {
        let mut state = lock_unpoisoned(&self.state);
        state.calls.push(TransportCall::WriteUpdate(id.clone(), update.kind()));
        if !state.connected.contains(id) {
            return Err(SatelliteError::Disconnected);
        }
        state.stats.updates_written += 1;
        if let (SatelliteUpdate::Firmware { version, .. }, Some(satellite)) = (update, state.satellites.get_mut(id)) {
            let versions = &mut satellite.state.persistent.platform_versions;
            versions.firmware_version_major = version.0;
            versions.firmware_version_minor = version.1;
        }
        Ok(())
    }
}
