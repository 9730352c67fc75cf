//! The satellite session manager.
//!
//! [`SatelliteManager`] owns the discovered-device table and the scan
//! lifecycle, and routes [`TransportEvent`]s through the permission, update
//! and transfer policies into each satellite's transfer state machine.
//!
//! Locks are taken in the order state, table, satellite and are never held
//! while a subscriber, a policy or the transport runs. Transfer passes are
//! split out of event handling ([`SatelliteManager::process_event`] returns a
//! [`TransferJob`]) so a driver can run them concurrently with later events;
//! a disconnect bumps the satellite's generation and the running pass stops
//! at its next step.

use crate::config::ManagerConfig;
use crate::error::{Result, SatelliteError, Status};
use crate::events::{lock_unpoisoned, EventChannel, EventSource};
use crate::indexes::CollectionIndexes;
use crate::policy::Environment;
use crate::satellite::{Advertisement, ConnectionState, Satellite, SatelliteId, SatelliteState, TransferFailure};
use crate::transfer::{plan_pending, unseen_indexes, PendingCollections, TransferSession, TransferState};
use crate::transport::{AdapterState, HardwareVersion, Transport, TransportEvent};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info, warn};

type SatelliteEntry = Arc<Mutex<Satellite>>;

#[derive(Debug)]
struct ScanState {
    adapter_state: AdapterState,
    /// The caller wants to scan; survives adapter power cycles.
    scan_desired: bool,
    scanning: bool,
    shut_down: bool,
}

/// A transfer pass ready to run, produced by
/// [`SatelliteManager::process_event`].
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use = "a transfer job does nothing until passed to run_transfer"]
pub struct TransferJob {
    satellite: SatelliteId,
    generation: u64,
}

impl TransferJob {
    pub fn satellite(&self) -> &SatelliteId {
        &self.satellite
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SatelliteSnapshot {
    pub id: SatelliteId,
    pub name: Option<String>,
    pub rssi: i16,
    pub connection: ConnectionState,
    pub transfer_state: TransferState,
    pub fail_safe: bool,
    pub suppressed: bool,
    pub collections: Option<CollectionIndexes>,
    pub pending: Vec<u16>,
    pub summary: String,
}

impl SatelliteSnapshot {
    fn of(satellite: &Satellite) -> Self {
        Self {
            id: satellite.id().clone(),
            name: satellite.name().map(str::to_string),
            rssi: satellite.rssi(),
            connection: satellite.connection_state(),
            transfer_state: satellite.transfer_state(),
            fail_safe: satellite.is_in_fail_safe_mode(),
            suppressed: satellite.is_suppressed(),
            collections: satellite.collections(),
            pending: satellite.pending_collections(),
            summary: satellite.summary(),
        }
    }
}

/// Serializable view of the whole manager, ordered by satellite id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagerSnapshot {
    pub adapter_state: AdapterState,
    pub scanning: bool,
    pub satellites: Vec<SatelliteSnapshot>,
}

pub struct SatelliteManager {
    transport: Arc<dyn Transport>,
    environment: Environment,
    config: ManagerConfig,
    scan: Mutex<ScanState>,
    satellites: Mutex<HashMap<SatelliteId, SatelliteEntry>>,
    adapter_state_events: EventChannel<AdapterState>,
    discovery_events: EventChannel<Satellite>,
    scanning_completion_events: EventChannel<Status>,
}

impl SatelliteManager {
    pub fn new(transport: Arc<dyn Transport>, environment: Environment, config: ManagerConfig) -> Self {
        let adapter_state = transport.adapter_state();
        info!(
            adapter = %adapter_state,
            hardware_version = %config.hardware_version,
            "Satellite manager created"
        );
        Self {
            transport,
            environment,
            config,
            scan: Mutex::new(ScanState {
                adapter_state,
                scan_desired: false,
                scanning: false,
                shut_down: false,
            }),
            satellites: Mutex::new(HashMap::new()),
            adapter_state_events: EventChannel::new(),
            discovery_events: EventChannel::new(),
            scanning_completion_events: EventChannel::new(),
        }
    }

    /// Validates `config` before building the manager.
    pub fn with_config(
        transport: Arc<dyn Transport>,
        environment: Environment,
        config: ManagerConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self::new(transport, environment, config))
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn environment(&self) -> &Environment {
        &self.environment
    }

    pub fn hardware_version(&self) -> HardwareVersion {
        self.config.hardware_version
    }

    // ---- scanning ----

    /// Starts scanning. The wish to scan is remembered even when the adapter
    /// is not ready, and scanning starts by itself once it powers on.
    pub fn scan_for_satellites(&self) -> Status {
        {
            let mut scan = lock_unpoisoned(&self.scan);
            if scan.shut_down {
                return Err(SatelliteError::ShutDown);
            }
            scan.scan_desired = true;
            if scan.scanning {
                if self.config.reject_duplicate_scan {
                    return Err(SatelliteError::AlreadyScanning);
                }
                debug!("Scan already active");
                return Ok(());
            }
            if !scan.adapter_state.is_powered_on() {
                warn!(adapter = %scan.adapter_state, "Cannot scan yet; waiting for the adapter to power on");
                return Err(SatelliteError::AdapterNotReady(scan.adapter_state));
            }
            scan.scanning = true;
        }

        self.clear_suppression();

        if let Err(e) = self.transport.start_scan() {
            error!("Failed to start scanning: {}", e);
            lock_unpoisoned(&self.scan).scanning = false;
            return Err(e);
        }
        info!("Scanning for satellites");
        Ok(())
    }

    /// Stops scanning, cancels running transfers and releases every
    /// connection. Safe to call at any time.
    pub fn stop_scanning(&self) {
        let was_scanning = {
            let mut scan = lock_unpoisoned(&self.scan);
            scan.scan_desired = false;
            core::mem::replace(&mut scan.scanning, false)
        };

        if was_scanning {
            if let Err(e) = self.transport.stop_scan() {
                warn!("Transport failed to stop scanning: {}", e);
            }
            info!("Scanning stopped");
        }

        self.release_all_satellites();

        if was_scanning {
            self.scanning_completion_events.publish(&Ok(()));
        }
    }

    pub fn is_scanning(&self) -> bool {
        lock_unpoisoned(&self.scan).scanning
    }

    pub fn bluetooth_state(&self) -> AdapterState {
        lock_unpoisoned(&self.scan).adapter_state
    }

    // ---- queries ----

    /// Point-in-time copy of every known satellite.
    pub fn get_discovered_satellites(&self) -> HashMap<SatelliteId, Satellite> {
        self.entries()
            .into_iter()
            .map(|(id, entry)| {
                let satellite = lock_unpoisoned(&entry).clone();
                (id, satellite)
            })
            .collect()
    }

    pub fn satellite(&self, id: &SatelliteId) -> Result<Satellite> {
        self.entry(id)
            .map(|entry| lock_unpoisoned(&entry).clone())
            .ok_or_else(|| SatelliteError::UnknownSatellite(id.clone()))
    }

    pub fn snapshot(&self) -> ManagerSnapshot {
        let (adapter_state, scanning) = {
            let scan = lock_unpoisoned(&self.scan);
            (scan.adapter_state, scan.scanning)
        };
        let mut satellites: Vec<SatelliteSnapshot> = self
            .entries()
            .iter()
            .map(|(_, entry)| SatelliteSnapshot::of(&lock_unpoisoned(entry)))
            .collect();
        satellites.sort_by(|a, b| a.id.cmp(&b.id));
        ManagerSnapshot {
            adapter_state,
            scanning,
            satellites,
        }
    }

    // ---- event sources ----

    pub fn adapter_state_events(&self) -> EventSource<'_, AdapterState> {
        self.adapter_state_events.source()
    }

    /// Fires once per satellite, when it first passes the advertisement filter.
    pub fn discovery_events(&self) -> EventSource<'_, Satellite> {
        self.discovery_events.source()
    }

    /// `Ok` after a manual stop, an error when the adapter or radio ended the scan.
    pub fn scanning_completion_events(&self) -> EventSource<'_, Status> {
        self.scanning_completion_events.source()
    }

    // ---- transport events ----

    /// Applies `event` and runs any transfer pass it starts to completion.
    pub fn handle_event(&self, event: TransportEvent) {
        if let Some(job) = self.process_event(event) {
            self.run_transfer(job);
        }
    }

    /// Applies `event`. A returned job must be passed to
    /// [`run_transfer`](Self::run_transfer) for the transfer to happen.
    pub fn process_event(&self, event: TransportEvent) -> Option<TransferJob> {
        if lock_unpoisoned(&self.scan).shut_down {
            debug!(?event, "Ignoring event after shutdown");
            return None;
        }

        match event {
            TransportEvent::AdapterStateChanged(state) => {
                self.on_adapter_state(state);
                None
            }
            TransportEvent::Advertisement(advertisement) => {
                self.on_advertisement(advertisement);
                None
            }
            TransportEvent::Connected(id) => {
                self.on_connected(&id);
                None
            }
            TransportEvent::ConnectionFailed { id, error } => {
                self.on_connection_failed(&id, error);
                None
            }
            TransportEvent::Disconnected { id, error } => {
                self.on_disconnected(&id, error);
                None
            }
            TransportEvent::StateUpdated {
                id,
                state,
                collections,
            } => self.on_state_updated(&id, state, collections),
            TransportEvent::ScanFailed(error) => {
                self.on_scan_failed(error);
                None
            }
        }
    }

    fn on_adapter_state(&self, state: AdapterState) {
        let (previous, was_scanning, restart) = {
            let mut scan = lock_unpoisoned(&self.scan);
            let previous = core::mem::replace(&mut scan.adapter_state, state);
            let was_scanning = if state.is_powered_on() {
                false
            } else {
                core::mem::replace(&mut scan.scanning, false)
            };
            let restart = state.is_powered_on() && !previous.is_powered_on() && scan.scan_desired && !scan.scanning;
            (previous, was_scanning, restart)
        };

        if previous == state {
            return;
        }
        info!(from = %previous, to = %state, "Adapter state changed");
        self.adapter_state_events.publish(&state);

        if !state.is_powered_on() {
            self.release_all_satellites();
            if was_scanning {
                self.scanning_completion_events
                    .publish(&Err(SatelliteError::AdapterNotReady(state)));
            }
        }

        if restart {
            info!("Adapter powered on; resuming requested scan");
            if let Err(e) = self.scan_for_satellites() {
                warn!("Automatic scan start failed: {}", e);
            }
        }
    }

    fn on_scan_failed(&self, error: SatelliteError) {
        let was_scanning = core::mem::replace(&mut lock_unpoisoned(&self.scan).scanning, false);
        warn!("Scan ended by the radio: {}", error);
        if was_scanning {
            self.scanning_completion_events.publish(&Err(error));
        }
    }

    fn on_advertisement(&self, advertisement: Advertisement) {
        if !self
            .environment
            .permissions
            .should_handle_advertisement(&advertisement)
        {
            debug!(satellite = %advertisement.id, "Advertisement rejected by permissions");
            return;
        }

        let may_connect = self.config.auto_connect && self.bluetooth_state().is_powered_on();
        let id = advertisement.id.clone();

        let (discovered, connect) = {
            let mut table = lock_unpoisoned(&self.satellites);
            let (entry, discovered) = match table.get(&id) {
                Some(entry) => (Arc::clone(entry), false),
                None => {
                    let entry = Arc::new(Mutex::new(Satellite::new(&advertisement)));
                    table.insert(id.clone(), Arc::clone(&entry));
                    (entry, true)
                }
            };

            let mut satellite = lock_unpoisoned(&entry);
            if !discovered && satellite.apply_advertisement(&advertisement) && satellite.suppressed {
                info!(satellite = %id, "Persistent state changed; reconsidering satellite");
                satellite.suppressed = false;
            }
            let connect = may_connect
                && !satellite.suppressed
                && satellite.connection_state() == ConnectionState::Disconnected;
            if connect {
                satellite.set_connection_state(ConnectionState::Connecting);
            }
            let discovered = discovered.then(|| satellite.clone());
            (discovered, connect)
        };

        if connect {
            debug!(satellite = %id, "Connecting");
            if let Err(e) = self.transport.connect(&id, self.config.hardware_version) {
                warn!(satellite = %id, "Connect request failed: {}", e);
                if let Some(entry) = self.entry(&id) {
                    lock_unpoisoned(&entry).set_connection_state(ConnectionState::Disconnected);
                }
            }
        }

        if let Some(satellite) = discovered {
            info!(satellite = %id, name = ?satellite.name(), rssi = satellite.rssi(), "Discovered satellite");
            self.discovery_events.publish(&satellite);
        }
    }

    fn on_connected(&self, id: &SatelliteId) {
        let Some(entry) = self.entry(id) else {
            warn!(satellite = %id, "Connection reported for unknown satellite");
            return;
        };
        let mut satellite = lock_unpoisoned(&entry);
        satellite.set_connection_state(ConnectionState::Connected);
        satellite.transfer_state = TransferState::AwaitingPermission;
        satellite.updates_offered = false;
        info!(satellite = %id, "Connected; awaiting state report");
    }

    fn on_connection_failed(&self, id: &SatelliteId, error: SatelliteError) {
        let Some(entry) = self.entry(id) else {
            return;
        };
        let mut satellite = lock_unpoisoned(&entry);
        satellite.interrupt_transfer();
        satellite.set_connection_state(ConnectionState::Disconnected);
        warn!(satellite = %id, "Connection failed: {}", error);
    }

    fn on_disconnected(&self, id: &SatelliteId, error: Option<SatelliteError>) {
        let Some(entry) = self.entry(id) else {
            return;
        };
        let mut satellite = lock_unpoisoned(&entry);
        if satellite.interrupt_transfer() {
            info!(
                satellite = %id,
                pending = satellite.backlog.len(),
                "Transfer interrupted by disconnect; pending collections retained"
            );
        }
        satellite.set_connection_state(ConnectionState::Disconnected);
        match error {
            Some(e) => warn!(satellite = %id, "Disconnected: {}", e),
            None => info!(satellite = %id, "Disconnected"),
        }
    }

    fn on_state_updated(
        &self,
        id: &SatelliteId,
        state: SatelliteState,
        collections: CollectionIndexes,
    ) -> Option<TransferJob> {
        let Some(entry) = self.entry(id) else {
            warn!(satellite = %id, "State reported for unknown satellite");
            return None;
        };

        let snapshot = {
            let mut satellite = lock_unpoisoned(&entry);
            satellite.replace_state(state, collections);
            debug!(satellite = %id, collections = %collections, "State updated");
            if !satellite.is_connected() || satellite.suppressed {
                return None;
            }
            satellite.clone()
        };

        let permissions = &self.environment.permissions;
        if !permissions.should_handle_satellite(&snapshot) {
            if !snapshot.is_in_fail_safe_mode() {
                self.reject(&entry, id);
                return None;
            }
            info!(satellite = %id, "Satellite in fail-safe mode; handling despite permissions");
        }

        // A running pass picks up nothing from a mid-transfer report.
        if snapshot.session.is_some() {
            return None;
        }

        if !snapshot.updates_offered {
            self.offer_updates(&entry, &snapshot);
        }

        if !permissions.should_transfer_collections(&snapshot) {
            let mut satellite = lock_unpoisoned(&entry);
            if satellite.generation == snapshot.generation {
                satellite.transfer_state = TransferState::Idle;
            }
            info!(satellite = %id, "Collection transfer not permitted");
            return None;
        }

        self.begin_session(&entry, &snapshot, collections)
    }

    /// Denies `entry`: drops it and keeps it suppressed until a new scan
    /// starts or its persistent state changes.
    fn reject(&self, entry: &SatelliteEntry, id: &SatelliteId) {
        let release = {
            let mut satellite = lock_unpoisoned(entry);
            satellite.suppressed = true;
            satellite.interrupt_transfer();
            let release = satellite.connection_state() != ConnectionState::Disconnected;
            satellite.set_connection_state(ConnectionState::Disconnected);
            release
        };
        info!(satellite = %id, "{}; disconnecting", SatelliteError::PolicyRejected);
        if release {
            if let Err(e) = self.transport.disconnect(id) {
                warn!(satellite = %id, "Disconnect failed: {}", e);
            }
        }
    }

    fn offer_updates(&self, entry: &SatelliteEntry, snapshot: &Satellite) {
        {
            let mut satellite = lock_unpoisoned(entry);
            if satellite.generation != snapshot.generation || satellite.updates_offered {
                return;
            }
            satellite.updates_offered = true;
        }

        let updates = &self.environment.updates;
        let pending = [updates.firmware_update(snapshot), updates.sensor_config_update(snapshot)];
        for update in pending.into_iter().flatten() {
            match self.transport.write_update(snapshot.id(), &update) {
                Ok(()) => info!(satellite = %snapshot.id(), kind = update.kind(), "Update delivered"),
                Err(e) => warn!(satellite = %snapshot.id(), kind = update.kind(), "Update failed: {}", e),
            }
        }
    }

    fn begin_session(
        &self,
        entry: &SatelliteEntry,
        snapshot: &Satellite,
        range: CollectionIndexes,
    ) -> Option<TransferJob> {
        let id = snapshot.id();
        let unseen = unseen_indexes(range, snapshot.frontier);
        let start = if unseen.is_empty() {
            unseen.end_index
        } else {
            let start = self
                .environment
                .transfers
                .first_collection_to_transfer(unseen, id);
            if unseen.admits_start(start) {
                start
            } else {
                warn!(satellite = %id, start, range = %unseen, "Transfer start outside range; transferring nothing new");
                unseen.end_index
            }
        };

        let mut satellite = lock_unpoisoned(entry);
        if satellite.generation != snapshot.generation || !satellite.is_connected() || satellite.session.is_some() {
            debug!(satellite = %id, "Satellite changed while planning; skipping session");
            return None;
        }
        let backlog = core::mem::take(&mut satellite.backlog);
        let pending = plan_pending(backlog, unseen, start);
        info!(
            satellite = %id,
            range = %range,
            pending = pending.len(),
            "Starting collection transfer"
        );
        satellite.session = Some(TransferSession::new(range, pending, satellite.generation));
        satellite.frontier = Some(range.end_index);
        satellite.transfer_state = TransferState::Transferring;

        Some(TransferJob {
            satellite: id.clone(),
            generation: satellite.generation,
        })
    }

    /// Runs one transfer pass: every pending index in ascending modular
    /// order, each read up to `read_attempts` times. Failed indexes stay
    /// pending. Returns early once the satellite disconnects.
    pub fn run_transfer(&self, job: TransferJob) {
        let id = job.satellite;
        let Some(entry) = self.entry(&id) else {
            return;
        };
        let range = match lock_unpoisoned(&entry).active_session(job.generation) {
            Some(session) => session.range(),
            None => return,
        };

        let transfers = &self.environment.transfers;
        transfers.will_transfer_collections(range, &id);

        let attempts = self.config.read_attempts.max(1);
        loop {
            let next = match lock_unpoisoned(&entry).active_session(job.generation) {
                Some(session) => session.advance(),
                None => {
                    info!(satellite = %id, "Transfer cancelled");
                    return;
                }
            };
            let Some(index) = next else {
                break;
            };

            let mut attempt = 0;
            let outcome = loop {
                attempt += 1;
                match self.transport.read_collection(&id, index) {
                    Ok(data) => break Ok(data),
                    Err(e) if attempt < attempts => {
                        debug!(satellite = %id, index, attempt, "Read failed, retrying: {}", e);
                    }
                    Err(e) => break Err(e),
                }
            };

            {
                let mut satellite = lock_unpoisoned(&entry);
                match satellite.active_session(job.generation) {
                    Some(session) => match &outcome {
                        Ok(_) => session.confirm(index),
                        Err(_) => session.mark_failed(index),
                    },
                    None => {
                        info!(satellite = %id, index, "Transfer cancelled; collection stays pending");
                        return;
                    }
                }
                if let Err(e) = &outcome {
                    satellite.record_failure(
                        TransferFailure {
                            index,
                            error: e.clone(),
                            attempts: attempt,
                        },
                        self.config.failure_history,
                    );
                }
            }

            match outcome {
                Ok(data) => {
                    debug!(satellite = %id, index, bytes = data.len(), "Collection transferred");
                    transfers.collection_transfer_did_finish(&data, index, &id);
                }
                Err(e) => {
                    warn!(satellite = %id, index, attempts = attempt, "Collection transfer failed: {}", e);
                    let error = SatelliteError::TransferFailed {
                        index,
                        reason: e.to_string(),
                    };
                    transfers.collection_transfer_did_fail(&error, index, &id);
                }
            }
        }

        let mut satellite = lock_unpoisoned(&entry);
        if satellite.active_session(job.generation).is_none() {
            return;
        }
        let Some(session) = satellite.session.take() else {
            return;
        };
        satellite.transfer_state = TransferState::Idle;
        let failed = session.failed_count();
        let pending = session.into_pending();
        if pending.is_empty() {
            info!(satellite = %id, "Transfer complete");
            satellite.backlog = PendingCollections::new();
        } else {
            warn!(
                satellite = %id,
                failed,
                pending = pending.len(),
                "Transfer pass finished with collections outstanding"
            );
            satellite.backlog = pending;
        }
    }

    // ---- teardown ----

    /// Releases every subscriber, stops scanning and disconnects all
    /// satellites. Later events are ignored and scanning is refused.
    pub fn shutdown(&self) {
        let was_scanning = {
            let mut scan = lock_unpoisoned(&self.scan);
            if scan.shut_down {
                return;
            }
            scan.shut_down = true;
            scan.scan_desired = false;
            core::mem::replace(&mut scan.scanning, false)
        };
        info!("Shutting down satellite manager");

        self.adapter_state_events.clear();
        self.discovery_events.clear();
        self.scanning_completion_events.clear();

        if was_scanning {
            if let Err(e) = self.transport.stop_scan() {
                warn!("Transport failed to stop scanning: {}", e);
            }
        }
        self.release_all_satellites();
    }

    pub fn is_shut_down(&self) -> bool {
        lock_unpoisoned(&self.scan).shut_down
    }

    // ---- helpers ----

    fn entry(&self, id: &SatelliteId) -> Option<SatelliteEntry> {
        lock_unpoisoned(&self.satellites).get(id).cloned()
    }

    fn entries(&self) -> Vec<(SatelliteId, SatelliteEntry)> {
        lock_unpoisoned(&self.satellites)
            .iter()
            .map(|(id, entry)| (id.clone(), Arc::clone(entry)))
            .collect()
    }

    fn clear_suppression(&self) {
        for (_, entry) in self.entries() {
            lock_unpoisoned(&entry).suppressed = false;
        }
    }

    /// Cancels every transfer, keeping pending indexes, and disconnects.
    fn release_all_satellites(&self) {
        for (id, entry) in self.entries() {
            let release = {
                let mut satellite = lock_unpoisoned(&entry);
                if satellite.interrupt_transfer() {
                    info!(satellite = %id, pending = satellite.backlog.len(), "Transfer cancelled");
                }
                let release = satellite.connection_state() != ConnectionState::Disconnected;
                satellite.set_connection_state(ConnectionState::Disconnected);
                release
            };
            if release {
                if let Err(e) = self.transport.disconnect(&id) {
                    debug!(satellite = %id, "Disconnect failed: {}", e);
                }
            }
        }
    }
}

impl Drop for SatelliteManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl core::fmt::Debug for SatelliteManager {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let scan = lock_unpoisoned(&self.scan);
        f.debug_struct("SatelliteManager")
            .field("adapter_state", &scan.adapter_state)
            .field("scanning", &scan.scanning)
            .field("satellites", &lock_unpoisoned(&self.satellites).len())
            .finish()
    }
}
