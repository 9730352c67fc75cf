#![allow(dead_code)]

use haversine::error::{Result, SatelliteError, Status};
use haversine::policy::{CollectionTransferPolicy, PermissionsPolicy};
use haversine::satellite::{
    ManufacturerData, OperatingMode, PersistentState, PlatformVersions, TransientState,
};
use haversine::simulator::SimulatedSatellite;
use haversine::transport::SatelliteUpdate;
use haversine::*;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    StartScan,
    StopScan,
    Connect(SatelliteId, HardwareVersion),
    Disconnect(SatelliteId),
    Read(SatelliteId, u16),
    WriteUpdate(SatelliteId, &'static str),
}

type ReadHook = Box<dyn Fn(&SatelliteId, u16) + Send + Sync>;

/// Transport double that records every call. Reads succeed with a one-byte
/// payload unless a failure count was scripted for the index.
pub struct MockTransport {
    adapter: Mutex<AdapterState>,
    calls: Mutex<Vec<Call>>,
    failures: Mutex<HashMap<u16, u32>>,
    read_hook: Mutex<Option<Arc<ReadHook>>>,
}

impl MockTransport {
    pub fn new(adapter: AdapterState) -> Arc<Self> {
        Arc::new(Self {
            adapter: Mutex::new(adapter),
            calls: Mutex::new(Vec::new()),
            failures: Mutex::new(HashMap::new()),
            read_hook: Mutex::new(None),
        })
    }

    pub fn powered_on() -> Arc<Self> {
        Self::new(AdapterState::PoweredOn)
    }

    pub fn set_adapter(&self, state: AdapterState) {
        *self.adapter.lock().unwrap() = state;
    }

    /// The next `times` reads of `index` fail with a timeout.
    pub fn fail_reads(&self, index: u16, times: u32) {
        self.failures.lock().unwrap().insert(index, times);
    }

    pub fn on_read<F>(&self, hook: F)
    where
        F: Fn(&SatelliteId, u16) + Send + Sync + 'static,
    {
        *self.read_hook.lock().unwrap() = Some(Arc::new(Box::new(hook)));
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, call: &Call) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| *c == call).count()
    }

    pub fn reads(&self) -> Vec<u16> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter_map(|call| match call {
                Call::Read(_, index) => Some(*index),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }
}

impl Transport for MockTransport {
    fn adapter_state(&self) -> AdapterState {
        *self.adapter.lock().unwrap()
    }

    fn start_scan(&self) -> Status {
        self.record(Call::StartScan);
        Ok(())
    }

    fn stop_scan(&self) -> Status {
        self.record(Call::StopScan);
        Ok(())
    }

    fn connect(&self, id: &SatelliteId, version: HardwareVersion) -> Status {
        self.record(Call::Connect(id.clone(), version));
        Ok(())
    }

    fn disconnect(&self, id: &SatelliteId) -> Status {
        self.record(Call::Disconnect(id.clone()));
        Ok(())
    }

    fn read_collection(&self, id: &SatelliteId, index: u16) -> Result<Vec<u8>> {
        self.record(Call::Read(id.clone(), index));
        let hook = self.read_hook.lock().unwrap().clone();
        if let Some(hook) = hook {
            (hook.as_ref())(id, index);
        }
        let mut failures = self.failures.lock().unwrap();
        if let Some(remaining) = failures.get_mut(&index) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(SatelliteError::Timeout);
            }
        }
        Ok(vec![index as u8])
    }

    fn write_update(&self, id: &SatelliteId, update: &SatelliteUpdate) -> Status {
        self.record(Call::WriteUpdate(id.clone(), update.kind()));
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    First(CollectionIndexes),
    Will(CollectionIndexes),
    Finished(u16),
    Failed(u16),
}

/// Transfer policy that logs every callback. The start point defaults to
/// `range.start`.
pub struct RecordingTransfers {
    start: Mutex<Box<dyn Fn(CollectionIndexes) -> u16 + Send + Sync>>,
    log: Mutex<Vec<Record>>,
}

impl RecordingTransfers {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            start: Mutex::new(Box::new(|range| range.start_index)),
            log: Mutex::new(Vec::new()),
        })
    }

    pub fn start_with<F>(&self, choose: F)
    where
        F: Fn(CollectionIndexes) -> u16 + Send + Sync + 'static,
    {
        *self.start.lock().unwrap() = Box::new(choose);
    }

    pub fn log(&self) -> Vec<Record> {
        self.log.lock().unwrap().clone()
    }

    pub fn finished(&self) -> Vec<u16> {
        self.log()
            .into_iter()
            .filter_map(|record| match record {
                Record::Finished(index) => Some(index),
                _ => None,
            })
            .collect()
    }

    pub fn failed(&self) -> Vec<u16> {
        self.log()
            .into_iter()
            .filter_map(|record| match record {
                Record::Failed(index) => Some(index),
                _ => None,
            })
            .collect()
    }
}

impl CollectionTransferPolicy for RecordingTransfers {
    fn first_collection_to_transfer(&self, range: CollectionIndexes, _satellite: &SatelliteId) -> u16 {
        self.log.lock().unwrap().push(Record::First(range));
        let choose = self.start.lock().unwrap();
        (*choose)(range)
    }

    fn will_transfer_collections(&self, range: CollectionIndexes, _satellite: &SatelliteId) {
        self.log.lock().unwrap().push(Record::Will(range));
    }

    fn collection_transfer_did_finish(&self, _data: &[u8], index: u16, _satellite: &SatelliteId) {
        self.log.lock().unwrap().push(Record::Finished(index));
    }

    fn collection_transfer_did_fail(&self, _error: &SatelliteError, index: u16, _satellite: &SatelliteId) {
        self.log.lock().unwrap().push(Record::Failed(index));
    }
}

/// Permissions double with switchable answers.
pub struct SwitchPermissions {
    pub denied_advertisements: Mutex<HashSet<SatelliteId>>,
    pub handle_satellites: AtomicBool,
    pub transfer: AtomicBool,
}

impl SwitchPermissions {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            denied_advertisements: Mutex::new(HashSet::new()),
            handle_satellites: AtomicBool::new(true),
            transfer: AtomicBool::new(true),
        })
    }

    pub fn deny_advertisement(&self, id: &SatelliteId) {
        self.denied_advertisements.lock().unwrap().insert(id.clone());
    }
}

impl PermissionsPolicy for SwitchPermissions {
    fn should_handle_advertisement(&self, advertisement: &Advertisement) -> bool {
        !self.denied_advertisements.lock().unwrap().contains(&advertisement.id)
    }

    fn should_handle_satellite(&self, _satellite: &Satellite) -> bool {
        self.handle_satellites.load(Ordering::SeqCst)
    }

    fn should_transfer_collections(&self, _satellite: &Satellite) -> bool {
        self.transfer.load(Ordering::SeqCst)
    }
}

pub fn satellite_id(n: u8) -> SatelliteId {
    SatelliteId::new(format!("C0:FF:EE:00:00:{:02X}", n))
}

pub fn advertisement(id: &SatelliteId, rssi: i16) -> Advertisement {
    Advertisement {
        id: id.clone(),
        name: Some(format!("Tag {}", id)),
        rssi,
        manufacturer_data: ManufacturerData {
            persistent_state_fingerprint: 0xABCD_0000,
            truncated_collection_count: 0,
        },
    }
}

pub fn state(fail_safe: bool) -> SatelliteState {
    SatelliteState {
        persistent: PersistentState {
            serial_number: "HV-0001".to_string(),
            platform_versions: PlatformVersions {
                firmware_version_major: 2,
                firmware_version_minor: 7,
                hardware_version_major: 10,
                hardware_version_minor: 0,
            },
            application_data: Vec::new(),
        },
        transient: TransientState::default(),
        mode: if fail_safe {
            OperatingMode::FailSafe
        } else {
            OperatingMode::Normal
        },
    }
}

pub fn manager_with(transport: Arc<MockTransport>, environment: Environment) -> Arc<SatelliteManager> {
    Arc::new(SatelliteManager::new(transport, environment, ManagerConfig::default()))
}

/// Advertises, connects and reports `range`, running any transfer inline.
pub fn connect_and_report(manager: &SatelliteManager, id: &SatelliteId, range: CollectionIndexes) {
    manager.handle_event(TransportEvent::Advertisement(advertisement(id, -60)));
    reconnect_and_report(manager, id, range);
}

pub fn reconnect_and_report(manager: &SatelliteManager, id: &SatelliteId, range: CollectionIndexes) {
    manager.handle_event(TransportEvent::Connected(id.clone()));
    report(manager, id, range, false);
}

pub fn report(manager: &SatelliteManager, id: &SatelliteId, range: CollectionIndexes, fail_safe: bool) {
    manager.handle_event(TransportEvent::StateUpdated {
        id: id.clone(),
        state: state(fail_safe),
        collections: range,
    });
}

/// Simulated device `n` with its own serial number.
pub fn simulated(n: u8, collections: CollectionIndexes) -> SimulatedSatellite {
    let id = satellite_id(n);
    let mut reported = state(false);
    reported.persistent.serial_number = format!("HV-{:04}", n);
    SimulatedSatellite::new(advertisement(&id, -60), reported, collections)
}
