use crate::events::lock_unpoisoned;
use crate::satellite::Satellite;
use crate::transport::SatelliteUpdate;
use std::sync::Mutex;

/// Supplies optional payloads to push to a connected satellite.
pub trait UpdatePolicy: Send + Sync {
    fn firmware_update(&self, _satellite: &Satellite) -> Option<SatelliteUpdate> {
        None
    }

    fn sensor_config_update(&self, _satellite: &Satellite) -> Option<SatelliteUpdate> {
        None
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoUpdates;

impl UpdatePolicy for NoUpdates {}

/// Holds one firmware image and one sensor configuration, set at runtime.
///
/// Firmware is only offered to satellites reporting a different version.
#[derive(Debug, Default)]
pub struct StaticUpdates {
    firmware: Mutex<Option<SatelliteUpdate>>,
    sensor_config: Mutex<Option<SatelliteUpdate>>,
}

impl StaticUpdates {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_firmware(&self, version: (u8, u8), image: Vec<u8>) {
        *lock_unpoisoned(&self.firmware) = Some(SatelliteUpdate::Firmware { version, image });
    }

    pub fn set_sensor_config(&self, config: Vec<u8>) {
        *lock_unpoisoned(&self.sensor_config) = Some(SatelliteUpdate::SensorConfig { config });
    }

    pub fn clear(&self) {
        *lock_unpoisoned(&self.firmware) = None;
        *lock_unpoisoned(&self.sensor_config) = None;
    }
}

impl UpdatePolicy for StaticUpdates {
    fn firmware_update(&self, satellite: &Satellite) -> Option<SatelliteUpdate> {
        let update = lock_unpoisoned(&self.firmware).clone()?;
        let SatelliteUpdate::Firmware { version, .. } = &update else {
            return None;
        };
        let installed = satellite.state().map(|state| {
            let versions = state.persistent.platform_versions;
            (versions.firmware_version_major, versions.firmware_version_minor)
        });
        (installed != Some(*version)).then_some(update)
    }

    fn sensor_config_update(&self, _satellite: &Satellite) -> Option<SatelliteUpdate> {
        lock_unpoisoned(&self.sensor_config).clone()
    }
}
