use crate::auth::AuthConfig;
use crate::error::{Result, SatelliteError, Status};
use crate::satellite::MAX_FAILURE_HISTORY;
use crate::transport::HardwareVersion;
use serde::{Deserialize, Serialize};

const DEFAULT_READ_ATTEMPTS: u8 = 3;
const MAX_READ_ATTEMPTS: u8 = 16;

/// Tunables for a [`SatelliteManager`](crate::manager::SatelliteManager).
///
/// Missing JSON fields fall back to their defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Passed through to the transport on every connect.
    pub hardware_version: HardwareVersion,
    /// Attempts per collection index within one connection.
    pub read_attempts: u8,
    /// Return `AlreadyScanning` instead of treating a second scan request as a no-op.
    pub reject_duplicate_scan: bool,
    pub auto_connect: bool,
    /// Per-satellite failure records kept for inspection.
    pub failure_history: usize,
    pub auth: AuthConfig,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            hardware_version: HardwareVersion::default(),
            read_attempts: DEFAULT_READ_ATTEMPTS,
            reject_duplicate_scan: false,
            auto_connect: true,
            failure_history: MAX_FAILURE_HISTORY,
            auth: AuthConfig::default(),
        }
    }
}

impl ManagerConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| SatelliteError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json_string(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| SatelliteError::InvalidConfig(e.to_string()))
    }

    pub fn validate(&self) -> Status {
        if self.read_attempts == 0 || self.read_attempts > MAX_READ_ATTEMPTS {
            return Err(SatelliteError::InvalidConfig(format!(
                "read_attempts must be within 1..={}, got {}",
                MAX_READ_ATTEMPTS, self.read_attempts
            )));
        }
        if self.failure_history > MAX_FAILURE_HISTORY {
            return Err(SatelliteError::InvalidConfig(format!(
                "failure_history holds at most {}, got {}",
                MAX_FAILURE_HISTORY, self.failure_history
            )));
        }
        if self.auth.error_refetch_interval_ms > self.auth.refetch_interval_ms {
            return Err(SatelliteError::InvalidConfig(
                "auth.error_refetch_interval_ms exceeds auth.refetch_interval_ms".to_string(),
            ));
        }
        Ok(())
    }
}
