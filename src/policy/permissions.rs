//! Which satellites to engage with.
//!
//! Keeping away from other people's satellites saves connections, battery
//! and latency, and avoids touching state that is not ours.

use crate::auth::{unix_time_ms, AuthorizationCache};
use crate::error::{SatelliteError, Status};
use crate::events::lock_unpoisoned;
use crate::metadata::{MetadataCodec, TagMetadataCodec};
use crate::satellite::{Advertisement, Satellite};
use heapless::Vec as BoundedVec;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, error};

pub const MAX_USER_FILTER: usize = 16;

pub type UserFilter = BoundedVec<u32, MAX_USER_FILTER>;

pub trait PermissionsPolicy: Send + Sync {
    /// Cheap filter applied before connecting.
    fn should_handle_advertisement(&self, _advertisement: &Advertisement) -> bool {
        true
    }

    /// Applied once the satellite's state is known. The manager accepts
    /// fail-safe satellites whatever this returns.
    fn should_handle_satellite(&self, _satellite: &Satellite) -> bool {
        true
    }

    fn should_transfer_collections(&self, _satellite: &Satellite) -> bool {
        true
    }
}

/// Engages with every satellite.
#[derive(Debug)]
pub struct AnyUserPermissions {
    transfer: AtomicBool,
}

impl AnyUserPermissions {
    pub fn new() -> Self {
        Self {
            transfer: AtomicBool::new(true),
        }
    }

    pub fn set_should_transfer(&self, enabled: bool) {
        self.transfer.store(enabled, Ordering::SeqCst);
    }
}

impl Default for AnyUserPermissions {
    fn default() -> Self {
        Self::new()
    }
}

impl PermissionsPolicy for AnyUserPermissions {
    fn should_transfer_collections(&self, _satellite: &Satellite) -> bool {
        self.transfer.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PermissionMode {
    AnyUser,
    /// Connect to satellites owned by one of these users or by nobody;
    /// transfer only from satellites owned by one of these users.
    MultiUser(UserFilter),
}

#[derive(Debug)]
struct Settings {
    mode: PermissionMode,
    should_transfer: bool,
}

/// Filters satellites by owner, optionally requiring an authorization token.
pub struct UserPermissions {
    settings: Mutex<Settings>,
    codec: Box<dyn MetadataCodec>,
    authorization: Option<Arc<AuthorizationCache>>,
    clock: fn() -> u64,
}

impl UserPermissions {
    pub fn new() -> Self {
        Self::with_codec(Box::new(TagMetadataCodec))
    }

    pub fn with_codec(codec: Box<dyn MetadataCodec>) -> Self {
        Self {
            settings: Mutex::new(Settings {
                mode: PermissionMode::AnyUser,
                should_transfer: true,
            }),
            codec,
            authorization: None,
            clock: unix_time_ms,
        }
    }

    pub fn with_authorization(mut self, authorization: Arc<AuthorizationCache>) -> Self {
        self.authorization = Some(authorization);
        self
    }

    /// Overrides the unix-millisecond clock used for token expiry.
    pub fn with_clock(mut self, clock: fn() -> u64) -> Self {
        self.clock = clock;
        self
    }

    /// Single user. `0` leaves the filter empty, so only unassigned
    /// satellites pass the advertisement filter.
    pub fn set_single_user(&self, user_id: u32) {
        let mut filter = UserFilter::new();
        if user_id != 0 {
            let _ = filter.push(user_id);
        }
        lock_unpoisoned(&self.settings).mode = PermissionMode::MultiUser(filter);
    }

    pub fn set_multi_user(&self, user_ids: &[u32]) -> Status {
        let filter = UserFilter::from_slice(user_ids).map_err(|_| {
            SatelliteError::InvalidConfig(format!(
                "user filter holds at most {} ids, got {}",
                MAX_USER_FILTER,
                user_ids.len()
            ))
        })?;
        lock_unpoisoned(&self.settings).mode = PermissionMode::MultiUser(filter);
        Ok(())
    }

    pub fn set_any_user(&self) {
        lock_unpoisoned(&self.settings).mode = PermissionMode::AnyUser;
    }

    pub fn set_should_transfer(&self, enabled: bool) {
        lock_unpoisoned(&self.settings).should_transfer = enabled;
    }

    pub fn mode(&self) -> PermissionMode {
        lock_unpoisoned(&self.settings).mode.clone()
    }

    /// Token gate. Passes trivially when no authorization cache is attached.
    fn is_authorized(&self, satellite: &Satellite, refresh: bool) -> bool {
        let Some(authorization) = &self.authorization else {
            return true;
        };
        let Some(state) = satellite.state() else {
            return false;
        };
        let serial = &state.persistent.serial_number;
        let now = (self.clock)();
        if refresh {
            authorization.update_if_necessary(serial, now);
        }
        authorization.has_token(serial, now)
    }

    fn user_id_of(&self, satellite: &Satellite) -> Option<u32> {
        let state = satellite.state()?;
        let token = self
            .authorization
            .as_ref()
            .and_then(|auth| auth.cached_token(&state.persistent.serial_number, (self.clock)()));
        match self.codec.parse_state(state, token.as_deref()) {
            Ok(metadata) => metadata.user_id,
            Err(e) => {
                error!(satellite = %satellite.id(), "Failed to read owner metadata: {}", e);
                None
            }
        }
    }

    fn owned_by_filtered_user(&self, satellite: &Satellite, filter: &UserFilter) -> bool {
        self.user_id_of(satellite)
            .map(|user_id| filter.contains(&user_id))
            .unwrap_or(false)
    }
}

impl Default for UserPermissions {
    fn default() -> Self {
        Self::new()
    }
}

impl PermissionsPolicy for UserPermissions {
    fn should_handle_advertisement(&self, advertisement: &Advertisement) -> bool {
        let PermissionMode::MultiUser(filter) = self.mode() else {
            return true;
        };
        let fingerprint = advertisement.manufacturer_data.persistent_state_fingerprint;
        let matches = filter
            .iter()
            .any(|&user_id| self.codec.fingerprint_matches_user(fingerprint, user_id))
            || self.codec.fingerprint_matches_no_user(fingerprint);
        if !matches {
            debug!(satellite = %advertisement.id, fingerprint, "Advertisement does not match user filter");
        }
        matches
    }

    fn should_handle_satellite(&self, satellite: &Satellite) -> bool {
        if satellite.is_in_fail_safe_mode() {
            return true;
        }
        if !self.is_authorized(satellite, true) {
            return false;
        }
        match self.mode() {
            PermissionMode::AnyUser => true,
            PermissionMode::MultiUser(filter) => self.owned_by_filtered_user(satellite, &filter),
        }
    }

    fn should_transfer_collections(&self, satellite: &Satellite) -> bool {
        let (mode, should_transfer) = {
            let settings = lock_unpoisoned(&self.settings);
            (settings.mode.clone(), settings.should_transfer)
        };
        if !should_transfer || !self.is_authorized(satellite, false) {
            return false;
        }
        match mode {
            PermissionMode::AnyUser => true,
            PermissionMode::MultiUser(filter) => self.owned_by_filtered_user(satellite, &filter),
        }
    }
}
