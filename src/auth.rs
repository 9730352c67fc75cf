//! Authorization tokens per satellite hardware id.
//!
//! Tokens come from an external [`TokenSource`]; this cache decides when to
//! ask for one and which cached tokens are still usable. Times are unix
//! milliseconds supplied by the caller.

use crate::error::{Result, SatelliteError};
use crate::events::lock_unpoisoned;
use arrayvec::ArrayString;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::{debug, info, warn};

pub const MAX_HARDWARE_ID_LEN: usize = 64;

const DEFAULT_REFETCH_INTERVAL_MS: u64 = 60 * 60 * 1000;
const DEFAULT_ERROR_REFETCH_INTERVAL_MS: u64 = 30 * 1000;
const DEFAULT_EXPIRY_MARGIN_MS: u64 = 60 * 1000;

pub type HardwareId = ArrayString<MAX_HARDWARE_ID_LEN>;

/// Strips the `:` separators from a serial or address.
pub fn standardize_hardware_id(raw: &str) -> Result<HardwareId> {
    let mut id = HardwareId::new();
    for c in raw.chars().filter(|&c| c != ':') {
        id.try_push(c).map_err(|_| {
            SatelliteError::Metadata(format!("hardware id longer than {} bytes: {}", MAX_HARDWARE_ID_LEN, raw))
        })?;
    }
    Ok(id)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenResponse {
    Token { value: String, expires_at_ms: u64 },
    /// The hardware id has no entitlement; any cached token is dropped.
    NoMembership,
}

pub trait TokenSource: Send + Sync {
    fn fetch_token(&self, hardware_id: &str) -> Result<TokenResponse>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthConfig {
    pub refetch_interval_ms: u64,
    pub error_refetch_interval_ms: u64,
    /// Tokens expiring within this margin are refreshed even inside the
    /// back-off window.
    pub expiry_margin_ms: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            refetch_interval_ms: DEFAULT_REFETCH_INTERVAL_MS,
            error_refetch_interval_ms: DEFAULT_ERROR_REFETCH_INTERVAL_MS,
            expiry_margin_ms: DEFAULT_EXPIRY_MARGIN_MS,
        }
    }
}

#[derive(Debug, Clone)]
struct CachedToken {
    value: String,
    expires_at_ms: u64,
}

#[derive(Debug, Default)]
struct CacheState {
    tokens: HashMap<HardwareId, CachedToken>,
    next_fetch_ms: HashMap<HardwareId, u64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthStats {
    pub fetches: u32,
    pub fetch_errors: u32,
    pub tokens_stored: u32,
    pub tokens_cleared: u32,
}

pub struct AuthorizationCache {
    source: Box<dyn TokenSource>,
    config: AuthConfig,
    state: Mutex<CacheState>,
    stats: Mutex<AuthStats>,
}

impl AuthorizationCache {
    pub fn new(source: Box<dyn TokenSource>) -> Self {
        Self::with_config(source, AuthConfig::default())
    }

    pub fn with_config(source: Box<dyn TokenSource>, config: AuthConfig) -> Self {
        Self {
            source,
            config,
            state: Mutex::new(CacheState::default()),
            stats: Mutex::new(AuthStats::default()),
        }
    }

    /// Fetches a token for `hardware_id` unless one was requested recently
    /// and the cached one is not about to expire.
    pub fn update_if_necessary(&self, hardware_id: &str, now_ms: u64) {
        let id = match standardize_hardware_id(hardware_id) {
            Ok(id) => id,
            Err(e) => {
                warn!("Skipping token refresh: {}", e);
                return;
            }
        };

        {
            let mut state = lock_unpoisoned(&self.state);
            if let Some(&next_fetch) = state.next_fetch_ms.get(&id) {
                if now_ms < next_fetch {
                    let expiring_soon = state
                        .tokens
                        .get(&id)
                        .filter(|token| token.expires_at_ms > now_ms)
                        .map(|token| token.expires_at_ms - now_ms < self.config.expiry_margin_ms);
                    match expiring_soon {
                        Some(true) => {}
                        _ => return,
                    }
                }
            }
            state
                .next_fetch_ms
                .insert(id, now_ms.saturating_add(self.config.refetch_interval_ms));
        }

        debug!(hardware_id = %id, "Fetching authorization token");
        lock_unpoisoned(&self.stats).fetches += 1;
        // The source may block; the cache lock is not held across it.
        let response = self.source.fetch_token(&id);

        let mut state = lock_unpoisoned(&self.state);
        match response {
            Ok(TokenResponse::Token { value, expires_at_ms }) => {
                info!(hardware_id = %id, "Stored authorization token");
                state.tokens.insert(id, CachedToken { value, expires_at_ms });
                lock_unpoisoned(&self.stats).tokens_stored += 1;
            }
            Ok(TokenResponse::NoMembership) => {
                info!(hardware_id = %id, "No authorization available");
                if state.tokens.remove(&id).is_some() {
                    lock_unpoisoned(&self.stats).tokens_cleared += 1;
                }
            }
            Err(e) => {
                warn!(hardware_id = %id, "Token fetch failed: {}", e);
                state
                    .next_fetch_ms
                    .insert(id, now_ms.saturating_add(self.config.error_refetch_interval_ms));
                lock_unpoisoned(&self.stats).fetch_errors += 1;
            }
        }
    }

    /// Cached token if present and unexpired.
    pub fn cached_token(&self, hardware_id: &str, now_ms: u64) -> Option<String> {
        let id = standardize_hardware_id(hardware_id).ok()?;
        lock_unpoisoned(&self.state)
            .tokens
            .get(&id)
            .filter(|token| token.expires_at_ms > now_ms)
            .map(|token| token.value.clone())
    }

    pub fn has_token(&self, hardware_id: &str, now_ms: u64) -> bool {
        self.cached_token(hardware_id, now_ms).is_some()
    }

    pub fn stats(&self) -> AuthStats {
        *lock_unpoisoned(&self.stats)
    }
}

/// Unix time in milliseconds.
pub fn unix_time_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}
