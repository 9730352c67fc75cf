//! # Haversine
//!
//! Session manager for wireless sensor satellites: discovery, permission
//! evaluation, connection lifecycle and resumable transfer of the numbered
//! data collections each satellite stores.
//!
//! ## Features
//!
//! - **Discovery**: one table entry and one discovery event per satellite, however often it advertises
//! - **Pluggable policies**: permissions, update delivery and transfer selection are traits
//! - **Resumable transfer**: indexes leave the pending set only when confirmed, across reconnects
//! - **Modular indexes**: 16-bit collection indexes compared in the modular ring
//! - **Event channels**: typed publish/subscribe with drop-to-unsubscribe handles
//! - **Async driver**: tokio event pump with per-satellite ordering
//!
//! ## Quick Start
//!
//! ```rust
//! use haversine::{Environment, ManagerConfig, SatelliteManager};
//! use haversine::simulator::{SimulatedTransport, SimulatorConfig};
//! use std::sync::Arc;
//!
//! let (transport, mut events) = SimulatedTransport::new(SimulatorConfig::default());
//! let manager = SatelliteManager::new(Arc::new(transport), Environment::new(), ManagerConfig::default());
//!
//! let _discovered = manager.discovery_events().subscribe(|satellite| {
//!     println!("found {}", satellite.id());
//! });
//! manager.scan_for_satellites().unwrap();
//!
//! while let Ok(event) = events.try_recv() {
//!     manager.handle_event(event);
//! }
//! ```
//!
//! ## Architecture
//!
//! - [`manager`] - Orchestrator and public API
//! - [`satellite`] - Per-device aggregate and reported state
//! - [`transfer`] - Transfer sessions and pending-index bookkeeping
//! - [`policy`] - Permission, update and transfer policies
//! - [`events`] - Event channels and subscriptions
//! - [`transport`] - Radio boundary
//! - [`pump`] - Async event driver
//! - [`simulator`] - In-memory transport

#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]

pub mod auth;
pub mod config;
pub mod error;
pub mod events;
pub mod indexes;
pub mod manager;
pub mod metadata;
pub mod policy;
pub mod pump;
pub mod satellite;
pub mod simulator;
pub mod transfer;
pub mod transport;

// Re-export main public types for convenience
pub use config::ManagerConfig;
pub use error::{Result, SatelliteError, Status};
pub use events::{EventChannel, EventSource, Subscription};
pub use indexes::CollectionIndexes;
pub use manager::{ManagerSnapshot, SatelliteManager, TransferJob};
pub use policy::Environment;
pub use pump::EventPump;
pub use satellite::{Advertisement, Satellite, SatelliteId, SatelliteState};
pub use transport::{AdapterState, HardwareVersion, Transport, TransportEvent};
