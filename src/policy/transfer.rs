use crate::error::SatelliteError;
use crate::indexes::CollectionIndexes;
use crate::satellite::SatelliteId;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, error, info, warn};

/// Chooses what to transfer and receives the results.
///
/// Callbacks run on the transfer pipeline; anything slow should be handed
/// off (see [`EventSinkTransfers`]).
pub trait CollectionTransferPolicy: Send + Sync {
    /// Start point within `[range.start, range.end]`; `range.end` means
    /// "nothing". Never consulted for an empty range.
    fn first_collection_to_transfer(&self, range: CollectionIndexes, satellite: &SatelliteId) -> u16;

    fn will_transfer_collections(&self, _range: CollectionIndexes, _satellite: &SatelliteId) {}

    fn collection_transfer_did_finish(&self, data: &[u8], index: u16, satellite: &SatelliteId);

    /// Called once `index` has exhausted its attempts for this connection.
    /// The index stays pending and is retried on the next connection.
    fn collection_transfer_did_fail(&self, error: &SatelliteError, index: u16, satellite: &SatelliteId);
}

/// Transfers every resident collection.
#[derive(Debug, Clone, Copy, Default)]
pub struct TransferAll;

impl CollectionTransferPolicy for TransferAll {
    fn first_collection_to_transfer(&self, range: CollectionIndexes, satellite: &SatelliteId) -> u16 {
        debug!(satellite = %satellite, "Transfer all over {}", range);
        range.start_index
    }

    fn will_transfer_collections(&self, range: CollectionIndexes, satellite: &SatelliteId) {
        info!(satellite = %satellite, "Will transfer {} collections", range.len());
    }

    fn collection_transfer_did_finish(&self, data: &[u8], index: u16, satellite: &SatelliteId) {
        info!(satellite = %satellite, index, "Collection transferred ({} bytes)", data.len());
    }

    fn collection_transfer_did_fail(&self, error: &SatelliteError, index: u16, satellite: &SatelliteId) {
        error!(satellite = %satellite, index, "Collection transfer failed: {}", error);
    }
}

/// Transfers only the most recent collection.
#[derive(Debug, Clone, Copy, Default)]
pub struct LatestOnly;

impl CollectionTransferPolicy for LatestOnly {
    fn first_collection_to_transfer(&self, range: CollectionIndexes, _satellite: &SatelliteId) -> u16 {
        if range.is_empty() {
            range.end_index
        } else {
            range.end_index.wrapping_sub(1)
        }
    }

    fn collection_transfer_did_finish(&self, data: &[u8], index: u16, satellite: &SatelliteId) {
        info!(satellite = %satellite, index, "Latest collection transferred ({} bytes)", data.len());
    }

    fn collection_transfer_did_fail(&self, error: &SatelliteError, index: u16, satellite: &SatelliteId) {
        error!(satellite = %satellite, index, "Latest collection transfer failed: {}", error);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CollectionEvent {
    WillTransfer {
        satellite: SatelliteId,
        range: CollectionIndexes,
    },
    Finished {
        satellite: SatelliteId,
        index: u16,
        data: Vec<u8>,
    },
    Failed {
        satellite: SatelliteId,
        index: u16,
        error: SatelliteError,
    },
}

/// Forwards results into a tokio channel so processing happens off the
/// transfer pipeline.
#[derive(Debug, Clone)]
pub struct EventSinkTransfers {
    sender: UnboundedSender<CollectionEvent>,
    latest_only: bool,
}

impl EventSinkTransfers {
    pub fn new(sender: UnboundedSender<CollectionEvent>) -> Self {
        Self {
            sender,
            latest_only: false,
        }
    }

    pub fn latest_only(mut self) -> Self {
        self.latest_only = true;
        self
    }

    fn forward(&self, event: CollectionEvent) {
        if self.sender.send(event).is_err() {
            warn!("Collection receiver dropped; discarding transfer event");
        }
    }
}

impl CollectionTransferPolicy for EventSinkTransfers {
    fn first_collection_to_transfer(&self, range: CollectionIndexes, satellite: &SatelliteId) -> u16 {
        if self.latest_only {
            LatestOnly.first_collection_to_transfer(range, satellite)
        } else {
            range.start_index
        }
    }

    fn will_transfer_collections(&self, range: CollectionIndexes, satellite: &SatelliteId) {
        self.forward(CollectionEvent::WillTransfer {
            satellite: satellite.clone(),
            range,
        });
    }

    fn collection_transfer_did_finish(&self, data: &[u8], index: u16, satellite: &SatelliteId) {
        self.forward(CollectionEvent::Finished {
            satellite: satellite.clone(),
            index,
            data: data.to_vec(),
        });
    }

    fn collection_transfer_did_fail(&self, error: &SatelliteError, index: u16, satellite: &SatelliteId) {
        self.forward(CollectionEvent::Failed {
            satellite: satellite.clone(),
            index,
            error: error.clone(),
        });
    }
}
