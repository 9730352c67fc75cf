pub mod permissions;
pub mod transfer;
pub mod update;

pub use permissions::{AnyUserPermissions, PermissionMode, PermissionsPolicy, UserPermissions};
pub use transfer::{CollectionEvent, CollectionTransferPolicy, EventSinkTransfers, LatestOnly, TransferAll};
pub use update::{NoUpdates, StaticUpdates, UpdatePolicy};

use std::sync::Arc;

/// The pluggable policies a manager is built with.
#[derive(Clone)]
pub struct Environment {
    pub permissions: Arc<dyn PermissionsPolicy>,
    pub updates: Arc<dyn UpdatePolicy>,
    pub transfers: Arc<dyn CollectionTransferPolicy>,
}

impl Environment {
    /// Accept every satellite, push no updates, transfer everything.
    pub fn new() -> Self {
        Self {
            permissions: Arc::new(AnyUserPermissions::new()),
            updates: Arc::new(NoUpdates),
            transfers: Arc::new(TransferAll),
        }
    }

    pub fn with_permissions(mut self, permissions: Arc<dyn PermissionsPolicy>) -> Self {
        self.permissions = permissions;
        self
    }

    pub fn with_updates(mut self, updates: Arc<dyn UpdatePolicy>) -> Self {
        self.updates = updates;
        self
    }

    pub fn with_transfers(mut self, transfers: Arc<dyn CollectionTransferPolicy>) -> Self {
        self.transfers = transfers;
        self
    }
}

impl Default for Environment {
    fn default() -> Self {
        Self::new()
    }
}
