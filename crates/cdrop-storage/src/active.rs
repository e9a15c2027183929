//! Process-wide pointer to the driver receiving new uploads

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use cdrop_core::types::DriverKind;
use tracing::info;

use crate::driver::StorageDriver;

/// Swappable active driver plus every driver seen so far, so records stored
/// before a swap stay readable through the driver that holds them.
#[derive(Clone)]
pub struct ActiveDriver {
    inner: Arc<RwLock<Arc<dyn StorageDriver>>>,
    known: Arc<RwLock<HashMap<(DriverKind, String), Arc<dyn StorageDriver>>>>,
}

impl ActiveDriver {
    pub fn new(driver: Arc<dyn StorageDriver>) -> Self {
        let mut known = HashMap::new();
        known.insert(registry_key(driver.as_ref()), Arc::clone(&driver));
        Self {
            inner: Arc::new(RwLock::new(driver)),
            known: Arc::new(RwLock::new(known)),
        }
    }

    /// The driver for new work. Callers keep the returned `Arc` for the
    /// duration of an operation, so a concurrent swap does not affect them.
    pub fn current(&self) -> Arc<dyn StorageDriver> {
        Arc::clone(&self.inner.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Make `driver` active, returning the previous one.
    pub fn swap(&self, driver: Arc<dyn StorageDriver>) -> Arc<dyn StorageDriver> {
        self.register(Arc::clone(&driver));
        let mut guard = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        info!(from = %guard.name(), to = %driver.name(), "active storage driver swapped");
        std::mem::replace(&mut *guard, driver)
    }

    /// Make a driver available for reads without activating it. A driver
    /// for the same kind and bucket replaces the earlier one.
    pub fn register(&self, driver: Arc<dyn StorageDriver>) {
        self.known
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(registry_key(driver.as_ref()), driver);
    }

    /// Driver holding objects of the given kind in `bucket`, if one is known.
    /// Local drivers have an empty bucket.
    pub fn lookup(&self, kind: DriverKind, bucket: &str) -> Option<Arc<dyn StorageDriver>> {
        self.known
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(kind, bucket.to_string()))
            .cloned()
    }
}

fn registry_key(driver: &dyn StorageDriver) -> (DriverKind, String) {
    (driver.kind(), driver.bucket().to_string())
}

impl std::fmt::Debug for ActiveDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActiveDriver")
            .field("current", &self.current().name())
            .finish()
    }
}
