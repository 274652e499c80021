//! Path-keyed registry of live devices
//!
//! Owned by the [`HostAdapter`](crate::host::HostAdapter). Entries are weak:
//! a device whose last handle has been dropped disappears from lookups on its
//! own and is swept out by [`DeviceRegistry::prune`].

use crate::host::DeviceHandle;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tracing::debug;

#[derive(Default)]
pub struct DeviceRegistry {
    devices: Mutex<HashMap<PathBuf, Weak<DeviceHandle>>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<PathBuf, Weak<DeviceHandle>>> {
        self.devices.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a device under its socket path
    ///
    /// Returns false if a live device already holds the path.
    pub fn register(&self, handle: &Arc<DeviceHandle>) -> bool {
        let mut devices = self.lock();
        let path = handle.path().to_path_buf();

        if devices
            .get(&path)
            .and_then(Weak::upgrade)
            .is_some_and(|existing| !existing.is_closed())
        {
            return false;
        }

        debug!("Registered device at {}", path.display());
        devices.insert(path, Arc::downgrade(handle));
        true
    }

    /// Remove the entry for `path`, returning the device if it is still alive
    pub fn unregister(&self, path: &Path) -> Option<Arc<DeviceHandle>> {
        let handle = self.lock().remove(path)?.upgrade();
        debug!("Unregistered device at {}", path.display());
        handle
    }

    pub fn get(&self, path: &Path) -> Option<Arc<DeviceHandle>> {
        self.lock().get(path).and_then(Weak::upgrade)
    }

    /// Every registered device that is still alive
    pub fn live_devices(&self) -> Vec<Arc<DeviceHandle>> {
        self.lock().values().filter_map(Weak::upgrade).collect()
    }

    /// Drop entries whose device is gone; returns how many were removed
    pub fn prune(&self) -> usize {
        let mut devices = self.lock();
        let before = devices.len();
        devices.retain(|_, handle| handle.strong_count() > 0);
        before - devices.len()
    }

    /// Number of entries, including ones not yet pruned
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(path: &str) -> (Arc<DeviceHandle>, async_channel::Receiver<crate::host::HostEvent>) {
        let (tx, rx) = async_channel::unbounded();
        (Arc::new(DeviceHandle::new(PathBuf::from(path), tx)), rx)
    }

    #[test]
    fn test_register_and_get() {
        let registry = DeviceRegistry::new();
        let (dev, _rx) = handle("/tmp/a.sock");

        assert!(registry.register(&dev));
        let found = registry.get(Path::new("/tmp/a.sock")).unwrap();
        assert!(Arc::ptr_eq(&found, &dev));
        assert_eq!(registry.live_devices().len(), 1);
    }

    #[test]
    fn test_duplicate_live_path_refused() {
        let registry = DeviceRegistry::new();
        let (first, _rx1) = handle("/tmp/a.sock");
        let (second, _rx2) = handle("/tmp/a.sock");

        assert!(registry.register(&first));
        assert!(!registry.register(&second));

        first.close();
        assert!(registry.register(&second));
    }

    #[test]
    fn test_weak_entries_expire() {
        let registry = DeviceRegistry::new();
        let (dev, _rx) = handle("/tmp/a.sock");
        registry.register(&dev);
        drop(dev);

        assert!(registry.get(Path::new("/tmp/a.sock")).is_none());
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.prune(), 1);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_unregister_is_idempotent() {
        let registry = DeviceRegistry::new();
        let (dev, _rx) = handle("/tmp/a.sock");
        registry.register(&dev);

        assert!(registry.unregister(Path::new("/tmp/a.sock")).is_some());
        assert!(registry.unregister(Path::new("/tmp/a.sock")).is_none());
    }
}
