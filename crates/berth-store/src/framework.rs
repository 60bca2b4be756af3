//! FrameworkStore — the framework identity assigned by the master.

use std::sync::Arc;

use tracing::info;

use berth_proto::FrameworkId;

use crate::error::{StoreError, StoreResult};
use crate::paths;
use crate::persister::Persister;

/// Thin wrapper persisting the framework id. The master assigns the id on
/// first registration; it must be presented on every re-registration after
/// a restart.
#[derive(Clone)]
pub struct FrameworkStore {
    persister: Arc<dyn Persister>,
}

impl FrameworkStore {
    pub fn new(persister: Arc<dyn Persister>) -> Self {
        Self { persister }
    }

    pub fn store_framework_id(&self, id: &FrameworkId) -> StoreResult<()> {
        self.persister.set(&paths::framework_id(), id.as_bytes())?;
        info!(framework_id = %id, "framework id stored");
        Ok(())
    }

    pub fn fetch_framework_id(&self) -> StoreResult<Option<FrameworkId>> {
        match self.persister.get(&paths::framework_id()) {
            Ok(bytes) => {
                let id = String::from_utf8(bytes)
                    .map_err(|e| StoreError::Deserialize(e.to_string()))?;
                Ok(Some(id))
            }
            Err(StoreError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Forget the framework id. Used by the uninstall deregister step.
    pub fn clear_framework_id(&self) -> StoreResult<()> {
        match self.persister.delete(&paths::framework_id()) {
            Ok(()) | Err(StoreError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persister::RedbPersister;

    fn store() -> FrameworkStore {
        FrameworkStore::new(Arc::new(RedbPersister::open_in_memory().unwrap()))
    }

    #[test]
    fn fetch_before_store_is_none() {
        assert_eq!(store().fetch_framework_id().unwrap(), None);
    }

    #[test]
    fn store_and_fetch() {
        let s = store();
        s.store_framework_id(&"fw-123".to_string()).unwrap();
        assert_eq!(s.fetch_framework_id().unwrap(), Some("fw-123".to_string()));
    }

    #[test]
    fn clear_is_idempotent() {
        let s = store();
        s.store_framework_id(&"fw-123".to_string()).unwrap();
        s.clear_framework_id().unwrap();
        s.clear_framework_id().unwrap();
        assert_eq!(s.fetch_framework_id().unwrap(), None);
    }
}
