//! ConfigStore — versioned service specs and the target pointer.
//!
//! Specs are stored under generated ids; exactly one id is the target at
//! any moment. Old specs are garbage-collected only once no running task
//! references them.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::info;
use uuid::Uuid;

use berth_spec::ServiceSpec;

use crate::error::{StoreError, StoreResult};
use crate::paths;
use crate::persister::Persister;

#[derive(Clone)]
pub struct ConfigStore {
    persister: Arc<dyn Persister>,
}

impl ConfigStore {
    pub fn new(persister: Arc<dyn Persister>) -> Self {
        Self { persister }
    }

    /// Persist a spec under a fresh id and return the id.
    pub fn store(&self, spec: &ServiceSpec) -> StoreResult<String> {
        let id = Uuid::new_v4().to_string();
        let value = serde_json::to_vec(spec)
            .map_err(|e| StoreError::Serialize(e.to_string()))?;
        self.persister.set(&paths::configuration(&id), &value)?;
        info!(config_id = %id, service = %spec.name, "configuration stored");
        Ok(id)
    }

    pub fn fetch(&self, id: &str) -> StoreResult<ServiceSpec> {
        let bytes = self.persister.get(&paths::configuration(id))?;
        serde_json::from_slice(&bytes).map_err(|e| StoreError::Deserialize(e.to_string()))
    }

    /// Point the target at an already-stored config. The target pointer is
    /// the sentinel write: it lands after the spec blob, so a crash between
    /// the two leaves an unreferenced spec rather than a dangling target.
    pub fn set_target(&self, id: &str) -> StoreResult<()> {
        self.fetch(id)?;
        self.persister.set(&paths::config_target(), id.as_bytes())?;
        info!(config_id = %id, "target configuration set");
        Ok(())
    }

    /// The current target config id. `NotFound` before the first deploy.
    pub fn target(&self) -> StoreResult<String> {
        let bytes = self.persister.get(&paths::config_target())?;
        String::from_utf8(bytes).map_err(|e| StoreError::Deserialize(e.to_string()))
    }

    pub fn list(&self) -> StoreResult<Vec<String>> {
        self.persister.list(&paths::configurations())
    }

    /// Delete configs that are neither the target nor in `referenced`.
    /// Returns the ids removed.
    pub fn prune(&self, referenced: &HashSet<String>) -> StoreResult<Vec<String>> {
        let target = match self.target() {
            Ok(id) => Some(id),
            Err(StoreError::NotFound(_)) => None,
            Err(e) => return Err(e),
        };

        let mut removed = Vec::new();
        for id in self.list()? {
            if Some(&id) == target.as_ref() || referenced.contains(&id) {
                continue;
            }
            self.persister.delete(&paths::configuration(&id))?;
            removed.push(id);
        }
        if !removed.is_empty() {
            info!(count = removed.len(), "pruned unreferenced configurations");
        }
        Ok(removed)
    }
}
