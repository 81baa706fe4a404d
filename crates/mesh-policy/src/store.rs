// store.rs — Versioned, read-mostly policy store.
//
// Readers get an `Arc` to an immutable config; an update swaps in a new Arc
// and never touches one already handed out, so in-flight runs keep the
// snapshot they started with.

use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::config::{PolicyConfig, PolicyPatch};
use crate::error::PolicyError;
use crate::role::Role;

#[derive(Debug)]
struct Versions {
    current: Arc<PolicyConfig>,
    history: Vec<Arc<PolicyConfig>>,
}

/// Holds the current governance configuration and every earlier version.
#[derive(Debug)]
pub struct PolicyStore {
    inner: RwLock<Versions>,
}

impl PolicyStore {
    pub fn new(initial: PolicyConfig) -> Result<Self, PolicyError> {
        initial.validate()?;
        let current = Arc::new(initial);
        Ok(Self {
            inner: RwLock::new(Versions {
                history: vec![current.clone()],
                current,
            }),
        })
    }

    /// Immutable snapshot of the current configuration.
    pub fn snapshot(&self) -> Arc<PolicyConfig> {
        self.read().current.clone()
    }

    /// A previously stored version.
    pub fn get_version(&self, version: u64) -> Result<Arc<PolicyConfig>, PolicyError> {
        self.read()
            .history
            .iter()
            .find(|p| p.version == version)
            .cloned()
            .ok_or(PolicyError::UnknownVersion(version))
    }

    /// All stored versions, oldest first.
    pub fn history(&self) -> Vec<Arc<PolicyConfig>> {
        self.read().history.clone()
    }

    /// Apply a partial update on behalf of `actor` and return the new snapshot.
    pub fn update(&self, patch: &PolicyPatch, actor: Role) -> Result<Arc<PolicyConfig>, PolicyError> {
        let mut versions = self.write();
        let next = Arc::new(versions.current.apply(patch, actor)?);
        versions.history.push(next.clone());
        versions.current = next.clone();
        tracing::info!(version = next.version, %actor, "policy updated");
        Ok(next)
    }

    fn read(&self) -> RwLockReadGuard<'_, Versions> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Versions> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for PolicyStore {
    fn default() -> Self {
        let current = Arc::new(PolicyConfig::default());
        Self {
            inner: RwLock::new(Versions {
                history: vec![current.clone()],
                current,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_is_unaffected_by_later_update() {
        let store = PolicyStore::default();
        let before = store.snapshot();
        let patch = PolicyPatch {
            p1_needs_approval: Some(false),
            ..Default::default()
        };
        let after = store.update(&patch, Role::Head).unwrap();

        assert!(before.p1_needs_approval);
        assert_eq!(before.version, 1);
        assert!(!after.p1_needs_approval);
        assert_eq!(store.snapshot().version, 2);
    }

    #[test]
    fn previous_versions_remain_readable() {
        let store = PolicyStore::default();
        let patch = PolicyPatch {
            max_auto_creates_per_hour: Some(5),
            ..Default::default()
        };
        store.update(&patch, Role::Exec).unwrap();
        assert_eq!(store.get_version(1).unwrap().max_auto_creates_per_hour, 10);
        assert_eq!(store.get_version(2).unwrap().max_auto_creates_per_hour, 5);
        assert!(store.get_version(3).is_err());
        assert_eq!(store.history().len(), 2);
    }

    #[test]
    fn forbidden_update_leaves_store_unchanged() {
        let store = PolicyStore::default();
        let patch = PolicyPatch {
            strict_mode_threshold_cents: Some(1),
            ..Default::default()
        };
        assert!(store.update(&patch, Role::Engineer).is_err());
        assert_eq!(store.snapshot().version, 1);
    }

    #[test]
    fn invalid_initial_config_is_refused() {
        let config = PolicyConfig {
            confidence_threshold: -0.1,
            ..Default::default()
        };
        assert!(PolicyStore::new(config).is_err());
    }
}
