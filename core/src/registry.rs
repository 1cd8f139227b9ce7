//! Label-keyed registry of managed shells.
//!
//! The registry is the sole owner of shell instances; everything else works
//! with labels and short-lived `Arc` clones. `insert` is the atomic claim
//! that makes labels unique even under concurrent starts.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::MutexGuard;

use crate::error::Result;
use crate::error::SupervisorError;
use crate::shell::ManagedShell;

#[derive(Debug, Default)]
pub struct ShellRegistry {
    shells: StdMutex<HashMap<String, Arc<ManagedShell>>>,
}

impl ShellRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<ManagedShell>>> {
        self.shells.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn insert(&self, shell: Arc<ManagedShell>) -> Result<()> {
        let mut shells = self.lock();
        let label = shell.label().to_string();
        if shells.contains_key(&label) {
            return Err(SupervisorError::DuplicateLabel(label));
        }
        shells.insert(label, shell);
        Ok(())
    }

    pub fn get(&self, label: &str) -> Result<Arc<ManagedShell>> {
        self.lock()
            .get(label)
            .cloned()
            .ok_or_else(|| SupervisorError::NotFound(label.to_string()))
    }

    pub fn remove(&self, label: &str) -> Option<Arc<ManagedShell>> {
        self.lock().remove(label)
    }

    pub fn list(&self) -> Vec<Arc<ManagedShell>> {
        self.lock().values().cloned().collect()
    }

    /// Shells the scheduler still needs to drive.
    pub fn non_terminal(&self) -> Vec<Arc<ManagedShell>> {
        self.lock()
            .values()
            .filter(|shell| !shell.state().is_terminal())
            .cloned()
            .collect()
    }

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
    use crate::classifier::EventClassifier;
    use crate::config::SupervisorConfig;

    fn shell(label: &str) -> Arc<ManagedShell> {
        let classifier = match EventClassifier::new(None, None) {
            Ok(c) => c,
            Err(e) => panic!("classifier failed to build: {e}"),
        };
        Arc::new(ManagedShell::new(
            label.to_string(),
            "true".to_string(),
            classifier,
            30_000,
            SupervisorConfig::fast(),
        ))
    }

    #[test]
    fn duplicate_labels_are_rejected() {
        let registry = ShellRegistry::new();
        assert!(registry.insert(shell("web")).is_ok());
        let err = match registry.insert(shell("web")) {
            Ok(()) => panic!("expected DuplicateLabel"),
            Err(err) => err,
        };
        assert_eq!(err.kind(), "DuplicateLabel");
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn lookup_and_removal() {
        let registry = ShellRegistry::new();
        assert!(registry.insert(shell("db")).is_ok());
        assert!(registry.get("db").is_ok());
        assert_eq!(
            registry.get("missing").map(|_| ()).map_err(|e| e.kind()),
            Err("NotFound")
        );
        assert!(registry.remove("db").is_some());
        assert!(registry.is_empty());
    }
}
