// State management module
//
// This module provides the StateManager which wraps HelperState with thread-safe access
// using Arc<RwLock<T>> and emits change events for external observers (editor UI, CLI).

use crate::models::HelperState;
use std::sync::{Arc, RwLock};
use tokio::sync::broadcast;

/// Change events emitted when state is modified
#[derive(Clone, Debug, PartialEq)]
pub enum StateChange {
    /// Binary provisioning started
    InstallStarted,

    /// Download progress moved (fraction in `[0, 1]`)
    DownloadProgress { fraction: f32 },

    /// Binary provisioning finished
    InstallFinished { success: bool },

    /// The server process was launched
    ServerStarted { pid: u32 },

    /// The server process was stopped
    ServerStopped,

    /// A user-visible warning was raised
    Warning { message: String },
}

/// Thread-safe state manager with event emission
///
/// - [`read()`](Self::read) for reading state
/// - [`update()`](Self::update) for mutations with automatic event emission
/// - [`subscribe()`](Self::subscribe) for listening to state changes
pub struct StateManager {
    state: Arc<RwLock<HelperState>>,

    /// Multiple subscribers can listen for state changes
    state_tx: broadcast::Sender<StateChange>,
}

impl StateManager {
    /// Create a new StateManager with default state and a 100 event buffer
    pub fn new() -> Self {
        let (state_tx, _) = broadcast::channel(100);
        Self {
            state: Arc::new(RwLock::new(HelperState::default())),
            state_tx,
        }
    }

    /// Clone of the current state
    pub fn snapshot(&self) -> HelperState {
        self.read(HelperState::clone)
    }

    /// Execute a function with read access to the state
    pub fn read<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&HelperState) -> R,
    {
        // A poisoned lock still holds consistent plain data
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        f(&state)
    }

    /// Update the state and emit change events
    ///
    /// # Returns
    /// The StateChange events that were emitted
    pub fn update<F>(&self, update_fn: F) -> Vec<StateChange>
    where
        F: FnOnce(&mut HelperState),
    {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        let old_state = state.clone();

        update_fn(&mut state);

        let changes = Self::detect_changes(&old_state, &state);
        for change in &changes {
            // It's OK if no one is listening
            let _ = self.state_tx.send(change.clone());
        }

        changes
    }

    /// Subscribe to state change events
    pub fn subscribe(&self) -> broadcast::Receiver<StateChange> {
        self.state_tx.subscribe()
    }

    fn detect_changes(old: &HelperState, new: &HelperState) -> Vec<StateChange> {
        let mut changes = Vec::new();

        if old.is_installing != new.is_installing && new.is_installing {
            changes.push(StateChange::InstallStarted);
        }

        if old.download_progress != new.download_progress {
            changes.push(StateChange::DownloadProgress {
                fraction: new.download_progress,
            });
        }

        if old.is_installing != new.is_installing && !new.is_installing {
            changes.push(StateChange::InstallFinished {
                success: new.last_install_succeeded,
            });
        }

        if old.server_pid != new.server_pid || old.is_running != new.is_running {
            match (new.is_running, new.server_pid) {
                (true, Some(pid)) => changes.push(StateChange::ServerStarted { pid }),
                (false, _) if old.is_running => changes.push(StateChange::ServerStopped),
                _ => {}
            }
        }

        if old.last_warning != new.last_warning {
            if let Some(message) = &new.last_warning {
                changes.push(StateChange::Warning {
                    message: message.clone(),
                });
            }
        }

        changes
    }

    // Convenience methods for common state updates

    pub fn begin_install(&self) -> Vec<StateChange> {
        self.update(|state| {
            state.is_installing = true;
            state.download_progress = 0.0;
            state.last_install_succeeded = false;
        })
    }

    pub fn set_download_progress(&self, fraction: f32) -> Vec<StateChange> {
        self.update(|state| state.download_progress = fraction.clamp(0.0, 1.0))
    }

    pub fn finish_install(&self, success: bool) -> Vec<StateChange> {
        self.update(|state| {
            if success {
                state.download_progress = 1.0;
            }
            state.last_install_succeeded = success;
            state.is_installing = false;
        })
    }

    pub fn server_started(&self, pid: u32) -> Vec<StateChange> {
        self.update(|state| {
            state.is_running = true;
            state.server_pid = Some(pid);
        })
    }

    pub fn server_stopped(&self) -> Vec<StateChange> {
        self.update(HelperState::reset_process_state)
    }

    /// Record a user-visible warning
    pub fn warn(&self, message: impl Into<String>) -> Vec<StateChange> {
        let message = message.into();
        tracing::warn!("{}", message);
        let mut changes = self.update(|state| state.last_warning = Some(message.clone()));
        if changes.is_empty() {
            // Same text as the last warning, still a new occurrence
            let change = StateChange::Warning { message };
            let _ = self.state_tx.send(change.clone());
            changes.push(change);
        }
        changes
    }
}

impl Default for StateManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_install_lifecycle_events() {
        let manager = StateManager::new();

        let changes = manager.begin_install();
        assert_eq!(changes, vec![StateChange::InstallStarted]);

        let changes = manager.set_download_progress(0.5);
        assert_eq!(changes, vec![StateChange::DownloadProgress { fraction: 0.5 }]);

        let changes = manager.finish_install(true);
        assert_eq!(
            changes,
            vec![
                StateChange::DownloadProgress { fraction: 1.0 },
                StateChange::InstallFinished { success: true },
            ]
        );
    }

    #[test]
    fn test_complete_download_then_failed_install() {
        let manager = StateManager::new();
        manager.begin_install();
        manager.set_download_progress(1.0);

        assert_eq!(
            manager.finish_install(false),
            vec![StateChange::InstallFinished { success: false }]
        );
        assert!(!manager.read(|s| s.last_install_succeeded));
    }

    #[test]
    fn test_progress_is_clamped() {
        let manager = StateManager::new();
        manager.set_download_progress(1.7);
        assert_eq!(manager.read(|s| s.download_progress), 1.0);
    }

    #[test]
    fn test_server_start_stop_events() {
        let manager = StateManager::new();

        assert_eq!(
            manager.server_started(1234),
            vec![StateChange::ServerStarted { pid: 1234 }]
        );
        assert!(manager.read(|s| s.is_running));

        assert_eq!(manager.server_stopped(), vec![StateChange::ServerStopped]);
        assert!(manager.snapshot().server_pid.is_none());

        // stopping again changes nothing
        assert!(manager.server_stopped().is_empty());
    }

    #[tokio::test]
    async fn test_subscribe_receives_warning() {
        let manager = StateManager::new();
        let mut rx = manager.subscribe();

        manager.warn("server directory not found");

        let event = rx.recv().await.unwrap();
        assert_eq!(
            event,
            StateChange::Warning {
                message: "server directory not found".to_string()
            }
        );
    }
}
