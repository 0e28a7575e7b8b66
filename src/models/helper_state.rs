/// Observable state of the patch server supervisor.
///
/// Wrapped in `Arc<RwLock<HelperState>>` by [`crate::state::StateManager`];
/// never mutate it directly, go through the manager so change events are emitted.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct HelperState {
    // Provisioning
    pub is_installing: bool,
    pub download_progress: f32,
    pub last_install_succeeded: bool,

    // Process
    pub is_running: bool,
    pub server_pid: Option<u32>,

    // Last user-visible warning (provisioning/start failures)
    pub last_warning: Option<String>,
}

impl HelperState {
    /// Clear everything tied to a running server.
    pub fn reset_process_state(&mut self) {
        self.is_running = false;
        self.server_pid = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_state() {
        let state = HelperState::default();
        assert!(!state.is_running);
        assert!(!state.is_installing);
        assert_eq!(state.download_progress, 0.0);
        assert!(state.server_pid.is_none());
    }

    #[test]
    fn test_reset_process_state() {
        let mut state = HelperState {
            is_running: true,
            server_pid: Some(42),
            last_warning: Some("kept".to_string()),
            ..HelperState::default()
        };
        state.reset_process_state();

        assert!(!state.is_running);
        assert!(state.server_pid.is_none());
        assert_eq!(state.last_warning.as_deref(), Some("kept"));
    }
}
