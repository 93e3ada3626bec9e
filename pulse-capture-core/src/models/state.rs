/// Connection (context) state as reported by the audio-server client library.
///
/// State transitions:
/// ```text
/// unconnected → connecting → authorizing → setting-name → ready
///                    ↓            ↓              ↓          ↓
///                 failed       failed         failed    failed / terminated
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContextState {
    Unconnected,
    Connecting,
    Authorizing,
    SettingName,
    Ready,
    Failed,
    Terminated,
}

impl ContextState {
    /// Failed or terminated; the context can never become ready again.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Failed | Self::Terminated)
    }

    /// States a connect waiter must be woken for.
    pub fn wakes_waiters(self) -> bool {
        self == Self::Ready || self.is_terminal()
    }
}

/// Record stream state as reported by the audio-server client library.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamState {
    Unconnected,
    Creating,
    Ready,
    Failed,
    Terminated,
}

impl StreamState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Failed | Self::Terminated)
    }

    pub fn wakes_waiters(self) -> bool {
        self == Self::Ready || self.is_terminal()
    }
}

/// Capture session state machine.
///
/// ```text
/// unconnected → connecting → ready → streaming → terminated
///                   ↓          ↓         ↓
///                 failed     failed    failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CaptureState {
    Unconnected,
    Connecting,
    Ready,
    Streaming,
    Terminated,
    Failed,
}

impl CaptureState {
    pub fn is_active(self) -> bool {
        matches!(self, Self::Ready | Self::Streaming)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Terminated | Self::Failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intermediate_context_states_do_not_wake() {
        for state in [
            ContextState::Unconnected,
            ContextState::Connecting,
            ContextState::Authorizing,
            ContextState::SettingName,
        ] {
            assert!(!state.wakes_waiters(), "{state:?}");
        }
        assert!(ContextState::Ready.wakes_waiters());
        assert!(ContextState::Failed.wakes_waiters());
        assert!(ContextState::Terminated.wakes_waiters());
    }

    #[test]
    fn stream_terminal_states() {
        assert!(StreamState::Failed.is_terminal());
        assert!(StreamState::Terminated.is_terminal());
        assert!(!StreamState::Ready.is_terminal());
        assert!(!StreamState::Creating.wakes_waiters());
    }
}
