use std::sync::Mutex;

use hearth_process::ComputeStatus;

/// Lifecycle phase of this compute.
///
/// Several independent loops (heartbeats, shutdown timers, the interruption
/// poller) race to advance the phase, so every setter is guarded: a request
/// that is not legal from the current phase is dropped silently.
#[derive(Debug)]
pub struct ComputeState {
    status: Mutex<ComputeStatus>,
}

impl Default for ComputeState {
    fn default() -> Self {
        Self::new()
    }
}

impl ComputeState {
    pub fn new() -> Self {
        Self {
            status: Mutex::new(ComputeStatus::Initializing),
        }
    }

    pub fn status(&self) -> ComputeStatus {
        *self.status.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_terminating_or_terminated(&self) -> bool {
        self.status().is_terminating_or_terminated()
    }

    pub fn is_initializing(&self) -> bool {
        self.status() == ComputeStatus::Initializing
    }

    pub fn report_activating(&self) {
        self.transition(ComputeStatus::Activating, |s| {
            s == ComputeStatus::Initializing
        });
    }

    pub fn report_active(&self) {
        self.transition(ComputeStatus::Active, |s| {
            matches!(s, ComputeStatus::Initializing | ComputeStatus::Activating)
        });
    }

    pub fn report_terminating(&self) {
        self.transition(ComputeStatus::Terminating, |s| {
            !s.is_terminating_or_terminated()
        });
    }

    pub fn report_interrupted(&self) {
        self.transition(ComputeStatus::Interrupted, |s| {
            s != ComputeStatus::Terminated
        });
    }

    /// Moves to `Terminated` from anywhere. Returns true only for the call
    /// that performed the move.
    pub fn report_terminated(&self) -> bool {
        self.transition(ComputeStatus::Terminated, |s| {
            s != ComputeStatus::Terminated
        })
    }

    fn transition(&self, to: ComputeStatus, allowed: impl Fn(ComputeStatus) -> bool) -> bool {
        let mut status = self.status.lock().unwrap_or_else(|e| e.into_inner());
        let from = *status;
        if !allowed(from) {
            tracing::debug!(%from, %to, "ignoring compute status transition");
            return false;
        }
        *status = to;
        drop(status);
        tracing::info!(%from, %to, "compute status changed");
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rank(s: ComputeStatus) -> u8 {
        match s {
            ComputeStatus::Initializing => 0,
            ComputeStatus::Activating => 1,
            ComputeStatus::Active => 2,
            ComputeStatus::Interrupted | ComputeStatus::Terminating => 3,
            ComputeStatus::Terminated => 4,
        }
    }

    #[test]
    fn happy_path() {
        let state = ComputeState::new();
        assert!(state.is_initializing());
        state.report_activating();
        assert_eq!(state.status(), ComputeStatus::Activating);
        state.report_active();
        assert_eq!(state.status(), ComputeStatus::Active);
        state.report_terminating();
        assert_eq!(state.status(), ComputeStatus::Terminating);
        assert!(state.report_terminated());
        assert_eq!(state.status(), ComputeStatus::Terminated);
    }

    #[test]
    fn activating_only_from_initializing() {
        let state = ComputeState::new();
        state.report_active();
        state.report_activating();
        assert_eq!(state.status(), ComputeStatus::Active);
    }

    #[test]
    fn terminating_does_not_override_interrupted() {
        let state = ComputeState::new();
        state.report_interrupted();
        state.report_terminating();
        assert_eq!(state.status(), ComputeStatus::Interrupted);
    }

    #[test]
    fn interrupted_overrides_terminating() {
        let state = ComputeState::new();
        state.report_terminating();
        state.report_interrupted();
        assert_eq!(state.status(), ComputeStatus::Interrupted);
    }

    #[test]
    fn terminated_is_absorbing() {
        let state = ComputeState::new();
        assert!(state.report_terminated());
        assert!(!state.report_terminated());
        state.report_activating();
        state.report_active();
        state.report_interrupted();
        state.report_terminating();
        assert_eq!(state.status(), ComputeStatus::Terminated);
    }

    #[test]
    fn every_report_sequence_is_monotonic() {
        // Every sequence of five report calls.
        let calls: [fn(&ComputeState); 5] = [
            ComputeState::report_activating,
            ComputeState::report_active,
            ComputeState::report_terminating,
            ComputeState::report_interrupted,
            |s| {
                s.report_terminated();
            },
        ];

        let n = calls.len();
        for mut code in 0..n.pow(5) {
            let state = ComputeState::new();
            let mut prev = state.status();
            for _ in 0..5 {
                calls[code % n](&state);
                code /= n;
                let now = state.status();
                if prev == ComputeStatus::Terminated {
                    assert_eq!(now, ComputeStatus::Terminated);
                }
                assert!(
                    rank(now) >= rank(prev),
                    "went backwards from {prev} to {now}"
                );
                prev = now;
            }
        }
    }
}
