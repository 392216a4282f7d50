use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle of the real-time scheduler.
///
/// ```text
/// Idle -> Armed -> Running -> Draining -> Stopped
///                  Running -> Faulted  -> Stopped
///         any state        -> Stopped
///                  Stopped -> Armed   (re-arm)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SchedulerState {
    Idle,
    Armed,
    Running,
    Draining,
    Faulted,
    Stopped,
}

impl SchedulerState {
    pub fn can_transition_to(self, next: SchedulerState) -> bool {
        use SchedulerState::*;
        match (self, next) {
            (Stopped, Stopped) => false,
            (_, Stopped) => true,
            (Idle | Stopped, Armed) => true,
            (Armed, Running) => true,
            (Armed | Running, Draining) => true,
            (Running, Faulted) => true,
            _ => false,
        }
    }

    /// Whether an output sender is attached in this state.
    pub fn holds_output(self) -> bool {
        matches!(
            self,
            SchedulerState::Armed | SchedulerState::Running | SchedulerState::Draining
        )
    }

    pub fn can_arm(self) -> bool {
        self.can_transition_to(SchedulerState::Armed)
    }
}

impl fmt::Display for SchedulerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SchedulerState::Idle => "idle",
            SchedulerState::Armed => "armed",
            SchedulerState::Running => "running",
            SchedulerState::Draining => "draining",
            SchedulerState::Faulted => "faulted",
            SchedulerState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::SchedulerState::*;

    #[test]
    fn happy_path_is_allowed() {
        assert!(Idle.can_transition_to(Armed));
        assert!(Armed.can_transition_to(Running));
        assert!(Running.can_transition_to(Draining));
        assert!(Draining.can_transition_to(Stopped));
    }

    #[test]
    fn faults_only_come_from_running() {
        assert!(Running.can_transition_to(Faulted));
        assert!(!Armed.can_transition_to(Faulted));
        assert!(!Draining.can_transition_to(Faulted));
        assert!(Faulted.can_transition_to(Stopped));
        assert!(!Faulted.can_transition_to(Armed));
    }

    #[test]
    fn every_live_state_can_stop() {
        for state in [Idle, Armed, Running, Draining, Faulted] {
            assert!(state.can_transition_to(Stopped), "{state}");
        }
        assert!(!Stopped.can_transition_to(Stopped));
    }

    #[test]
    fn stopped_scheduler_can_be_rearmed() {
        assert!(Stopped.can_arm());
        assert!(!Running.can_arm());
        assert!(!Idle.can_transition_to(Running));
    }
}
