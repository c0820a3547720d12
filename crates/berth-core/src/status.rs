//! Task status and its transition rules.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Status of a Task.
///
/// Transitions only move forward: `Queued -> Running -> terminal`, with
/// `Queued` allowed to jump straight to `Failed` (rejected before
/// dispatch) or `Cancelled`. Nothing leaves a terminal state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Task accepted, waiting for a host slot.
    #[default]
    Queued,
    /// Task is executing on its host.
    Running,
    /// Execution finished with a zero exit status.
    Succeeded,
    /// Execution failed, or the task was rejected before dispatch.
    Failed,
    /// Task was cancelled by an operator or by host deregistration.
    Cancelled,
}

impl TaskStatus {
    /// Returns true if the task is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }

    /// Returns true if the task is still active (not terminal).
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    /// Whether moving from `self` to `next` is a legal transition.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        match (self, next) {
            (Self::Queued, Self::Running | Self::Failed | Self::Cancelled) => true,
            (Self::Running, Self::Succeeded | Self::Failed | Self::Cancelled) => true,
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_transitions_allowed() {
        assert!(TaskStatus::Queued.can_transition_to(TaskStatus::Running));
        assert!(TaskStatus::Queued.can_transition_to(TaskStatus::Cancelled));
        assert!(TaskStatus::Queued.can_transition_to(TaskStatus::Failed));
        assert!(TaskStatus::Running.can_transition_to(TaskStatus::Succeeded));
        assert!(TaskStatus::Running.can_transition_to(TaskStatus::Cancelled));
    }

    #[test]
    fn test_no_transition_out_of_terminal() {
        for terminal in [TaskStatus::Succeeded, TaskStatus::Failed, TaskStatus::Cancelled] {
            for next in [
                TaskStatus::Queued,
                TaskStatus::Running,
                TaskStatus::Succeeded,
                TaskStatus::Failed,
                TaskStatus::Cancelled,
            ] {
                assert!(!terminal.can_transition_to(next), "{terminal} -> {next}");
            }
        }
    }

    #[test]
    fn test_no_backwards_or_skip_to_success() {
        assert!(!TaskStatus::Running.can_transition_to(TaskStatus::Queued));
        assert!(!TaskStatus::Queued.can_transition_to(TaskStatus::Succeeded));
        assert!(!TaskStatus::Running.can_transition_to(TaskStatus::Running));
    }
}
