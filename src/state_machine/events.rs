use serde::{Deserialize, Serialize};

use super::states::WorkItemStatus;
use crate::error::{RelvalError, Result};

/// Events that can trigger work item status transitions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleEvent {
    /// Move one status forward
    Advance,
    /// Move one status back
    Revert,
}

impl LifecycleEvent {
    /// Get a string representation of the event type for logging
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Advance => "advance",
            Self::Revert => "revert",
        }
    }

    /// Target status of this event from `current`.
    ///
    /// `submitting` can never be advanced by a caller: only the submission
    /// worker moves an item out of it.
    pub fn target(&self, prepid: &str, current: WorkItemStatus) -> Result<WorkItemStatus> {
        let target = match (self, current) {
            (Self::Advance, WorkItemStatus::Submitting) => None,
            (Self::Advance, status) => status.next(),
            (Self::Revert, status) => status.previous(),
        };
        target.ok_or_else(|| RelvalError::invalid_transition(prepid, current, self.event_type()))
    }
}

impl std::fmt::Display for LifecycleEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.event_type())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_advance_targets() {
        let advance = LifecycleEvent::Advance;
        assert_eq!(
            advance.target("x", WorkItemStatus::New).unwrap(),
            WorkItemStatus::Approved
        );
        assert_eq!(
            advance.target("x", WorkItemStatus::Approved).unwrap(),
            WorkItemStatus::Submitting
        );
        assert_eq!(
            advance.target("x", WorkItemStatus::Submitted).unwrap(),
            WorkItemStatus::Done
        );
        assert!(advance.target("x", WorkItemStatus::Submitting).is_err());
        assert!(advance.target("x", WorkItemStatus::Done).is_err());
    }

    #[test]
    fn test_revert_targets() {
        let revert = LifecycleEvent::Revert;
        assert!(revert.target("x", WorkItemStatus::New).is_err());
        assert_eq!(
            revert.target("x", WorkItemStatus::Approved).unwrap(),
            WorkItemStatus::New
        );
        for status in [
            WorkItemStatus::Submitting,
            WorkItemStatus::Submitted,
            WorkItemStatus::Done,
        ] {
            assert_eq!(revert.target("x", status).unwrap(), WorkItemStatus::Approved);
        }
    }

    #[test]
    fn test_invalid_transition_names_action_and_status() {
        let err = LifecycleEvent::Advance
            .target("CMSSW_14_0_0__fullsim-ZMM-00001", WorkItemStatus::Submitting)
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Invalid transition for CMSSW_14_0_0__fullsim-ZMM-00001: cannot advance from status submitting"
        );
    }
}
