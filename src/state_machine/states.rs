use serde::{Deserialize, Serialize};
use std::fmt;

/// Work item lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkItemStatus {
    /// Editable, not yet approved
    New,
    /// Conditions resolved, waiting to be submitted
    Approved,
    /// Queued for or being processed by a submission worker
    Submitting,
    /// Workflow exists in the batch service
    Submitted,
    /// Newest workflow completed with valid outputs
    Done,
}

impl WorkItemStatus {
    pub const ALL: [WorkItemStatus; 5] = [
        Self::New,
        Self::Approved,
        Self::Submitting,
        Self::Submitted,
        Self::Done,
    ];

    /// Status reached by a successful `advance`, if any
    pub fn next(&self) -> Option<Self> {
        match self {
            Self::New => Some(Self::Approved),
            Self::Approved => Some(Self::Submitting),
            Self::Submitting => Some(Self::Submitted),
            Self::Submitted => Some(Self::Done),
            Self::Done => None,
        }
    }

    /// Status reached by a successful `revert`, if any
    pub fn previous(&self) -> Option<Self> {
        match self {
            Self::New => None,
            Self::Approved => Some(Self::New),
            Self::Submitting | Self::Submitted | Self::Done => Some(Self::Approved),
        }
    }

    /// Whether the batch service may know about workflows of this item
    pub fn may_have_workflows(&self) -> bool {
        matches!(self, Self::Submitting | Self::Submitted | Self::Done)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Approved => "approved",
            Self::Submitting => "submitting",
            Self::Submitted => "submitted",
            Self::Done => "done",
        }
    }
}

impl fmt::Display for WorkItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for WorkItemStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "new" => Ok(Self::New),
            "approved" => Ok(Self::Approved),
            "submitting" => Ok(Self::Submitting),
            "submitted" => Ok(Self::Submitted),
            "done" => Ok(Self::Done),
            _ => Err(format!("Invalid work item status: {s}")),
        }
    }
}

impl Default for WorkItemStatus {
    fn default() -> Self {
        Self::New
    }
}

/// Ticket status: a ticket is done once its work items were created
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketStatus {
    New,
    Done,
}

impl fmt::Display for TicketStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::New => write!(f, "new"),
            Self::Done => write!(f, "done"),
        }
    }
}

impl Default for TicketStatus {
    fn default() -> Self {
        Self::New
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_chain_is_linear() {
        let mut status = WorkItemStatus::New;
        let mut visited = vec![status];
        while let Some(next) = status.next() {
            visited.push(next);
            status = next;
        }
        assert_eq!(visited, WorkItemStatus::ALL.to_vec());
    }

    #[test]
    fn test_reverse_targets() {
        assert_eq!(WorkItemStatus::New.previous(), None);
        assert_eq!(WorkItemStatus::Approved.previous(), Some(WorkItemStatus::New));
        assert_eq!(
            WorkItemStatus::Done.previous(),
            Some(WorkItemStatus::Approved)
        );
    }

    #[test]
    fn test_state_string_conversion() {
        assert_eq!(WorkItemStatus::Submitting.to_string(), "submitting");
        assert_eq!(
            "done".parse::<WorkItemStatus>().unwrap(),
            WorkItemStatus::Done
        );
        assert!("running".parse::<WorkItemStatus>().is_err());
    }

    #[test]
    fn test_state_serde() {
        let json = serde_json::to_string(&WorkItemStatus::Submitted).unwrap();
        assert_eq!(json, "\"submitted\"");
        let parsed: TicketStatus = serde_json::from_str("\"done\"").unwrap();
        assert_eq!(parsed, TicketStatus::Done);
    }
}
