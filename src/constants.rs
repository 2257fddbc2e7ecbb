//! # System Constants
//!
//! Fixed vocabulary of the RelVal lifecycle: history actions, external workflow
//! statuses, data tier ranking and lock key formats.

/// Prefix marking a conditions value as an alias that must be resolved remotely
pub const CONDITIONS_ALIAS_PREFIX: &str = "auto:";

/// History actions written by the orchestration core
pub mod history {
    pub const STATUS: &str = "status";
    pub const SUBMISSION: &str = "submission";
    pub const SUBMISSION_FAILED: &str = "failed";
    pub const SUBMISSION_SUCCEEDED: &str = "succeeded";
    pub const CREATED_RELVALS: &str = "created_relvals";
    pub const REMOVE_RELVAL: &str = "remove_relval";
    pub const CREATE: &str = "create";
    pub const UPDATE: &str = "update";
    pub const AUTOMATIC_ACTOR: &str = "automatic";
}

/// Workflow statuses reported by the batch and tracking services
pub mod workflow_status {
    pub const NEW: &str = "new";
    pub const ASSIGNMENT_APPROVED: &str = "assignment-approved";
    pub const COMPLETED: &str = "completed";
    pub const CLOSED_OUT: &str = "closed-out";
    pub const ANNOUNCED: &str = "announced";
    pub const ABORTED: &str = "aborted";
    pub const REJECTED: &str = "rejected";
    pub const FAILED: &str = "failed";

    /// Statuses after which a workflow no longer counts as active
    pub const TERMINAL_NEGATIVE: [&str; 3] = [ABORTED, REJECTED, FAILED];

    /// Workflows that last reported one of these are rejected, everything else is aborted
    pub const REJECT_FROM: [&str; 5] = [NEW, ASSIGNMENT_APPROVED, COMPLETED, CLOSED_OUT, ANNOUNCED];

    /// Request type of workflows that are ignored by reconciliation
    pub const RESUBMISSION_TYPE: &str = "resubmission";
}

/// Dataset access type reported by the catalog for usable datasets
pub const VALID_DATASET_ACCESS_TYPE: &str = "valid";

/// Output data tiers ranked from most to least preferred. DQM content carries no
/// physics events and is always ranked last; unknown tiers rank just above it.
pub const TIER_PRIORITY: &[&str] = &[
    "NANOAODSIM",
    "NANOAOD",
    "MINIAODSIM",
    "MINIAOD",
    "AODSIM",
    "AOD",
    "GEN-SIM-RECO",
    "RECOSIM",
    "RECO",
    "GEN-SIM-DIGI-RAW",
    "GEN-SIM-RAW",
    "RAW-RECO",
    "RAW",
    "ALCARECO",
    "GEN-SIM",
    "GEN",
];

/// Tiers whose content is diagnostic only
pub const DQM_TIERS: &[&str] = &["DQMIO", "DQM"];

/// Rank of a data tier in [`TIER_PRIORITY`]; lower ranks sort first
pub fn tier_rank(tier: &str) -> usize {
    if DQM_TIERS.iter().any(|dqm| dqm.eq_ignore_ascii_case(tier)) {
        return TIER_PRIORITY.len() + 1;
    }

    TIER_PRIORITY
        .iter()
        .position(|known| known.eq_ignore_ascii_case(tier))
        .unwrap_or(TIER_PRIORITY.len())
}

/// Lock key formats
pub mod lock_keys {
    pub fn generate_id(prefix: &str) -> String {
        format!("generate-id-{prefix}")
    }

    pub fn generate_ticket_id(prefix: &str) -> String {
        format!("generate-ticket-id-{prefix}")
    }

    pub fn resolve_conditions(release: &str, scram_arch: &str) -> String {
        format!("resolve-conditions-{release}-{scram_arch}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tier_rank_orders_analysis_tiers_first() {
        assert!(tier_rank("AOD") < tier_rank("RAW"));
        assert!(tier_rank("NANOAODSIM") < tier_rank("MINIAODSIM"));
        assert!(tier_rank("RAW") < tier_rank("SOMETHING-NEW"));
        assert!(tier_rank("SOMETHING-NEW") < tier_rank("DQMIO"));
    }
}
