use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One append-only audit entry of a work item or ticket
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub action: String,
    #[serde(default)]
    pub value: Value,
    /// Acting user, `None` for transitions performed by the core itself
    #[serde(default)]
    pub user: Option<String>,
    /// Unix timestamp in seconds
    pub time: i64,
}

impl HistoryEntry {
    pub fn new(action: impl Into<String>, value: impl Into<Value>, user: Option<String>) -> Self {
        Self {
            action: action.into(),
            value: value.into(),
            user,
            time: Utc::now().timestamp(),
        }
    }

    pub fn at(mut self, time: i64) -> Self {
        self.time = time;
        self
    }

    /// Status transition entry: `(status, <new status>, null, ts)`
    pub fn status(new_status: impl ToString) -> Self {
        Self::new(
            crate::constants::history::STATUS,
            new_status.to_string(),
            None,
        )
    }
}

/// Shared behavior of documents carrying an append-only history
pub trait WithHistory {
    fn history(&self) -> &[HistoryEntry];
    fn history_mut(&mut self) -> &mut Vec<HistoryEntry>;

    fn add_history(&mut self, action: &str, value: impl Into<Value>, user: Option<String>) {
        self.history_mut().push(HistoryEntry::new(action, value, user));
    }

    /// Distinct users that ever touched the document, in first-seen order
    fn history_users(&self) -> Vec<String> {
        let mut users: Vec<String> = Vec::new();
        for user in self.history().iter().filter_map(|entry| entry.user.as_ref()) {
            if !user.is_empty() && !users.contains(user) {
                users.push(user.clone());
            }
        }
        users
    }
}
