// request-state-rs/src/request.rs
// Request record and its lifecycle stages.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Pipeline stage. Normal progress follows declaration order; `Failed` is
/// reachable from any non-terminal stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Stage {
    Queued,
    Interpreting,
    Ranking,
    Refining,
    Finalizing,
    Complete,
    Failed,
}

impl Stage {
    pub const PIPELINE: [Stage; 6] = [
        Stage::Queued,
        Stage::Interpreting,
        Stage::Ranking,
        Stage::Refining,
        Stage::Finalizing,
        Stage::Complete,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(self, Stage::Complete | Stage::Failed)
    }

    /// Immediate successor on the happy path.
    pub fn next(self) -> Option<Stage> {
        match self {
            Stage::Queued => Some(Stage::Interpreting),
            Stage::Interpreting => Some(Stage::Ranking),
            Stage::Ranking => Some(Stage::Refining),
            Stage::Refining => Some(Stage::Finalizing),
            Stage::Finalizing => Some(Stage::Complete),
            Stage::Complete | Stage::Failed => None,
        }
    }

    /// Whether `self -> to` is a legal `advance`.
    pub fn can_transition_to(self, to: Stage) -> bool {
        if self.is_terminal() {
            return false;
        }
        to == self || to == Stage::Failed || self.next() == Some(to)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Queued => "queued",
            Stage::Interpreting => "interpreting",
            Stage::Ranking => "ranking",
            Stage::Refining => "refining",
            Stage::Finalizing => "finalizing",
            Stage::Complete => "complete",
            Stage::Failed => "failed",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One prompt's journey through the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: Uuid,
    pub prompt: String,
    pub stage: Stage,
    /// Output of the latest stage that produced one.
    pub result: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Advances recorded with an error.
    pub attempts: u32,
    pub last_error: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl Request {
    pub fn new(prompt: String, metadata: HashMap<String, String>, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            prompt,
            stage: Stage::Queued,
            result: None,
            created_at: now,
            updated_at: now,
            attempts: 0,
            last_error: None,
            metadata,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.stage.is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transitions() {
        assert!(Stage::Queued.can_transition_to(Stage::Queued));
        assert!(Stage::Queued.can_transition_to(Stage::Interpreting));
        assert!(!Stage::Queued.can_transition_to(Stage::Ranking));
        assert!(Stage::Refining.can_transition_to(Stage::Failed));
        assert!(Stage::Finalizing.can_transition_to(Stage::Complete));
        assert!(!Stage::Ranking.can_transition_to(Stage::Interpreting));
        assert!(!Stage::Complete.can_transition_to(Stage::Complete));
        assert!(!Stage::Failed.can_transition_to(Stage::Failed));
        assert!(!Stage::Failed.can_transition_to(Stage::Queued));
    }

    #[test]
    fn pipeline_is_chained_by_next() {
        for pair in Stage::PIPELINE.windows(2) {
            assert_eq!(pair[0].next(), Some(pair[1]));
        }
        assert_eq!(Stage::Complete.next(), None);
    }

    #[test]
    fn stage_serializes_by_name() {
        assert_eq!(serde_json::to_string(&Stage::Interpreting).unwrap(), "\"Interpreting\"");
    }
}
