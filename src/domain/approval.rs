//! Approval requests raised by approval stages.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A human approval checkpoint for one run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub run_id: Uuid,

    /// Approval stage that raised the request
    pub stage_index: usize,

    /// Run revision the request belongs to
    #[serde(default)]
    pub revision: u32,

    /// What the reviewer is asked to approve
    pub summary: String,

    pub decision: Decision,

    pub notes: Option<String>,

    /// Who decided
    pub decider: Option<String>,

    pub requested_at: DateTime<Utc>,

    pub decided_at: Option<DateTime<Utc>>,

    /// Pending requests past this instant expire
    pub expires_at: DateTime<Utc>,

    /// Stage to resume at for `revise` decisions
    pub revise_to: Option<usize>,
}

impl ApprovalRequest {
    pub fn new(
        run_id: Uuid,
        revision: u32,
        stage_index: usize,
        summary: String,
        max_wait: chrono::Duration,
    ) -> Self {
        let requested_at = Utc::now();
        Self {
            run_id,
            stage_index,
            revision,
            summary,
            decision: Decision::Pending,
            notes: None,
            decider: None,
            requested_at,
            decided_at: None,
            expires_at: requested_at + max_wait,
            revise_to: None,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.decision == Decision::Pending
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.is_pending() && now >= self.expires_at
    }

    /// Whether this request was raised by the given stage pass
    pub fn matches(&self, revision: u32, stage_index: usize) -> bool {
        self.revision == revision && self.stage_index == stage_index
    }

    /// Seconds between request and expiry
    pub fn max_wait_seconds(&self) -> u64 {
        (self.expires_at - self.requested_at).num_seconds().max(0) as u64
    }
}

/// Decision state of an approval request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Pending,
    Approved,
    Rejected,
    Revise,
    /// No decision arrived within the configured wait
    Expired,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Revise => "revise",
            Self::Expired => "expired",
        }
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Decision {
    type Err = String;

    /// Parse a reviewer's decision word
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "approve" | "approved" => Ok(Self::Approved),
            "reject" | "rejected" => Ok(Self::Rejected),
            "revise" => Ok(Self::Revise),
            other => Err(format!(
                "unknown decision '{}' (expected approve, reject or revise)",
                other
            )),
        }
    }
}
