//! Audit entry shape (§3, §4.8), grounded in the reference source's
//! `governance/schemas.py::AuditEntry`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::decision::{Action, DecidedBy};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditEventType {
    Decision,
    PolicyCheck,
    PolicyViolation,
    HumanOverride,
    Escalation,
    SystemEvent,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub entry_id: String,
    pub timestamp: DateTime<Utc>,
    pub event_type: AuditEventType,
    pub decision_id: String,
    pub session_id: String,
    pub user_id: String,
    pub action: Option<Action>,
    pub confidence: Option<f64>,
    pub decided_by: Option<DecidedBy>,
    pub policy_version: String,
    pub agent_outputs: Value,
    pub metadata: Value,
    #[serde(default)]
    pub previous_hash: Option<String>,
    #[serde(default)]
    pub entry_hash: Option<String>,
}

/// Human-originated correction to a prior decision (§3 "Supplemented
/// data"). The core validates shape and forwards these as
/// `HUMAN_OVERRIDE` audit entries; it never originates one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OverrideType {
    ApproveBlocked,
    BlockAllowed,
    EscalateResolved,
    PolicyException,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HumanOverride {
    pub override_id: String,
    pub decision_id: String,
    pub override_type: OverrideType,
    pub original_action: Action,
    pub new_action: Action,
    pub reason: String,
    pub reviewer_id: String,
    pub timestamp: DateTime<Utc>,
}

const MIN_REASON_LENGTH: usize = 10;

impl HumanOverride {
    pub fn validate(&self) -> Result<(), String> {
        if self.reason.trim().len() < MIN_REASON_LENGTH {
            return Err(format!("override reason must be at least {MIN_REASON_LENGTH} characters"));
        }
        Ok(())
    }
}
