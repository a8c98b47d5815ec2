//! Error taxonomy for the decision core.
//!
//! Mirrors the error taxonomy of §7: one variant per category, each carrying
//! the minimal structured payload needed to render `{code, message, details}`
//! to a caller without leaking internal state.

use chrono::{DateTime, Utc};
use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Top-level error returned to a caller of `evaluate_login`.
#[derive(Debug, Error, Diagnostic)]
pub enum DecisionError {
    #[error("invalid input context: {0}")]
    #[diagnostic(code(aegis::validation), help("check the InputContext invariants in the request"))]
    Validation(String),

    #[error("configuration error: {0}")]
    #[diagnostic(code(aegis::config))]
    Config(String),

    #[error("agent evaluation failed")]
    #[diagnostic(code(aegis::agent))]
    Agent(#[from] AgentFailure),

    #[error("policy violation: {0}")]
    #[diagnostic(code(aegis::policy_violation))]
    PolicyViolation(String),

    #[error("audit ledger error: {0}")]
    #[diagnostic(code(aegis::audit))]
    Audit(String),

    #[error("model inference error: {0}")]
    #[diagnostic(code(aegis::model))]
    Model(String),

    #[error("escalation: {0}")]
    #[diagnostic(code(aegis::escalation))]
    Escalation(String),
}

impl DecisionError {
    /// The machine-readable code named in §6.
    pub fn code(&self) -> &'static str {
        match self {
            DecisionError::Validation(_) => "VALIDATION_ERROR",
            DecisionError::Config(_) => "CONFIG_ERROR",
            DecisionError::Agent(_) => "AGENT_ERROR",
            DecisionError::PolicyViolation(_) => "POLICY_VIOLATION",
            DecisionError::Audit(_) => "AUDIT_ERROR",
            DecisionError::Model(_) => "MODEL_ERROR",
            DecisionError::Escalation(_) => "ESCALATION_ERROR",
        }
    }
}

/// A single evaluator's failure, reported without aborting the other
/// in-flight evaluators (§4.1 failure semantics).
#[derive(Debug, Clone, Error, Diagnostic)]
#[error("evaluator {evaluator} failed: {event}")]
pub struct AgentFailure {
    pub evaluator: EvaluatorKind,
    #[source]
    pub event: ErrorEvent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvaluatorKind {
    Risk,
    Behavior,
    Network,
    Confidence,
    Explanation,
}

impl std::fmt::Display for EvaluatorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EvaluatorKind::Risk => "risk",
            EvaluatorKind::Behavior => "behavior",
            EvaluatorKind::Network => "network",
            EvaluatorKind::Confidence => "confidence",
            EvaluatorKind::Explanation => "explanation",
        };
        write!(f, "{s}")
    }
}

/// A structured, serializable failure record carried into `EscalationCase`
/// facts and audit-entry metadata. Shape mirrors `weavegraph`'s
/// `ErrorEvent`/`LadderError`, re-themed from node/runner/scheduler scope to
/// evaluator scope.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorEvent {
    #[serde(default = "Utc::now")]
    pub when: DateTime<Utc>,
    pub message: String,
    #[serde(default)]
    pub cause: Option<Box<ErrorEvent>>,
    #[serde(default)]
    pub details: serde_json::Value,
}

impl std::fmt::Display for ErrorEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ErrorEvent {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause.as_deref().map(|c| c as &dyn std::error::Error)
    }
}

impl ErrorEvent {
    pub fn msg(message: impl Into<String>) -> Self {
        Self {
            when: Utc::now(),
            message: message.into(),
            cause: None,
            details: serde_json::Value::Null,
        }
    }

    #[must_use]
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }

    #[must_use]
    pub fn with_cause(mut self, cause: ErrorEvent) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }
}
