//! Policy engine (§4.6): deterministic veto/escalate layer over every
//! proposed automated action.
//!
//! `PolicyEngine.evaluate()`/`.enforce()` are unimplemented stubs in the
//! reference source — this module's rule pipeline and per-user counters
//! are authored directly from §4.6's contract; see `DESIGN.md`.

use serde::{Deserialize, Serialize};

use crate::decision::Action;
use crate::util::sharded_lock::ShardedLockMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyRules {
    pub version: String,
    pub min_to_allow: f64,
    pub min_to_escalate: f64,
    pub allowed_actions: Vec<Action>,
    pub human_only_actions: Vec<Action>,
    pub max_actions_per_user_per_day: u32,
    pub disagreement_threshold: f64,
    pub consecutive_high_risk_limit: u32,
    pub low_risk_max: f64,
    pub medium_risk_max: f64,
    pub critical_risk_threshold: f64,
}

impl Default for PolicyRules {
    fn default() -> Self {
        Self {
            version: "v1".to_string(),
            min_to_allow: 0.75,
            min_to_escalate: 0.50,
            allowed_actions: vec![Action::Allow, Action::Challenge, Action::Block],
            human_only_actions: vec![],
            max_actions_per_user_per_day: 500,
            disagreement_threshold: 0.30,
            consecutive_high_risk_limit: 3,
            low_risk_max: 0.30,
            medium_risk_max: 0.65,
            critical_risk_threshold: 0.85,
        }
    }
}

impl PolicyRules {
    /// Maps a risk score to a recommended action (§4.6 "risk-to-action
    /// recommendation"), used when the router's explanation step produced
    /// no proposed action.
    pub fn recommend_action(&self, risk_score: f64) -> Action {
        if risk_score <= self.low_risk_max {
            Action::Allow
        } else if risk_score <= self.medium_risk_max {
            Action::Challenge
        } else if risk_score < self.critical_risk_threshold {
            Action::Block
        } else {
            Action::Escalate
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ViolationType {
    DisallowedAction,
    HumanOnlyAction,
    LowConfidence,
    HighDisagreement,
    CriticalRisk,
    ConsecutiveHighRisk,
    DailyActionLimit,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyViolation {
    pub violation_type: ViolationType,
    pub rule_name: String,
    pub details: String,
    pub severity: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PolicyDecision {
    Approve,
    Veto,
    Escalate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyOutcome {
    pub decision: PolicyDecision,
    pub approved_action: Option<Action>,
    pub violations: Vec<PolicyViolation>,
    pub reasons: Vec<String>,
}

pub struct PolicyInput<'a> {
    pub proposed_action: Action,
    pub confidence: f64,
    pub risk_score: f64,
    pub disagreement: f64,
    pub user_id: &'a str,
}

#[derive(Debug, Default, Clone, Copy)]
struct UserCounters {
    consecutive_high_risk: u32,
    daily_action_count: u32,
    day_started: Option<chrono::NaiveDate>,
}

/// Per-user striped state (§5 "policy engine state"): one lock per user-id,
/// so two different users' evaluations never contend on the same mutex.
pub struct PolicyEngine {
    rules: PolicyRules,
    counters: ShardedLockMap<String, UserCounters>,
}

impl PolicyEngine {
    pub fn new(rules: PolicyRules) -> Self {
        Self {
            rules,
            counters: ShardedLockMap::new(),
        }
    }

    pub fn version(&self) -> &str {
        &self.rules.version
    }

    /// Replaces the rule set atomically; the new version is reflected by
    /// subsequent `version()` calls and therefore in subsequent audit
    /// entries.
    pub fn reload(&mut self, rules: PolicyRules) {
        self.rules = rules;
    }

    #[tracing::instrument(skip_all, fields(user_id = %input.user_id))]
    pub async fn evaluate(&self, input: PolicyInput<'_>) -> PolicyOutcome {
        let mut violations = Vec::new();
        let mut reasons = Vec::new();

        // Rule 1: action must be in the allowed set and not human-only.
        if !self.rules.allowed_actions.contains(&input.proposed_action) {
            violations.push(PolicyViolation {
                violation_type: ViolationType::DisallowedAction,
                rule_name: "allowed_actions".to_string(),
                details: format!("{:?} is not an allowed action", input.proposed_action),
                severity: "high".to_string(),
            });
            reasons.push("disallowed_action".to_string());
            return PolicyOutcome {
                decision: PolicyDecision::Veto,
                approved_action: None,
                violations,
                reasons,
            };
        }
        if self.rules.human_only_actions.contains(&input.proposed_action) {
            violations.push(PolicyViolation {
                violation_type: ViolationType::HumanOnlyAction,
                rule_name: "human_only_actions".to_string(),
                details: format!("{:?} requires human review", input.proposed_action),
                severity: "high".to_string(),
            });
            reasons.push("human_only_action".to_string());
            return PolicyOutcome {
                decision: PolicyDecision::Escalate,
                approved_action: None,
                violations,
                reasons,
            };
        }

        // Rule 2 & 3: confidence floors.
        if input.confidence < self.rules.min_to_escalate {
            reasons.push("confidence_below_escalation_floor".to_string());
            return PolicyOutcome {
                decision: PolicyDecision::Escalate,
                approved_action: None,
                violations,
                reasons,
            };
        }
        if input.confidence < self.rules.min_to_allow {
            reasons.push("confidence_below_allow_floor".to_string());
            return PolicyOutcome {
                decision: PolicyDecision::Escalate,
                approved_action: None,
                violations,
                reasons,
            };
        }

        // Rule 4: disagreement ceiling.
        if input.disagreement > self.rules.disagreement_threshold {
            reasons.push("disagreement_above_threshold".to_string());
            return PolicyOutcome {
                decision: PolicyDecision::Escalate,
                approved_action: None,
                violations,
                reasons,
            };
        }

        // Rule 5: critical risk.
        if input.risk_score >= self.rules.critical_risk_threshold {
            reasons.push("critical_risk".to_string());
            return PolicyOutcome {
                decision: PolicyDecision::Escalate,
                approved_action: None,
                violations,
                reasons,
            };
        }

        // Rules 6 & 7: per-user sliding state.
        let today = chrono::Utc::now().date_naive();
        let lock = self.counters.lock_for(&input.user_id.to_string()).await;
        let mut entry = lock.lock().await;
        if entry.day_started != Some(today) {
            entry.day_started = Some(today);
            entry.daily_action_count = 0;
        }

        if input.risk_score >= self.rules.medium_risk_max {
            entry.consecutive_high_risk += 1;
        } else {
            entry.consecutive_high_risk = 0;
        }
        if entry.consecutive_high_risk > self.rules.consecutive_high_risk_limit {
            reasons.push("consecutive_high_risk_limit_exceeded".to_string());
            return PolicyOutcome {
                decision: PolicyDecision::Escalate,
                approved_action: None,
                violations,
                reasons,
            };
        }

        entry.daily_action_count += 1;
        if entry.daily_action_count > self.rules.max_actions_per_user_per_day {
            violations.push(PolicyViolation {
                violation_type: ViolationType::DailyActionLimit,
                rule_name: "max_actions_per_user_per_day".to_string(),
                details: format!("{} actions today exceeds limit", entry.daily_action_count),
                severity: "medium".to_string(),
            });
            reasons.push("daily_action_limit_exceeded".to_string());
            return PolicyOutcome {
                decision: PolicyDecision::Veto,
                approved_action: None,
                violations,
                reasons,
            };
        }

        PolicyOutcome {
            decision: PolicyDecision::Approve,
            approved_action: Some(input.proposed_action),
            violations,
            reasons,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(action: Action, confidence: f64, risk: f64, disagreement: f64) -> PolicyInput<'static> {
        PolicyInput {
            proposed_action: action,
            confidence,
            risk_score: risk,
            disagreement,
            user_id: "user-1",
        }
    }

    #[tokio::test]
    async fn clean_allow_approves() {
        let engine = PolicyEngine::new(PolicyRules::default());
        let outcome = engine.evaluate(input(Action::Allow, 0.9, 0.1, 0.05)).await;
        assert_eq!(outcome.decision, PolicyDecision::Approve);
        assert_eq!(outcome.approved_action, Some(Action::Allow));
    }

    #[tokio::test]
    async fn low_confidence_escalates() {
        let engine = PolicyEngine::new(PolicyRules::default());
        let outcome = engine.evaluate(input(Action::Allow, 0.3, 0.1, 0.05)).await;
        assert_eq!(outcome.decision, PolicyDecision::Escalate);
        assert!(outcome.reasons.contains(&"confidence_below_escalation_floor".to_string()));
    }

    #[tokio::test]
    async fn critical_risk_escalates_even_with_high_confidence() {
        let engine = PolicyEngine::new(PolicyRules::default());
        let outcome = engine.evaluate(input(Action::Block, 0.95, 0.9, 0.05)).await;
        assert_eq!(outcome.decision, PolicyDecision::Escalate);
    }

    #[tokio::test]
    async fn human_only_action_is_escalated_not_vetoed() {
        let mut rules = PolicyRules::default();
        rules.human_only_actions.push(Action::Challenge);
        let engine = PolicyEngine::new(rules);
        let outcome = engine.evaluate(input(Action::Challenge, 0.9, 0.1, 0.05)).await;
        assert_eq!(outcome.decision, PolicyDecision::Escalate);
        assert_eq!(outcome.violations[0].violation_type, ViolationType::HumanOnlyAction);
    }

    #[tokio::test]
    async fn consecutive_high_risk_trips_limit() {
        let engine = PolicyEngine::new(PolicyRules::default());
        for _ in 0..4 {
            let outcome = engine.evaluate(input(Action::Challenge, 0.9, 0.7, 0.05)).await;
            let _ = outcome;
        }
        let outcome = engine.evaluate(input(Action::Challenge, 0.9, 0.7, 0.05)).await;
        assert_eq!(outcome.decision, PolicyDecision::Escalate);
        assert!(outcome.reasons.contains(&"consecutive_high_risk_limit_exceeded".to_string()));
    }

    #[test]
    fn recommend_action_maps_risk_bands() {
        let rules = PolicyRules::default();
        assert_eq!(rules.recommend_action(0.1), Action::Allow);
        assert_eq!(rules.recommend_action(0.5), Action::Challenge);
        assert_eq!(rules.recommend_action(0.7), Action::Block);
        assert_eq!(rules.recommend_action(0.9), Action::Escalate);
    }
}
