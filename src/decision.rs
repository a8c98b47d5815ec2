//! Decision flow (§4.7): composes the router, the policy engine, and the
//! audit ledger into the single `evaluate_login` operation, plus the
//! `DecisionService` composition root (§2 "Composition root") that owns
//! every long-lived resource explicitly instead of through statics.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::audit::{AuditEntry, AuditEventType, AuditLedger, WriterConfig};
use crate::calibration::ConfidenceCalibrator;
use crate::context::InputContext;
use crate::errors::DecisionError;
use crate::evaluators::{BehaviorEvaluator, NetworkContext, NetworkEvaluator, ProfileStore, RiskEvaluator};
use crate::policy::{PolicyDecision, PolicyEngine, PolicyInput, PolicyRules};
use crate::router::AgentRouter;
use crate::telemetry::{DecisionObserver, NullObserver};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Action {
    Allow,
    Challenge,
    Block,
    Escalate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DecidedBy {
    Ai,
    HumanRequired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EscalationReason {
    LowConfidence,
    HighDisagreement,
    PolicyOverride,
    AgentFailure,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalDecision {
    pub decision_id: String,
    pub timestamp: DateTime<Utc>,
    pub action: Action,
    pub decided_by: DecidedBy,
    pub confidence: f64,
    pub explanation: String,
    pub session_id: String,
    pub user_id: String,
    pub risk_score: f64,
    pub behavior_match_score: f64,
    pub network_risk: f64,
    pub disagreement: f64,
    pub audit_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscalationFacts {
    pub risk_factors: Vec<String>,
    pub deviations: Vec<String>,
    pub evidence: Vec<String>,
    pub error_summary: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscalationCase {
    pub case_id: String,
    pub decision_id: String,
    pub reason: EscalationReason,
    pub facts: EscalationFacts,
}

pub struct DecisionOutcome {
    pub decision: FinalDecision,
    pub escalation: Option<EscalationCase>,
}

/// Composes the agent router, confidence calibrator, policy engine, and
/// audit ledger into the single public operation (§4.7).
pub struct DecisionFlow {
    router: AgentRouter,
    calibrator: ConfidenceCalibrator,
    policy: PolicyEngine,
    audit: Arc<AuditLedger>,
    observer: Arc<dyn DecisionObserver>,
}

impl DecisionFlow {
    pub fn new(router: AgentRouter, calibrator: ConfidenceCalibrator, policy: PolicyEngine, audit: Arc<AuditLedger>) -> Self {
        Self::with_observer(router, calibrator, policy, audit, Arc::new(NullObserver))
    }

    pub fn with_observer(
        router: AgentRouter,
        calibrator: ConfidenceCalibrator,
        policy: PolicyEngine,
        audit: Arc<AuditLedger>,
        observer: Arc<dyn DecisionObserver>,
    ) -> Self {
        Self {
            router,
            calibrator,
            policy,
            audit,
            observer,
        }
    }

    #[tracing::instrument(skip_all, fields(session_id = %context.session.session_id, user_id = %context.user.user_id))]
    pub async fn process(&self, context: &InputContext, network_context: Option<&NetworkContext>) -> Result<DecisionOutcome, DecisionError> {
        context.validate()?;

        let decision_id = Uuid::new_v4().to_string();
        let session_id = context.session.session_id.clone();
        let user_id = context.user.user_id.clone();

        // Step 1: route through phases 1-3.
        let routed = match self.router.route(context, network_context, &self.calibrator).await {
            Ok(routed) => routed,
            Err(failure) => {
                let mut outcome = self.escalate(
                    &decision_id,
                    &session_id,
                    &user_id,
                    EscalationReason::AgentFailure,
                    EscalationFacts {
                        risk_factors: Vec::new(),
                        deviations: Vec::new(),
                        evidence: Vec::new(),
                        error_summary: Some(failure.to_string()),
                    },
                    0.0,
                    0.0,
                    0.0,
                    1.0,
                );
                outcome.decision.audit_id = self.record(&outcome, None).await;
                return Ok(outcome);
            }
        };

        // Step 2: confidence gate.
        if routed.confidence.should_escalate() {
            let reason = if routed.confidence.disagreement_score > 0.30 {
                EscalationReason::HighDisagreement
            } else {
                EscalationReason::LowConfidence
            };
            let mut outcome = self.escalate(
                &decision_id,
                &session_id,
                &user_id,
                reason,
                EscalationFacts {
                    risk_factors: routed.risk.risk_factors.clone(),
                    deviations: routed.behavior.deviations.clone(),
                    evidence: routed.network.evidence.clone(),
                    error_summary: None,
                },
                routed.risk.risk_score,
                routed.behavior.match_score,
                routed.network.network_risk,
                routed.confidence.disagreement_score,
            );
            outcome.decision.audit_id = self
                .record(
                    &outcome,
                    Some(json!({
                        "risk": routed.risk.risk_score,
                        "behavior_match": routed.behavior.match_score,
                        "network_risk": routed.network.network_risk,
                    })),
                )
                .await;
            return Ok(outcome);
        }

        // Steps 3 & 4: derive proposed action, invoke the policy engine.
        let policy_outcome = self
            .policy
            .evaluate(PolicyInput {
                proposed_action: routed.explanation.proposed_action,
                confidence: routed.confidence.final_confidence,
                risk_score: routed.risk.risk_score,
                disagreement: routed.confidence.disagreement_score,
                user_id: &user_id,
            })
            .await;

        let agent_outputs = json!({
            "risk": { "score": routed.risk.risk_score, "factors": routed.risk.risk_factors },
            "behavior": { "match_score": routed.behavior.match_score, "deviations": routed.behavior.deviations },
            "network": { "risk": routed.network.network_risk, "evidence": routed.network.evidence },
            "confidence": routed.confidence,
        });

        let mut outcome = match policy_outcome.decision {
            PolicyDecision::Veto | PolicyDecision::Escalate => self.escalate(
                &decision_id,
                &session_id,
                &user_id,
                EscalationReason::PolicyOverride,
                EscalationFacts {
                    risk_factors: routed.risk.risk_factors.clone(),
                    deviations: routed.behavior.deviations.clone(),
                    evidence: routed.network.evidence.clone(),
                    error_summary: Some(policy_outcome.reasons.join("; ")),
                },
                routed.risk.risk_score,
                routed.behavior.match_score,
                routed.network.network_risk,
                routed.confidence.disagreement_score,
            ),
            PolicyDecision::Approve => DecisionOutcome {
                decision: FinalDecision {
                    decision_id,
                    timestamp: Utc::now(),
                    action: policy_outcome.approved_action.unwrap_or(routed.explanation.proposed_action),
                    decided_by: DecidedBy::Ai,
                    confidence: routed.confidence.final_confidence,
                    explanation: routed.explanation.explanation.clone(),
                    session_id,
                    user_id,
                    risk_score: routed.risk.risk_score,
                    behavior_match_score: routed.behavior.match_score,
                    network_risk: routed.network.network_risk,
                    disagreement: routed.confidence.disagreement_score,
                    audit_id: None,
                },
                escalation: None,
            },
        };

        outcome.decision.audit_id = self.record(&outcome, Some(agent_outputs)).await;

        Ok(outcome)
    }

    #[allow(clippy::too_many_arguments)]
    fn escalate(
        &self,
        decision_id: &str,
        session_id: &str,
        user_id: &str,
        reason: EscalationReason,
        facts: EscalationFacts,
        risk_score: f64,
        behavior_match_score: f64,
        network_risk: f64,
        disagreement: f64,
    ) -> DecisionOutcome {
        let decision = FinalDecision {
            decision_id: decision_id.to_string(),
            timestamp: Utc::now(),
            action: Action::Escalate,
            decided_by: DecidedBy::HumanRequired,
            confidence: 0.0,
            explanation: "escalated for human review".to_string(),
            session_id: session_id.to_string(),
            user_id: user_id.to_string(),
            risk_score,
            behavior_match_score,
            network_risk,
            disagreement,
            audit_id: None,
        };
        let escalation = EscalationCase {
            case_id: Uuid::new_v4().to_string(),
            decision_id: decision_id.to_string(),
            reason,
            facts,
        };
        DecisionOutcome {
            decision,
            escalation: Some(escalation),
        }
    }

    /// Validates a human-review back-office correction and forwards it to
    /// the ledger as a `HUMAN_OVERRIDE` entry. The core never originates an
    /// override, only validates shape and relays it (§3 "Supplemented
    /// data").
    pub async fn submit_human_override(&self, override_record: crate::audit::HumanOverride) -> Result<String, DecisionError> {
        override_record.validate().map_err(DecisionError::Validation)?;

        let entry = AuditEntry {
            entry_id: Uuid::new_v4().to_string(),
            timestamp: override_record.timestamp,
            event_type: AuditEventType::HumanOverride,
            decision_id: override_record.decision_id.clone(),
            session_id: String::new(),
            user_id: String::new(),
            action: Some(override_record.new_action),
            confidence: None,
            decided_by: Some(DecidedBy::HumanRequired),
            policy_version: self.policy.version().to_string(),
            agent_outputs: serde_json::Value::Null,
            metadata: serde_json::to_value(&override_record).unwrap_or(serde_json::Value::Null),
            previous_hash: None,
            entry_hash: None,
        };
        self.audit.submit(entry).await
    }

    /// Step 5: submits the audit entry and returns its `entry_id` on
    /// success for the caller to attach to `FinalDecision::audit_id`. The
    /// ledger is otherwise fire-and-forget (§7 "audit failures ... never
    /// fail the user-visible response"): submission failures are logged,
    /// not propagated, and leave `audit_id` unset.
    async fn record(&self, outcome: &DecisionOutcome, agent_outputs: Option<serde_json::Value>) -> Option<String> {
        self.observer.observe(&outcome.decision);

        let event_type = if outcome.escalation.is_some() {
            AuditEventType::Escalation
        } else {
            AuditEventType::Decision
        };
        let entry = AuditEntry {
            entry_id: Uuid::new_v4().to_string(),
            timestamp: outcome.decision.timestamp,
            event_type,
            decision_id: outcome.decision.decision_id.clone(),
            session_id: outcome.decision.session_id.clone(),
            user_id: outcome.decision.user_id.clone(),
            action: Some(outcome.decision.action),
            confidence: Some(outcome.decision.confidence),
            decided_by: Some(outcome.decision.decided_by),
            policy_version: self.policy.version().to_string(),
            agent_outputs: agent_outputs.unwrap_or(serde_json::Value::Null),
            metadata: outcome
                .escalation
                .as_ref()
                .map(|e| serde_json::to_value(e).unwrap_or(serde_json::Value::Null))
                .unwrap_or(serde_json::Value::Null),
            previous_hash: None,
            entry_hash: None,
        };
        match self.audit.submit(entry).await {
            Ok(entry_id) => Some(entry_id),
            Err(err) => {
                tracing::error!(error = %err, "failed to submit audit entry");
                None
            }
        }
    }
}

/// Owns every long-lived resource, constructed once at process startup
/// (§2 "Composition root").
pub struct DecisionService {
    pub flow: DecisionFlow,
}

impl DecisionService {
    pub fn build(config: crate::config::ServiceConfig, policy_rules: PolicyRules, audit_store: Arc<dyn crate::audit::AuditStore>) -> Self {
        Self::build_with_observer(config, policy_rules, audit_store, Arc::new(NullObserver))
    }

    /// Same as `build`, but wires a `DecisionObserver` that receives every
    /// `FinalDecision` as it is recorded, for callers that want typed
    /// decision-outcome events instead of parsing log lines.
    pub fn build_with_observer(
        config: crate::config::ServiceConfig,
        policy_rules: PolicyRules,
        audit_store: Arc<dyn crate::audit::AuditStore>,
        observer: Arc<dyn DecisionObserver>,
    ) -> Self {
        let profiles = Arc::new(ProfileStore::new());
        let policy_rules = Arc::new(policy_rules);
        let router = AgentRouter::new(
            RiskEvaluator::heuristic(),
            BehaviorEvaluator::new(true, config.behavior_min_sessions),
            NetworkEvaluator::new(),
            profiles,
            policy_rules.clone(),
            config.worker_pool_size,
        );
        let audit = AuditLedger::start(
            audit_store,
            WriterConfig {
                queue_capacity: config.audit_queue_capacity,
                submit_timeout: config.audit_queue_timeout,
                overflow_policy: config.overflow_policy,
            },
        );
        let flow = DecisionFlow::with_observer(
            router,
            ConfidenceCalibrator::new(),
            PolicyEngine::new((*policy_rules).clone()),
            audit,
            observer,
        );
        Self { flow }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{AuditStore, InMemoryAuditStore};
    use crate::config::ServiceConfig;
    use crate::context::{AuthMethod, Device, DeviceType, GeoLocation, LoginEvent, Session, User};

    fn sample_context() -> InputContext {
        InputContext {
            login_event: LoginEvent {
                event_id: "e".into(),
                timestamp: Utc::now(),
                success: true,
                auth_method: AuthMethod::Password,
                failed_attempts_before: 0,
                time_since_last_login_hours: Some(2.0),
                is_new_device: false,
                is_new_ip: false,
                is_new_location: false,
                session_id: "s".into(),
                user_id: "u".into(),
            },
            session: Session {
                session_id: "s".into(),
                device_id: "d".into(),
                ip_address: "1.2.3.4".into(),
                geo_location: GeoLocation {
                    city: "x".into(),
                    country: "US".into(),
                    latitude: 30.0,
                    longitude: -97.0,
                },
                start_time: Utc::now(),
                is_vpn: false,
                is_tor: false,
            },
            device: Device {
                device_id: "d".into(),
                device_type: DeviceType::Desktop,
                os: "x".into(),
                browser: "x".into(),
                is_known: true,
                first_seen_at: None,
            },
            user: User {
                user_id: "u".into(),
                account_age_days: 400,
                home_country: "US".into(),
                home_city: "x".into(),
                typical_login_hour_start: 8,
                typical_login_hour_end: 20,
            },
        }
    }

    #[tokio::test]
    async fn clean_login_is_allowed_and_audited() {
        let store = Arc::new(InMemoryAuditStore::new());
        let service = DecisionService::build(ServiceConfig::default(), PolicyRules::default(), store.clone());
        let context = sample_context();
        let outcome = service.flow.process(&context, None).await.unwrap();
        assert_eq!(outcome.decision.action, Action::Allow);
        assert!(outcome.escalation.is_none());
        let date = Utc::now().date_naive();
        assert_eq!(store.get_entry_count(date).await, 1);
    }

    #[tokio::test]
    async fn mismatched_context_is_rejected_before_routing() {
        let store = Arc::new(InMemoryAuditStore::new());
        let service = DecisionService::build(ServiceConfig::default(), PolicyRules::default(), store);
        let mut context = sample_context();
        context.session.session_id = "other".into();
        assert!(service.flow.process(&context, None).await.is_err());
    }

    #[tokio::test]
    async fn clean_login_reaches_observer_and_gets_an_audit_id() {
        use crate::telemetry::RecordingObserver;

        let store = Arc::new(InMemoryAuditStore::new());
        let observer = RecordingObserver::new();
        let service = DecisionService::build_with_observer(
            ServiceConfig::default(),
            PolicyRules::default(),
            store,
            Arc::new(observer.clone()),
        );
        let outcome = service.flow.process(&sample_context(), None).await.unwrap();
        assert!(outcome.decision.audit_id.is_some());
        assert_eq!(observer.recorded().len(), 1);
    }

    #[tokio::test]
    async fn human_override_with_short_reason_is_rejected() {
        use crate::audit::{HumanOverride, OverrideType};

        let store = Arc::new(InMemoryAuditStore::new());
        let service = DecisionService::build(ServiceConfig::default(), PolicyRules::default(), store);
        let override_record = HumanOverride {
            override_id: "o-1".into(),
            decision_id: "d-1".into(),
            override_type: OverrideType::ApproveBlocked,
            original_action: Action::Block,
            new_action: Action::Allow,
            reason: "too short".into(),
            reviewer_id: "reviewer-1".into(),
            timestamp: Utc::now(),
        };
        assert!(service.flow.submit_human_override(override_record).await.is_err());
    }

    #[tokio::test]
    async fn valid_human_override_is_recorded() {
        use crate::audit::{HumanOverride, OverrideType};

        let store = Arc::new(InMemoryAuditStore::new());
        let service = DecisionService::build(ServiceConfig::default(), PolicyRules::default(), store.clone());
        let override_record = HumanOverride {
            override_id: "o-2".into(),
            decision_id: "d-2".into(),
            override_type: OverrideType::EscalateResolved,
            original_action: Action::Escalate,
            new_action: Action::Allow,
            reason: "reviewed evidence and cleared the account manually".into(),
            reviewer_id: "reviewer-1".into(),
            timestamp: Utc::now(),
        };
        let entry_id = service.flow.submit_human_override(override_record).await.unwrap();
        assert!(!entry_id.is_empty());
        let date = Utc::now().date_naive();
        assert_eq!(store.get_entry_count(date).await, 1);
    }
}
