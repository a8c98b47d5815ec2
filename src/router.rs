//! Agent router (§4.1): fans the three evaluators out concurrently, then
//! runs confidence calibration and explanation-building serially.
//!
//! Phase-1 fan-out is a `tokio::task::JoinSet` bounded by a
//! `tokio::sync::Semaphore`, replacing the reference source's
//! `ThreadPoolExecutor` singleton with a pool explicitly owned by the
//! `DecisionService` that spawned it — the same "construct once, thread
//! through" discipline `weavegraph`'s `EventBus` workers follow.

use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::calibration::{disagreement_score, CalibrationInputs, ConfidenceCalibrator, ConfidenceVerdict};
use crate::context::InputContext;
use crate::errors::{AgentFailure, ErrorEvent, EvaluatorKind};
use crate::evaluators::{
    BehaviorEvaluation, BehaviorEvaluator, NetworkContext, NetworkEvaluation, NetworkEvaluator, ProfileStore,
    RiskEvaluation, RiskEvaluator,
};
use crate::policy::PolicyRules;

#[derive(Debug, Clone, PartialEq)]
pub struct ExplanationOutput {
    pub explanation: String,
    pub proposed_action: crate::decision::Action,
}

pub struct RouterOutput {
    pub risk: RiskEvaluation,
    pub behavior: BehaviorEvaluation,
    pub network: NetworkEvaluation,
    pub confidence: ConfidenceVerdict,
    pub explanation: ExplanationOutput,
}

/// Default worker-pool size when the caller does not override it (§5
/// "min(N_cpus, configured_max) with a default of 3").
pub fn default_pool_size() -> usize {
    std::thread::available_parallelism().map(|n| n.get()).unwrap_or(3).min(3)
}

pub struct AgentRouter {
    risk: Arc<RiskEvaluator>,
    behavior: Arc<BehaviorEvaluator>,
    network: Arc<NetworkEvaluator>,
    profiles: Arc<ProfileStore>,
    policy_rules: Arc<PolicyRules>,
    semaphore: Arc<Semaphore>,
}

enum EvaluatorOutcome {
    Risk(Result<RiskEvaluation, AgentFailure>),
    Behavior(BehaviorEvaluation),
    Network(NetworkEvaluation),
}

impl AgentRouter {
    pub fn new(
        risk: RiskEvaluator,
        behavior: BehaviorEvaluator,
        network: NetworkEvaluator,
        profiles: Arc<ProfileStore>,
        policy_rules: Arc<PolicyRules>,
        pool_size: usize,
    ) -> Self {
        Self {
            risk: Arc::new(risk),
            behavior: Arc::new(behavior),
            network: Arc::new(network),
            profiles,
            policy_rules,
            semaphore: Arc::new(Semaphore::new(pool_size.max(1))),
        }
    }

    #[tracing::instrument(skip_all, fields(session_id = %context.session.session_id))]
    pub async fn route(
        &self,
        context: &InputContext,
        network_context: Option<&NetworkContext>,
        calibrator: &ConfidenceCalibrator,
    ) -> Result<RouterOutput, AgentFailure> {
        let mut set: JoinSet<EvaluatorOutcome> = JoinSet::new();

        {
            let permit = self.semaphore.clone().acquire_owned().await.expect("semaphore not closed");
            let risk = self.risk.clone();
            let login_event = context.login_event.clone();
            let session = context.session.clone();
            let device = context.device.clone();
            set.spawn(async move {
                let _permit = permit;
                let outcome = risk.evaluate(&login_event, &session, &device).map_err(|err| AgentFailure {
                    evaluator: EvaluatorKind::Risk,
                    event: ErrorEvent::msg(err.to_string()),
                });
                EvaluatorOutcome::Risk(outcome)
            });
        }
        {
            let permit = self.semaphore.clone().acquire_owned().await.expect("semaphore not closed");
            let behavior = self.behavior.clone();
            let profiles = self.profiles.clone();
            let login_event = context.login_event.clone();
            let session = context.session.clone();
            let user = context.user.clone();
            let device_type = context.device.device_type;
            set.spawn(async move {
                let _permit = permit;
                let evaluation = behavior.evaluate(&profiles, &login_event, &session, &user, device_type).await;
                EvaluatorOutcome::Behavior(evaluation)
            });
        }
        {
            let permit = self.semaphore.clone().acquire_owned().await.expect("semaphore not closed");
            let network = self.network.clone();
            let session = context.session.clone();
            let network_context = network_context.cloned();
            set.spawn(async move {
                let _permit = permit;
                let evaluation = network.evaluate(&session, network_context.as_ref());
                EvaluatorOutcome::Network(evaluation)
            });
        }

        let mut risk_result: Option<Result<RiskEvaluation, AgentFailure>> = None;
        let mut behavior_result: Option<BehaviorEvaluation> = None;
        let mut network_result: Option<NetworkEvaluation> = None;
        let mut failures = Vec::new();

        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(EvaluatorOutcome::Risk(Ok(r))) => risk_result = Some(Ok(r)),
                Ok(EvaluatorOutcome::Risk(Err(failure))) => {
                    failures.push(failure.clone());
                    risk_result = Some(Err(failure));
                }
                Ok(EvaluatorOutcome::Behavior(b)) => behavior_result = Some(b),
                Ok(EvaluatorOutcome::Network(n)) => network_result = Some(n),
                Err(join_err) => failures.push(AgentFailure {
                    evaluator: EvaluatorKind::Risk,
                    event: ErrorEvent::msg(format!("evaluator task panicked: {join_err}")),
                }),
            }
        }

        if let Some(failure) = failures.into_iter().next() {
            return Err(failure);
        }

        let risk = risk_result.expect("risk task always resolves")?;
        let behavior = behavior_result.expect("behavior task always resolves");
        let network = network_result.expect("network task always resolves");

        let disagreement = disagreement_score(risk.risk_score, behavior.match_score, network.network_risk);
        let raw_confidence = 1.0 - ((risk.risk_score + network.network_risk + (1.0 - behavior.match_score)) / 3.0);
        let confidence = calibrator.calibrate(&CalibrationInputs {
            raw_confidence: raw_confidence.clamp(0.0, 1.0),
            detection_factors_count: risk.risk_factors.len(),
            network_evidence_count: network.evidence.len(),
            behavioral_match_score: behavior.match_score,
            disagreement_score: disagreement,
        });

        let explanation = build_explanation(&risk, &behavior, &network, &confidence, &self.policy_rules);

        Ok(RouterOutput {
            risk,
            behavior,
            network,
            confidence,
            explanation,
        })
    }
}

/// Phase 3 (§4.1 "explanation builder"): deterministic one-to-three-sentence
/// summary plus a proposed action derived from the aggregated tags and the
/// confidence verdict.
fn build_explanation(
    risk: &RiskEvaluation,
    behavior: &BehaviorEvaluation,
    network: &NetworkEvaluation,
    confidence: &ConfidenceVerdict,
    policy_rules: &PolicyRules,
) -> ExplanationOutput {
    let mut sentences = Vec::new();

    if risk.risk_factors.is_empty() {
        sentences.push("No risk indicators were detected for this login.".to_string());
    } else {
        sentences.push(format!(
            "Risk indicators detected: {}.",
            risk.risk_factors.join(", ")
        ));
    }

    if !behavior.deviations.is_empty() {
        sentences.push(format!("Behavioral deviations: {}.", behavior.deviations.join(", ")));
    }

    if !network.evidence.is_empty() {
        sentences.push(format!("Network evidence: {}.", network.evidence.join(", ")));
    }

    let proposed_action = if confidence.should_escalate() {
        crate::decision::Action::Escalate
    } else {
        policy_rules.recommend_action(risk.risk_score)
    };

    ExplanationOutput {
        explanation: sentences.join(" "),
        proposed_action,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{AuthMethod, Device, DeviceType, GeoLocation, LoginEvent, Session, User};
    use crate::evaluators::NullModel;
    use chrono::Utc;

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
    async fn clean_login_routes_to_low_risk_allow() {
        let _ = NullModel;
        let router = AgentRouter::new(
            RiskEvaluator::heuristic(),
            BehaviorEvaluator::new(true, crate::evaluators::DEFAULT_MIN_SESSIONS_FOR_PROFILE),
            NetworkEvaluator::new(),
            Arc::new(ProfileStore::new()),
            Arc::new(PolicyRules::default()),
            default_pool_size(),
        );
        let calibrator = ConfidenceCalibrator::new();
        let context = sample_context();
        let output = router.route(&context, None, &calibrator).await.unwrap();
        assert!(output.risk.risk_score < 0.5);
        assert!(!output.explanation.explanation.is_empty());
    }
}
