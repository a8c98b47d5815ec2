//! Confidence calibration (§4.5): turns the three evaluators' raw outputs
//! into a single, trustworthy confidence figure and a gatekeeping decision
//! on whether a human must review the login.
//!
//! The four-step penalty/boost pipeline below is ported bit-for-bit, in
//! its original order, from the reference source's `ConfidenceCalibrator`.
//! The disagreement-score formula that feeds it has no ground truth in the
//! reference source (`calibrate()` takes `disagreement_score` as an
//! already-computed argument) and is authored here from spec alone; see
//! `DESIGN.md` for the recorded decision.

use serde::{Deserialize, Serialize};

const OVERCONFIDENCE_THRESHOLD: f64 = 0.92;
const OVERCONFIDENCE_PENALTY_RATE: f64 = 0.4;
const STRONG_AGREEMENT: f64 = 0.15;
const DISAGREEMENT_WARNING: f64 = 0.25;
const DISAGREEMENT_CRITICAL: f64 = 0.40;
const MIN_ESCALATION_RATE: f64 = 0.15;
const ESCALATION_BOOST_THRESHOLD: f64 = 0.65;
const MISSING_DETECTION_FACTORS_PENALTY: f64 = 0.08;
const MISSING_NETWORK_EVIDENCE_PENALTY: f64 = 0.05;
const WEAK_BEHAVIORAL_MATCH_PENALTY: f64 = 0.06;

const ESCALATE_CONFIDENCE_FLOOR: f64 = 0.75;
const ESCALATE_DISAGREEMENT_CEILING: f64 = 0.30;

/// Dispersion across the three evaluator outputs, in `[0, 1]`.
///
/// Treats behavior as `1 - match_score` per spec, then takes the range
/// (max - min) of the three resulting risk-flavored scalars. Range is
/// simple, symmetric, and already bounded in `[0, 1]` given inputs in
/// `[0, 1]`, so no further normalization is needed.
pub fn disagreement_score(risk_score: f64, behavioral_match_score: f64, network_risk: f64) -> f64 {
    let behavioral_risk = 1.0 - behavioral_match_score;
    let values = [risk_score, behavioral_risk, network_risk];
    let max = values.iter().cloned().fold(f64::MIN, f64::max);
    let min = values.iter().cloned().fold(f64::MAX, f64::min);
    (max - min).clamp(0.0, 1.0)
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CalibrationBreakdown {
    pub raw_confidence: f64,
    pub overconfidence_penalty: f64,
    pub disagreement_penalty: f64,
    pub agreement_boost: f64,
    pub evidence_penalty: f64,
    pub escalation_boost: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DecisionPermission {
    AiAllowed,
    HumanRequired,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceVerdict {
    pub final_confidence: f64,
    pub permission: DecisionPermission,
    pub disagreement_score: f64,
    pub calibration_breakdown: CalibrationBreakdown,
    pub escalation_reason: Option<String>,
}

impl ConfidenceVerdict {
    pub fn should_escalate(&self) -> bool {
        matches!(self.permission, DecisionPermission::HumanRequired)
    }
}

/// Inputs to a single calibration pass, named after the evaluator outputs
/// that produce them.
pub struct CalibrationInputs {
    pub raw_confidence: f64,
    pub detection_factors_count: usize,
    pub network_evidence_count: usize,
    pub behavioral_match_score: f64,
    pub disagreement_score: f64,
}

/// Running escalation-rate monitor (§4.5 "drift signal").
///
/// The reference source keeps a pair of running counters (`total`/`recent`,
/// the latter reset every `window_size` decisions) rather than a literal
/// ring buffer; that counter-pair shape is what's ported here, over the
/// more literal "rolling window" framing in this crate's own expanded
/// specification — it's simpler, matches the actual source behavior, and
/// `reset_recent()` gives the same periodic-rate-check semantics a ring
/// buffer would.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct EscalationMetrics {
    pub total_decisions: u64,
    pub escalations: u64,
    pub recent_decisions: u64,
    pub recent_escalations: u64,
}

impl EscalationMetrics {
    pub fn overall_rate(&self) -> f64 {
        if self.total_decisions == 0 {
            0.0
        } else {
            self.escalations as f64 / self.total_decisions as f64
        }
    }

    pub fn recent_rate(&self) -> f64 {
        if self.recent_decisions == 0 {
            0.0
        } else {
            self.recent_escalations as f64 / self.recent_decisions as f64
        }
    }

    pub fn record(&mut self, escalated: bool) {
        self.total_decisions += 1;
        self.recent_decisions += 1;
        if escalated {
            self.escalations += 1;
            self.recent_escalations += 1;
        }
    }

    pub fn reset_recent(&mut self) {
        self.recent_decisions = 0;
        self.recent_escalations = 0;
    }
}

/// Stateful calibrator: pure scoring plus the drift monitor's running
/// counters and the recalibration flag they can trip.
#[derive(Debug, Default)]
pub struct ConfidenceCalibrator {
    metrics: EscalationMetrics,
    recalibration_needed: bool,
}

impl ConfidenceCalibrator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn metrics(&self) -> EscalationMetrics {
        self.metrics
    }

    pub fn recalibration_needed(&self) -> bool {
        self.recalibration_needed
    }

    pub fn reset_recalibration_flag(&mut self) {
        self.recalibration_needed = false;
    }

    /// Records a decision for escalation-rate monitoring and trips the
    /// recalibration flag if the recent escalation rate falls below
    /// `MIN_ESCALATION_RATE` once the window fills.
    pub fn record_decision(&mut self, escalated: bool, window_size: u64) {
        self.metrics.record(escalated);
        if self.metrics.recent_decisions >= window_size {
            if self.metrics.recent_rate() < MIN_ESCALATION_RATE {
                self.recalibration_needed = true;
            }
            self.metrics.reset_recent();
        }
    }

    /// Runs the four-step penalty/boost pipeline and the escalation gate.
    /// Order matters: overconfidence, then disagreement/agreement, then
    /// evidence, then the escalation nudge.
    pub fn calibrate(&self, inputs: &CalibrationInputs) -> ConfidenceVerdict {
        let CalibrationInputs {
            raw_confidence,
            detection_factors_count,
            network_evidence_count,
            behavioral_match_score,
            disagreement_score,
        } = *inputs;

        let mut calibrated = raw_confidence;
        let mut overconfidence_penalty = 0.0;
        let mut disagreement_penalty = 0.0;
        let mut agreement_boost = 0.0;
        let mut evidence_penalty = 0.0;
        let mut escalation_boost = 0.0;

        // Step 1: overconfidence penalty, damped by strong agreement.
        if calibrated > OVERCONFIDENCE_THRESHOLD {
            let excess = calibrated - OVERCONFIDENCE_THRESHOLD;
            overconfidence_penalty = excess * OVERCONFIDENCE_PENALTY_RATE;
            if disagreement_score > STRONG_AGREEMENT {
                overconfidence_penalty *= 1.0 + disagreement_score;
            } else {
                overconfidence_penalty *= 0.3;
            }
            calibrated -= overconfidence_penalty;
        }

        // Step 2: disagreement penalty or agreement boost.
        if disagreement_score >= DISAGREEMENT_CRITICAL {
            disagreement_penalty = 0.20 + (disagreement_score - DISAGREEMENT_CRITICAL) * 0.4;
        } else if disagreement_score >= DISAGREEMENT_WARNING {
            disagreement_penalty = (disagreement_score - DISAGREEMENT_WARNING) * 0.4;
        } else if disagreement_score < STRONG_AGREEMENT {
            agreement_boost = 0.05;
        }
        calibrated = calibrated - disagreement_penalty + agreement_boost;

        // Step 3: evidence penalties, halved when agents agree strongly.
        let evidence_multiplier = if disagreement_score < STRONG_AGREEMENT { 0.5 } else { 1.0 };

        if detection_factors_count == 0 && raw_confidence < 0.7 {
            evidence_penalty += MISSING_DETECTION_FACTORS_PENALTY * evidence_multiplier;
        }
        if network_evidence_count == 0 && disagreement_score >= DISAGREEMENT_WARNING {
            evidence_penalty += MISSING_NETWORK_EVIDENCE_PENALTY * evidence_multiplier;
        }
        if behavioral_match_score < 0.5 && raw_confidence > 0.7 && disagreement_score >= STRONG_AGREEMENT {
            evidence_penalty += WEAK_BEHAVIORAL_MATCH_PENALTY * evidence_multiplier;
        }
        calibrated -= evidence_penalty;

        // Step 4: escalation nudge.
        if calibrated < ESCALATION_BOOST_THRESHOLD && disagreement_score >= DISAGREEMENT_WARNING {
            escalation_boost = (ESCALATION_BOOST_THRESHOLD - calibrated) * 0.15;
            calibrated -= escalation_boost;
        }

        calibrated = calibrated.clamp(0.0, 1.0);

        let should_escalate = calibrated < ESCALATE_CONFIDENCE_FLOOR || disagreement_score > ESCALATE_DISAGREEMENT_CEILING;
        let permission = if should_escalate {
            DecisionPermission::HumanRequired
        } else {
            DecisionPermission::AiAllowed
        };
        let escalation_reason = should_escalate.then(|| {
            if disagreement_score > ESCALATE_DISAGREEMENT_CEILING {
                "HIGH_DISAGREEMENT".to_string()
            } else {
                "LOW_CONFIDENCE".to_string()
            }
        });

        ConfidenceVerdict {
            final_confidence: calibrated,
            permission,
            disagreement_score,
            calibration_breakdown: CalibrationBreakdown {
                raw_confidence,
                overconfidence_penalty,
                disagreement_penalty,
                agreement_boost,
                evidence_penalty,
                escalation_boost,
            },
            escalation_reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inputs(raw: f64, disagreement: f64) -> CalibrationInputs {
        CalibrationInputs {
            raw_confidence: raw,
            detection_factors_count: 1,
            network_evidence_count: 1,
            behavioral_match_score: 0.9,
            disagreement_score: disagreement,
        }
    }

    #[test]
    fn clean_high_confidence_low_disagreement_is_ai_allowed() {
        let calibrator = ConfidenceCalibrator::new();
        let verdict = calibrator.calibrate(&inputs(0.85, 0.05));
        assert_eq!(verdict.permission, DecisionPermission::AiAllowed);
        assert!(verdict.calibration_breakdown.agreement_boost > 0.0);
        assert!(verdict.escalation_reason.is_none());
    }

    #[test]
    fn high_disagreement_forces_human_required() {
        let calibrator = ConfidenceCalibrator::new();
        let verdict = calibrator.calibrate(&inputs(0.9, 0.5));
        assert_eq!(verdict.permission, DecisionPermission::HumanRequired);
        assert_eq!(verdict.escalation_reason.as_deref(), Some("HIGH_DISAGREEMENT"));
        assert!(verdict.calibration_breakdown.disagreement_penalty > 0.0);
    }

    #[test]
    fn overconfidence_penalty_applies_above_threshold() {
        let calibrator = ConfidenceCalibrator::new();
        let verdict = calibrator.calibrate(&inputs(0.97, 0.05));
        assert!(verdict.calibration_breakdown.overconfidence_penalty > 0.0);
        assert!(verdict.final_confidence < 0.97);
    }

    #[test]
    fn low_confidence_without_disagreement_still_escalates_on_floor() {
        let calibrator = ConfidenceCalibrator::new();
        let verdict = calibrator.calibrate(&inputs(0.5, 0.05));
        assert_eq!(verdict.permission, DecisionPermission::HumanRequired);
        assert_eq!(verdict.escalation_reason.as_deref(), Some("LOW_CONFIDENCE"));
    }

    #[test]
    fn missing_evidence_penalizes_suspicious_high_risk_claim() {
        let calibrator = ConfidenceCalibrator::new();
        let verdict = calibrator.calibrate(&CalibrationInputs {
            raw_confidence: 0.6,
            detection_factors_count: 0,
            network_evidence_count: 0,
            behavioral_match_score: 0.9,
            disagreement_score: 0.3,
        });
        assert!(verdict.calibration_breakdown.evidence_penalty > 0.0);
    }

    #[test]
    fn disagreement_score_is_zero_when_all_agree() {
        assert_eq!(disagreement_score(0.2, 0.8, 0.2), 0.0);
    }

    #[test]
    fn disagreement_score_reflects_spread() {
        let score = disagreement_score(0.9, 0.95, 0.1);
        assert!((score - 0.85).abs() < 1e-9);
    }

    #[test]
    fn escalation_metrics_trip_recalibration_on_low_recent_rate() {
        let mut calibrator = ConfidenceCalibrator::new();
        for _ in 0..10 {
            calibrator.record_decision(false, 10);
        }
        assert!(calibrator.recalibration_needed());
        assert_eq!(calibrator.metrics().recent_decisions, 0);
    }
}
