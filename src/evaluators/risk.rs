//! Risk evaluator (§4.2): converts login features into a calibrated risk
//! probability with per-feature attribution.

use crate::context::{Device, LoginEvent, Session};
use crate::errors::DecisionError;

pub const FEATURE_COUNT: usize = 14;

/// Canonical feature order, ported verbatim from the reference source's
/// `FEATURE_NAMES` registry.
pub const FEATURE_NAMES: [&str; FEATURE_COUNT] = [
    "is_new_device",
    "device_not_known",
    "is_new_ip",
    "is_new_location",
    "is_vpn",
    "is_tor",
    "failed_attempts_before",
    "failed_attempts_capped",
    "time_since_last_login_hours",
    "is_long_absence",
    "auth_method_password",
    "auth_method_mfa",
    "auth_method_sso",
    "auth_method_biometric",
];

const FAILED_ATTEMPTS_CAP: u32 = 3;
const LONG_ABSENCE_HOURS: f64 = 720.0;

/// Extracts the fixed 14-feature vector for a login in the order named by
/// `FEATURE_NAMES`.
pub fn extract_features(login_event: &LoginEvent, session: &Session, device: &Device) -> [f64; FEATURE_COUNT] {
    let is_new_device = login_event.is_new_device || !device.is_known;
    let capped_attempts = login_event.failed_attempts_before.min(FAILED_ATTEMPTS_CAP);
    let time_since = login_event.time_since_last_login_hours.unwrap_or(-1.0);
    let is_long_absence = login_event
        .time_since_last_login_hours
        .map(|h| h > LONG_ABSENCE_HOURS)
        .unwrap_or(false);

    let mut auth_one_hot = [0.0f64; 4];
    auth_one_hot[login_event.auth_method.one_hot_index()] = 1.0;

    [
        bool_f(is_new_device),
        bool_f(!device.is_known),
        bool_f(login_event.is_new_ip),
        bool_f(login_event.is_new_location),
        bool_f(session.is_vpn),
        bool_f(session.is_tor),
        capped_attempts as f64,
        bool_f(login_event.failed_attempts_before >= FAILED_ATTEMPTS_CAP),
        time_since,
        bool_f(is_long_absence),
        auth_one_hot[0],
        auth_one_hot[1],
        auth_one_hot[2],
        auth_one_hot[3],
    ]
}

fn bool_f(b: bool) -> f64 {
    if b { 1.0 } else { 0.0 }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RiskEvaluation {
    pub risk_score: f64,
    pub risk_factors: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RiskPrediction {
    pub probability: f64,
    pub attributions: Option<[f64; FEATURE_COUNT]>,
}

/// Pluggable scoring backend (§4.2 "Model artifact abstraction"). The
/// default implementation ships no trained model; it is the seam a real
/// artifact loader plugs into.
pub trait RiskModel: Send + Sync {
    fn predict(&self, features: &[f64; FEATURE_COUNT]) -> Result<RiskPrediction, DecisionError>;
}

/// A `RiskModel` that always fails, used in tests to exercise the
/// `fallback_to_heuristic` path.
#[derive(Debug, Default)]
pub struct NullModel;

impl RiskModel for NullModel {
    fn predict(&self, _features: &[f64; FEATURE_COUNT]) -> Result<RiskPrediction, DecisionError> {
        Err(DecisionError::Model("no model artifact loaded".into()))
    }
}

struct WeightedIndicator {
    tag: &'static str,
    weight: f64,
    active: bool,
}

pub struct RiskEvaluator {
    model: Option<Box<dyn RiskModel>>,
    fallback_to_heuristic: bool,
}

impl RiskEvaluator {
    /// Heuristic-only evaluator; this is the default §4.2 "otherwise" path.
    pub fn heuristic() -> Self {
        Self {
            model: None,
            fallback_to_heuristic: true,
        }
    }

    pub fn with_model(model: Box<dyn RiskModel>, fallback_to_heuristic: bool) -> Self {
        Self {
            model: Some(model),
            fallback_to_heuristic,
        }
    }

    #[tracing::instrument(skip_all, fields(session_id = %session.session_id))]
    pub fn evaluate(
        &self,
        login_event: &LoginEvent,
        session: &Session,
        device: &Device,
    ) -> Result<RiskEvaluation, DecisionError> {
        let features = extract_features(login_event, session, device);

        if let Some(model) = &self.model {
            match model.predict(&features) {
                Ok(prediction) => return Ok(Self::from_model_prediction(prediction)),
                Err(err) if self.fallback_to_heuristic => {
                    tracing::warn!(error = %err, "risk model failed, falling back to heuristic");
                }
                Err(err) => return Err(err),
            }
        }

        Ok(Self::heuristic_score(login_event, session, device))
    }

    fn from_model_prediction(prediction: RiskPrediction) -> RiskEvaluation {
        let score = prediction.probability.clamp(0.0, 1.0);
        let mut tags: Vec<(usize, f64, &'static str)> = Vec::new();
        if let Some(attributions) = prediction.attributions {
            for (idx, &value) in attributions.iter().enumerate() {
                if value > 0.02 {
                    tags.push((idx, value, feature_to_factor_name(FEATURE_NAMES[idx])));
                }
            }
        }
        tags.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap().then(a.0.cmp(&b.0)));
        tags.truncate(5);
        RiskEvaluation {
            risk_score: score,
            risk_factors: tags.into_iter().map(|(_, _, tag)| tag.to_string()).collect(),
        }
    }

    fn heuristic_score(login_event: &LoginEvent, session: &Session, device: &Device) -> RiskEvaluation {
        let capped_attempts = login_event.failed_attempts_before.min(FAILED_ATTEMPTS_CAP);
        let long_absence = login_event
            .time_since_last_login_hours
            .map(|h| h > LONG_ABSENCE_HOURS)
            .unwrap_or(false);

        let indicators = [
            WeightedIndicator {
                tag: "new_device_detected",
                weight: 0.25,
                active: login_event.is_new_device || !device.is_known,
            },
            WeightedIndicator {
                tag: "login_from_new_ip",
                weight: 0.15,
                active: login_event.is_new_ip,
            },
            WeightedIndicator {
                tag: "login_from_new_country",
                weight: 0.30,
                active: login_event.is_new_location,
            },
            WeightedIndicator {
                tag: "high_login_velocity_failed_attempts",
                weight: 0.10 * capped_attempts as f64,
                active: login_event.failed_attempts_before > 0,
            },
            WeightedIndicator {
                tag: "vpn_or_proxy_detected",
                weight: 0.10,
                active: session.is_vpn,
            },
            WeightedIndicator {
                tag: "tor_exit_node_detected",
                weight: 0.35,
                active: session.is_tor,
            },
            WeightedIndicator {
                tag: "login_after_extended_absence",
                weight: 0.10,
                active: long_absence,
            },
        ];

        let mut score = 0.0;
        let mut factors = Vec::new();
        for indicator in indicators {
            if indicator.active {
                score += indicator.weight;
                factors.push(indicator.tag.to_string());
            }
        }

        RiskEvaluation {
            risk_score: score.clamp(0.0, 1.0),
            risk_factors: factors,
        }
    }
}

/// Maps a feature name to the human-readable factor tag used in
/// model-path attribution, a 1:1 port of the reference source's
/// `feature_to_factor_name` mapping table. Unknown names pass through
/// unchanged, matching the reference's `dict.get(name, name)` fallback.
fn feature_to_factor_name(feature_name: &str) -> &str {
    match feature_name {
        "is_new_device" => "new_device_detected",
        "device_not_known" => "unknown_device",
        "is_new_ip" => "login_from_new_ip",
        "is_new_location" => "login_from_new_country",
        "is_vpn" => "vpn_or_proxy_detected",
        "is_tor" => "tor_exit_node_detected",
        "failed_attempts_before" => "high_login_velocity",
        "failed_attempts_capped" => "excessive_failed_attempts",
        "time_since_last_login_hours" => "unusual_login_timing",
        "is_long_absence" => "login_after_extended_absence",
        "auth_method_password" => "password_auth",
        "auth_method_mfa" => "mfa_auth",
        "auth_method_sso" => "sso_auth",
        "auth_method_biometric" => "biometric_auth",
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{AuthMethod, DeviceType, GeoLocation};
    use chrono::Utc;

    fn login(is_new_device: bool, failed: u32, vpn: bool, tor: bool, time_since: Option<f64>) -> (LoginEvent, Session, Device) {
        let login_event = LoginEvent {
            event_id: "e".into(),
            timestamp: Utc::now(),
            success: true,
            auth_method: AuthMethod::Password,
            failed_attempts_before: failed,
            time_since_last_login_hours: time_since,
            is_new_device,
            is_new_ip: false,
            is_new_location: false,
            session_id: "s".into(),
            user_id: "u".into(),
        };
        let session = Session {
            session_id: "s".into(),
            device_id: "d".into(),
            ip_address: "1.2.3.4".into(),
            geo_location: GeoLocation {
                city: "x".into(),
                country: "US".into(),
                latitude: 0.0,
                longitude: 0.0,
            },
            start_time: Utc::now(),
            is_vpn: vpn,
            is_tor: tor,
        };
        let device = Device {
            device_id: "d".into(),
            device_type: DeviceType::Desktop,
            os: "x".into(),
            browser: "x".into(),
            is_known: !is_new_device,
            first_seen_at: None,
        };
        (login_event, session, device)
    }

    #[test]
    fn clean_login_scores_zero() {
        let (le, s, d) = login(false, 0, false, false, Some(1.0));
        let eval = RiskEvaluator::heuristic_score(&le, &s, &d);
        assert_eq!(eval.risk_score, 0.0);
        assert!(eval.risk_factors.is_empty());
    }

    #[test]
    fn failed_attempts_cap_at_three() {
        let (le, s, d) = login(false, 10, false, false, None);
        let eval = RiskEvaluator::heuristic_score(&le, &s, &d);
        // 0.10 * 3 = 0.30, same as 3 failed attempts
        assert!((eval.risk_score - 0.30).abs() < 1e-9);
    }

    #[test]
    fn tor_and_vpn_stack_and_clamp() {
        let (le, s, d) = login(true, 10, true, true, Some(1000.0));
        let eval = RiskEvaluator::heuristic_score(&le, &s, &d);
        // 0.25 + 0.30 + 0.10 + 0.35 + 0.10 = 1.10 -> clamped to 1.0
        assert_eq!(eval.risk_score, 1.0);
        assert!(eval.risk_factors.contains(&"tor_exit_node_detected".to_string()));
    }

    #[test]
    fn feature_vector_matches_fixed_order() {
        let (le, s, d) = login(true, 5, true, false, None);
        let features = extract_features(&le, &s, &d);
        assert_eq!(features[0], 1.0); // is_new_device
        assert_eq!(features[6], 3.0); // failed_attempts_before capped
        assert_eq!(features[8], -1.0); // missing time_since -> -1
    }

    #[test]
    fn null_model_falls_back_to_heuristic() {
        let evaluator = RiskEvaluator::with_model(Box::new(NullModel), true);
        let (le, s, d) = login(true, 0, false, false, None);
        let result = evaluator.evaluate(&le, &s, &d).unwrap();
        assert!(result.risk_score > 0.0);
    }

    #[test]
    fn null_model_without_fallback_errors() {
        let evaluator = RiskEvaluator::with_model(Box::new(NullModel), false);
        let (le, s, d) = login(true, 0, false, false, None);
        assert!(evaluator.evaluate(&le, &s, &d).is_err());
    }
}
