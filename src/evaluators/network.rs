//! Network evaluator (§4.4): shared-infrastructure evidence aggregation.
//!
//! Unlike the risk and behavior evaluators, this one has no reference-source
//! implementation to port from — `agents/network/agent.py::analyze` is an
//! unimplemented stub there. The weighted-signal design below is authored
//! directly from §4.4's contract; see `DESIGN.md` for the recorded decision.

use crate::context::Session;

#[derive(Debug, Clone, PartialEq)]
pub struct NetworkEvaluation {
    pub network_risk: f64,
    pub evidence: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct NetworkContext {
    pub ip_shared_account_count: u32,
    pub device_shared_account_count: u32,
    pub is_datacenter_ip: bool,
    pub is_known_proxy_range: bool,
    pub is_in_risky_cluster: bool,
    pub cluster_fraud_rate: f64,
}

const TOR_WEIGHT: f64 = 0.35;
const VPN_WEIGHT: f64 = 0.15;
const DATACENTER_WEIGHT: f64 = 0.20;
const PROXY_RANGE_WEIGHT: f64 = 0.15;
const IP_SHARED_WEIGHT: f64 = 0.15;
const DEVICE_SHARED_WEIGHT: f64 = 0.10;
const RISKY_CLUSTER_MAX_WEIGHT: f64 = 0.25;
const SHARED_ACCOUNT_THRESHOLD: u32 = 3;

pub struct NetworkEvaluator;

impl NetworkEvaluator {
    pub fn new() -> Self {
        Self
    }

    #[tracing::instrument(skip_all, fields(session_id = %session.session_id))]
    pub fn evaluate(&self, session: &Session, context: Option<&NetworkContext>) -> NetworkEvaluation {
        let Some(context) = context else {
            return Self::session_flags_only(session);
        };

        let mut score = 0.0;
        let mut evidence = Vec::new();

        if session.is_tor {
            score += TOR_WEIGHT;
            evidence.push("tor_exit_node_detected".to_string());
        } else if session.is_vpn {
            score += VPN_WEIGHT;
            evidence.push("vpn_or_proxy_detected".to_string());
        }

        if context.is_datacenter_ip {
            score += DATACENTER_WEIGHT;
            evidence.push("datacenter_ip".to_string());
        }
        if context.is_known_proxy_range {
            score += PROXY_RANGE_WEIGHT;
            evidence.push("known_proxy_range".to_string());
        }
        if context.ip_shared_account_count > SHARED_ACCOUNT_THRESHOLD {
            score += IP_SHARED_WEIGHT;
            evidence.push("ip_shared_with_other_accounts".to_string());
        }
        if context.device_shared_account_count > SHARED_ACCOUNT_THRESHOLD {
            score += DEVICE_SHARED_WEIGHT;
            evidence.push("device_shared_with_other_accounts".to_string());
        }
        if context.is_in_risky_cluster {
            score += (RISKY_CLUSTER_MAX_WEIGHT * context.cluster_fraud_rate).min(RISKY_CLUSTER_MAX_WEIGHT);
            evidence.push("risky_network_cluster".to_string());
        }

        NetworkEvaluation {
            network_risk: score.clamp(0.0, 1.0),
            evidence,
        }
    }

    fn session_flags_only(session: &Session) -> NetworkEvaluation {
        let mut evidence = Vec::new();
        let mut score = 0.0;
        if session.is_tor {
            evidence.push("tor_exit_node_detected".to_string());
            score = TOR_WEIGHT;
        } else if session.is_vpn {
            evidence.push("vpn_or_proxy_detected".to_string());
            score = VPN_WEIGHT;
        }
        NetworkEvaluation {
            network_risk: score,
            evidence,
        }
    }
}

impl Default for NetworkEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::GeoLocation;
    use chrono::Utc;

    fn session(vpn: bool, tor: bool) -> Session {
        Session {
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
        }
    }

    #[test]
    fn no_context_and_no_flags_scores_zero() {
        let eval = NetworkEvaluator::new().evaluate(&session(false, false), None);
        assert_eq!(eval.network_risk, 0.0);
        assert!(eval.evidence.is_empty());
    }

    #[test]
    fn no_context_with_tor_flag() {
        let eval = NetworkEvaluator::new().evaluate(&session(false, true), None);
        assert_eq!(eval.evidence, vec!["tor_exit_node_detected".to_string()]);
    }

    #[test]
    fn context_aggregates_multiple_signals() {
        let context = NetworkContext {
            ip_shared_account_count: 10,
            device_shared_account_count: 0,
            is_datacenter_ip: true,
            is_known_proxy_range: false,
            is_in_risky_cluster: true,
            cluster_fraud_rate: 0.5,
        };
        let eval = NetworkEvaluator::new().evaluate(&session(false, false), Some(&context));
        assert!(eval.evidence.contains(&"datacenter_ip".to_string()));
        assert!(eval.evidence.contains(&"ip_shared_with_other_accounts".to_string()));
        assert!(eval.evidence.contains(&"risky_network_cluster".to_string()));
        assert!(eval.network_risk > 0.0 && eval.network_risk <= 1.0);
    }
}
