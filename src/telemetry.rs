//! Structured logging setup and a pluggable decision-outcome observer.
//!
//! Restates `weavegraph`'s `EventBus` multi-sink abstraction (several
//! pluggable sinks, one of which is memory-backed for tests) over
//! `tracing` rather than a bespoke event bus: `tracing` already gives this
//! crate fan-out-to-many-subscribers for free, so the only thing on top
//! is a narrow `DecisionObserver` seam, wired into `DecisionFlow` so
//! callers can get typed decision-outcome events instead of parsing log
//! lines.

use std::sync::{Arc, Mutex};

use tracing_subscriber::EnvFilter;

use crate::decision::FinalDecision;

/// Initializes the global `tracing` subscriber once per process. Safe to
/// call multiple times in tests; later calls are no-ops.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).with_target(false).try_init();
}

/// A sink for decision outcomes, independent of the `tracing` event
/// stream. Wired into `DecisionFlow`/`DecisionService::build_with_observer`
/// (defaulting to `NullObserver`) for callers that want structured
/// `FinalDecision` values directly instead of parsing log lines.
pub trait DecisionObserver: Send + Sync {
    fn observe(&self, decision: &FinalDecision);
}

/// No-op observer, the default when nothing else is wired up.
#[derive(Debug, Default)]
pub struct NullObserver;

impl DecisionObserver for NullObserver {
    fn observe(&self, _decision: &FinalDecision) {}
}

/// In-memory observer used by tests and by the operational metadata index
/// collaborator's local fan-out, grounded in `weavegraph`'s
/// `EventBus` memory sink.
#[derive(Debug, Default, Clone)]
pub struct RecordingObserver {
    decisions: Arc<Mutex<Vec<FinalDecision>>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn recorded(&self) -> Vec<FinalDecision> {
        self.decisions.lock().expect("recording observer mutex poisoned").clone()
    }
}

impl DecisionObserver for RecordingObserver {
    fn observe(&self, decision: &FinalDecision) {
        self.decisions.lock().expect("recording observer mutex poisoned").push(decision.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decision::{Action, DecidedBy};
    use chrono::Utc;

    fn sample_decision() -> FinalDecision {
        FinalDecision {
            decision_id: "d-1".to_string(),
            timestamp: Utc::now(),
            action: Action::Allow,
            decided_by: DecidedBy::Ai,
            confidence: 0.9,
            explanation: "clean login".to_string(),
            session_id: "s-1".to_string(),
            user_id: "u-1".to_string(),
            risk_score: 0.1,
            behavior_match_score: 0.95,
            network_risk: 0.0,
            disagreement: 0.05,
            audit_id: None,
        }
    }

    #[test]
    fn recording_observer_accumulates_decisions() {
        let observer = RecordingObserver::new();
        observer.observe(&sample_decision());
        observer.observe(&sample_decision());
        assert_eq!(observer.recorded().len(), 2);
    }

    #[test]
    fn null_observer_does_nothing() {
        NullObserver.observe(&sample_decision());
    }
}
