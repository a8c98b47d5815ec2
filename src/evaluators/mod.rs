//! The three independent evaluators (§4.1 "Evaluator / agent"): risk,
//! behavior, and network. Each observes only the `InputContext` fields it
//! needs and never observes another evaluator's output.

pub mod behavior;
pub mod network;
pub mod risk;

pub use behavior::{BehaviorEvaluation, BehaviorEvaluator, BehavioralProfile, ProfileStore, DEFAULT_MIN_SESSIONS_FOR_PROFILE};
pub use network::{NetworkContext, NetworkEvaluation, NetworkEvaluator};
pub use risk::{NullModel, RiskEvaluation, RiskEvaluator, RiskModel, RiskPrediction};
