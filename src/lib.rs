//! Concurrent authentication risk decision core.
//!
//! A login attempt flows through three independent evaluators run in
//! parallel ([`evaluators`]), a confidence calibrator ([`calibration`]),
//! a policy engine ([`policy`]), and a hash-chained audit ledger
//! ([`audit`]) — composed end to end by [`decision::DecisionFlow`].
//!
//! ```no_run
//! use std::sync::Arc;
//! use aegis_decision_core::audit::InMemoryAuditStore;
//! use aegis_decision_core::config::ServiceConfig;
//! use aegis_decision_core::decision::DecisionService;
//! use aegis_decision_core::policy::PolicyRules;
//!
//! # async fn run(context: aegis_decision_core::context::InputContext) -> Result<(), aegis_decision_core::errors::DecisionError> {
//! let store = Arc::new(InMemoryAuditStore::new());
//! let service = DecisionService::build(ServiceConfig::default(), PolicyRules::default(), store);
//! let outcome = service.flow.process(&context, None).await?;
//! println!("{:?}", outcome.decision.action);
//! # Ok(())
//! # }
//! ```
//!
//! ## Module guide
//!
//! - [`context`] - the immutable per-request case file
//! - [`evaluators`] - risk, behavior, and network evaluators
//! - [`calibration`] - confidence calibration and the escalation drift monitor
//! - [`policy`] - the veto/escalate rule engine
//! - [`router`] - phase 1-3 fan-out and explanation building
//! - [`decision`] - `DecisionFlow` and the `DecisionService` composition root
//! - [`audit`] - the hash-chained ledger and its background writer
//! - [`config`] - environment-driven service configuration
//! - [`telemetry`] - logging setup and the decision-outcome observer seam

pub mod audit;
pub mod calibration;
pub mod config;
pub mod context;
pub mod decision;
pub mod errors;
pub mod evaluators;
pub mod policy;
pub mod router;
pub mod telemetry;
pub mod util;
