//! Append-only, hash-chained audit ledger (§4.8).

pub mod entry;
pub mod store;
pub mod writer;

pub use entry::{AuditEntry, AuditEventType, HumanOverride, OverrideType};
pub use store::{AuditStore, EntryFilter, FileAuditStore, InMemoryAuditStore, IntegrityViolation};
pub use writer::{AuditLedger, OverflowPolicy, WriterConfig, WriterMetrics};
