//! Durable side of the governance ledger: append-only event backends, the
//! content-addressed blob store, the secondary index and read projections.

#![forbid(unsafe_code)]
#![allow(clippy::missing_errors_doc)]

mod backend;
mod content;
mod engine;
mod index;
mod ledger;
mod query;
mod views;

pub use backend::{
    JsonlLedgerBackend, LedgerBackend, LedgerWrite, MemoryLedgerBackend, SqliteLedgerBackend,
};
pub use content::{ContentIntegrity, ContentStore, FsContentStore, MemoryContentStore};
pub use engine::QueryEngine;
pub use index::{IndexStats, LedgerIndex};
pub use ledger::{EventLedger, ExecutionClaim};
pub use query::{Order, QueryFilter};
pub use views::{
    AuditTrail, ConstraintDataStatus, ConstraintSummary, EvaluationCounts, InvariantSummary,
    RelatedArtifacts, RuleSummary, TimelineEntry,
};
