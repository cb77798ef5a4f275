//! The master: sole owner of the node registry and job ledger.
//!
//! Every state change of a job or node flows through [`Master`], either from
//! its inbox or from the external job API.

pub mod coordinator;
pub mod job;
pub mod ledger;
pub mod registry;

pub use coordinator::Master;
pub use job::{DiscardReason, Job, JobEvent, JobSnapshot, JobState, RecordOutcome, Slot};
pub use ledger::{JobEntry, JobLedger};
pub use registry::{Node, NodeRegistry, NodeState};
