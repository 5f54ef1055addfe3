#![deny(missing_docs, clippy::unwrap_used)]
//! Client-side roles of the tpre network.
//!
//! Two roles live here:
//!
//! * the [`Delegator`](delegator::Delegator) grants access: it derives the
//!   per-policy payload keypair, splits the re-encryption key into
//!   fragments, samples workers deterministically, delivers one sealed
//!   fragment per worker, and returns the signed policy and treasure map;
//! * the [`Retriever`](retriever::Retriever) redeems a grant: it resolves
//!   the map's workers through the fleet, fans out re-encryption requests,
//!   keeps the first threshold of verified answers, cancels the rest, and
//!   decrypts.
//!
//! Every failed call reports which workers were contacted, the failure
//! kind each produced, and whether a retry is sensible (see
//! [`WorkerOutcome`] and [`RetrievalReport`]).

use std::fmt;

use tpre_types::NodeId;

pub mod delegator;
pub mod retriever;
pub mod transport;

pub use delegator::{Delegator, GrantConfig, GrantError, GrantOutcome};
pub use retriever::{Retriever, RetrieveConfig, RetrieveError, RetrieveOutcome};
pub use transport::{TransportError, WorkerApiClient};

/// What happened with one worker during a client call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WorkerOutcomeKind {
    /// The worker answered with verified fragments.
    Served,
    /// The worker could not be reached (connect failure, broken transfer,
    /// timeout).
    Unreachable(String),
    /// The worker answered with a typed rejection.
    Rejected {
        /// The worker's error code.
        code: String,
        /// Whether the worker suggested retrying later.
        retriable: bool,
    },
    /// The worker answered, but its fragments failed proof verification.
    /// The worker is treated as suspicious for this session only.
    InvalidCfrags(String),
    /// The identity is quarantined; it was not contacted.
    Quarantined,
    /// The fleet does not know the identity; it was not contacted.
    NotKnown,
    /// The request was cancelled because the threshold was already met.
    Cancelled,
}

impl WorkerOutcomeKind {
    /// Whether retrying this worker later is sensible.
    pub fn retriable(&self) -> bool {
        match self {
            WorkerOutcomeKind::Served | WorkerOutcomeKind::Cancelled => false,
            WorkerOutcomeKind::Unreachable(_) | WorkerOutcomeKind::NotKnown => true,
            WorkerOutcomeKind::Rejected { retriable, .. } => *retriable,
            WorkerOutcomeKind::InvalidCfrags(_) | WorkerOutcomeKind::Quarantined => false,
        }
    }
}

impl fmt::Display for WorkerOutcomeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerOutcomeKind::Served => f.write_str("served"),
            WorkerOutcomeKind::Unreachable(reason) => write!(f, "unreachable ({reason})"),
            WorkerOutcomeKind::Rejected { code, .. } => write!(f, "rejected ({code})"),
            WorkerOutcomeKind::InvalidCfrags(reason) => write!(f, "invalid cfrags ({reason})"),
            WorkerOutcomeKind::Quarantined => f.write_str("quarantined"),
            WorkerOutcomeKind::NotKnown => f.write_str("not known to the fleet"),
            WorkerOutcomeKind::Cancelled => f.write_str("cancelled"),
        }
    }
}

/// One worker's outcome in a client call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkerOutcome {
    /// The worker.
    pub node_id: NodeId,
    /// What happened.
    pub kind: WorkerOutcomeKind,
}

/// Structured per-worker report attached to client results and failures.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RetrievalReport {
    /// Outcomes in the order workers concluded.
    pub outcomes: Vec<WorkerOutcome>,
}

impl RetrievalReport {
    /// Workers whose fragments failed verification this session.
    pub fn suspicious(&self) -> Vec<NodeId> {
        self.outcomes
            .iter()
            .filter(|outcome| matches!(outcome.kind, WorkerOutcomeKind::InvalidCfrags(_)))
            .map(|outcome| outcome.node_id)
            .collect()
    }

    /// Workers that served verified fragments.
    pub fn served(&self) -> Vec<NodeId> {
        self.outcomes
            .iter()
            .filter(|outcome| outcome.kind == WorkerOutcomeKind::Served)
            .map(|outcome| outcome.node_id)
            .collect()
    }

    /// Whether retrying the whole call later might succeed.
    pub fn retry_sensible(&self) -> bool {
        self.outcomes.iter().any(|outcome| outcome.kind.retriable())
    }
}

impl fmt::Display for RetrievalReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for outcome in &self.outcomes {
            writeln!(f, "{}: {}", outcome.node_id, outcome.kind)?;
        }
        Ok(())
    }
}
