//! Stock Reservation Protocol Types
//!
//! States, rejection reasons, outcomes and the per-attempt trace.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::domain::ports::{GeneratedId, UserId, VoucherId};

// =============================================================================
// Reservation State Machine
// =============================================================================

/// States of one reservation attempt
///
/// ```text
///   Validating ─▶ Serializing ─▶ ReservingStock ─▶ Minting ─▶ Committed
///        │              │               │
///        └──────────────┴───────────────┴──────────────────▶ Rejected
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ReservationState {
    /// Checking the sale window and the stock hint
    Validating,
    /// Waiting for the per-user lock
    Serializing,
    /// Idempotency check and conditional decrement
    ReservingStock,
    /// Minting the order id and inserting the order
    Minting,
    /// Order committed
    Committed,
    /// Attempt refused
    Rejected,
}

impl std::fmt::Display for ReservationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReservationState::Validating => write!(f, "Validating"),
            ReservationState::Serializing => write!(f, "Serializing"),
            ReservationState::ReservingStock => write!(f, "ReservingStock"),
            ReservationState::Minting => write!(f, "Minting"),
            ReservationState::Committed => write!(f, "Committed"),
            ReservationState::Rejected => write!(f, "Rejected"),
        }
    }
}

// =============================================================================
// Outcomes
// =============================================================================

/// Why a reservation was refused. Never retried by the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Rejection {
    /// No voucher with that id
    VoucherNotFound,
    /// The sale window has not opened
    NotStarted,
    /// The sale window has closed
    Ended,
    /// Out of stock (hint or authoritative decrement)
    InsufficientStock,
    /// The user already holds an order for this voucher
    AlreadyOrdered,
    /// The per-user lock stayed busy for every retry
    LockContention,
}

impl Rejection {
    pub const ALL: [Rejection; 6] = [
        Rejection::VoucherNotFound,
        Rejection::NotStarted,
        Rejection::Ended,
        Rejection::InsufficientStock,
        Rejection::AlreadyOrdered,
        Rejection::LockContention,
    ];

    /// Stable snake_case label, used in logs and metric names
    pub fn as_str(&self) -> &'static str {
        match self {
            Rejection::VoucherNotFound => "voucher_not_found",
            Rejection::NotStarted => "not_started",
            Rejection::Ended => "ended",
            Rejection::InsufficientStock => "insufficient_stock",
            Rejection::AlreadyOrdered => "already_ordered",
            Rejection::LockContention => "lock_contention",
        }
    }
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Rejection::VoucherNotFound => write!(f, "voucher does not exist"),
            Rejection::NotStarted => write!(f, "sale has not started"),
            Rejection::Ended => write!(f, "sale has ended"),
            Rejection::InsufficientStock => write!(f, "insufficient stock"),
            Rejection::AlreadyOrdered => write!(f, "user already ordered this voucher"),
            Rejection::LockContention => write!(f, "too many concurrent requests for this user"),
        }
    }
}

/// Result of a reservation attempt that reached a decision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ReservationOutcome {
    Committed(GeneratedId),
    Rejected(Rejection),
}

impl ReservationOutcome {
    pub fn is_committed(&self) -> bool {
        matches!(self, ReservationOutcome::Committed(_))
    }

    pub fn order_id(&self) -> Option<GeneratedId> {
        match self {
            ReservationOutcome::Committed(id) => Some(*id),
            ReservationOutcome::Rejected(_) => None,
        }
    }

    pub fn rejection(&self) -> Option<Rejection> {
        match self {
            ReservationOutcome::Committed(_) => None,
            ReservationOutcome::Rejected(reason) => Some(*reason),
        }
    }
}

impl From<Rejection> for ReservationOutcome {
    fn from(reason: Rejection) -> Self {
        ReservationOutcome::Rejected(reason)
    }
}

impl std::fmt::Display for ReservationOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReservationOutcome::Committed(id) => write!(f, "committed order {}", id),
            ReservationOutcome::Rejected(reason) => write!(f, "rejected: {}", reason),
        }
    }
}

// =============================================================================
// Trace
// =============================================================================

/// A state entered by one attempt, and when
#[derive(Debug, Clone, Copy, Serialize)]
pub struct ReservationStep {
    pub state: ReservationState,
    pub at: DateTime<Utc>,
}

/// Record of one reservation attempt, kept in the service history
#[derive(Debug, Clone, Serialize)]
pub struct ReservationTrace {
    pub user_id: UserId,
    pub voucher_id: VoucherId,
    pub started_at: DateTime<Utc>,
    pub steps: Vec<ReservationStep>,
    /// `None` while running or when the attempt errored
    pub outcome: Option<ReservationOutcome>,
    pub error: Option<String>,
}

impl ReservationTrace {
    pub(crate) fn new(user_id: UserId, voucher_id: VoucherId) -> Self {
        let started_at = Utc::now();
        Self {
            user_id,
            voucher_id,
            started_at,
            steps: vec![ReservationStep {
                state: ReservationState::Validating,
                at: started_at,
            }],
            outcome: None,
            error: None,
        }
    }

    pub(crate) fn transition(&mut self, state: ReservationState) {
        self.steps.push(ReservationStep {
            state,
            at: Utc::now(),
        });
    }

    pub(crate) fn finish(&mut self, outcome: ReservationOutcome) {
        let state = match outcome {
            ReservationOutcome::Committed(_) => ReservationState::Committed,
            ReservationOutcome::Rejected(_) => ReservationState::Rejected,
        };
        self.transition(state);
        self.outcome = Some(outcome);
    }

    pub(crate) fn fail(&mut self, error: &str) {
        self.transition(ReservationState::Rejected);
        self.error = Some(error.to_string());
    }

    /// Current (last entered) state
    pub fn state(&self) -> ReservationState {
        self.steps
            .last()
            .map(|s| s.state)
            .unwrap_or(ReservationState::Validating)
    }

    /// States visited, in order
    pub fn states(&self) -> Vec<ReservationState> {
        self.steps.iter().map(|s| s.state).collect()
    }

    /// Time from the first to the last recorded step
    pub fn elapsed(&self) -> chrono::Duration {
        self.steps
            .last()
            .map(|s| s.at - self.started_at)
            .unwrap_or_else(chrono::Duration::zero)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_helpers() {
        let committed = ReservationOutcome::Committed(GeneratedId::compose(5, 1));
        assert!(committed.is_committed());
        assert_eq!(committed.order_id(), Some(GeneratedId::compose(5, 1)));
        assert_eq!(committed.rejection(), None);

        let rejected: ReservationOutcome = Rejection::AlreadyOrdered.into();
        assert!(!rejected.is_committed());
        assert_eq!(rejected.rejection(), Some(Rejection::AlreadyOrdered));
        assert_eq!(rejected.to_string(), "rejected: user already ordered this voucher");
    }

    #[test]
    fn test_rejection_labels_are_unique() {
        let mut labels: Vec<_> = Rejection::ALL.iter().map(|r| r.as_str()).collect();
        labels.sort_unstable();
        labels.dedup();
        assert_eq!(labels.len(), Rejection::ALL.len());
    }

    #[test]
    fn test_trace_transitions() {
        let mut trace = ReservationTrace::new(UserId(1), VoucherId(2));
        trace.transition(ReservationState::Serializing);
        trace.transition(ReservationState::ReservingStock);
        trace.finish(ReservationOutcome::Rejected(Rejection::InsufficientStock));

        assert_eq!(trace.state(), ReservationState::Rejected);
        assert_eq!(
            trace.states(),
            vec![
                ReservationState::Validating,
                ReservationState::Serializing,
                ReservationState::ReservingStock,
                ReservationState::Rejected,
            ]
        );
        assert!(trace.elapsed() >= chrono::Duration::zero());
        assert!(trace.error.is_none());
    }
}
