//! Negotiation state machine: sequences bid/propose/counter/accept/reject actions per task.
//!
//! The machine validates transitions and records history. It never picks a winner;
//! resolved tasks are handed to the caller as [`Resolution`] values.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use tokio::sync::Mutex;

use crate::payload::{NegotiationAction, NegotiationPayload};

/// Default idle time after which a task is expired as rejected.
pub const DEFAULT_NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(60);

/// Reason recorded on tasks expired by [`Negotiator::expire`].
pub const TIMEOUT_REASON: &str = "timeout";

/// Resolved tasks are remembered for this many negotiation timeouts.
pub const RESOLVED_RETENTION_FACTOR: u64 = 10;

/// One negotiator shared by every session of an agent (task IDs span connections).
pub type SharedNegotiator = Arc<Mutex<Negotiator>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    Open,
    Proposed,
    Accepted,
    Rejected,
}

impl NegotiationState {
    pub fn is_terminal(self) -> bool {
        matches!(self, NegotiationState::Accepted | NegotiationState::Rejected)
    }
}

/// A negotiation action as seen by the state machine.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedAction {
    pub source_id: String,
    pub action: NegotiationAction,
    pub details: Map<String, Value>,
    /// Receiver-local time the action was applied (seconds since epoch).
    pub at: u64,
}

/// Live state for one task that has not resolved yet.
#[derive(Debug, Clone)]
pub struct NegotiationSession {
    pub task_id: String,
    state: NegotiationState,
    history: Vec<RecordedAction>,
    last_activity: u64,
}

impl NegotiationSession {
    pub fn state(&self) -> NegotiationState {
        self.state
    }

    /// Every action applied to this task, in arrival order.
    pub fn history(&self) -> &[RecordedAction] {
        &self.history
    }

    /// Bids, proposals and counter-offers, in arrival order.
    pub fn offers(&self) -> impl Iterator<Item = &RecordedAction> {
        self.history.iter().filter(|a| a.action.is_offer())
    }

    pub fn latest_offer(&self) -> Option<&RecordedAction> {
        self.history.iter().rev().find(|a| a.action.is_offer())
    }

    pub fn last_activity(&self) -> u64 {
        self.last_activity
    }

    // The offer an accept refers to: latest offer from `details.offer_from` if named, else the latest offer.
    fn referenced_offer(&self, accept: &RecordedAction) -> Option<RecordedAction> {
        match accept.details.get("offer_from").and_then(Value::as_str) {
            Some(from) => self
                .history
                .iter()
                .rev()
                .find(|a| a.action.is_offer() && a.source_id == from)
                .cloned(),
            None => self.latest_offer().cloned(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Accepted,
    Rejected,
}

/// Final decision for a task, handed to whoever schedules the work.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub task_id: String,
    pub outcome: Outcome,
    /// Agent that accepted or rejected; `None` when the task timed out.
    pub decided_by: Option<String>,
    /// `details.reason` of a rejection, or [`TIMEOUT_REASON`].
    pub reason: Option<String>,
    /// Offer the acceptance refers to.
    pub accepted_offer: Option<RecordedAction>,
    pub history: Vec<RecordedAction>,
}

impl Resolution {
    pub fn state(&self) -> NegotiationState {
        match self.outcome {
            Outcome::Accepted => NegotiationState::Accepted,
            Outcome::Rejected => NegotiationState::Rejected,
        }
    }
}

/// Result of a legal action.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// Task is (still) open for offers.
    Updated {
        task_id: String,
        state: NegotiationState,
        offers: usize,
    },
    /// Task reached a terminal state.
    Resolved(Resolution),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NegotiationError {
    #[error("stale negotiation: task {task_id} already {state:?}")]
    StaleNegotiation {
        task_id: String,
        state: NegotiationState,
    },
    #[error("illegal negotiation action {action} for task {task_id} in state {state:?}")]
    IllegalTransition {
        task_id: String,
        state: NegotiationState,
        action: NegotiationAction,
    },
}

#[derive(Debug, Clone, Copy)]
struct Tombstone {
    state: NegotiationState,
    resolved_at: u64,
}

/// Per-task negotiation state for every task this agent has seen.
#[derive(Debug)]
pub struct Negotiator {
    timeout_secs: u64,
    retention_secs: u64,
    active: HashMap<String, NegotiationSession>,
    /// Terminal state of recently resolved tasks, kept so late actions are reported as stale.
    resolved: HashMap<String, Tombstone>,
}

impl Negotiator {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout_secs: timeout.as_secs(),
            retention_secs: timeout
                .as_secs()
                .saturating_mul(RESOLVED_RETENTION_FACTOR)
                .max(1),
            active: HashMap::new(),
            resolved: HashMap::new(),
        }
    }

    /// Override how long resolved tasks are remembered.
    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention_secs = retention.as_secs().max(1);
        self
    }

    pub fn shared(timeout: Duration) -> SharedNegotiator {
        Arc::new(Mutex::new(Self::new(timeout)))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Whether `apply` would accept this action, without changing anything.
    pub fn check(&self, payload: &NegotiationPayload) -> Result<(), NegotiationError> {
        let task_id = &payload.task_id;
        if let Some(t) = self.resolved.get(task_id) {
            return Err(NegotiationError::StaleNegotiation {
                task_id: task_id.clone(),
                state: t.state,
            });
        }
        let opens = matches!(
            payload.action,
            NegotiationAction::Bid | NegotiationAction::ProposeTask
        );
        if !opens && !self.active.contains_key(task_id) {
            return Err(NegotiationError::IllegalTransition {
                task_id: task_id.clone(),
                state: NegotiationState::Open,
                action: payload.action,
            });
        }
        Ok(())
    }

    /// Apply an action sent or received by `source_id` at time `now` (seconds since epoch).
    /// Illegal and stale actions leave state untouched.
    pub fn apply(
        &mut self,
        source_id: &str,
        payload: &NegotiationPayload,
        now: u64,
    ) -> Result<Transition, NegotiationError> {
        self.check(payload)?;
        let task_id = &payload.task_id;
        let action = payload.action;
        let recorded = RecordedAction {
            source_id: source_id.to_string(),
            action,
            details: payload.details.clone(),
            at: now,
        };

        match self.active.entry(task_id.clone()) {
            Entry::Vacant(slot) => {
                slot.insert(NegotiationSession {
                    task_id: task_id.clone(),
                    state: NegotiationState::Proposed,
                    history: vec![recorded],
                    last_activity: now,
                });
                Ok(Transition::Updated {
                    task_id: task_id.clone(),
                    state: NegotiationState::Proposed,
                    offers: 1,
                })
            }
            Entry::Occupied(mut slot) if action.is_offer() => {
                let session = slot.get_mut();
                session.history.push(recorded);
                session.last_activity = now;
                Ok(Transition::Updated {
                    task_id: task_id.clone(),
                    state: session.state,
                    offers: session.offers().count(),
                })
            }
            Entry::Occupied(slot) => {
                let session = slot.remove();
                let resolution = match action {
                    NegotiationAction::AcceptTask => Resolution {
                        task_id: task_id.clone(),
                        outcome: Outcome::Accepted,
                        decided_by: Some(recorded.source_id.clone()),
                        reason: None,
                        accepted_offer: session.referenced_offer(&recorded),
                        history: with_action(session.history, recorded),
                    },
                    _ => Resolution {
                        task_id: task_id.clone(),
                        outcome: Outcome::Rejected,
                        decided_by: Some(recorded.source_id.clone()),
                        reason: recorded
                            .details
                            .get("reason")
                            .and_then(Value::as_str)
                            .map(str::to_string),
                        accepted_offer: None,
                        history: with_action(session.history, recorded),
                    },
                };
                self.bury(task_id, resolution.state(), now);
                Ok(Transition::Resolved(resolution))
            }
        }
    }

    /// Expire `task_id` as rejected with reason `timeout` if it has been idle for at least the timeout.
    pub fn expire(&mut self, task_id: &str, now: u64) -> Option<Resolution> {
        let idle = self
            .active
            .get(task_id)
            .is_some_and(|s| now.saturating_sub(s.last_activity) >= self.timeout_secs);
        if !idle {
            return None;
        }
        let session = self.active.remove(task_id)?;
        self.bury(task_id, NegotiationState::Rejected, now);
        Some(Resolution {
            task_id: session.task_id,
            outcome: Outcome::Rejected,
            decided_by: None,
            reason: Some(TIMEOUT_REASON.to_string()),
            accepted_offer: None,
            history: session.history,
        })
    }

    /// Expire every idle task and drop resolved records past retention. Intended to be called periodically.
    pub fn expire_idle(&mut self, now: u64) -> Vec<Resolution> {
        let idle: Vec<String> = self
            .active
            .values()
            .filter(|s| now.saturating_sub(s.last_activity) >= self.timeout_secs)
            .map(|s| s.task_id.clone())
            .collect();
        let expired = idle
            .iter()
            .filter_map(|task_id| self.expire(task_id, now))
            .collect();
        self.prune_resolved(now);
        expired
    }

    /// Forget resolved tasks older than the retention window. Returns how many were dropped.
    pub fn prune_resolved(&mut self, now: u64) -> usize {
        let before = self.resolved.len();
        let retention = self.retention_secs;
        self.resolved
            .retain(|_, t| now.saturating_sub(t.resolved_at) < retention);
        before - self.resolved.len()
    }

    /// Number of resolved tasks still remembered.
    pub fn resolved_len(&self) -> usize {
        self.resolved.len()
    }

    fn bury(&mut self, task_id: &str, state: NegotiationState, now: u64) {
        self.resolved.insert(
            task_id.to_string(),
            Tombstone {
                state,
                resolved_at: now,
            },
        );
    }

    /// Current state of a task. Unknown tasks are `Open`.
    pub fn state(&self, task_id: &str) -> NegotiationState {
        if let Some(s) = self.active.get(task_id) {
            return s.state;
        }
        self.resolved
            .get(task_id)
            .map_or(NegotiationState::Open, |t| t.state)
    }

    pub fn session(&self, task_id: &str) -> Option<&NegotiationSession> {
        self.active.get(task_id)
    }

    pub fn active_tasks(&self) -> impl Iterator<Item = &str> {
        self.active.keys().map(String::as_str)
    }

    /// Drop the record of a resolved task; its ID becomes `Open` again.
    pub fn forget(&mut self, task_id: &str) -> bool {
        self.resolved.remove(task_id).is_some()
    }
}

impl Default for Negotiator {
    fn default() -> Self {
        Self::new(DEFAULT_NEGOTIATION_TIMEOUT)
    }
}

fn with_action(mut history: Vec<RecordedAction>, action: RecordedAction) -> Vec<RecordedAction> {
    history.push(action);
    history
}
