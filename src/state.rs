//! The single shared state object and the invariants it enforces.
//!
//! Every field here is mutated only while the node's state mutex is held;
//! see `Node` in `node.rs` for the lock itself. This module owns the data
//! and the bookkeeping that keeps the five core invariants true (at most one
//! value timer per round, a write-once response per round, a leader is
//! always self-consistent, round numbers only move forward on followers
//! except by explicit update, and self is always present in its own round's
//! values) — it does not decide *when* to transition (that's
//! `election.rs`/`round.rs`).

use std::collections::HashMap;
use std::time::Instant;

use crate::timer::{Scheduler, TimerId};

/// Derived from `leader`/`in_election`, never stored redundantly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Idle,
    Campaigning,
    Leader,
    Follower,
}

/// Per-round buffers. Kept in one place so `gc_rounds_below` can sweep all
/// of them together, cancelling each round's timer in O(1).
#[derive(Default)]
struct RoundBuffers {
    values_received: HashMap<u64, u64>,
    responses_received: HashMap<u64, u64>,
    response_sent: Option<u64>,
    value_timer: Option<TimerId>,
    consensus_timer: Option<TimerId>,
}

pub struct NodeState {
    pub id: u64,
    pub round: u64,
    pub leader: Option<u64>,
    pub alive: HashMap<u64, Instant>,
    pub in_election: bool,
    pub received_ok: bool,
    pub round_query_in_progress: bool,
    pub round_query_responses: HashMap<u64, u64>,
    pub shutdown: bool,

    rounds: HashMap<u64, RoundBuffers>,
}

impl NodeState {
    pub fn new(id: u64, round_start: u64) -> NodeState {
        let mut alive = HashMap::new();
        alive.insert(id, Instant::now());
        NodeState {
            id,
            round: round_start,
            leader: None,
            alive,
            in_election: false,
            received_ok: false,
            round_query_in_progress: false,
            round_query_responses: HashMap::new(),
            shutdown: false,
            rounds: HashMap::new(),
        }
    }

    pub fn role(&self) -> Role {
        if self.leader == Some(self.id) {
            Role::Leader
        } else if self.in_election {
            Role::Campaigning
        } else if self.leader.is_some() {
            Role::Follower
        } else {
            Role::Idle
        }
    }

    pub fn is_leader(&self) -> bool {
        self.leader == Some(self.id)
    }

    pub fn mark_alive(&mut self, pid: u64) {
        self.alive.insert(pid, Instant::now());
    }

    pub fn alive_pids(&self) -> Vec<u64> {
        self.alive.keys().copied().collect()
    }

    fn round_mut(&mut self, round: u64) -> &mut RoundBuffers {
        self.rounds.entry(round).or_default()
    }

    /// Invariant 5: self's own value is present whenever `values_received[r]`
    /// is non-empty. Callers insert their own value before any other,
    /// satisfied by always calling this first when opening a round.
    pub fn record_value(&mut self, round: u64, pid: u64, value: u64) {
        self.round_mut(round).values_received.insert(pid, value);
    }

    pub fn values_for(&self, round: u64) -> Vec<u64> {
        self.rounds
            .get(&round)
            .map(|r| r.values_received.values().copied().collect())
            .unwrap_or_default()
    }

    pub fn has_value_timer(&self, round: u64) -> bool {
        self.rounds
            .get(&round)
            .is_some_and(|r| r.value_timer.is_some())
    }

    /// Invariant 1: at most one `value_timers[r]` per round. Returns `false`
    /// (and sets nothing) if one is already scheduled.
    pub fn set_value_timer(&mut self, round: u64, scheduler: &Scheduler, id: TimerId) -> bool {
        let buf = self.round_mut(round);
        if buf.value_timer.is_some() {
            scheduler.cancel(id);
            false
        } else {
            buf.value_timer = Some(id);
            true
        }
    }

    pub fn clear_value_timer(&mut self, round: u64, scheduler: &Scheduler) {
        if let Some(buf) = self.rounds.get_mut(&round) {
            if let Some(id) = buf.value_timer.take() {
                scheduler.cancel(id);
            }
        }
    }

    /// Invariant 2: `responses_sent[r]` is written at most once. Returns
    /// `false` if a response for `round` was already recorded, in which
    /// case the caller must not re-emit a RESPONSE record.
    pub fn try_set_response_sent(&mut self, round: u64, response: u64) -> bool {
        let buf = self.round_mut(round);
        if buf.response_sent.is_some() {
            false
        } else {
            buf.response_sent = Some(response);
            true
        }
    }

    pub fn response_sent(&self, round: u64) -> Option<u64> {
        self.rounds.get(&round).and_then(|r| r.response_sent)
    }

    pub fn record_response(&mut self, round: u64, pid: u64, response: u64) {
        self.round_mut(round).responses_received.insert(pid, response);
    }

    pub fn responses_for(&self, round: u64) -> Vec<u64> {
        self.rounds
            .get(&round)
            .map(|r| r.responses_received.values().copied().collect())
            .unwrap_or_default()
    }

    /// Starts `round` fresh, cancelling and discarding anything left over
    /// from a prior occupant of this round number. Only the leader's own
    /// control loop calls this — a round it is about to (re)drive.
    pub fn open_round(&mut self, round: u64, scheduler: &Scheduler) {
        self.clear_value_timer(round, scheduler);
        self.clear_consensus_timer(round, scheduler);
        self.rounds.insert(round, RoundBuffers::default());
    }

    /// Ensures `round`'s buffers exist without disturbing them if already
    /// open. Used when handling a received START_CONSENSUS: the multicast
    /// loop echoes the leader's own publish back to itself, and that echo
    /// must not clobber values already recorded for a round `open_round`
    /// just started.
    pub fn ensure_round_open(&mut self, round: u64) {
        self.rounds.entry(round).or_default();
    }

    pub fn set_consensus_timer(&mut self, round: u64, scheduler: &Scheduler, id: TimerId) {
        let buf = self.round_mut(round);
        if let Some(old) = buf.consensus_timer.replace(id) {
            scheduler.cancel(old);
        }
    }

    pub fn clear_consensus_timer(&mut self, round: u64, scheduler: &Scheduler) {
        if let Some(buf) = self.rounds.get_mut(&round) {
            if let Some(id) = buf.consensus_timer.take() {
                scheduler.cancel(id);
            }
        }
    }

    /// Drops every per-round buffer and cancels every pending per-round
    /// timer — both the value timer and the consensus-response timer — for
    /// rounds `< floor`. This is the only place rounds are removed, keeping
    /// per-round memory bounded as rounds advance, and it's also how a
    /// reconnection cancels every outstanding round timer at once.
    pub fn gc_rounds_below(&mut self, floor: u64, scheduler: &Scheduler) {
        let stale: Vec<u64> = self.rounds.keys().copied().filter(|r| *r < floor).collect();
        for round in stale {
            if let Some(buf) = self.rounds.remove(&round) {
                if let Some(id) = buf.value_timer {
                    scheduler.cancel(id);
                }
                if let Some(id) = buf.consensus_timer {
                    scheduler.cancel(id);
                }
            }
        }
    }

    #[cfg(test)]
    pub fn round_count(&self) -> usize {
        self.rounds.len()
    }
}
