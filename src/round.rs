//! The per-round agreement protocol: the leader's periodic commit loop and
//! every node's value/response handling.

use std::collections::HashMap;
use std::sync::Arc;

use rand::Rng;

use crate::node::Node;
use crate::record::Record;

fn roll_value(id: u64) -> u64 {
    let roll: u64 = rand::thread_rng().gen_range(1..=10);
    roll * roll * id
}

/// Picks the most frequent value in `values`, breaking ties toward the
/// higher value — used both for response plurality and round-query
/// reconciliation.
fn plurality(values: impl IntoIterator<Item = u64>) -> Option<u64> {
    let mut tally: HashMap<u64, usize> = HashMap::new();
    for v in values {
        *tally.entry(v).or_insert(0) += 1;
    }
    tally
        .into_iter()
        .max_by_key(|&(value, count)| (count, value))
        .map(|(value, _)| value)
}

// ---- Leader's control loop -------------------------------------------

/// Scheduled by `election::become_leader` after `LEADER_STARTUP_DELAY`,
/// running alongside (not after) the post-election round-query
/// reconciliation window, so it reads whatever round that reconciliation
/// has already settled on. Runs one round of consensus, then reschedules
/// itself after `CONSENSUS_INTERVAL` regardless of whether this round ever
/// commits.
pub fn run_round(node: Arc<Node>) {
    if node.is_shutdown() {
        return;
    }
    let round = {
        let state = node.state.lock().unwrap();
        if !state.is_leader() {
            return;
        }
        state.round
    };

    {
        let mut state = node.state.lock().unwrap();
        state.open_round(round, &node.scheduler);
        let v_self = roll_value(state.id);
        let self_id = state.id;
        state.record_value(round, self_id, v_self);
    }
    node.publish(&Record::StartConsensus { round });

    let timeout_node = node.clone();
    let timer = node
        .scheduler
        .schedule(node.config.consensus_response_timeout, move || {
            process_consensus_responses(&timeout_node, round);
        });
    node.state.lock().unwrap().set_consensus_timer(round, &node.scheduler, timer);

    let next = node.clone();
    node.scheduler.schedule(node.config.consensus_interval, move || {
        run_round(next);
    });
}

fn process_consensus_responses(node: &Arc<Node>, round: u64) {
    if node.is_shutdown() {
        return;
    }
    node.state.lock().unwrap().clear_consensus_timer(round, &node.scheduler);
    let responses = node.state.lock().unwrap().responses_for(round);
    if responses.is_empty() {
        log::info!("[{}] round {}: no responses, abandoning", node.id(), round);
        return;
    }
    let committed = plurality(responses).expect("non-empty responses always have a plurality winner");

    let mut state = node.state.lock().unwrap();
    if !state.is_leader() || state.round != round {
        return;
    }
    let next_round = round + 1;
    state.round = next_round;
    state.gc_rounds_below(next_round, &node.scheduler);
    log::info!(
        "*[{}] round {}: committed value {}, advancing to round {}",
        state.id,
        round,
        committed,
        next_round
    );
    drop(state);
    node.publish(&Record::RoundUpdate { round: next_round });
}

// ---- Post-election round reconciliation -------------------------------
//
// Runs concurrently with the `LEADER_STARTUP_DELAY` timer that schedules the
// first `run_round` (started alongside this, in `election::become_leader`),
// not chained before it — `ROUND_QUERY_TIMEOUT` is configured strictly
// shorter than `LEADER_STARTUP_DELAY` so reconciliation always settles
// first.

pub fn begin_round_query_reconciliation(node: &Arc<Node>) {
    {
        let mut state = node.state.lock().unwrap();
        if !state.is_leader() {
            return;
        }
        state.round_query_in_progress = true;
        state.round_query_responses.clear();
        let self_id = state.id;
        let self_round = state.round;
        state.round_query_responses.insert(self_id, self_round);
    }
    node.publish(&Record::RoundQuery { pid: node.id() });

    let timeout_node = node.clone();
    node.scheduler
        .schedule(node.config.round_query_timeout, move || {
            reconcile_round(&timeout_node);
        });
}

fn reconcile_round(node: &Arc<Node>) {
    if node.is_shutdown() {
        return;
    }
    let adopted = {
        let mut state = node.state.lock().unwrap();
        if !state.is_leader() || !state.round_query_in_progress {
            return;
        }
        state.round_query_in_progress = false;
        let adopted =
            plurality(state.round_query_responses.values().copied()).unwrap_or(state.round);
        state.round_query_responses.clear();
        if adopted != state.round {
            state.round = adopted;
            state.gc_rounds_below(adopted, &node.scheduler);
        }
        adopted
    };
    log::info!("*[{}] round query: settled on round {}", node.id(), adopted);
    node.publish(&Record::RoundUpdate { round: adopted });
}

pub fn handle_round_query(node: &Arc<Node>, _pid: u64) {
    let (self_id, round) = {
        let state = node.state.lock().unwrap();
        (state.id, state.round)
    };
    node.publish(&Record::RoundResponse { pid: self_id, round });
}

pub fn handle_round_response(node: &Arc<Node>, pid: u64, round: u64) {
    let mut state = node.state.lock().unwrap();
    if state.round_query_in_progress {
        state.round_query_responses.insert(pid, round);
    }
}

// ---- Follower / common handling ---------------------------------------

/// Handles every received START_CONSENSUS, including the leader's own —
/// the multicast group loops a publisher's own sends back to it, so the
/// leader sees this for a round it already opened via `run_round`. Using
/// `ensure_round_open` rather than `open_round` here means that echo can't
/// wipe values already recorded for the round this cycle.
pub fn handle_start_consensus(node: &Arc<Node>, round: u64) {
    let self_id = node.id();
    let v = roll_value(self_id);
    {
        let mut state = node.state.lock().unwrap();
        state.ensure_round_open(round);
        state.record_value(round, self_id, v);
    }
    node.publish(&Record::Value { pid: self_id, value: v, round });
    schedule_maximum_value(node, round, node.config.start_consensus_delay);
}

pub fn handle_value(node: &Arc<Node>, pid: u64, value: u64, round: u64) {
    let needs_timer = {
        let mut state = node.state.lock().unwrap();
        state.record_value(round, pid, value);
        !state.has_value_timer(round)
    };
    if needs_timer {
        schedule_maximum_value(node, round, node.config.value_process_delay);
    }
}

fn schedule_maximum_value(node: &Arc<Node>, round: u64, delay: std::time::Duration) {
    let scheduled = node.clone();
    let timer = node.scheduler.schedule(delay, move || {
        process_maximum_value(&scheduled, round);
    });
    if !node.state.lock().unwrap().set_value_timer(round, &node.scheduler, timer) {
        log::debug!("[{}] round {}: value timer already pending", node.id(), round);
    }
}

/// Runs at most once per round, guarded by `responses_sent[r]`'s write-once
/// semantics; a duplicate START_CONSENSUS or a second VALUE arriving after
/// this already ran causes no further emission.
fn process_maximum_value(node: &Arc<Node>, round: u64) {
    if node.is_shutdown() {
        return;
    }
    let self_id = node.id();
    let mut state = node.state.lock().unwrap();
    state.clear_value_timer(round, &node.scheduler);
    if state.response_sent(round).is_some() {
        return;
    }
    let values = state.values_for(round);
    let resp = match values.into_iter().max() {
        Some(v) => v,
        None => return,
    };
    if !state.try_set_response_sent(round, resp) {
        return;
    }
    let is_leader = state.is_leader();
    if is_leader {
        state.record_response(round, self_id, resp);
        drop(state);
    } else {
        drop(state);
        node.publish(&Record::Response { pid: self_id, response: resp, round });
    }
}

pub fn handle_response(node: &Arc<Node>, pid: u64, response: u64, round: u64) {
    let mut state = node.state.lock().unwrap();
    if state.is_leader() {
        state.record_response(round, pid, response);
    }
}

pub fn handle_round_update(node: &Arc<Node>, round: u64) {
    let mut state = node.state.lock().unwrap();
    if state.is_leader() {
        return;
    }
    state.round = round;
    state.gc_rounds_below(round, &node.scheduler);
    log::info!("[{}] round: adopting round {}", state.id, round);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::network::NetworkManager;
    use std::time::Duration;

    fn test_node(id: u64) -> Arc<Node> {
        let network = NetworkManager::bind().unwrap();
        Node::new(id, Config::default(), network)
    }

    #[test]
    fn plurality_breaks_ties_toward_the_higher_value() {
        assert_eq!(plurality([10, 20]), Some(20));
    }

    #[test]
    fn plurality_favors_the_more_common_value_over_a_larger_minority() {
        assert_eq!(plurality([25, 25, 49]), Some(25));
    }

    #[test]
    fn follower_receiving_start_consensus_contributes_its_own_value_first() {
        let node = test_node(3);
        handle_start_consensus(&node, 0);
        let state = node.state.lock().unwrap();
        assert!(state.values_for(0).iter().any(|&v| v % 3 == 0));
    }

    #[test]
    fn process_maximum_value_is_idempotent_under_a_second_start_consensus() {
        let node = test_node(3);
        handle_start_consensus(&node, 0);
        std::thread::sleep(node.config.start_consensus_delay + Duration::from_millis(100));
        let first = node.state.lock().unwrap().response_sent(0);
        assert!(first.is_some());
        handle_start_consensus(&node, 0);
        std::thread::sleep(node.config.start_consensus_delay + Duration::from_millis(100));
        // A duplicate START_CONSENSUS schedules another max-value computation,
        // but response_sent is already set from the first round, so it no-ops
        // rather than re-emitting a response or leaving a timer dangling.
        assert_eq!(node.state.lock().unwrap().response_sent(0), first);
        assert!(!node.state.lock().unwrap().has_value_timer(0));
    }

    #[test]
    fn self_echoed_start_consensus_does_not_clobber_values_already_recorded_this_round() {
        let node = test_node(5);
        {
            let mut state = node.state.lock().unwrap();
            state.leader = Some(5);
            state.open_round(0, &node.scheduler);
            state.record_value(0, 5, 100); // leader's own roll from run_round
            state.record_value(0, 9, 200); // a peer's VALUE that beat the echo
        }
        handle_start_consensus(&node, 0);
        assert!(node.state.lock().unwrap().values_for(0).contains(&200));
    }

    #[test]
    fn round_update_advances_a_follower_and_prunes_old_rounds() {
        let node = test_node(1);
        {
            let mut state = node.state.lock().unwrap();
            state.record_value(0, 1, 10);
            state.record_value(1, 1, 20);
        }
        handle_round_update(&node, 2);
        let state = node.state.lock().unwrap();
        assert_eq!(state.round, 2);
        assert!(state.values_for(0).is_empty());
        assert!(state.values_for(1).is_empty());
    }

    #[test]
    fn leader_ignores_round_update_it_did_not_originate() {
        let node = test_node(1);
        node.state.lock().unwrap().leader = Some(1);
        handle_round_update(&node, 99);
        assert_eq!(node.state.lock().unwrap().round, 0);
    }

    #[test]
    fn round_query_reply_reports_current_round() {
        let node = test_node(4);
        node.state.lock().unwrap().round = 6;
        // handle_round_query only publishes; assert it doesn't alter state.
        handle_round_query(&node, 1);
        assert_eq!(node.state.lock().unwrap().round, 6);
    }

    #[test]
    fn round_response_is_recorded_only_while_a_query_is_in_progress() {
        let node = test_node(1);
        handle_round_response(&node, 2, 5);
        assert!(node.state.lock().unwrap().round_query_responses.is_empty());

        node.state.lock().unwrap().round_query_in_progress = true;
        handle_round_response(&node, 2, 5);
        assert_eq!(node.state.lock().unwrap().round_query_responses.get(&2), Some(&5));
    }
}
