//! The node: the shared state object, its collaborators, and the
//! concurrent activities that drive it (receiver, heartbeat emitter,
//! failure detector, election engine, round engine, main loop).
//!
//! Each activity is a free function taking `&Arc<Node>`, in the style of
//! module-level functions that close over a shared `node` handle
//! (`start_heartbeat(node)`, `start_monitor(node)`, `bully(node)`).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Instant;

use crate::config::Config;
use crate::discovery;
use crate::election;
use crate::failure_detector;
use crate::network::NetworkManager;
use crate::record::Record;
use crate::round;
use crate::state::NodeState;
use crate::timer::Scheduler;

pub struct Node {
    pub config: Config,
    pub state: Mutex<NodeState>,
    pub network: NetworkManager,
    pub scheduler: Scheduler,
    shutdown: AtomicBool,
}

impl Node {
    pub fn new(id: u64, config: Config, network: NetworkManager) -> Arc<Node> {
        let state = Mutex::new(NodeState::new(id, config.round_start));
        Arc::new(Node {
            config,
            state,
            network,
            scheduler: Scheduler::start(),
            shutdown: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> u64 {
        self.state.lock().unwrap().id
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Cooperative stop: every loop and timer callback checks this on its
    /// next tick.
    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.state.lock().unwrap().shutdown = true;
    }

    /// Publishes a record to the multicast group and logs the attempt.
    /// Failure is swallowed here — callers don't change state just because a
    /// send failed.
    pub fn publish(&self, record: &Record) {
        if self.is_shutdown() {
            return;
        }
        let is_leader = self.state.lock().unwrap().is_leader();
        let glyph = if is_leader { "*" } else { " " };
        let ok = self.network.send(&record.encode());
        if ok {
            log::debug!("{glyph}[{}] -> {}", self.id(), record.op());
        } else {
            log::warn!("{glyph}[{}] failed to publish {}", self.id(), record.op());
        }
    }
}

/// Top-level entry point used by `main.rs`: wires up every activity and
/// blocks in the main loop until shutdown.
pub fn run(node: Arc<Node>) {
    spawn_receiver(node.clone());
    failure_detector::start_heartbeat_emitter(node.clone());

    discovery::discover(&node);

    failure_detector::start_monitor(node.clone());

    main_loop(node);
}

fn spawn_receiver(node: Arc<Node>) {
    thread::Builder::new()
        .name("receiver".into())
        .spawn(move || receiver_loop(node))
        .expect("failed to spawn receiver thread");
}

fn receiver_loop(node: Arc<Node>) {
    while !node.is_shutdown() {
        match node.network.receive() {
            Some((bytes, _from)) => match Record::decode(&bytes) {
                Some(record) => dispatch(&node, record),
                None => log::warn!("[{}] dropped malformed record", node.id()),
            },
            None => {
                // Transient receive failure; the main loop owns reconnection
                // policy and logging cadence, so just back off briefly here.
                thread::sleep(node.config.network_retry_delay.min(std::time::Duration::from_millis(200)));
            }
        }
    }
}

/// Dispatches a decoded record to the engine that owns its `op`.
fn dispatch(node: &Arc<Node>, record: Record) {
    match record {
        Record::Hello { pid } => discovery::handle_hello(node, pid),
        Record::HelloAck { pid, round, to } => discovery::handle_hello_ack(node, pid, round, to),
        Record::Heartbeat { pid } => {
            node.state.lock().unwrap().mark_alive(pid);
        }
        Record::Election { source } => election::handle_election(node, source),
        Record::Ok { to } => election::handle_ok(node, to),
        Record::Leader { pid, round } => election::handle_leader(node, pid, round),
        Record::StartConsensus { round } => round::handle_start_consensus(node, round),
        Record::Value { pid, value, round } => round::handle_value(node, pid, value, round),
        Record::Response { pid, response, round } => {
            round::handle_response(node, pid, response, round)
        }
        Record::RoundUpdate { round } => round::handle_round_update(node, round),
        Record::RoundQuery { pid } => round::handle_round_query(node, pid),
        Record::RoundResponse { pid, round } => round::handle_round_response(node, pid, round),
    }
}

/// Priorities checked each `MAIN_LOOP_INTERVAL` tick: recover the network
/// first, then chase a missing leader, then log a periodic status line.
fn main_loop(node: Arc<Node>) {
    let mut last_network_log = Instant::now() - node.config.network_log_interval;
    let mut last_status_log = Instant::now();
    let mut last_hello_search = Instant::now();

    while !node.is_shutdown() {
        thread::sleep(node.config.main_loop_interval);

        if !node.network.connected() {
            if last_network_log.elapsed() >= node.config.network_log_interval {
                log::warn!("[{}] network disconnected, retrying", node.id());
                last_network_log = Instant::now();
            }
            thread::sleep(node.config.network_retry_delay);
            node.network.reconnect();
            if node.network.connected() {
                log::info!("[{}] network reconnected, rejoining", node.id());
                let mut state = node.state.lock().unwrap();
                state.leader = None;
                state.in_election = false;
                let floor = state.round + 1;
                state.gc_rounds_below(floor, &node.scheduler);
                drop(state);
                node.publish(&Record::Hello { pid: node.id() });
            }
            continue;
        }

        let (leader_is_none, in_election) = {
            let state = node.state.lock().unwrap();
            (state.leader.is_none(), state.in_election)
        };

        if leader_is_none && !in_election {
            if last_hello_search.elapsed() >= node.config.leader_search_interval {
                log::info!("[{}] still leaderless, re-publishing HELLO", node.id());
                node.publish(&Record::Hello { pid: node.id() });
                last_hello_search = Instant::now();
            }
        } else if last_status_log.elapsed() >= node.config.status_log_interval {
            let state = node.state.lock().unwrap();
            let glyph = if state.is_leader() { "*" } else { " " };
            log::info!(
                "{glyph}[{}] status: role={:?} leader={:?} round={} alive={}",
                state.id,
                state.role(),
                state.leader,
                state.round,
                state.alive.len()
            );
            drop(state);
            last_status_log = Instant::now();
        }
    }
}
