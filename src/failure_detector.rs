//! Heartbeat emission and the liveness monitor that ages out silent peers.

use std::sync::Arc;
use std::time::Instant;

use crate::election;
use crate::node::Node;
use crate::record::Record;

/// Publishes `HB{pid}` every `HEARTBEAT_INT`, forever, until shutdown.
pub fn start_heartbeat_emitter(node: Arc<Node>) {
    std::thread::Builder::new()
        .name("heartbeat".into())
        .spawn(move || {
            while !node.is_shutdown() {
                node.publish(&Record::Heartbeat { pid: node.id() });
                std::thread::sleep(node.config.heartbeat_int);
            }
        })
        .expect("failed to spawn heartbeat thread");
}

/// Scans `alive` every `MONITOR_INTERVAL`, removing peers silent for longer
/// than `FAIL_TIMEOUT`. A startup grace window suppresses death verdicts so
/// that slow initial discovery doesn't eject peers that simply haven't sent
/// their first record yet.
pub fn start_monitor(node: Arc<Node>) {
    let boot = Instant::now();
    std::thread::Builder::new()
        .name("monitor".into())
        .spawn(move || {
            while !node.is_shutdown() {
                std::thread::sleep(node.config.monitor_interval);
                if boot.elapsed() < node.config.monitor_startup_grace {
                    continue;
                }
                sweep(&node);
            }
        })
        .expect("failed to spawn monitor thread");
}

fn sweep(node: &Arc<Node>) {
    let self_id = node.id();
    let dead: Vec<u64> = {
        let state = node.state.lock().unwrap();
        let now = Instant::now();
        state
            .alive
            .iter()
            .filter(|(&pid, &last_seen)| {
                pid != self_id && now.duration_since(last_seen) > node.config.fail_timeout
            })
            .map(|(&pid, _)| pid)
            .collect()
    };
    if dead.is_empty() {
        return;
    }

    let mut leader_died = false;
    {
        let mut state = node.state.lock().unwrap();
        for pid in &dead {
            state.alive.remove(pid);
            log::info!("[{}] detector: {} timed out", state.id, pid);
            if state.leader == Some(*pid) {
                state.leader = None;
                leader_died = true;
            }
        }
    }

    if leader_died {
        let delayed = node.clone();
        node.scheduler
            .schedule(node.config.leader_death_delay, move || {
                if !delayed.is_shutdown() {
                    election::start_election(&delayed);
                }
            });
    }
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
    fn sweep_removes_only_peers_past_fail_timeout() {
        let node = test_node(1);
        {
            let mut state = node.state.lock().unwrap();
            state.mark_alive(2);
            state
                .alive
                .insert(3, Instant::now() - node.config.fail_timeout - Duration::from_millis(10));
        }
        sweep(&node);
        let state = node.state.lock().unwrap();
        assert!(state.alive.contains_key(&1));
        assert!(state.alive.contains_key(&2));
        assert!(!state.alive.contains_key(&3));
    }

    #[test]
    fn sweep_never_removes_self() {
        let node = test_node(1);
        {
            let mut state = node.state.lock().unwrap();
            state
                .alive
                .insert(1, Instant::now() - node.config.fail_timeout - Duration::from_millis(10));
        }
        sweep(&node);
        assert!(node.state.lock().unwrap().alive.contains_key(&1));
    }

    #[test]
    fn death_of_the_recognized_leader_clears_it_and_schedules_an_election() {
        let node = test_node(1);
        {
            let mut state = node.state.lock().unwrap();
            state.leader = Some(9);
            state
                .alive
                .insert(9, Instant::now() - node.config.fail_timeout - Duration::from_millis(10));
        }
        sweep(&node);
        assert!(node.state.lock().unwrap().leader.is_none());
        std::thread::sleep(node.config.leader_death_delay + Duration::from_millis(50));
        assert!(node.state.lock().unwrap().in_election);
    }
}
