//! Raft election, heartbeat/replication, and the two RPC handlers that
//! drive them.
//!
//! This is the simplified variant spec.md calls for: no prev-log
//! consistency check on `AppendEntries` (the leader pushes its whole log
//! every time and followers replace theirs wholesale), no log-matching
//! safety property, and `commit_index` is taken from the leader as-is
//! with no monotonic guard on the follower side. None of that is an
//! oversight — see SPEC_FULL.md's Open Questions.
//!
//! `peers` is threaded through as its own `PeerTable` rather than read
//! off `NodeConfig` directly, so a late-joining node can be absorbed by
//! extending every existing node's live peer map without restarting
//! anything (spec scenario 4).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rand::Rng;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::info;

use crate::config::NodeConfig;
use crate::rpc_client;
use crate::state::{LogEntry, PeerTable, RaftState, Role, StateMachine};

pub const SERVICE: &str = "RaftService";

/// How often the election ticker re-checks the heartbeat deadline while
/// waiting out a timeout.
const ELECTION_POLL_INTERVAL: Duration = Duration::from_millis(50);

fn majority(peer_count: usize) -> usize {
    (peer_count + 1) / 2 + 1
}

fn snapshot_peers(peers: &PeerTable) -> HashMap<String, String> {
    peers.lock().unwrap().clone()
}

fn commit_index_from_i64(v: i64) -> Option<u64> {
    if v < 0 {
        None
    } else {
        Some(v as u64)
    }
}

fn to_i64(v: Option<u64>) -> i64 {
    v.map(|x| x as i64).unwrap_or(-1)
}

/// Handles for the two background tickers a running node owns.
pub struct Tickers {
    pub election: JoinHandle<()>,
    pub heartbeat: JoinHandle<()>,
}

/// Spawn the election and heartbeat/replication tickers. Both run until
/// `running` is cleared.
pub fn spawn_tickers(
    config: Arc<NodeConfig>,
    peers: Arc<PeerTable>,
    state: Arc<Mutex<RaftState>>,
    machine: Arc<Mutex<StateMachine>>,
    running: Arc<AtomicBool>,
) -> Tickers {
    let election = tokio::spawn(election_timer(
        config.clone(),
        peers.clone(),
        state.clone(),
        running.clone(),
    ));
    let heartbeat = tokio::spawn(heartbeat_loop(config, peers, state, machine, running));
    Tickers { election, heartbeat }
}

async fn election_timer(
    config: Arc<NodeConfig>,
    peers: Arc<PeerTable>,
    state: Arc<Mutex<RaftState>>,
    running: Arc<AtomicBool>,
) {
    while running.load(Ordering::SeqCst) {
        let timeout = {
            let (lo, hi) = config.election_timeout_range;
            let millis = rand::thread_rng().gen_range(lo.as_millis() as u64..=hi.as_millis() as u64);
            Duration::from_millis(millis)
        };

        let mut triggered = false;
        while running.load(Ordering::SeqCst) {
            tokio::time::sleep(ELECTION_POLL_INTERVAL).await;
            let elapsed = state.lock().unwrap().last_heartbeat.elapsed();
            if elapsed >= timeout {
                triggered = true;
                break;
            }
        }
        if !triggered {
            continue;
        }

        let (term, last_log_index, last_log_term) = {
            let mut guard = state.lock().unwrap();
            if guard.last_heartbeat.elapsed() < timeout {
                continue; // a heartbeat landed between the poll and re-check
            }
            guard.role = Role::Candidate;
            guard.current_term += 1;
            guard.voted_for = Some(config.node_id.clone());
            guard.last_heartbeat = Instant::now();
            (guard.current_term, guard.last_log_index(), guard.last_log_term())
        };

        info!(term, node = %config.node_id, "raft: starting election");

        let peer_snapshot = snapshot_peers(&peers);
        let mut votes = 1usize;
        for (peer_id, target) in peer_snapshot.iter() {
            if peer_id == &config.node_id {
                continue;
            }
            let request = serde_json::json!({
                "candidate_id": config.node_id,
                "term": term,
                "last_log_index": last_log_index,
                "last_log_term": last_log_term,
            });
            match rpc_client::call(target, SERVICE, "RequestVote", request).await {
                Ok(response) => {
                    if response.get("vote_granted").and_then(Value::as_bool).unwrap_or(false) {
                        votes += 1;
                    }
                }
                Err(_) => continue,
            }
        }

        let mut guard = state.lock().unwrap();
        if votes >= majority(peer_snapshot.len()) {
            guard.role = Role::Leader;
            guard.leader_id = Some(config.node_id.clone());
            guard.last_heartbeat = Instant::now();
            info!(term, node = %config.node_id, "raft: elected leader");
        } else {
            guard.role = Role::Follower;
        }
    }
}

async fn heartbeat_loop(
    config: Arc<NodeConfig>,
    peers: Arc<PeerTable>,
    state: Arc<Mutex<RaftState>>,
    machine: Arc<Mutex<StateMachine>>,
    running: Arc<AtomicBool>,
) {
    while running.load(Ordering::SeqCst) {
        tokio::time::sleep(config.heartbeat_interval).await;
        if !running.load(Ordering::SeqCst) {
            break;
        }

        let (term, entries, commit_index) = {
            let guard = state.lock().unwrap();
            if guard.role != Role::Leader {
                continue;
            }
            (guard.current_term, guard.log.clone(), to_i64(guard.commit_index))
        };

        for (peer_id, target) in snapshot_peers(&peers).iter() {
            if peer_id == &config.node_id {
                continue;
            }
            let request = serde_json::json!({
                "leader_id": config.node_id,
                "term": term,
                "entries": entries,
                "commit_index": commit_index,
            });
            let _ = rpc_client::call(target, SERVICE, "AppendEntries", request).await;
        }

        apply_entries(&state, &machine).await;
    }
}

/// Replicate the leader's current log to every peer and, if a majority
/// (including self) acknowledges, advance `commit_index` to the end of
/// the log. Used on the synchronous client-command path, distinct from
/// the periodic heartbeat loop above.
pub async fn replicate_log(config: &NodeConfig, peers: &PeerTable, state: &Mutex<RaftState>) -> bool {
    let (term, entries) = {
        let guard = state.lock().unwrap();
        (guard.current_term, guard.log.clone())
    };

    let peer_snapshot = snapshot_peers(peers);
    let mut success_count = 1usize;
    for (peer_id, target) in peer_snapshot.iter() {
        if peer_id == &config.node_id {
            continue;
        }
        let request = serde_json::json!({
            "leader_id": config.node_id,
            "term": term,
            "entries": entries,
            "commit_index": entries.len() as i64 - 1,
        });
        match rpc_client::call(target, SERVICE, "AppendEntries", request).await {
            Ok(response) if response.get("success").and_then(Value::as_bool).unwrap_or(false) => {
                success_count += 1;
            }
            _ => {}
        }
    }

    if success_count >= majority(peer_snapshot.len()) {
        state.lock().unwrap().commit_index = commit_index_from_i64(entries.len() as i64 - 1);
        true
    } else {
        false
    }
}

/// Apply every committed-but-unapplied entry to the state machine,
/// returning the result of the last command whose result was non-empty.
pub async fn apply_entries(state: &Mutex<RaftState>, machine: &Mutex<StateMachine>) -> String {
    let mut applied_result = String::new();
    loop {
        let command = {
            let mut guard = state.lock().unwrap();
            if to_i64(guard.commit_index) <= to_i64(guard.last_applied) {
                break;
            }
            let next_index = to_i64(guard.last_applied) + 1;
            guard.last_applied = Some(next_index as u64);
            guard.log[next_index as usize].command.clone()
        };
        let result = machine.lock().unwrap().execute_command(&command);
        if !result.is_empty() {
            applied_result = result;
        }
    }
    applied_result
}

pub async fn handle_request_vote(config: &NodeConfig, state: &Mutex<RaftState>, payload: Value) -> Value {
    let candidate_id = payload["candidate_id"].as_str().unwrap_or_default().to_string();
    let term = payload["term"].as_u64().unwrap_or(0);

    info!(node = %config.node_id, caller = %candidate_id, rpc = "RequestVote", "raft: handling vote request");

    let mut guard = state.lock().unwrap();
    if term < guard.current_term {
        return serde_json::json!({"vote_granted": false, "term": guard.current_term});
    }
    if term > guard.current_term {
        guard.current_term = term;
        guard.voted_for = None;
        guard.role = Role::Follower;
    }
    let can_vote = guard.voted_for.is_none() || guard.voted_for.as_deref() == Some(candidate_id.as_str());
    if can_vote {
        guard.voted_for = Some(candidate_id);
        guard.last_heartbeat = Instant::now();
        serde_json::json!({"vote_granted": true, "term": guard.current_term})
    } else {
        serde_json::json!({"vote_granted": false, "term": guard.current_term})
    }
}

pub async fn handle_append_entries(
    config: &NodeConfig,
    state: &Mutex<RaftState>,
    machine: &Mutex<StateMachine>,
    payload: Value,
) -> Value {
    let leader_id = payload["leader_id"].as_str().unwrap_or_default().to_string();
    let term = payload["term"].as_u64().unwrap_or(0);
    let commit_index = payload["commit_index"].as_i64().unwrap_or(-1);

    info!(node = %config.node_id, caller = %leader_id, rpc = "AppendEntries", "raft: handling append entries");

    let entries: Vec<LogEntry> = payload["entries"]
        .as_array()
        .map(|arr| {
            arr.iter()
                .filter_map(|e| {
                    Some(LogEntry {
                        index: e.get("index")?.as_u64()?,
                        term: e.get("term")?.as_u64()?,
                        command: e.get("command")?.as_str()?.to_string(),
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    // Stale-term check and the resulting mutation must happen under one
    // uninterrupted hold of the lock — splitting them lets a lower-term
    // call that passed its check land its mutation after a higher-term
    // call has already advanced `current_term`, rolling it backward.
    let current_term = {
        let mut guard = state.lock().unwrap();
        if term < guard.current_term {
            return serde_json::json!({"success": false, "term": guard.current_term});
        }
        guard.leader_id = Some(leader_id);
        guard.role = Role::Follower;
        guard.current_term = term;
        guard.last_heartbeat = Instant::now();
        if !entries.is_empty() {
            guard.log = entries;
        }
        guard.commit_index = commit_index_from_i64(commit_index);
        guard.current_term
    };

    apply_entries(state, machine).await;

    serde_json::json!({"success": true, "term": current_term})
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(node_id: &str) -> NodeConfig {
        NodeConfig::new(node_id, "127.0.0.1", 6000, HashMap::new())
    }

    fn peer_table(pairs: &[(&str, &str)]) -> PeerTable {
        Mutex::new(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }

    #[tokio::test]
    async fn grants_vote_to_first_candidate_in_term() {
        let cfg = config("n1");
        let state = Mutex::new(RaftState::new());
        let payload = serde_json::json!({"candidate_id": "n2", "term": 1, "last_log_index": -1, "last_log_term": 0});
        let response = handle_request_vote(&cfg, &state, payload).await;
        assert_eq!(response["vote_granted"], true);
        assert_eq!(state.lock().unwrap().voted_for.as_deref(), Some("n2"));
    }

    #[tokio::test]
    async fn refuses_second_candidate_in_same_term() {
        let cfg = config("n1");
        let state = Mutex::new(RaftState::new());
        handle_request_vote(&cfg, &state, serde_json::json!({"candidate_id": "n2", "term": 1})).await;
        let response = handle_request_vote(&cfg, &state, serde_json::json!({"candidate_id": "n3", "term": 1})).await;
        assert_eq!(response["vote_granted"], false);
    }

    #[tokio::test]
    async fn stale_term_vote_request_is_rejected() {
        let cfg = config("n1");
        let state = Mutex::new(RaftState::new());
        state.lock().unwrap().current_term = 5;
        let response = handle_request_vote(&cfg, &state, serde_json::json!({"candidate_id": "n2", "term": 2})).await;
        assert_eq!(response["vote_granted"], false);
        assert_eq!(response["term"], 5);
    }

    #[tokio::test]
    async fn append_entries_replaces_log_and_applies() {
        let cfg = config("n1");
        let state = Mutex::new(RaftState::new());
        let machine = Mutex::new(StateMachine::new());
        let payload = serde_json::json!({
            "leader_id": "n0",
            "term": 1,
            "entries": [{"index": 0, "term": 1, "command": "set x 1"}],
            "commit_index": 0,
        });
        let response = handle_append_entries(&cfg, &state, &machine, payload).await;
        assert_eq!(response["success"], true);
        assert_eq!(machine.lock().unwrap().kv_store.get("x").unwrap(), "1");
        assert_eq!(state.lock().unwrap().leader_id.as_deref(), Some("n0"));
    }

    #[tokio::test]
    async fn append_entries_rejects_stale_term() {
        let cfg = config("n1");
        let state = Mutex::new(RaftState::new());
        state.lock().unwrap().current_term = 9;
        let machine = Mutex::new(StateMachine::new());
        let payload = serde_json::json!({"leader_id": "n0", "term": 1, "entries": [], "commit_index": -1});
        let response = handle_append_entries(&cfg, &state, &machine, payload).await;
        assert_eq!(response["success"], false);
        assert_eq!(response["term"], 9);
    }

    #[tokio::test]
    async fn empty_entries_do_not_clear_existing_log() {
        let cfg = config("n1");
        let state = Mutex::new(RaftState::new());
        state.lock().unwrap().log.push(LogEntry { index: 0, term: 1, command: "set x 1".to_string() });
        let machine = Mutex::new(StateMachine::new());
        let payload = serde_json::json!({"leader_id": "n0", "term": 1, "entries": [], "commit_index": -1});
        handle_append_entries(&cfg, &state, &machine, payload).await;
        assert_eq!(state.lock().unwrap().log.len(), 1);
    }

    #[tokio::test]
    async fn replicate_log_commits_without_peers() {
        let cfg = config("n1");
        let peers = peer_table(&[]);
        let state = Mutex::new(RaftState::new());
        state.lock().unwrap().log.push(LogEntry { index: 0, term: 0, command: "set x 1".to_string() });
        let committed = replicate_log(&cfg, &peers, &state).await;
        assert!(committed);
        assert_eq!(state.lock().unwrap().commit_index, Some(0));
    }

    #[test]
    fn majority_matches_peers_plus_self_over_two_plus_one() {
        assert_eq!(majority(2), 2);
        assert_eq!(majority(3), 3);
        assert_eq!(majority(0), 1);
    }
}
