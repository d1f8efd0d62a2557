//! Shared node state: the Raft log/role/term, the tiny KV state machine,
//! and the 2PC transaction table.
//!
//! `RaftState` is guarded by a plain `std::sync::Mutex`, not
//! `tokio::sync::Mutex`: every critical section here is a synchronous
//! snapshot-or-mutate, never held across an `.await`. Callers acquire,
//! read or mutate, and release before making any RPC (see `raft.rs` and
//! `node.rs`).

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

use serde::{Deserialize, Serialize};

/// One entry in the replicated log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub index: u64,
    pub term: u64,
    pub command: String,
}

/// A node's current Raft role. Behavior that varies by role lives in
/// `raft.rs`'s tickers and handlers, dispatched on this tag rather than
/// through a role-specific type hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Follower => "follower",
            Role::Candidate => "candidate",
            Role::Leader => "leader",
        }
    }
}

/// Everything the Raft tickers and handlers read or mutate under
/// `state_lock`.
pub struct RaftState {
    pub role: Role,
    pub current_term: u64,
    pub voted_for: Option<String>,
    pub log: Vec<LogEntry>,
    /// `-1` (no entry committed yet) is represented as `None`.
    pub commit_index: Option<u64>,
    pub last_applied: Option<u64>,
    pub leader_id: Option<String>,
    pub last_heartbeat: Instant,
}

impl RaftState {
    pub fn new() -> Self {
        Self {
            role: Role::Follower,
            current_term: 0,
            voted_for: None,
            log: Vec::new(),
            commit_index: None,
            last_applied: None,
            leader_id: None,
            last_heartbeat: Instant::now(),
        }
    }

    pub fn last_log_index(&self) -> i64 {
        self.log.len() as i64 - 1
    }

    pub fn last_log_term(&self) -> u64 {
        self.log.last().map(|e| e.term).unwrap_or(0)
    }
}

impl Default for RaftState {
    fn default() -> Self {
        Self::new()
    }
}

/// The tiny command-string state machine applied as log entries commit.
/// Recognizes `set <key> <value>`, `increment <key>`, `get <key>`;
/// anything else is recorded as applied but has no effect on the store.
#[derive(Debug, Default)]
pub struct StateMachine {
    pub kv_store: HashMap<String, String>,
    pub applied_commands: Vec<String>,
}

impl StateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one command, returning the command's result string (empty
    /// for unrecognized or malformed commands).
    pub fn execute_command(&mut self, command: &str) -> String {
        let parts: Vec<&str> = command.split_whitespace().collect();
        if parts.is_empty() {
            return String::new();
        }
        let op = parts[0].to_lowercase();
        let result = match op.as_str() {
            "set" if parts.len() == 3 => {
                let (key, value) = (parts[1], parts[2]);
                self.kv_store.insert(key.to_string(), value.to_string());
                Some(value.to_string())
            }
            "increment" if parts.len() == 2 => {
                let key = parts[1];
                let current: i64 = self
                    .kv_store
                    .get(key)
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(0);
                let next = current + 1;
                self.kv_store.insert(key.to_string(), next.to_string());
                Some(next.to_string())
            }
            "get" if parts.len() == 2 => Some(self.kv_store.get(parts[1]).cloned().unwrap_or_default()),
            _ => None,
        };
        self.applied_commands.push(command.to_string());
        result.unwrap_or_default()
    }
}

/// One 2PC transaction as tracked by a participant.
#[derive(Debug, Clone)]
pub struct TransactionRecord {
    pub transaction_id: String,
    pub payload: String,
    pub decision: Option<bool>,
}

/// Transaction table guarded by its own lock, independent of
/// `RaftState`'s — 2PC and Raft never need to hold both at once.
pub type TransactionTable = Mutex<HashMap<String, TransactionRecord>>;

/// Live peer map (`peer_id -> "host:port"`), separate from `RaftState`
/// so a node can absorb a late-joining peer (spec scenario: extend every
/// existing node's peer map, then start the new node) without touching
/// Raft's own lock.
pub type PeerTable = Mutex<HashMap<String, String>>;
