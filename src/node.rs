//! `Node`: wires the RPC server, Raft tickers, 2PC handlers, and the KV
//! state machine together into one running consensus participant.
//!
//! There is no separate "client" or "cluster manager" type — a `Node`
//! is simultaneously a Raft peer, a 2PC participant, and (for any
//! transaction it starts) a 2PC coordinator, exactly as spec §4 and
//! `ConsensusNode` in the original implementation model it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tracing::info;
use uuid::Uuid;

use crate::config::NodeConfig;
use crate::raft::{self, Tickers};
use crate::rpc_client;
use crate::rpc_server::{RpcServer, ServerError};
use crate::state::{LogEntry, PeerTable, RaftState, Role, StateMachine, TransactionTable};
use crate::twophase;

pub struct Node {
    config: Arc<NodeConfig>,
    server: RpcServer,
    peers: Arc<PeerTable>,
    state: Arc<Mutex<RaftState>>,
    machine: Arc<Mutex<StateMachine>>,
    transactions: Arc<TransactionTable>,
    running: Arc<AtomicBool>,
    tickers: Option<Tickers>,
}

impl Node {
    pub fn new(config: NodeConfig) -> Self {
        let peers = Arc::new(Mutex::new(config.peers.clone()));
        let config = Arc::new(config);
        let server = RpcServer::new(config.address());
        Self {
            config,
            server,
            peers,
            state: Arc::new(Mutex::new(RaftState::new())),
            machine: Arc::new(Mutex::new(StateMachine::new())),
            transactions: Arc::new(Mutex::new(HashMap::new())),
            running: Arc::new(AtomicBool::new(false)),
            tickers: None,
        }
    }

    /// Extend the live peer map with a late-joining node, without
    /// restarting anything (spec scenario: "late join").
    pub fn add_peer(&self, peer_id: impl Into<String>, address: impl Into<String>) {
        self.peers.lock().unwrap().insert(peer_id.into(), address.into());
    }

    /// Bind the RPC server, register every endpoint, and start the Raft
    /// tickers. Mirrors `ConsensusNode.start` in the original: server
    /// first, background loops after.
    pub async fn start(&mut self) -> Result<(), ServerError> {
        self.register_handlers();
        self.server.start().await?;
        self.running.store(true, Ordering::SeqCst);
        self.tickers = Some(raft::spawn_tickers(
            self.config.clone(),
            self.peers.clone(),
            self.state.clone(),
            self.machine.clone(),
            self.running.clone(),
        ));
        info!(node = %self.config.node_id, addr = %self.config.address(), "node: started");
        Ok(())
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.server.stop();
    }

    pub async fn wait(&mut self) {
        self.server.wait().await;
        if let Some(tickers) = self.tickers.take() {
            let _ = tickers.election.await;
            let _ = tickers.heartbeat.await;
        }
    }

    fn register_handlers(&mut self) {
        let config = self.config.clone();
        let state = self.state.clone();
        let machine = self.machine.clone();
        let transactions = self.transactions.clone();

        let c = config.clone();
        let t = transactions.clone();
        self.server.register(twophase::VOTING_SERVICE, "RequestVote", move |payload| {
            let c = c.clone();
            let t = t.clone();
            async move { twophase::handle_vote_request(&c, &t, payload).await }
        });

        let t = transactions.clone();
        self.server.register(twophase::DECISION_SERVICE, "DeliverDecision", move |payload| {
            let t = t.clone();
            async move { twophase::handle_decision(&t, payload).await }
        });

        let c = config.clone();
        let s = state.clone();
        self.server.register(raft::SERVICE, "RequestVote", move |payload| {
            let c = c.clone();
            let s = s.clone();
            async move { raft::handle_request_vote(&c, &s, payload).await }
        });

        let c = config.clone();
        let s = state.clone();
        let m = machine.clone();
        self.server.register(raft::SERVICE, "AppendEntries", move |payload| {
            let c = c.clone();
            let s = s.clone();
            let m = m.clone();
            async move { raft::handle_append_entries(&c, &s, &m, payload).await }
        });

        let c = config.clone();
        let p = self.peers.clone();
        let s = state.clone();
        let m = machine.clone();
        self.server.register(raft::SERVICE, "ClientCommand", move |payload| {
            let c = c.clone();
            let p = p.clone();
            let s = s.clone();
            let m = m.clone();
            async move { handle_client_command(&c, &p, &s, &m, payload).await }
        });

        let c = config.clone();
        let s = state.clone();
        let m = machine.clone();
        self.server.register(raft::SERVICE, "GetStatus", move |payload| {
            let c = c.clone();
            let s = s.clone();
            let m = m.clone();
            async move { handle_get_status(&c, &s, &m, payload).await }
        });

        let running = self.running.clone();
        let server_running = self.server.running_handle();
        self.server.register(raft::SERVICE, "Shutdown", move |payload| {
            let running = running.clone();
            let server_running = server_running.clone();
            async move { handle_shutdown(&running, &server_running, payload).await }
        });
    }

    /// Start a 2PC transaction with this node as coordinator.
    pub async fn run_transaction(
        &self,
        payload: &str,
        participants: &[String],
    ) -> Result<bool, twophase::TwoPcError> {
        twophase::run_transaction(&self.config, &self.peers, payload, participants).await
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }
}

/// Client-facing command entry point: if this node is the leader, append
/// to the log and drive replication/commit/apply synchronously; if not,
/// forward the command to whichever node it believes is the leader.
async fn handle_client_command(
    config: &NodeConfig,
    peers: &PeerTable,
    state: &Mutex<RaftState>,
    machine: &Mutex<StateMachine>,
    payload: Value,
) -> Value {
    let source_id = payload["source_id"].as_str().unwrap_or("client").to_string();
    let command = match payload["command"].as_str() {
        Some(c) => c.to_string(),
        None => return serde_json::json!({"success": false, "message": "missing_command"}),
    };

    info!(node = %config.node_id, caller = %source_id, rpc = "ClientCommand", "node: handling client command");

    let leader_id = {
        let mut guard = state.lock().unwrap();
        let leader_id = if guard.role == Role::Leader {
            Some(config.node_id.clone())
        } else {
            guard.leader_id.clone()
        };
        if guard.role == Role::Leader {
            let index = guard.log.len() as u64;
            let term = guard.current_term;
            guard.log.push(LogEntry { index, term, command: command.clone() });
        }
        leader_id
    };

    if leader_id.as_deref() != Some(config.node_id.as_str()) {
        let Some(leader_id) = leader_id else {
            return serde_json::json!({"success": false, "leader_id": "", "message": "no_leader"});
        };
        let target_address = peers
            .lock()
            .unwrap()
            .get(&leader_id)
            .cloned()
            .unwrap_or_else(|| config.address());
        let request = serde_json::json!({
            "source_id": config.node_id,
            "command": command,
            "client_id": payload.get("client_id").and_then(Value::as_str).unwrap_or("client"),
            "request_id": payload
                .get("request_id")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| Uuid::new_v4().simple().to_string()),
        });
        return match rpc_client::call(&target_address, raft::SERVICE, "ClientCommand", request).await {
            Ok(response) => response,
            Err(e) => serde_json::json!({
                "success": false,
                "leader_id": leader_id,
                "message": format!("forward_failed:{e}"),
            }),
        };
    }

    if raft::replicate_log(config, peers, state).await {
        let result = raft::apply_entries(state, machine).await;
        serde_json::json!({
            "success": true,
            "leader_id": config.node_id,
            "result": result,
            "message": "committed",
        })
    } else {
        serde_json::json!({
            "success": false,
            "leader_id": config.node_id,
            "message": "failed_to_commit",
        })
    }
}

async fn handle_get_status(
    config: &NodeConfig,
    state: &Mutex<RaftState>,
    machine: &Mutex<StateMachine>,
    payload: Value,
) -> Value {
    let requester_id = payload["requester_id"].as_str().unwrap_or("client");
    info!(node = %config.node_id, caller = %requester_id, rpc = "GetStatus", "node: handling status request");

    let guard = state.lock().unwrap();
    let applied_commands = machine.lock().unwrap().applied_commands.clone();
    serde_json::json!({
        "node_id": config.node_id,
        "role": guard.role.as_str(),
        "term": guard.current_term,
        "commit_index": guard.commit_index.map(|v| v as i64).unwrap_or(-1),
        "applied_commands": applied_commands,
        "leader_id": guard.leader_id.clone().unwrap_or_default(),
    })
}

async fn handle_shutdown(running: &AtomicBool, server_running: &AtomicBool, payload: Value) -> Value {
    let requester_id = payload["requester_id"].as_str().unwrap_or("client");
    info!(caller = %requester_id, rpc = "Shutdown", "node: handling shutdown request");
    running.store(false, Ordering::SeqCst);
    server_running.store(false, Ordering::SeqCst);
    serde_json::json!({"stopping": true})
}
