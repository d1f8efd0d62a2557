//! Classical two-phase commit: voting phase then decision phase, run by
//! whichever node calls `run_transaction` (the coordinator for that one
//! transaction — there is no fixed coordinator role, per spec §4.E).
//!
//! Presumed-abort throughout: an RPC failure during voting counts as a
//! "no" vote, and a failure delivering the decision is simply logged and
//! skipped — there is no retry or rollback (spec Non-goals).

use std::collections::HashMap;

use serde_json::Value;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::NodeConfig;
use crate::rpc_client;
use crate::state::{PeerTable, TransactionRecord, TransactionTable};

pub const VOTING_SERVICE: &str = "VotingPhase";
pub const DECISION_SERVICE: &str = "DecisionPhase";

#[derive(Error, Debug)]
pub enum TwoPcError {
    #[error("unknown participant {0}")]
    UnknownParticipant(String),
}

fn resolve_target(config: &NodeConfig, peers: &PeerTable, participant_id: &str) -> Option<String> {
    if participant_id == config.node_id {
        Some(config.address())
    } else {
        peers.lock().unwrap().get(participant_id).cloned()
    }
}

/// Run one transaction to completion: collect a vote from every
/// participant, then deliver the unanimous-AND decision to all of them.
/// Returns the decision (`true` = committed).
pub async fn run_transaction(
    config: &NodeConfig,
    peers: &PeerTable,
    payload: &str,
    participants: &[String],
) -> Result<bool, TwoPcError> {
    let transaction_id = Uuid::new_v4().simple().to_string();
    let mut votes: HashMap<String, bool> = HashMap::new();

    for participant_id in participants {
        let target = resolve_target(config, peers, participant_id)
            .ok_or_else(|| TwoPcError::UnknownParticipant(participant_id.clone()))?;
        info!(
            phase = "Voting",
            source = %config.node_id,
            rpc = "RequestVote",
            %participant_id,
            %target,
            "2pc: sending vote request"
        );
        let request = serde_json::json!({
            "coordinator_id": config.node_id,
            "participant_id": participant_id,
            "transaction_id": transaction_id,
            "payload": payload,
        });
        let vote = match rpc_client::call(&target, VOTING_SERVICE, "RequestVote", request).await {
            Ok(response) => response
                .get("commit")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            Err(e) => {
                warn!(%participant_id, error = %e, "2pc: vote request failed, counting as no");
                false
            }
        };
        votes.insert(participant_id.clone(), vote);
    }

    let decision = votes.values().all(|v| *v);

    for participant_id in participants {
        let Some(target) = resolve_target(config, peers, participant_id) else {
            continue;
        };
        info!(
            phase = "Decision",
            source = %config.node_id,
            rpc = "DeliverDecision",
            %participant_id,
            %target,
            "2pc: delivering decision"
        );
        let request = serde_json::json!({
            "coordinator_id": config.node_id,
            "participant_id": participant_id,
            "transaction_id": transaction_id,
            "commit": decision,
            "payload": payload,
        });
        if let Err(e) = rpc_client::call(&target, DECISION_SERVICE, "DeliverDecision", request).await {
            warn!(%participant_id, error = %e, "2pc: failed to deliver decision, leaving participant in doubt");
        }
    }

    Ok(decision)
}

/// Participant side of the voting phase: record the transaction and cast
/// this node's fixed vote (`config.vote_commit`).
pub async fn handle_vote_request(
    config: &NodeConfig,
    transactions: &TransactionTable,
    payload: Value,
) -> Value {
    let participant_id = payload["participant_id"].as_str().unwrap_or_default();
    let coordinator_id = payload["coordinator_id"].as_str().unwrap_or_default();
    let transaction_id = payload["transaction_id"].as_str().unwrap_or_default().to_string();
    let transaction_payload = payload["payload"].as_str().unwrap_or_default().to_string();

    info!(
        phase = "Voting",
        node = %participant_id,
        rpc = "RequestVote",
        caller = %coordinator_id,
        "2pc: handling vote request"
    );

    let vote = config.vote_commit;
    let record = TransactionRecord {
        transaction_id: transaction_id.clone(),
        payload: transaction_payload,
        decision: None,
    };
    transactions.lock().unwrap().insert(transaction_id.clone(), record);

    serde_json::json!({
        "participant_id": participant_id,
        "transaction_id": transaction_id,
        "commit": vote,
    })
}

/// Participant side of the decision phase: record the coordinator's
/// decision against the transaction, if known.
pub async fn handle_decision(transactions: &TransactionTable, payload: Value) -> Value {
    let participant_id = payload["participant_id"].as_str().unwrap_or_default();
    let coordinator_id = payload["coordinator_id"].as_str().unwrap_or_default();
    let transaction_id = payload["transaction_id"].as_str().unwrap_or_default().to_string();
    let commit = payload["commit"].as_bool().unwrap_or(false);

    info!(
        phase = "Decision",
        node = %participant_id,
        rpc = "DeliverDecision",
        caller = %coordinator_id,
        "2pc: handling decision"
    );

    if let Some(record) = transactions.lock().unwrap().get_mut(&transaction_id) {
        record.decision = Some(commit);
    }

    let message = if commit { "committed" } else { "aborted" };
    serde_json::json!({
        "participant_id": participant_id,
        "transaction_id": transaction_id,
        "committed": commit,
        "message": message,
    })
}
