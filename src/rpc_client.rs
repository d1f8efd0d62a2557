//! Short-lived RPC client: one TCP connection per call, 5s timeout on
//! connect, send, and receive.

use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use crate::codec::{decode_response, encode_request, Request};
use crate::config::parse_target;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Error, Debug)]
pub enum RpcError {
    #[error("connect to {0} timed out")]
    ConnectTimeout(String),

    #[error("call to {0} timed out")]
    CallTimeout(String),

    #[error("transport error talking to {target}: {source}")]
    Transport {
        target: String,
        #[source]
        source: std::io::Error,
    },

    #[error("connection closed before a response was received")]
    ConnectionClosed,

    #[error("malformed frame: {0}")]
    Codec(#[from] crate::codec::CodecError),

    #[error("remote error: {0}")]
    Remote(String),

    #[error("invalid target address: {0}")]
    InvalidTarget(String),
}

/// Call `service.method(payload)` on the node listening at `target`
/// (`"host:port"`), returning the decoded response payload or an
/// `RpcError`. Any failure — refused connection, timeout, malformed
/// frame, or an in-band `payload.error` — is surfaced uniformly so
/// callers (Raft tickers, 2PC, command forwarding) can treat them all as
/// "this peer did not answer".
pub async fn call(target: &str, service: &str, method: &str, payload: Value) -> Result<Value, RpcError> {
    call_with_timeout(target, service, method, payload, DEFAULT_TIMEOUT).await
}

pub async fn call_with_timeout(
    target: &str,
    service: &str,
    method: &str,
    payload: Value,
    call_timeout: Duration,
) -> Result<Value, RpcError> {
    parse_target(target).ok_or_else(|| RpcError::InvalidTarget(target.to_string()))?;

    debug!(target, service, method, "rpc: dialing");

    let mut stream = timeout(call_timeout, TcpStream::connect(target))
        .await
        .map_err(|_| RpcError::ConnectTimeout(target.to_string()))?
        .map_err(|source| RpcError::Transport {
            target: target.to_string(),
            source,
        })?;

    let request = Request {
        service: service.to_string(),
        method: method.to_string(),
        payload,
    };
    let line = encode_request(&request)?;

    timeout(call_timeout, stream.write_all(line.as_bytes()))
        .await
        .map_err(|_| RpcError::CallTimeout(target.to_string()))?
        .map_err(|source| RpcError::Transport {
            target: target.to_string(),
            source,
        })?;

    let mut reader = BufReader::new(stream);
    let mut response_line = String::new();
    let bytes_read = timeout(call_timeout, reader.read_line(&mut response_line))
        .await
        .map_err(|_| RpcError::CallTimeout(target.to_string()))?
        .map_err(|source| RpcError::Transport {
            target: target.to_string(),
            source,
        })?;

    if bytes_read == 0 {
        return Err(RpcError::ConnectionClosed);
    }

    let response = decode_response(response_line.trim_end())?;
    if let Some(message) = response.error_message() {
        return Err(RpcError::Remote(message.to_string()));
    }
    Ok(response.payload)
}
