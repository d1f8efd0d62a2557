//! TCP RPC server: a bounded-poll accept loop plus one worker task per
//! connection, dispatching on `(service, method)`.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::codec::{decode_request, encode_response, Response};

/// How often the accept loop checks the `running` flag.
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("server is already running")]
    AlreadyRunning,

    #[error("failed to bind {0}: {1}")]
    Bind(String, std::io::Error),
}

/// A boxed async handler: takes the decoded request payload, returns the
/// response payload. Handlers never return an `Err` — transport/protocol
/// failures are the server's job; application failures are encoded as
/// ordinary in-band fields on the returned `Value` (per spec §7).
pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;
pub type Handler = Arc<dyn Fn(Value) -> BoxFuture<Value> + Send + Sync>;

/// A running (or not-yet-started) RPC server bound to a single node.
pub struct RpcServer {
    bind_addr: String,
    handlers: HashMap<(String, String), Handler>,
    running: Arc<AtomicBool>,
    accept_task: Option<JoinHandle<()>>,
}

impl RpcServer {
    pub fn new(bind_addr: impl Into<String>) -> Self {
        Self {
            bind_addr: bind_addr.into(),
            handlers: HashMap::new(),
            running: Arc::new(AtomicBool::new(false)),
            accept_task: None,
        }
    }

    /// Register a handler for `service.method`. Must be called before
    /// `start()`.
    pub fn register<F, Fut>(&mut self, service: &str, method: &str, handler: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Value> + Send + 'static,
    {
        self.handlers.insert(
            (service.to_string(), method.to_string()),
            Arc::new(move |payload| Box::pin(handler(payload))),
        );
    }

    /// Bind the listener and spawn the accept loop. Returns once the
    /// listener is bound; the accept loop itself runs in the background.
    pub async fn start(&mut self) -> Result<(), ServerError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(ServerError::AlreadyRunning);
        }

        let addr = self
            .bind_addr
            .parse()
            .map_err(|e| ServerError::Bind(self.bind_addr.clone(), std::io::Error::new(std::io::ErrorKind::InvalidInput, e)))?;

        let socket = if addr_is_v6(&self.bind_addr) {
            TcpSocket::new_v6()
        } else {
            TcpSocket::new_v4()
        }
        .map_err(|e| ServerError::Bind(self.bind_addr.clone(), e))?;
        socket
            .set_reuseaddr(true)
            .map_err(|e| ServerError::Bind(self.bind_addr.clone(), e))?;
        socket
            .bind(addr)
            .map_err(|e| ServerError::Bind(self.bind_addr.clone(), e))?;
        let listener = socket
            .listen(1024)
            .map_err(|e| ServerError::Bind(self.bind_addr.clone(), e))?;

        info!(addr = %self.bind_addr, "rpc server: listening");

        let handlers = self.handlers.clone_handlers();
        let running = self.running.clone();
        self.accept_task = Some(tokio::spawn(accept_loop(listener, handlers, running)));
        Ok(())
    }

    /// Mark the server as stopped. The accept loop observes this at its
    /// next poll tick (at most `ACCEPT_POLL_INTERVAL` later) and returns;
    /// in-flight connection workers drain naturally.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// A clone of this server's own running flag, distinct from any
    /// flag the owning node uses for its Raft tickers. Lets a handler
    /// registered before `start()` (e.g. `RaftService.Shutdown`) stop
    /// the accept loop itself, not just the node's background tasks.
    pub fn running_handle(&self) -> Arc<AtomicBool> {
        self.running.clone()
    }

    /// Wait for the accept loop to exit, bounded so a wedged task cannot
    /// hang shutdown forever.
    pub async fn wait(&mut self) {
        if let Some(handle) = self.accept_task.take() {
            let _ = tokio::time::timeout(Duration::from_secs(2), handle).await;
        }
    }
}

// `HashMap<_, Handler>` doesn't implement `Clone` generically enough to
// derive, but `Handler` (`Arc<..>`) is cheap to clone, so clone the map
// entry-by-entry.
trait CloneHandlers {
    fn clone_handlers(&self) -> HashMap<(String, String), Handler>;
}

impl CloneHandlers for HashMap<(String, String), Handler> {
    fn clone_handlers(&self) -> HashMap<(String, String), Handler> {
        self.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
    }
}

fn addr_is_v6(addr: &str) -> bool {
    addr.starts_with('[')
}

async fn accept_loop(
    listener: TcpListener,
    handlers: HashMap<(String, String), Handler>,
    running: Arc<AtomicBool>,
) {
    let handlers = Arc::new(handlers);
    while running.load(Ordering::SeqCst) {
        match tokio::time::timeout(ACCEPT_POLL_INTERVAL, listener.accept()).await {
            Ok(Ok((stream, peer))) => {
                debug!(%peer, "rpc server: accepted connection");
                let handlers = handlers.clone();
                tokio::spawn(handle_connection(stream, handlers));
            }
            Ok(Err(e)) => {
                warn!(error = %e, "rpc server: accept failed");
            }
            Err(_) => continue, // poll timeout — re-check `running`
        }
    }
    info!("rpc server: accept loop stopped");
}

/// Serve one connection: read until `\n`, dispatch, write one response,
/// repeat until the peer closes the socket. A connection may carry many
/// request/response pairs sequentially (spec §4.B).
async fn handle_connection(stream: TcpStream, handlers: Arc<HashMap<(String, String), Handler>>) {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    loop {
        line.clear();
        let bytes_read = match reader.read_line(&mut line).await {
            Ok(n) => n,
            Err(e) => {
                debug!(error = %e, "rpc server: connection read error");
                return;
            }
        };
        if bytes_read == 0 {
            return; // peer closed the connection
        }
        let trimmed = line.trim_end();
        if trimmed.is_empty() {
            continue;
        }

        let response = match decode_request(trimmed) {
            Ok(request) => match handlers.get(&(request.service.clone(), request.method.clone())) {
                Some(handler) => Response::ok(handler(request.payload).await),
                None => Response::error("method_not_found"),
            },
            Err(e) => Response::error(e.to_string()),
        };

        let encoded = match encode_response(&response) {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "rpc server: failed to encode response");
                return;
            }
        };
        if writer.write_all(encoded.as_bytes()).await.is_err() {
            return; // socket failure — close, per spec §4.A
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc_client;

    #[tokio::test]
    async fn dispatches_to_registered_handler() {
        let mut server = RpcServer::new("127.0.0.1:17601");
        server.register("Echo", "Ping", |payload| async move {
            serde_json::json!({"echo": payload})
        });
        server.start().await.unwrap();

        let result = rpc_client::call("127.0.0.1:17601", "Echo", "Ping", serde_json::json!("hi"))
            .await
            .unwrap();
        assert_eq!(result["echo"], "hi");

        server.stop();
        server.wait().await;
    }

    #[tokio::test]
    async fn unknown_method_returns_in_band_error() {
        let mut server = RpcServer::new("127.0.0.1:17602");
        server.start().await.unwrap();

        let err = rpc_client::call("127.0.0.1:17602", "Nope", "Nope", Value::Null)
            .await
            .unwrap_err();
        assert!(matches!(err, rpc_client::RpcError::Remote(msg) if msg == "method_not_found"));

        server.stop();
        server.wait().await;
    }

    #[tokio::test]
    async fn second_start_is_rejected() {
        let mut server = RpcServer::new("127.0.0.1:17603");
        server.start().await.unwrap();
        assert!(matches!(server.start().await, Err(ServerError::AlreadyRunning)));
        server.stop();
        server.wait().await;
    }

    #[tokio::test]
    async fn connection_carries_multiple_requests() {
        let mut server = RpcServer::new("127.0.0.1:17604");
        server.register("Echo", "Ping", |payload| async move { payload });
        server.start().await.unwrap();

        for i in 0..3 {
            let result =
                rpc_client::call("127.0.0.1:17604", "Echo", "Ping", serde_json::json!(i))
                    .await
                    .unwrap();
            assert_eq!(result, i);
        }

        server.stop();
        server.wait().await;
    }
}
