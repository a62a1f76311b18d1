//! Line-delimited JSON-RPC 2.0 connection.
//!
//! A reader task owns the inbound half. Responses are routed to the waiting
//! caller by id, notifications are queued on a channel, and requests from the
//! peer are answered through a handler. When the stream ends every waiter is
//! failed with [`RunnerError::Connection`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::acp::RunnerError;
use crate::acp::protocol::RpcErrorObject;

type Writer = Box<dyn AsyncWrite + Send + Unpin>;
type Waiter = oneshot::Sender<Result<Value, RunnerError>>;

/// Answers requests initiated by the peer.
pub type RequestHandler = Arc<dyn Fn(&str, &Value) -> Result<Value, RpcErrorObject> + Send + Sync>;

/// Message sent by the peer without an id.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub method: String,
    pub params: Value,
}

#[derive(Default)]
struct Pending {
    waiters: HashMap<u64, Waiter>,
    closed: Option<String>,
}

impl Pending {
    fn fail_all(&mut self, reason: &str) {
        self.closed = Some(reason.to_string());
        for (_, waiter) in self.waiters.drain() {
            let _ = waiter.send(Err(RunnerError::Connection(reason.to_string())));
        }
    }
}

pub struct JsonRpcConnection {
    writer: Arc<tokio::sync::Mutex<Writer>>,
    pending: Arc<Mutex<Pending>>,
    next_id: AtomicU64,
    reader: JoinHandle<()>,
}

impl std::fmt::Debug for JsonRpcConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JsonRpcConnection")
            .field("next_id", &self.next_id)
            .finish_non_exhaustive()
    }
}

/// Removes the waiter if the request future is dropped before completion.
struct WaiterGuard<'a> {
    pending: &'a Mutex<Pending>,
    id: u64,
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.waiters.remove(&self.id);
        }
    }
}

impl JsonRpcConnection {
    /// Start a connection over `reader`/`writer`. Must be called inside a tokio runtime.
    pub fn new<R, W>(
        reader: R,
        writer: W,
        handler: RequestHandler,
    ) -> (Self, mpsc::UnboundedReceiver<Notification>)
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let writer: Arc<tokio::sync::Mutex<Writer>> =
            Arc::new(tokio::sync::Mutex::new(Box::new(writer)));
        let pending = Arc::new(Mutex::new(Pending::default()));
        let (notify_tx, notify_rx) = mpsc::unbounded_channel();

        let reader = tokio::spawn(read_loop(
            reader,
            Arc::clone(&writer),
            Arc::clone(&pending),
            notify_tx,
            handler,
        ));

        let conn = Self {
            writer,
            pending,
            next_id: AtomicU64::new(1),
            reader,
        };
        (conn, notify_rx)
    }

    pub fn is_closed(&self) -> bool {
        self.pending
            .lock()
            .map(|pending| pending.closed.is_some())
            .unwrap_or(true)
    }

    /// Send a request and wait for its response.
    pub async fn request(&self, method: &str, params: Value) -> Result<Value, RunnerError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self
                .pending
                .lock()
                .map_err(|_| RunnerError::Connection("pending map poisoned".into()))?;
            if let Some(reason) = &pending.closed {
                return Err(RunnerError::Connection(reason.clone()));
            }
            pending.waiters.insert(id, tx);
        }
        let _guard = WaiterGuard {
            pending: &self.pending,
            id,
        };

        debug!(id, method, "sending request");
        let message = json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params });
        write_message(&self.writer, &message).await?;

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(RunnerError::Connection("response channel dropped".into())),
        }
    }

    pub async fn notify(&self, method: &str, params: Value) -> Result<(), RunnerError> {
        if self.is_closed() {
            return Err(RunnerError::Connection("connection closed".into()));
        }
        let message = json!({ "jsonrpc": "2.0", "method": method, "params": params });
        write_message(&self.writer, &message).await
    }

    /// Stop reading and fail every outstanding request.
    pub fn shutdown(&self) {
        self.reader.abort();
        if let Ok(mut pending) = self.pending.lock() {
            if pending.closed.is_none() {
                pending.fail_all("connection shut down");
            }
        }
    }
}

impl Drop for JsonRpcConnection {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn write_message(
    writer: &tokio::sync::Mutex<Writer>,
    message: &Value,
) -> Result<(), RunnerError> {
    let mut line = serde_json::to_string(message).map_err(|err| RunnerError::Protocol {
        code: crate::acp::protocol::PARSE_ERROR,
        message: err.to_string(),
    })?;
    line.push('\n');
    let mut writer = writer.lock().await;
    writer
        .write_all(line.as_bytes())
        .await
        .map_err(|err| RunnerError::Connection(err.to_string()))?;
    writer
        .flush()
        .await
        .map_err(|err| RunnerError::Connection(err.to_string()))
}

async fn read_loop<R>(
    reader: R,
    writer: Arc<tokio::sync::Mutex<Writer>>,
    pending: Arc<Mutex<Pending>>,
    notifications: mpsc::UnboundedSender<Notification>,
    handler: RequestHandler,
) where
    R: AsyncRead + Send + Unpin + 'static,
{
    let mut lines = BufReader::new(reader).lines();
    let reason = loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break "agent closed the stream".to_string(),
            Err(err) => break format!("read from agent: {err}"),
        };
        if line.trim().is_empty() {
            continue;
        }
        trace!(line = %line, "received line");
        let message: Value = match serde_json::from_str(&line) {
            Ok(value) => value,
            Err(err) => {
                warn!(err = %err, "skipping non-JSON line from agent");
                continue;
            }
        };
        dispatch(message, &writer, &pending, &notifications, &handler).await;
    };

    debug!(reason = %reason, "connection reader finished");
    if let Ok(mut pending) = pending.lock() {
        pending.fail_all(&reason);
    }
}

async fn dispatch(
    message: Value,
    writer: &tokio::sync::Mutex<Writer>,
    pending: &Mutex<Pending>,
    notifications: &mpsc::UnboundedSender<Notification>,
    handler: &RequestHandler,
) {
    let method = message.get("method").and_then(Value::as_str);
    let id = message.get("id").filter(|id| !id.is_null());

    match (method, id) {
        (Some(method), Some(id)) => {
            let params = message.get("params").cloned().unwrap_or(Value::Null);
            let reply = match handler(method, &params) {
                Ok(result) => json!({ "jsonrpc": "2.0", "id": id, "result": result }),
                Err(error) => json!({ "jsonrpc": "2.0", "id": id, "error": error }),
            };
            if let Err(err) = write_message(writer, &reply).await {
                warn!(method, err = %err, "failed to answer agent request");
            }
        }
        (Some(method), None) => {
            let params = message.get("params").cloned().unwrap_or(Value::Null);
            let _ = notifications.send(Notification {
                method: method.to_string(),
                params,
            });
        }
        (None, Some(id)) => {
            let Some(id) = id.as_u64() else {
                warn!(id = %id, "response with non-numeric id");
                return;
            };
            let result = match message.get("error") {
                Some(error) => Err(protocol_error(error)),
                None => Ok(message.get("result").cloned().unwrap_or(Value::Null)),
            };
            let waiter = pending
                .lock()
                .ok()
                .and_then(|mut pending| pending.waiters.remove(&id));
            match waiter {
                Some(waiter) => {
                    let _ = waiter.send(result);
                }
                None => debug!(id, "response for abandoned request"),
            }
        }
        (None, None) => warn!("message without method or id"),
    }
}

fn protocol_error(error: &Value) -> RunnerError {
    match serde_json::from_value::<RpcErrorObject>(error.clone()) {
        Ok(obj) => RunnerError::Protocol {
            code: obj.code,
            message: obj.message,
        },
        Err(_) => RunnerError::Protocol {
            code: 0,
            message: error.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acp::protocol::answer_agent_request;
    use tokio::io::{AsyncBufReadExt, BufReader, duplex};

    fn handler() -> RequestHandler {
        Arc::new(answer_agent_request)
    }

    /// Responses are matched to requests by id, notifications are queued.
    #[tokio::test]
    async fn request_receives_matching_response() {
        let (client_io, agent_io) = duplex(4096);
        let (client_read, client_write) = tokio::io::split(client_io);
        let (conn, mut notes) = JsonRpcConnection::new(client_read, client_write, handler());

        let (agent_read, mut agent_write) = tokio::io::split(agent_io);
        let agent = tokio::spawn(async move {
            let mut lines = BufReader::new(agent_read).lines();
            let line = lines.next_line().await.expect("read").expect("line");
            let request: Value = serde_json::from_str(&line).expect("json");
            assert_eq!(request["method"], "ping");
            let note = json!({ "jsonrpc": "2.0", "method": "tick", "params": { "n": 1 } });
            let reply = json!({ "jsonrpc": "2.0", "id": request["id"], "result": { "pong": true } });
            agent_write
                .write_all(format!("{note}\n{reply}\n").as_bytes())
                .await
                .expect("write");
            agent_write
        });

        let result = conn.request("ping", json!({})).await.expect("response");
        assert_eq!(result["pong"], true);
        let note = notes.recv().await.expect("notification");
        assert_eq!(note.method, "tick");
        drop(agent.await.expect("agent"));
    }

    #[tokio::test]
    async fn error_response_maps_to_protocol_error() {
        let (client_io, agent_io) = duplex(4096);
        let (client_read, client_write) = tokio::io::split(client_io);
        let (conn, _notes) = JsonRpcConnection::new(client_read, client_write, handler());

        let (agent_read, mut agent_write) = tokio::io::split(agent_io);
        let _agent = tokio::spawn(async move {
            let mut lines = BufReader::new(agent_read).lines();
            let line = lines.next_line().await.expect("read").expect("line");
            let request: Value = serde_json::from_str(&line).expect("json");
            let reply = json!({
                "jsonrpc": "2.0",
                "id": request["id"],
                "error": { "code": -32000, "message": "boom" }
            });
            agent_write
                .write_all(format!("{reply}\n").as_bytes())
                .await
                .expect("write");
            // Keep the stream open until the test finishes.
            std::future::pending::<()>().await;
        });

        let err = conn.request("x", json!({})).await.expect_err("error");
        assert_eq!(
            err,
            RunnerError::Protocol {
                code: -32000,
                message: "boom".into()
            }
        );
    }

    /// Closing the stream fails outstanding and later requests alike.
    #[tokio::test]
    async fn closed_stream_fails_pending_requests() {
        let (client_io, agent_io) = duplex(4096);
        let (client_read, client_write) = tokio::io::split(client_io);
        let (conn, _notes) = JsonRpcConnection::new(client_read, client_write, handler());

        let closer = tokio::spawn(async move {
            let (agent_read, _agent_write) = tokio::io::split(agent_io);
            let mut lines = BufReader::new(agent_read).lines();
            let _ = lines.next_line().await;
            // Dropping both halves closes the stream without replying.
        });

        let err = conn.request("never", json!({})).await.expect_err("closed");
        assert!(matches!(err, RunnerError::Connection(_)));
        closer.await.expect("closer");

        let err = conn.request("again", json!({})).await.expect_err("closed");
        assert!(matches!(err, RunnerError::Connection(_)));
        assert!(conn.is_closed());
    }

    /// Requests initiated by the agent get an answer on the same stream.
    #[tokio::test]
    async fn unknown_agent_request_gets_method_not_found() {
        let (client_io, agent_io) = duplex(4096);
        let (client_read, client_write) = tokio::io::split(client_io);
        let (_conn, _notes) = JsonRpcConnection::new(client_read, client_write, handler());

        let (agent_read, mut agent_write) = tokio::io::split(agent_io);
        let request = json!({ "jsonrpc": "2.0", "id": 7, "method": "terminal/create", "params": {} });
        agent_write
            .write_all(format!("{request}\n").as_bytes())
            .await
            .expect("write");

        let mut lines = BufReader::new(agent_read).lines();
        let line = lines.next_line().await.expect("read").expect("line");
        let reply: Value = serde_json::from_str(&line).expect("json");
        assert_eq!(reply["id"], 7);
        assert_eq!(reply["error"]["code"], -32601);
    }
}
