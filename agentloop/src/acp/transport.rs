//! ACP methods over a [`JsonRpcConnection`].

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::Child;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, warn};

use crate::acp::jsonrpc::{JsonRpcConnection, Notification};
use crate::acp::protocol::{
    self, ContentBlock, McpServer, NewSessionResponse, PromptResponse, SessionNotification,
    SessionUpdate,
};
use crate::acp::{AgentTransport, RunnerError, StopReason};

pub struct AcpTransport {
    conn: JsonRpcConnection,
    updates: Mutex<mpsc::UnboundedReceiver<Notification>>,
    child: Mutex<Option<Child>>,
}

impl std::fmt::Debug for AcpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcpTransport")
            .field("conn", &self.conn)
            .finish_non_exhaustive()
    }
}

impl AcpTransport {
    /// Wrap a byte stream to an agent. `child`, when given, is killed on close.
    pub fn connect<R, W>(reader: R, writer: W, child: Option<Child>) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (conn, updates) =
            JsonRpcConnection::new(reader, writer, Arc::new(protocol::answer_agent_request));
        Self {
            conn,
            updates: Mutex::new(updates),
            child: Mutex::new(child),
        }
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T, RunnerError> {
        let value = self.conn.request(method, params).await?;
        serde_json::from_value(value).map_err(|err| RunnerError::Protocol {
            code: protocol::PARSE_ERROR,
            message: format!("decode {method} response: {err}"),
        })
    }
}

fn forward(session_id: &str, note: Notification, on_update: &(dyn Fn(SessionUpdate) + Send + Sync)) {
    if note.method != protocol::METHOD_SESSION_UPDATE {
        debug!(method = %note.method, "ignoring notification");
        return;
    }
    match serde_json::from_value::<SessionNotification>(note.params) {
        Ok(notification) if notification.session_id == session_id => on_update(notification.update),
        Ok(notification) => {
            debug!(session_id = %notification.session_id, "dropping update for another session");
        }
        Err(err) => warn!(err = %err, "undecodable session update"),
    }
}

#[async_trait]
impl AgentTransport for AcpTransport {
    async fn initialize(&self) -> Result<(), RunnerError> {
        let response: Value = self
            .call(protocol::METHOD_INITIALIZE, protocol::initialize_params())
            .await?;
        debug!(
            protocol_version = ?response.get("protocolVersion"),
            "agent initialized"
        );
        Ok(())
    }

    async fn new_session(
        &self,
        cwd: &Path,
        mcp_servers: &[McpServer],
    ) -> Result<String, RunnerError> {
        let servers: Vec<Value> = mcp_servers.iter().map(McpServer::to_wire).collect();
        let response: NewSessionResponse = self
            .call(
                protocol::METHOD_SESSION_NEW,
                json!({ "cwd": cwd.display().to_string(), "mcpServers": servers }),
            )
            .await?;
        Ok(response.session_id)
    }

    async fn set_model(&self, session_id: &str, model: &str) -> Result<(), RunnerError> {
        let _: Value = self
            .call(
                protocol::METHOD_SESSION_SET_MODEL,
                json!({ "sessionId": session_id, "modelId": model }),
            )
            .await?;
        Ok(())
    }

    async fn prompt(
        &self,
        session_id: &str,
        blocks: Vec<ContentBlock>,
        on_update: &(dyn Fn(SessionUpdate) + Send + Sync),
    ) -> Result<StopReason, RunnerError> {
        let mut updates = self.updates.lock().await;
        // Anything queued now belongs to an earlier prompt.
        while let Ok(stale) = updates.try_recv() {
            debug!(method = %stale.method, "discarding stale notification");
        }

        let response = self.call::<PromptResponse>(
            protocol::METHOD_SESSION_PROMPT,
            json!({ "sessionId": session_id, "prompt": blocks }),
        );
        tokio::pin!(response);

        let result = loop {
            tokio::select! {
                biased;
                Some(note) = updates.recv() => forward(session_id, note, on_update),
                result = &mut response => break result,
            }
        };
        // Updates written before the response are already queued.
        while let Ok(note) = updates.try_recv() {
            forward(session_id, note, on_update);
        }
        Ok(StopReason::from_wire(&result?.stop_reason))
    }

    async fn cancel(&self, session_id: &str) -> Result<(), RunnerError> {
        self.conn
            .notify(
                protocol::METHOD_SESSION_CANCEL,
                json!({ "sessionId": session_id }),
            )
            .await
    }

    async fn close(&self) {
        self.conn.shutdown();
        let mut child = self.child.lock().await;
        if let Some(mut child) = child.take() {
            if let Err(err) = child.kill().await {
                warn!(err = %err, "failed to kill agent process");
            } else {
                debug!("agent process stopped");
            }
        }
    }
}
