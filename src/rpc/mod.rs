//! JSON-RPC 2.0 over a Unix-domain socket.
//!
//! Newline-delimited frames, one response per request, requests within a
//! connection dispatched concurrently. The socket is `0600`; a stale socket
//! left by a dead daemon is probed (200 ms connect) and unlinked, while a
//! live one aborts startup.

use crate::errors::HibossError;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;
pub const UNAUTHORIZED: i64 = -32001;
pub const NOT_FOUND: i64 = -32002;
pub const ALREADY_EXISTS: i64 = -32003;
pub const DELIVERY_FAILED: i64 = -32010;

const PROBE_TIMEOUT: Duration = Duration::from_millis(200);

/// Wire-level error: code, message, optional data payload.
#[derive(Debug, Clone, Serialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(METHOD_NOT_FOUND, format!("Method not found: {}", method))
    }

    pub fn invalid_params(detail: impl std::fmt::Display) -> Self {
        Self::new(INVALID_PARAMS, format!("Invalid params: {}", detail))
    }
}

impl From<HibossError> for RpcError {
    fn from(e: HibossError) -> Self {
        match &e {
            HibossError::Validation(_) => Self::new(INVALID_PARAMS, e.to_string()),
            HibossError::SetupRequired | HibossError::Unauthorized(_) => {
                Self::new(UNAUTHORIZED, e.to_string())
            }
            HibossError::NotFound { .. } => Self::new(NOT_FOUND, e.to_string()),
            HibossError::AmbiguousIdPrefix {
                entity,
                prefix,
                candidates,
            } => Self {
                code: NOT_FOUND,
                message: e.to_string(),
                data: Some(json!({
                    "kind": "ambiguous-id-prefix",
                    "entity": entity,
                    "prefix": prefix,
                    "matchCount": candidates.len(),
                    "candidates": candidates,
                })),
            },
            HibossError::Conflict(_) => Self::new(ALREADY_EXISTS, e.to_string()),
            HibossError::Delivery(failure) => Self {
                code: DELIVERY_FAILED,
                message: e.to_string(),
                data: Some(json!({
                    "reason": failure.kind.as_str(),
                    "detail": failure.detail,
                    "hint": failure.hint,
                })),
            },
            HibossError::Internal(_) => Self::new(INTERNAL_ERROR, e.to_string()),
        }
    }
}

/// Dispatches one method call. The daemon shell implements this.
#[async_trait::async_trait]
pub trait RpcHandler: Send + Sync {
    async fn handle(&self, method: &str, params: Value) -> Result<Value, RpcError>;
}

#[derive(Debug, Deserialize)]
struct RpcRequest {
    #[allow(dead_code)]
    jsonrpc: Option<String>,
    #[serde(default)]
    id: Value,
    method: Option<String>,
    #[serde(default)]
    params: Value,
}

fn response_ok(id: &Value, result: Value) -> String {
    json!({"jsonrpc": "2.0", "id": id, "result": result}).to_string()
}

fn response_err(id: &Value, error: &RpcError) -> String {
    json!({"jsonrpc": "2.0", "id": id, "error": error}).to_string()
}

pub struct RpcServer {
    socket_path: PathBuf,
}

impl RpcServer {
    pub fn new(socket_path: PathBuf) -> Self {
        Self { socket_path }
    }

    /// Bind the socket: probe a pre-existing file for a live daemon, unlink
    /// it when stale, then listen with `0600` permissions.
    pub async fn bind(&self) -> Result<UnixListener, HibossError> {
        if let Some(parent) = self.socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        if self.socket_path.exists() {
            let probe =
                tokio::time::timeout(PROBE_TIMEOUT, UnixStream::connect(&self.socket_path)).await;
            if matches!(probe, Ok(Ok(_))) {
                return Err(HibossError::Conflict("Daemon already running".to_string()));
            }
            debug!("removing stale socket {}", self.socket_path.display());
            std::fs::remove_file(&self.socket_path)?;
        }

        let listener = UnixListener::bind(&self.socket_path).map_err(|e| {
            HibossError::Internal(anyhow::anyhow!(
                "failed to bind socket {}: {}",
                self.socket_path.display(),
                e
            ))
        })?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&self.socket_path, std::fs::Permissions::from_mode(0o600))?;
        }

        info!("listening on {}", self.socket_path.display());
        Ok(listener)
    }

    /// Accept connections until `shutdown` flips. Each connection gets its
    /// own task; a connection error never affects its siblings.
    pub async fn serve(
        listener: UnixListener,
        handler: Arc<dyn RpcHandler>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, _addr)) => {
                        let handler = handler.clone();
                        tokio::spawn(async move {
                            handle_connection(stream, handler).await;
                        });
                    }
                    Err(e) => {
                        warn!("accept failed: {}", e);
                    }
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("rpc server stopped");
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }
}

async fn handle_connection(stream: UnixStream, handler: Arc<dyn RpcHandler>) {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    // One writer task serializes response frames from concurrent requests
    let (tx, mut rx) = mpsc::channel::<String>(64);
    let writer = tokio::spawn(async move {
        while let Some(mut frame) = rx.recv().await {
            frame.push('\n');
            if let Err(e) = write_half.write_all(frame.as_bytes()).await {
                debug!("connection write failed: {}", e);
                break;
            }
        }
    });

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                debug!("connection read failed: {}", e);
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let request: RpcRequest = match serde_json::from_str(&line) {
            Ok(req) => req,
            Err(e) => {
                let err = RpcError::new(PARSE_ERROR, format!("Parse error: {}", e));
                let _ = tx.send(response_err(&Value::Null, &err)).await;
                continue;
            }
        };
        let Some(method) = request.method else {
            let err = RpcError::new(INVALID_REQUEST, "Invalid request: missing method");
            let _ = tx.send(response_err(&request.id, &err)).await;
            continue;
        };

        let handler = handler.clone();
        let tx = tx.clone();
        tokio::spawn(async move {
            let frame = match handler.handle(&method, request.params).await {
                Ok(result) => response_ok(&request.id, result),
                Err(error) => response_err(&request.id, &error),
            };
            let _ = tx.send(frame).await;
        });
    }

    drop(tx);
    let _ = writer.await;
}
