//! UDS control protocol (§6): a length-prefixed JSON request/response protocol used by operators
//! to inspect and reload a running proxy without restarting it.
//!
//! Wire format: 4-byte little-endian length prefix, then a UTF-8 JSON body. Bodies over 4 MiB are
//! rejected before the read buffer is allocated, so a malformed or hostile peer can't force an
//! unbounded allocation.

use crate::server::ProxyServer;

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tracing::warn;

const MAX_BODY_BYTES: u32 = 4 * 1024 * 1024;

#[derive(Debug, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
enum ControlRequest {
    Stats,
    Sessions,
    PolicyReload { #[allow(dead_code)] path: Option<String> },
}

/// The envelope every response takes: `{"ok": true, "payload": ...}` on success,
/// `{"ok": false, "error": "...", ...}` on failure.
#[derive(Debug, Serialize)]
struct ControlResponse {
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    payload: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    command: Option<String>,
}

impl ControlResponse {
    fn ok(payload: serde_json::Value) -> Self {
        Self {
            ok: true,
            payload: Some(payload),
            error: None,
            code: None,
            command: None,
        }
    }

    fn err(error: impl Into<String>) -> Self {
        Self {
            ok: false,
            payload: None,
            error: Some(error.into()),
            code: None,
            command: None,
        }
    }

    /// §6: `sessions` and `policy_reload` are reserved for future versions.
    fn not_implemented(command: &str) -> Self {
        Self {
            ok: false,
            payload: None,
            error: Some("not implemented".to_string()),
            code: Some(501),
            command: Some(command.to_string()),
        }
    }

    fn unknown_command(command: &str) -> Self {
        Self::err(format!("unknown command '{command}'"))
    }
}

/// Binds `socket_path`, removing a stale socket file left behind by an unclean prior exit, and
/// serves connections until the process exits. Each connection is handled on its own task; a
/// single malformed request closes only that connection.
pub async fn serve(socket_path: impl AsRef<Path>, server: Arc<ProxyServer>, policy_path: Option<String>) -> std::io::Result<()> {
    let path = socket_path.as_ref();
    if path.exists() {
        std::fs::remove_file(path)?;
    }
    let listener = UnixListener::bind(path)?;
    loop {
        let (stream, _) = listener.accept().await?;
        let server = Arc::clone(&server);
        let policy_path = policy_path.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, server, policy_path).await {
                warn!(error = %e, "control connection ended with an error");
            }
        });
    }
}

async fn handle_connection(
    mut stream: UnixStream,
    server: Arc<ProxyServer>,
    _policy_path: Option<String>,
) -> std::io::Result<()> {
    loop {
        let mut len_buf = [0u8; 4];
        if stream.read_exact(&mut len_buf).await.is_err() {
            return Ok(());
        }
        let len = u32::from_le_bytes(len_buf);
        if len > MAX_BODY_BYTES {
            let resp = ControlResponse::err("request body exceeds 4 MiB limit");
            write_response(&mut stream, &resp).await?;
            return Ok(());
        }

        let mut body = vec![0u8; len as usize];
        stream.read_exact(&mut body).await?;

        let response = match serde_json::from_slice::<serde_json::Value>(&body) {
            Ok(value) => {
                let command = value.get("command").and_then(|c| c.as_str());
                match command {
                    Some("stats") | Some("sessions") | Some("policy_reload") => {
                        match serde_json::from_value::<ControlRequest>(value) {
                            Ok(req) => dispatch(req, &server),
                            Err(e) => ControlResponse::err(format!("malformed request: {e}")),
                        }
                    }
                    Some(other) => ControlResponse::unknown_command(other),
                    None => ControlResponse::err("missing \"command\" field"),
                }
            }
            Err(e) => ControlResponse::err(format!("malformed request: {e}")),
        };
        write_response(&mut stream, &response).await?;
    }
}

/// §6: `stats` is implemented; `sessions` and `policy_reload` are reserved for future versions.
fn dispatch(req: ControlRequest, server: &ProxyServer) -> ControlResponse {
    match req {
        ControlRequest::Stats => {
            let snapshot = server.stats().snapshot();
            match serde_json::to_value(snapshot) {
                Ok(v) => ControlResponse::ok(v),
                Err(e) => ControlResponse::err(e.to_string()),
            }
        }
        ControlRequest::Sessions => ControlResponse::not_implemented("sessions"),
        ControlRequest::PolicyReload { .. } => ControlResponse::not_implemented("policy_reload"),
    }
}

async fn write_response(
    stream: &mut UnixStream,
    response: &ControlResponse,
) -> std::io::Result<()> {
    let body = serde_json::to_vec(response)?;
    stream.write_all(&(body.len() as u32).to_le_bytes()).await?;
    stream.write_all(&body).await?;
    stream.flush().await
}
