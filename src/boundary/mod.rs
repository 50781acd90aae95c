//! BoundaryAPI (C10) — a single TCP port serving both a JSON-RPC 2.0
//! WebSocket endpoint and a plain `GET /health` check (§4.6).
//!
//! Grounded directly on `clawd`'s `ipc/mod.rs`: the 12-byte peek that
//! distinguishes a health check from a WebSocket upgrade before committing
//! to either, the per-IP/per-connection sliding/tumbling-window rate
//! limiters, and the constant-time `daemon.auth` bearer-token challenge.

mod dispatch;

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Instant;

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::{accept_async_with_config, tungstenite::Message};
use tracing::{debug, error, info, trace, warn};

use crate::AppContext;

const MAX_CONNECTIONS_PER_MIN: usize = 10;
const MAX_RPC_PER_SEC: u32 = 100;
const OUTBOUND_QUEUE_CAPACITY: usize = 256;

struct ConnectionRateLimiter {
    connections: HashMap<IpAddr, Vec<Instant>>,
}

impl ConnectionRateLimiter {
    fn new() -> Self {
        Self { connections: HashMap::new() }
    }

    fn check_and_record(&mut self, ip: IpAddr) -> bool {
        let now = Instant::now();
        let one_min_ago = now - std::time::Duration::from_secs(60);
        let timestamps = self.connections.entry(ip).or_default();
        timestamps.retain(|t| *t > one_min_ago);
        if timestamps.len() >= MAX_CONNECTIONS_PER_MIN {
            return false;
        }
        timestamps.push(now);
        true
    }
}

/// Per-connection tumbling-window RPC rate limiter (one counter reset per
/// wall-clock second), distinct from a token bucket.
struct RpcRateLimiter {
    count: u32,
    window_start: Instant,
}

impl RpcRateLimiter {
    fn new() -> Self {
        Self { count: 0, window_start: Instant::now() }
    }

    fn check(&mut self) -> bool {
        let now = Instant::now();
        if now.duration_since(self.window_start).as_secs() >= 1 {
            self.count = 0;
            self.window_start = now;
        }
        self.count += 1;
        self.count <= MAX_RPC_PER_SEC
    }
}

/// Constant-time token comparison, defeating a timing oracle on the bearer
/// token (§4.6).
fn tokens_equal(a: &str, b: &str) -> bool {
    let a = a.as_bytes();
    let b = b.as_bytes();
    if a.len() != b.len() {
        return false;
    }
    let mut result: u8 = 0;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }
    result == 0
}

#[derive(Deserialize)]
struct RpcRequest {
    jsonrpc: String,
    id: Option<Value>,
    method: String,
    params: Option<Value>,
}

#[derive(Serialize)]
struct RpcResponse {
    jsonrpc: &'static str,
    id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<RpcError>,
}

#[derive(Serialize)]
struct RpcError {
    code: i32,
    message: String,
}

fn error_response(id: Value, code: i32, message: &str) -> String {
    let resp = RpcResponse { jsonrpc: "2.0", id, result: None, error: Some(RpcError { code, message: message.to_string() }) };
    serde_json::to_string(&resp).unwrap_or_default()
}

/// Run the BoundaryAPI to completion (until a shutdown signal arrives).
pub async fn run(ctx: Arc<AppContext>) -> anyhow::Result<()> {
    let listener = TcpListener::bind(&ctx.config.bind_addr).await?;
    info!(addr = %ctx.config.bind_addr, "BoundaryAPI listening (WebSocket + HTTP health on shared port)");

    let conn_limiter = Arc::new(Mutex::new(ConnectionRateLimiter::new()));
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            biased;

            _ = &mut shutdown => {
                info!("shutdown signal received");
                break;
            }

            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(c) => c,
                    Err(e) => {
                        error!(err = %e, "accept error");
                        continue;
                    }
                };

                {
                    let mut limiter = conn_limiter.lock().await;
                    if !limiter.check_and_record(peer.ip()) {
                        warn!(peer = %peer, "connection rate limit exceeded, rejecting");
                        drop(stream);
                        continue;
                    }
                }

                debug!(peer = %peer, "new connection");
                let ctx = Arc::clone(&ctx);
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, ctx).await {
                        warn!(peer = %peer, err = %e, "connection error");
                    }
                });
            }
        }
    }

    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to register SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.ok();
    }
}

/// Peek 12 bytes to tell `GET /health ` apart from everything else
/// (including a WebSocket upgrade, which also begins with `GET `).
async fn handle_connection(stream: TcpStream, ctx: Arc<AppContext>) -> anyhow::Result<()> {
    let mut peek_buf = [0u8; 12];
    let n = stream.peek(&mut peek_buf).await.unwrap_or(0);
    if n >= 12 && &peek_buf[..12] == b"GET /health " {
        return handle_health_check(stream, &ctx).await;
    }

    let ws_config = WebSocketConfig { max_message_size: Some(16 * 1024 * 1024), max_frame_size: Some(4 * 1024 * 1024), ..Default::default() };
    let ws = accept_async_with_config(stream, Some(ws_config)).await?;
    let (mut sink, mut ws_stream) = ws.split();

    let mut client_token = String::new();
    if !ctx.config.auth_token.is_empty() {
        let first = tokio::time::timeout(std::time::Duration::from_secs(10), ws_stream.next()).await;
        let text = match first {
            Ok(Some(Ok(Message::Text(t)))) => t,
            _ => return Ok(()),
        };

        let req: RpcRequest = match serde_json::from_str(&text) {
            Ok(r) => r,
            Err(_) => {
                let _ = sink.send(Message::Text(error_response(Value::Null, dispatch::PARSE_ERROR, "Parse error"))).await;
                return Ok(());
            }
        };
        let id = req.id.clone().unwrap_or(Value::Null);

        if req.method != "daemon.auth" {
            let _ = sink.send(Message::Text(error_response(id, dispatch::UNAUTHORIZED, "Unauthorized — send daemon.auth first"))).await;
            return Ok(());
        }

        let provided = req.params.as_ref().and_then(|p| p.get("token")).and_then(Value::as_str).unwrap_or_default();
        if !tokens_equal(provided, &ctx.config.auth_token) {
            let _ = sink.send(Message::Text(error_response(id, dispatch::UNAUTHORIZED, "Unauthorized — invalid token"))).await;
            return Ok(());
        }

        client_token = provided.to_string();
        let resp = serde_json::json!({ "jsonrpc": "2.0", "id": id, "result": { "authenticated": true } });
        let _ = sink.send(Message::Text(resp.to_string())).await;
        debug!("client authenticated");
    }

    let (outbound_tx, mut outbound_rx) = mpsc::channel::<String>(OUTBOUND_QUEUE_CAPACITY);
    let mut rpc_limiter = RpcRateLimiter::new();

    loop {
        tokio::select! {
            msg = ws_stream.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if !rpc_limiter.check() {
                            let resp = error_response(Value::Null, -32003, "RPC rate limit exceeded");
                            if sink.send(Message::Text(resp)).await.is_err() {
                                break;
                            }
                            continue;
                        }
                        let response = dispatch_text(&text, &ctx, &client_token, &outbound_tx).await;
                        if sink.send(Message::Text(response)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = sink.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        warn!(err = %e, "ws error");
                        break;
                    }
                    _ => {}
                }
            }
            notification = outbound_rx.recv() => {
                match notification {
                    Some(json) => {
                        if sink.send(Message::Text(json)).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
        }
    }

    Ok(())
}

async fn handle_health_check(stream: TcpStream, ctx: &AppContext) -> anyhow::Result<()> {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    let mut stream = stream;

    let mut req_buf = [0u8; 256];
    let _ = stream.read(&mut req_buf).await;

    let uptime_secs = ctx.started_at.elapsed().as_secs();
    let body = serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime": uptime_secs,
    });
    let body_str = body.to_string();
    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body_str.len(),
        body_str
    );
    stream.write_all(response.as_bytes()).await?;
    Ok(())
}

async fn dispatch_text(text: &str, ctx: &AppContext, client_token: &str, outbound: &mpsc::Sender<String>) -> String {
    let req: RpcRequest = match serde_json::from_str(text) {
        Ok(r) => r,
        Err(_) => return error_response(Value::Null, dispatch::PARSE_ERROR, "Parse error"),
    };

    if !ctx.config.auth_token.is_empty() && !tokens_equal(client_token, &ctx.config.auth_token) {
        return error_response(req.id.unwrap_or(Value::Null), dispatch::UNAUTHORIZED, "Unauthorized — invalid or missing token");
    }
    if req.jsonrpc != "2.0" {
        return error_response(req.id.unwrap_or(Value::Null), dispatch::INVALID_REQUEST, "Invalid Request");
    }

    let id = req.id.unwrap_or(Value::Null);
    let params = req.params.unwrap_or(Value::Null);
    trace!(method = %req.method, "rpc dispatch");

    match dispatch::dispatch(&req.method, params, ctx, outbound).await {
        Ok(value) => serde_json::to_string(&RpcResponse { jsonrpc: "2.0", id, result: Some(value), error: None }).unwrap_or_default(),
        Err(e) => {
            let (code, msg) = dispatch::classify_error(&e);
            error_response(id, code, &msg)
        }
    }
}
