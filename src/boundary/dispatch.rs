//! JSON-RPC 2.0 method table for the BoundaryAPI (§4.6, §6.3).

use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::warn;

use crate::index::{ListFilter, SessionIndexEntry};
use crate::session::{TurnRecord, TurnRole};
use crate::stream::CanonicalEvent;
use crate::AppContext;

pub(crate) const PARSE_ERROR: i32 = -32700;
pub(crate) const INVALID_REQUEST: i32 = -32600;
pub(crate) const METHOD_NOT_FOUND: i32 = -32601;
pub(crate) const INVALID_PARAMS: i32 = -32602;
#[allow(dead_code)]
pub(crate) const INTERNAL_ERROR: i32 = -32603;
pub(crate) const UNAUTHORIZED: i32 = -32004;
pub(crate) const SESSION_NOT_FOUND: i32 = -32001;

/// Method surface a connection may reach *after* completing `daemon.auth`
/// (handled separately, before the dispatch loop begins — §4.6).
pub(crate) async fn dispatch(method: &str, params: Value, ctx: &AppContext, outbound: &mpsc::Sender<String>) -> anyhow::Result<Value> {
    match method {
        "daemon.health" => Ok(json!({ "status": "ok", "uptime": ctx.started_at.elapsed().as_secs() })),
        "session.create" => session_create(params, ctx).await,
        "session.sendMessage" => session_send_message(params, ctx, outbound).await,
        "session.subscribe" => session_subscribe(params, ctx, outbound).await,
        "session.interrupt" => session_interrupt(params, ctx).await,
        "session.clear" => session_clear(params, ctx).await,
        "session.delete" => session_delete(params, ctx).await,
        "projects.list" => projects_list(params, ctx).await,
        "projects.sessions" => project_sessions(params, ctx).await,
        "session.load" => session_load(params, ctx).await,
        "conversations.listRecent" => list_recent_conversations(params, ctx).await,
        "index.rebuild" => {
            ctx.index.rebuild().await?;
            Ok(json!({ "success": true }))
        }
        "analytics.summary" => analytics(ctx).await,
        "approval.respond" => approval_respond(params, ctx).await,
        _ => Err(anyhow::anyhow!("METHOD_NOT_FOUND:{method}")),
    }
}

fn require_str<'a>(params: &'a Value, key: &str) -> anyhow::Result<&'a str> {
    params.get(key).and_then(Value::as_str).ok_or_else(|| anyhow::anyhow!("INVALID_PARAMS:missing '{key}'"))
}

async fn session_create(params: Value, ctx: &AppContext) -> anyhow::Result<Value> {
    let session_id = uuid::Uuid::new_v4().to_string();
    let cwd = params
        .get("cwd")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| std::env::current_dir().map(|p| p.display().to_string()).unwrap_or_default());
    let provider = params.get("provider").and_then(Value::as_str).unwrap_or("claude");
    let model = params.get("model").and_then(Value::as_str).unwrap_or("default");

    let _rx = ctx.broker.subscribe(&session_id, provider, model, &cwd).await;
    Ok(json!({ "sessionId": session_id, "cwd": cwd }))
}

async fn session_send_message(params: Value, ctx: &AppContext, outbound: &mpsc::Sender<String>) -> anyhow::Result<Value> {
    let session_id = require_str(&params, "sessionId")?.to_string();
    let content = require_str(&params, "content")?.to_string();
    let model = params.get("model").and_then(Value::as_str).unwrap_or("default").to_string();
    let provider = params.get("provider").and_then(Value::as_str).unwrap_or("claude").to_string();
    let cwd = params.get("cwd").and_then(Value::as_str).unwrap_or(".").to_string();

    spawn_forwarder(Arc::new(ctx_handles(ctx)), session_id.clone(), provider.clone(), outbound.clone());

    ctx.broker.submit_turn(&session_id, &provider, &model, &cwd, &content).await?;
    ctx.broker
        .record_turn(
            &session_id,
            TurnRole::User,
            TurnRecord {
                turn_id: uuid::Uuid::new_v4().to_string(),
                timestamp: chrono::Utc::now(),
                role: TurnRole::User,
                content: vec![crate::stream::ContentBlock::Text { text: content }],
                parent_tool_use_id: None,
                usage: None,
            },
        )
        .await;

    Ok(json!({ "accepted": true }))
}

async fn session_subscribe(params: Value, ctx: &AppContext, outbound: &mpsc::Sender<String>) -> anyhow::Result<Value> {
    let session_id = require_str(&params, "sessionId")?.to_string();
    let provider = params.get("provider").and_then(Value::as_str).unwrap_or("claude").to_string();
    spawn_forwarder(Arc::new(ctx_handles(ctx)), session_id, provider, outbound.clone());
    Ok(json!({ "subscribed": true }))
}

async fn session_interrupt(params: Value, ctx: &AppContext) -> anyhow::Result<Value> {
    let session_id = require_str(&params, "sessionId")?;
    ctx.broker.interrupt(session_id).await;
    Ok(json!({ "success": true }))
}

async fn session_clear(params: Value, ctx: &AppContext) -> anyhow::Result<Value> {
    let session_id = require_str(&params, "sessionId")?;
    ctx.broker.remove(session_id).await;
    Ok(json!({ "success": true }))
}

async fn session_delete(params: Value, ctx: &AppContext) -> anyhow::Result<Value> {
    let session_id = require_str(&params, "sessionId")?;
    let provider = params.get("provider").and_then(Value::as_str).unwrap_or("claude");
    ctx.broker.remove(session_id).await;
    ctx.persistence.delete_session(provider, session_id).await?;
    ctx.index.remove(session_id).await?;
    Ok(json!({ "success": true }))
}

async fn projects_list(params: Value, ctx: &AppContext) -> anyhow::Result<Value> {
    let limit = params.get("limit").and_then(Value::as_u64).map(|n| n as usize);
    let offset = params.get("offset").and_then(Value::as_u64).unwrap_or(0) as usize;
    let all = ctx.index.list(ListFilter { limit: None, offset: 0, ..Default::default() }).await;

    let mut projects: Vec<String> = all.into_iter().map(|e| e.project_path).collect();
    projects.sort();
    projects.dedup();
    let total = projects.len();
    let start = offset.min(total);
    let end = match limit {
        Some(l) => (start + l).min(total),
        None => total,
    };
    Ok(json!({ "projects": projects[start..end], "totalCount": total }))
}

async fn project_sessions(params: Value, ctx: &AppContext) -> anyhow::Result<Value> {
    let project_path = require_str(&params, "projectName")?.to_string();
    let limit = params.get("limit").and_then(Value::as_u64).map(|n| n as usize);
    let offset = params.get("offset").and_then(Value::as_u64).unwrap_or(0) as usize;

    let filter = ListFilter { project_path: Some(project_path), limit: limit.map(|l| l + 1), offset, ..Default::default() };
    let mut entries = ctx.index.list(filter).await;
    let has_more = limit.map(|l| entries.len() > l).unwrap_or(false);
    if has_more {
        entries.truncate(limit.unwrap());
    }
    Ok(json!({ "sessions": entries, "hasMore": has_more }))
}

async fn session_load(params: Value, ctx: &AppContext) -> anyhow::Result<Value> {
    let session_id = require_str(&params, "sessionId")?;
    let history = ctx.broker.history(session_id).await;
    if history.is_empty() {
        return Err(anyhow::anyhow!("SESSION_NOT_FOUND:{session_id}"));
    }
    Ok(json!({ "messages": history }))
}

async fn list_recent_conversations(params: Value, ctx: &AppContext) -> anyhow::Result<Value> {
    let provider = params.get("provider").and_then(Value::as_str).map(str::to_string);
    let project_path = params.get("project").and_then(Value::as_str).map(str::to_string);
    let limit = params.get("limit").and_then(Value::as_u64).map(|n| n as usize);
    let offset = params.get("offset").and_then(Value::as_u64).unwrap_or(0) as usize;

    let filter = ListFilter { provider, project_path, limit: limit.map(|l| l + 1), offset };
    let mut entries = ctx.index.list(filter).await;
    let has_more = limit.map(|l| entries.len() > l).unwrap_or(false);
    if has_more {
        entries.truncate(limit.unwrap());
    }
    let total_count = entries.len() + offset;
    Ok(json!({ "conversations": entries, "totalCount": total_count, "hasMore": has_more }))
}

/// The GUI client's response to a `tool_use` awaiting approval in
/// `interactive` permission mode — unblocks `ApprovalRouter::wait_for_decision`
/// inside the matching `ShimAgentLoop` turn.
async fn approval_respond(params: Value, ctx: &AppContext) -> anyhow::Result<Value> {
    let session_id = require_str(&params, "sessionId")?;
    let tool_use_id = require_str(&params, "toolUseId")?;
    let approve = params.get("approve").and_then(Value::as_bool).unwrap_or(false);

    let approval_id = ctx
        .approvals
        .find_pending_by_tool_use(session_id, tool_use_id)
        .await
        .ok_or_else(|| anyhow::anyhow!("SESSION_NOT_FOUND:no pending approval for tool use '{tool_use_id}'"))?;

    if approve {
        ctx.approvals.grant(&approval_id).await?;
    } else {
        ctx.approvals.deny(&approval_id).await?;
    }
    Ok(json!({ "success": true }))
}

async fn analytics(ctx: &AppContext) -> anyhow::Result<Value> {
    let all = ctx.index.list(ListFilter::default()).await;

    let mut by_provider = std::collections::HashMap::<String, u64>::new();
    let mut by_model = std::collections::HashMap::<String, u64>::new();
    let mut by_project = std::collections::HashMap::<String, u64>::new();
    let mut total_tokens = 0u64;
    let mut total_cost = 0.0f64;

    for entry in &all {
        *by_provider.entry(entry.provider.clone()).or_insert(0) += 1;
        *by_model.entry(entry.model.clone()).or_insert(0) += 1;
        *by_project.entry(entry.project_path.clone()).or_insert(0) += 1;
        total_tokens += entry.total_tokens.unwrap_or(0);
        total_cost += entry.total_cost.unwrap_or(0.0);
    }

    Ok(json!({
        "byProvider": by_provider,
        "byModel": by_model,
        "byProject": by_project,
        "totalSessions": all.len(),
        "totalTokens": total_tokens,
        "totalCostUsd": total_cost,
    }))
}

/// Small clone of the handles a forwarder task needs, so it doesn't have to
/// hold an `Arc<AppContext>` (the context itself isn't `Clone`).
struct ForwardHandles {
    broker: Arc<crate::session::SessionBroker>,
    persistence: Arc<crate::persistence::PersistenceStore>,
    index: Arc<crate::index::SessionIndex>,
}

fn ctx_handles(ctx: &AppContext) -> ForwardHandles {
    ForwardHandles { broker: Arc::clone(&ctx.broker), persistence: Arc::clone(&ctx.persistence), index: Arc::clone(&ctx.index) }
}

/// Subscribe to a session's canonical-event fan-out and forward every event
/// as a JSON-RPC notification on topic `message:{sessionId}`, appending each
/// event to the transcript log and updating the index on terminal events.
/// One of these is spawned per `sendMessage`/`subscribe` call; duplicate
/// subscriptions from the same connection simply run two independent
/// forwarders (harmless — both see the same broadcast stream).
fn spawn_forwarder(handles: Arc<ForwardHandles>, session_id: String, provider: String, outbound: mpsc::Sender<String>) {
    tokio::spawn(async move {
        let mut rx = handles.broker.subscribe(&session_id, &provider, "default", ".").await;
        let topic = format!("message:{session_id}");

        loop {
            match rx.recv().await {
                Ok(event) => {
                    handles.persistence.append_event(&provider, &session_id, &event).await;

                    let notification = json!({ "jsonrpc": "2.0", "method": topic, "params": event });
                    if outbound.send(notification.to_string()).await.is_err() {
                        break;
                    }

                    if event.is_terminal() {
                        sync_index_entry(&handles, &session_id, &provider).await;
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    warn!(session_id, skipped = n, "session forwarder lagged, disconnecting subscriber");
                    break;
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

async fn sync_index_entry(handles: &ForwardHandles, session_id: &str, provider: &str) {
    let history = handles.broker.history(session_id).await;
    let message_count = history.len() as u64;
    let title = history
        .iter()
        .find_map(|t| t.content.iter().find_map(|c| match c {
            crate::stream::ContentBlock::Text { text } => Some(text.chars().take(100).collect::<String>()),
            _ => None,
        }))
        .unwrap_or_default();

    let entry = SessionIndexEntry {
        session_id: session_id.to_string(),
        provider: provider.to_string(),
        model: "default".to_string(),
        model_display: "default".to_string(),
        title,
        summary: None,
        project_path: ".".to_string(),
        message_count,
        created: chrono::Utc::now(),
        updated: chrono::Utc::now(),
        file_path: String::new(),
        file_size: 0,
        claude_project_dir: None,
        compaction_count: None,
        total_tokens: None,
        total_cost: None,
    };
    if let Err(e) = handles.index.upsert(entry).await {
        warn!(session_id, error = %e, "failed to sync index entry after turn");
    }
}

/// Map an `anyhow::Error` produced by `dispatch` into an RPC error code,
/// following the corpus's structured-prefix convention.
pub(crate) fn classify_error(e: &anyhow::Error) -> (i32, String) {
    let msg = e.to_string();
    if let Some(rest) = msg.strip_prefix("METHOD_NOT_FOUND:") {
        return (METHOD_NOT_FOUND, format!("Method not found: {rest}"));
    }
    if let Some(rest) = msg.strip_prefix("INVALID_PARAMS:") {
        return (INVALID_PARAMS, rest.to_string());
    }
    if let Some(rest) = msg.strip_prefix("SESSION_NOT_FOUND:") {
        return (SESSION_NOT_FOUND, format!("Session not found: {rest}"));
    }

    let kind = crate::errors::classify_error_text(&msg);
    let code = match kind {
        crate::errors::ErrorKind::AuthMissing => UNAUTHORIZED,
        crate::errors::ErrorKind::SandboxViolation => INVALID_PARAMS,
        _ => INTERNAL_ERROR,
    };
    (code, crate::errors::sanitize_path_in_message(&msg))
}
