//! In-memory approval backend for trying the sync client end to end.
//!
//! Run with: cargo run -p agent-sync-mock-server -- --token dev-token
//!
//! Serves the control protocol on `/ws` and the action ledger under `/api`.
//! Every request must carry `Authorization: Bearer <token>`. A synthetic
//! pending action is created every `--spawn-every` seconds.

use std::{
    collections::{HashMap, HashSet},
    net::SocketAddr,
    sync::Arc,
    time::Duration,
};

use agent_sync_core::{ActionId, ActionStatus, BatchItemResult, PendingAction};
use axum::{
    Json, Router,
    extract::{
        Path, Request, State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    http::{StatusCode, header::AUTHORIZATION},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use clap::Parser;
use futures::{SinkExt, StreamExt};
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::{broadcast, mpsc};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

const TOOLS: &[(&str, &str)] = &[
    ("bash", "cargo test --workspace"),
    ("edit", "Update src/main.rs"),
    ("bash", "rm -rf target/debug/incremental"),
    ("write", "Create CHANGELOG.md"),
];

#[derive(Parser, Debug)]
#[command(name = "agent-sync-mock-server", version, about)]
struct Args {
    /// Address to listen on.
    #[arg(long, default_value = "127.0.0.1:3000")]
    listen: SocketAddr,
    /// Bearer token clients must present.
    #[arg(long, env = "AGENT_SYNC_TOKEN", default_value = "dev-token")]
    token: String,
    /// Session synthetic actions are attributed to.
    #[arg(long, default_value = "demo")]
    session: String,
    /// Seconds between synthetic actions; 0 disables them.
    #[arg(long, default_value_t = 10)]
    spawn_every: u64,
}

#[derive(Default)]
struct Ledger {
    pending: IndexMap<ActionId, PendingAction>,
    /// Per-session event log; `seq` is the 1-based position.
    logs: HashMap<String, Vec<Value>>,
}

struct Backend {
    token: String,
    ledger: Mutex<Ledger>,
    events: broadcast::Sender<Value>,
}

impl Backend {
    fn new(token: String) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            token,
            ledger: Mutex::new(Ledger::default()),
            events,
        }
    }

    fn authorized(&self, header: Option<&str>) -> bool {
        header.and_then(|h| h.strip_prefix("Bearer ")) == Some(self.token.as_str())
    }

    /// Append a session event to its log and broadcast it.
    fn publish(&self, ledger: &mut Ledger, session_id: &str, mut event: Value) {
        let log = ledger.logs.entry(session_id.to_owned()).or_default();
        let seq = log
            .last()
            .and_then(|e| e.get("seq"))
            .and_then(Value::as_u64)
            .unwrap_or(0)
            + 1;
        if let Some(map) = event.as_object_mut() {
            map.insert("sessionId".to_owned(), json!(session_id));
            map.insert("seq".to_owned(), json!(seq));
        }
        log.push(event.clone());
        let _ = self.events.send(event);
    }

    fn create(&self, session_id: &str, tool_name: &str, description: &str) -> PendingAction {
        let action = PendingAction::new(Uuid::new_v4().to_string(), tool_name, description)
            .with_session(session_id);
        let mut ledger = self.ledger.lock();
        ledger.pending.insert(action.id.clone(), action.clone());
        self.publish(
            &mut ledger,
            session_id,
            json!({"type": "action_pending", "action": action}),
        );
        tracing::info!(action_id = %action.id, tool_name, "Action pending");
        action
    }

    /// Settle a pending action. Returns false if it is unknown or already settled.
    fn decide(&self, id: &ActionId, status: ActionStatus) -> bool {
        let mut ledger = self.ledger.lock();
        let Some(action) = ledger.pending.shift_remove(id) else {
            return false;
        };
        let session_id = action.session_id.unwrap_or_default();
        self.publish(
            &mut ledger,
            &session_id,
            json!({"type": "action_updated", "actionId": id, "status": status}),
        );
        tracing::info!(action_id = %id, %status, "Action settled");
        true
    }

    fn pending(&self) -> Vec<PendingAction> {
        self.ledger.lock().pending.values().cloned().collect()
    }

    fn replay(&self, session_id: &str, since_seq: u64) -> Vec<Value> {
        self.ledger
            .lock()
            .logs
            .get(session_id)
            .map(|log| {
                log.iter()
                    .filter(|e| e.get("seq").and_then(Value::as_u64) > Some(since_seq))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }
}

type AppState = Arc<Backend>;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=debug".into()),
        )
        .init();

    let args = Args::parse();
    let state: AppState = Arc::new(Backend::new(args.token));

    if args.spawn_every > 0 {
        tokio::spawn(spawn_actions(
            Arc::clone(&state),
            args.session,
            Duration::from_secs(args.spawn_every),
        ));
    }

    let app = Router::new()
        .route("/ws", get(ws_handler))
        .route("/api/actions", post(create_action))
        .route("/api/actions/pending", get(list_pending))
        .route("/api/actions/batch/approve", post(batch_approve))
        .route("/api/actions/batch/reject", post(batch_reject))
        .route("/api/actions/{id}/approve", post(approve))
        .route("/api/actions/{id}/reject", post(reject))
        .route_layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            require_bearer,
        ))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(args.listen).await?;
    tracing::info!("Mock backend listening on http://{}", args.listen);
    axum::serve(listener, app).await?;
    Ok(())
}

async fn spawn_actions(state: AppState, session_id: String, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    ticker.tick().await;
    for (tool_name, description) in TOOLS.iter().cycle() {
        ticker.tick().await;
        state.create(&session_id, tool_name, description);
    }
}

async fn require_bearer(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let header = req
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    if state.authorized(header) {
        next.run(req).await
    } else {
        tracing::warn!(path = %req.uri().path(), "Rejected unauthenticated request");
        StatusCode::UNAUTHORIZED.into_response()
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateBody {
    tool_name: String,
    #[serde(default)]
    description: String,
    #[serde(default = "default_session")]
    session_id: String,
}

fn default_session() -> String {
    "demo".to_owned()
}

#[derive(Deserialize)]
struct ReasonBody {
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Deserialize)]
struct BatchBody {
    ids: Vec<ActionId>,
    #[serde(default)]
    reason: Option<String>,
}

async fn create_action(
    State(state): State<AppState>,
    Json(body): Json<CreateBody>,
) -> impl IntoResponse {
    let action = state.create(&body.session_id, &body.tool_name, &body.description);
    (StatusCode::CREATED, Json(action))
}

async fn list_pending(State(state): State<AppState>) -> Json<Value> {
    Json(json!({"actions": state.pending()}))
}

async fn approve(State(state): State<AppState>, Path(id): Path<String>) -> StatusCode {
    let id = ActionId::from(id);
    if state.decide(&id, ActionStatus::Approved) {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    }
}

async fn reject(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<ReasonBody>,
) -> StatusCode {
    let id = ActionId::from(id);
    if let Some(reason) = &body.reason {
        tracing::info!(action_id = %id, reason, "Rejection reason");
    }
    if state.decide(&id, ActionStatus::Rejected) {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    }
}

fn settle_batch(state: &Backend, ids: Vec<ActionId>, status: ActionStatus) -> Vec<BatchItemResult> {
    ids.into_iter()
        .map(|id| {
            if state.decide(&id, status) {
                BatchItemResult::succeeded(id)
            } else {
                BatchItemResult::failed(id, "not pending")
            }
        })
        .collect()
}

async fn batch_approve(
    State(state): State<AppState>,
    Json(body): Json<BatchBody>,
) -> Json<Vec<BatchItemResult>> {
    Json(settle_batch(&state, body.ids, ActionStatus::Approved))
}

async fn batch_reject(
    State(state): State<AppState>,
    Json(body): Json<BatchBody>,
) -> Json<Vec<BatchItemResult>> {
    if let Some(reason) = &body.reason {
        tracing::info!(count = body.ids.len(), reason, "Batch rejection reason");
    }
    Json(settle_batch(&state, body.ids, ActionStatus::Rejected))
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let conn_id = Uuid::new_v4();
    let sessions: Arc<Mutex<HashSet<String>>> = Arc::default();

    let (tx, mut rx) = mpsc::unbounded_channel::<Value>();

    let send_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if ws_sender
                .send(Message::Text(frame.to_string().into()))
                .await
                .is_err()
            {
                break;
            }
        }
    });

    // Live events for the sessions this connection said hello to, plus
    // session-less ones.
    let mut events = state.events.subscribe();
    let live_tx = tx.clone();
    let live_sessions = Arc::clone(&sessions);
    let live_task = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    let wanted = event
                        .get("sessionId")
                        .and_then(Value::as_str)
                        .is_none_or(|sid| live_sessions.lock().contains(sid));
                    if wanted && live_tx.send(event).is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(%conn_id, skipped = n, "Connection lagged behind events");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    tracing::info!(%conn_id, "Control connection opened");

    while let Some(msg) = ws_receiver.next().await {
        let text = match msg {
            Ok(Message::Text(t)) => t,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                tracing::error!(%conn_id, "WebSocket error: {e}");
                break;
            }
        };

        let frame: Value = match serde_json::from_str(&text) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(%conn_id, "Invalid client frame: {e}");
                continue;
            }
        };

        match frame.get("type").and_then(Value::as_str) {
            Some("hello") => {
                let Some(session_id) = frame.get("sessionId").and_then(Value::as_str) else {
                    continue;
                };
                let since_seq = frame.get("sinceSeq").and_then(Value::as_u64).unwrap_or(0);
                // Subscribe before replaying: duplicates are harmless, gaps are not.
                sessions.lock().insert(session_id.to_owned());
                let missed = state.replay(session_id, since_seq);
                tracing::info!(%conn_id, session_id, since_seq, replayed = missed.len(), "Session resumed");
                for event in missed {
                    let _ = tx.send(event);
                }
                let _ = tx.send(json!({"type": "initial_sync", "actions": state.pending()}));
            }
            Some("ping") => {}
            Some(kind @ ("request" | "approval" | "question")) => {
                let Some(request_id) = frame.get("requestId").and_then(Value::as_str) else {
                    tracing::warn!(%conn_id, kind, "Command without requestId");
                    continue;
                };
                let reply = answer(&state, &tx, kind, request_id, &frame);
                let _ = tx.send(reply);
            }
            other => tracing::debug!(%conn_id, kind = ?other, "Ignoring frame"),
        }
    }

    live_task.abort();
    send_task.abort();
    tracing::info!(%conn_id, "Control connection closed");
}

/// Build the response for a correlated command, emitting progress on `tx`.
fn answer(
    state: &Backend,
    tx: &mpsc::UnboundedSender<Value>,
    kind: &str,
    request_id: &str,
    frame: &Value,
) -> Value {
    match kind {
        "approval" => {
            let Some(id) = frame.get("actionId").and_then(Value::as_str) else {
                return error_reply(request_id, "approval without actionId");
            };
            let approved = frame
                .get("approved")
                .and_then(Value::as_bool)
                .or_else(|| frame.get("decision").and_then(Value::as_str).map(|d| d == "approve"))
                .unwrap_or(false);
            let _ = tx.send(json!({"type": "approval_progress", "requestId": request_id, "stage": "applying"}));
            let status = if approved {
                ActionStatus::Approved
            } else {
                ActionStatus::Rejected
            };
            if state.decide(&ActionId::from(id), status) {
                json!({"type": "response", "requestId": request_id, "payload": {"actionId": id, "status": status}})
            } else {
                error_reply(request_id, &format!("action {id} is not pending"))
            }
        }
        "question" => json!({
            "type": "response",
            "requestId": request_id,
            "payload": {"answer": "acknowledged"}
        }),
        _ => match frame.get("method").and_then(Value::as_str) {
            Some("list_pending") => json!({
                "type": "response",
                "requestId": request_id,
                "payload": {"actions": state.pending()}
            }),
            _ => json!({"type": "response", "requestId": request_id, "payload": {"echo": frame}}),
        },
    }
}

fn error_reply(request_id: &str, message: &str) -> Value {
    json!({"type": "response", "requestId": request_id, "error": {"message": message}})
}
