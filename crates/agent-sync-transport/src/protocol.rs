//! Wire protocol for the control connection.
//!
//! Every frame is a JSON object with a `type` field. Correlated commands carry
//! a sender-assigned `requestId` that the server echoes; session-scoped events
//! carry `sessionId` and a monotonically increasing `seq`.

use agent_sync_core::{ActionId, ActionStatus, PendingAction, SyncError};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Frame type of the terminal reply to a correlated command.
pub const RESPONSE_TYPE: &str = "response";

/// Kind of correlated command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    /// A generic agent request (prompt, tool call, ...).
    Request,
    /// A decision on a pending action.
    Approval,
    /// An answer to an agent question.
    Question,
}

/// Message from client to server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Resume request: redeliver events with `seq > since_seq`.
    Hello {
        #[serde(rename = "sessionId")]
        session_id: String,
        #[serde(rename = "sinceSeq")]
        since_seq: u64,
    },
    /// Correlated generic request.
    Request {
        #[serde(rename = "requestId")]
        request_id: String,
        #[serde(flatten)]
        body: Map<String, Value>,
    },
    /// Correlated approval decision.
    Approval {
        #[serde(rename = "requestId")]
        request_id: String,
        #[serde(flatten)]
        body: Map<String, Value>,
    },
    /// Correlated answer to a question.
    Question {
        #[serde(rename = "requestId")]
        request_id: String,
        #[serde(flatten)]
        body: Map<String, Value>,
    },
    /// Keepalive, no reply expected.
    Ping,
}

/// A command awaiting a correlation id.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    /// Which frame type to send.
    pub kind: CommandKind,
    /// Fields sent next to `type` and `requestId`.
    pub body: Map<String, Value>,
}

impl Command {
    /// Build a command. A non-object body is wrapped as `{"payload": body}`;
    /// reserved keys (`type`, `requestId`) are dropped from object bodies.
    #[must_use]
    pub fn new(kind: CommandKind, body: Value) -> Self {
        let body = match body {
            Value::Object(mut map) => {
                map.remove("type");
                map.remove("requestId");
                map
            }
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("payload".to_owned(), other);
                map
            }
        };
        Self { kind, body }
    }

    #[must_use]
    pub fn request(body: Value) -> Self {
        Self::new(CommandKind::Request, body)
    }

    #[must_use]
    pub fn approval(body: Value) -> Self {
        Self::new(CommandKind::Approval, body)
    }

    #[must_use]
    pub fn question(body: Value) -> Self {
        Self::new(CommandKind::Question, body)
    }

    /// Tag the command with its correlation id.
    #[must_use]
    pub fn into_message(self, request_id: String) -> ClientMessage {
        let Self { kind, body } = self;
        match kind {
            CommandKind::Request => ClientMessage::Request { request_id, body },
            CommandKind::Approval => ClientMessage::Approval { request_id, body },
            CommandKind::Question => ClientMessage::Question { request_id, body },
        }
    }
}

#[derive(Deserialize)]
struct Header {
    #[serde(rename = "type")]
    kind: String,
    #[serde(rename = "requestId", default)]
    request_id: Option<String>,
    #[serde(rename = "sessionId", default)]
    session_id: Option<String>,
    #[serde(default)]
    seq: Option<u64>,
}

/// An inbound frame: the routing header plus the verbatim body.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    /// Value of the `type` field.
    pub kind: String,
    /// Correlation id, when the frame belongs to a request.
    pub request_id: Option<String>,
    /// Session scope; `None` for session-independent events.
    pub session_id: Option<String>,
    /// Per-session sequence number.
    pub seq: Option<u64>,
    /// The whole frame as received.
    pub body: Value,
}

impl Envelope {
    /// Parse a text frame.
    ///
    /// # Errors
    /// Returns `SyncError::Protocol` if the text is not a JSON object with a
    /// string `type`.
    pub fn parse(text: &str) -> Result<Self, SyncError> {
        let value: Value = serde_json::from_str(text)?;
        Self::from_value(value)
    }

    /// Build an envelope from an already-decoded frame.
    ///
    /// # Errors
    /// Returns `SyncError::Protocol` if the value lacks a string `type`.
    pub fn from_value(value: Value) -> Result<Self, SyncError> {
        if !value.is_object() {
            return Err(SyncError::protocol("frame is not a JSON object"));
        }
        let header = Header::deserialize(&value)?;
        Ok(Self {
            kind: header.kind,
            request_id: header.request_id,
            session_id: header.session_id,
            seq: header.seq,
            body: value,
        })
    }

    /// Whether this is the terminal reply to a command.
    #[must_use]
    pub fn is_response(&self) -> bool {
        self.kind == RESPONSE_TYPE
    }

    /// Look up a body field.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.body.get(key)
    }

    /// Outcome carried by a `response`: its `payload`, or `SyncError::Remote`
    /// when it carries an `error`.
    ///
    /// # Errors
    /// Returns `SyncError::Remote` with the server's message.
    pub fn response_outcome(&self) -> Result<Value, SyncError> {
        match self.body.get("error") {
            None | Some(Value::Null) => Ok(self.body.get("payload").cloned().unwrap_or(Value::Null)),
            Some(Value::String(message)) => Err(SyncError::Remote(message.clone())),
            Some(other) => Err(SyncError::Remote(
                other
                    .get("message")
                    .and_then(Value::as_str)
                    .map_or_else(|| other.to_string(), str::to_owned),
            )),
        }
    }
}

/// Action lifecycle event decoded from an envelope.
#[derive(Debug, Clone, PartialEq)]
pub enum ActionEvent {
    /// `action_pending` / `action_created`: an action reported as pending.
    Sighted(PendingAction),
    /// A status report for an action.
    Updated {
        id: ActionId,
        status: ActionStatus,
    },
    /// `initial_sync`: the authoritative pending list.
    InitialSync(Vec<PendingAction>),
}

impl ActionEvent {
    /// Decode an action event. Returns `None` for frames of other types.
    ///
    /// Accepted shapes:
    /// - `{"type":"action_pending","action":{...}}` (or the action fields inline)
    /// - `{"type":"action_updated","action":{"id":..,"status":..}}`
    /// - `{"type":"action_updated","actionId":..,"status":..}`
    /// - `{"type":"initial_sync","actions":[...]}`
    #[must_use]
    pub fn from_envelope(env: &Envelope) -> Option<Result<Self, SyncError>> {
        let event = match env.kind.as_str() {
            "action_pending" | "action_created" => decode_sighting(env),
            "action_updated" => decode_update(env),
            "initial_sync" => decode_initial_sync(env),
            _ => return None,
        };
        Some(event)
    }
}

fn action_value(env: &Envelope) -> &Value {
    env.get("action").unwrap_or(&env.body)
}

fn decode_action(value: &Value, env: &Envelope) -> Result<PendingAction, SyncError> {
    let mut action = PendingAction::deserialize(value)?;
    if action.session_id.is_none() {
        action.session_id.clone_from(&env.session_id);
    }
    Ok(action)
}

fn status_of(value: &Value) -> Result<Option<ActionStatus>, SyncError> {
    value
        .get("status")
        .map(|s| ActionStatus::deserialize(s).map_err(SyncError::from))
        .transpose()
}

fn decode_sighting(env: &Envelope) -> Result<ActionEvent, SyncError> {
    let value = action_value(env);
    let action = decode_action(value, env)?;
    match status_of(value)? {
        Some(status) if status.is_terminal() => Ok(ActionEvent::Updated {
            id: action.id,
            status,
        }),
        _ => Ok(ActionEvent::Sighted(action)),
    }
}

fn decode_update(env: &Envelope) -> Result<ActionEvent, SyncError> {
    let nested = env.get("action");
    let status = match nested.map(status_of).transpose()?.flatten() {
        Some(status) => status,
        None => status_of(&env.body)?
            .ok_or_else(|| SyncError::protocol("action_updated without status"))?,
    };

    if status == ActionStatus::Pending {
        // An update that still reports pending is just another sighting.
        return match nested {
            Some(value) => decode_action(value, env).map(ActionEvent::Sighted),
            None => Err(SyncError::protocol("pending action_updated without action")),
        };
    }

    let id = nested
        .and_then(|a| a.get("id"))
        .or_else(|| env.get("actionId"))
        .and_then(Value::as_str)
        .ok_or_else(|| SyncError::protocol("action_updated without action id"))?;
    Ok(ActionEvent::Updated {
        id: ActionId::new(id),
        status,
    })
}

fn decode_initial_sync(env: &Envelope) -> Result<ActionEvent, SyncError> {
    let Some(Value::Array(items)) = env.get("actions") else {
        return Err(SyncError::protocol("initial_sync without actions array"));
    };
    items
        .iter()
        .map(|item| decode_action(item, env))
        .collect::<Result<Vec<_>, _>>()
        .map(ActionEvent::InitialSync)
}
