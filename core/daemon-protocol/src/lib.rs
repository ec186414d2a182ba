//! Wire types and validation for the digitme daemon.
//!
//! This crate is shared by the daemon, its editor clients and the remote
//! aggregation service to prevent schema drift. Two protocols live here:
//!
//! - the editor channel: JSON lines of the form `[requestIndex, {event, ts, data}]`,
//!   answered with `[requestIndex, body]` and interleaved with `["ex", command]` pushes;
//! - the remote protocol: JSON lines tagged by `method` (requests) or `type`
//!   (responses), carrying session and timer records.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const PROTOCOL_VERSION: u32 = 1;
pub const MAX_REQUEST_BYTES: usize = 1024 * 1024; // 1MB
pub const DEFAULT_TIMER_NAME: &str = "default";

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
}

impl ErrorInfo {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Editor channel
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Deserialize)]
struct RawEditorMessage {
    event: String,
    #[serde(default)]
    ts: Option<i64>,
    #[serde(default)]
    data: Option<Value>,
}

/// Buffer identity carried by `bufEnter` and, optionally, `bufLeave`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferInfo {
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default)]
    pub filetype: Option<String>,
    #[serde(default)]
    pub project: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EditorEvent {
    Ping,
    BufEnter(BufferInfo),
    BufLeave(Option<BufferInfo>),
    TimerQuery,
    TimerStart { name: String },
    TimerPause,
    TimerResume,
    TimerAbandon,
}

impl EditorEvent {
    pub fn name(&self) -> &'static str {
        match self {
            EditorEvent::Ping => "ping",
            EditorEvent::BufEnter(_) => "bufEnter",
            EditorEvent::BufLeave(_) => "bufLeave",
            EditorEvent::TimerQuery => "timerQuery",
            EditorEvent::TimerStart { .. } => "timerStart",
            EditorEvent::TimerPause => "timerPause",
            EditorEvent::TimerResume => "timerResume",
            EditorEvent::TimerAbandon => "timerAbandon",
        }
    }

    /// Session events are fire-and-forget; timer queries and controls are answered.
    pub fn expects_reply(&self) -> bool {
        !matches!(
            self,
            EditorEvent::Ping | EditorEvent::BufEnter(_) | EditorEvent::BufLeave(_)
        )
    }
}

/// A decoded editor message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EditorRequest {
    pub index: u64,
    pub ts: i64,
    pub event: EditorEvent,
}

/// Decodes one editor line (`[index, {event, ts, data}]`).
pub fn parse_editor_line(line: &[u8]) -> Result<EditorRequest, ErrorInfo> {
    if line.len() > MAX_REQUEST_BYTES {
        return Err(ErrorInfo::new(
            "request_too_large",
            "request exceeded maximum size",
        ));
    }
    if line.iter().all(|b| b.is_ascii_whitespace()) {
        return Err(ErrorInfo::new("empty_request", "request body was empty"));
    }

    let (index, raw): (u64, RawEditorMessage) = serde_json::from_slice(line).map_err(|err| {
        ErrorInfo::new(
            "invalid_json",
            format!("request was not a valid [index, message] pair: {}", err),
        )
    })?;

    let ts = raw
        .ts
        .ok_or_else(|| ErrorInfo::new("missing_field", "ts is required"))?;
    let event = parse_editor_event(&raw.event, raw.data)?;

    Ok(EditorRequest { index, ts, event })
}

/// Maps an event name and its payload onto a typed [`EditorEvent`].
///
/// `tomato*` names from older editor plugins are accepted as aliases.
pub fn parse_editor_event(name: &str, data: Option<Value>) -> Result<EditorEvent, ErrorInfo> {
    let data = data.filter(|value| !value.is_null());

    match name {
        "ping" => Ok(EditorEvent::Ping),
        "bufEnter" => {
            let info = match data {
                Some(value) => parse_buffer_info(value)?,
                None => BufferInfo::default(),
            };
            Ok(EditorEvent::BufEnter(info))
        }
        "bufLeave" => {
            let info = data.map(parse_buffer_info).transpose()?;
            Ok(EditorEvent::BufLeave(info))
        }
        "timerQuery" | "tomatoQuery" => Ok(EditorEvent::TimerQuery),
        "timerStart" | "tomatoStart" => {
            let name = match data {
                Some(value) => optional_string(&value, "name")?,
                None => None,
            };
            Ok(EditorEvent::TimerStart {
                name: name.unwrap_or_else(|| DEFAULT_TIMER_NAME.to_string()),
            })
        }
        "timerPause" | "tomatoPause" => Ok(EditorEvent::TimerPause),
        "timerResume" | "tomatoResume" => Ok(EditorEvent::TimerResume),
        "timerAbandon" | "tomatoAbandon" => Ok(EditorEvent::TimerAbandon),
        other => Err(ErrorInfo::new(
            "unknown_event",
            format!("unsupported editor event: {}", other),
        )),
    }
}

fn parse_buffer_info(value: Value) -> Result<BufferInfo, ErrorInfo> {
    if !value.is_object() {
        return Err(ErrorInfo::new("invalid_params", "data must be an object"));
    }
    serde_json::from_value(value).map_err(|err| {
        ErrorInfo::new(
            "invalid_params",
            format!("buffer info is invalid: {}", err),
        )
    })
}

fn optional_string(value: &Value, field: &str) -> Result<Option<String>, ErrorInfo> {
    match value.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(candidate)) if candidate.trim().is_empty() => Ok(None),
        Some(Value::String(candidate)) => Ok(Some(candidate.clone())),
        Some(_) => Err(ErrorInfo::new(
            "invalid_params",
            format!("{} must be a string", field),
        )),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimerState {
    Idle,
    Running,
    Paused,
    Finished,
}

impl TimerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimerState::Idle => "idle",
            TimerState::Running => "running",
            TimerState::Paused => "paused",
            TimerState::Finished => "finished",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimerSnapshot {
    pub state: TimerState,
    pub t_end: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remaining: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// Control acknowledgement: `ok` is 0 on success and 1 on failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    pub ok: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub err: Option<String>,
}

impl Ack {
    pub fn success() -> Self {
        Self { ok: 0, err: None }
    }

    pub fn failure(token: impl Into<String>) -> Self {
        Self {
            ok: 1,
            err: Some(token.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EditorReply {
    Ack(Ack),
    Timer(TimerSnapshot),
}

pub fn encode_reply(index: u64, reply: &EditorReply) -> Result<String, serde_json::Error> {
    serde_json::to_string(&(index, reply))
}

/// Unsolicited notifications broadcast to every editor client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Push {
    Finish,
    Change {
        state: TimerState,
        t_end: Option<i64>,
    },
}

impl Push {
    /// The editor-side command carried by the push.
    pub fn command(&self) -> String {
        match self {
            Push::Finish => "call digitme#tomatoFinish()".to_string(),
            Push::Change { state, t_end } => format!(
                "call digitme#tomatoStateSync('{}', {})",
                state.as_str(),
                t_end.unwrap_or(0)
            ),
        }
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&("ex", self.command()))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Records
// ═══════════════════════════════════════════════════════════════════════════════

/// A closed, validated editor session as persisted downstream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub filename: String,
    pub filetype: String,
    pub project: String,
    pub start: i64,
    pub end: i64,
    pub last_tick: i64,
    pub ticks: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimerOutcome {
    Finished,
    Abandoned,
}

/// A focus interval that ran to completion or was abandoned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimerRecord {
    pub name: String,
    pub start: i64,
    pub end: i64,
    pub duration: i64,
    pub status: TimerOutcome,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Remote aggregation protocol
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum RemoteRequest {
    Hello {
        protocol_version: u32,
        client: String,
    },
    SaveSessions {
        records: Vec<SessionRecord>,
    },
    SaveTimers {
        records: Vec<TimerRecord>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveReply {
    pub status_code: i32,
    #[serde(default)]
    pub err_msg: String,
}

impl SaveReply {
    pub fn accepted() -> Self {
        Self {
            status_code: 0,
            err_msg: String::new(),
        }
    }

    pub fn is_accepted(&self) -> bool {
        self.status_code == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RemoteResponse {
    Welcome { protocol_version: u32 },
    Saved(SaveReply),
    Error(ErrorInfo),
}
