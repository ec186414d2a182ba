use digitme_protocol::{SessionRecord, TimerRecord};
use serde::{Deserialize, Serialize};

/// Which records a batch carries; also selects the buffer file suffix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BatchKind {
    Sessions,
    Timers,
    Combined,
}

impl BatchKind {
    pub fn suffix(&self) -> &'static str {
        match self {
            BatchKind::Sessions => "tmp_sessions",
            BatchKind::Timers => "tomato",
            BatchKind::Combined => "tmp",
        }
    }

    pub fn from_suffix(value: &str) -> Option<Self> {
        match value {
            "tmp_sessions" => Some(BatchKind::Sessions),
            "tomato" => Some(BatchKind::Timers),
            "tmp" => Some(BatchKind::Combined),
            _ => None,
        }
    }
}

/// Records pending delivery to the remote store.
///
/// Batches are moved, never mutated, once handed to the buffer or the remote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingBatch {
    pub kind: BatchKind,
    pub created_at: i64,
    pub sessions: Vec<SessionRecord>,
    pub timers: Vec<TimerRecord>,
}

#[derive(Serialize, Deserialize)]
struct CombinedPayload {
    ts: i64,
    #[serde(default)]
    history: Vec<SessionRecord>,
    #[serde(default)]
    tomatos: Vec<TimerRecord>,
}

impl PendingBatch {
    /// The periodic flush batch; `None` when there is nothing to send.
    pub fn combined(
        created_at: i64,
        sessions: Vec<SessionRecord>,
        timers: Vec<TimerRecord>,
    ) -> Option<Self> {
        let batch = Self {
            kind: BatchKind::Combined,
            created_at,
            sessions,
            timers,
        };
        (!batch.is_empty()).then_some(batch)
    }

    pub fn sessions(created_at: i64, sessions: Vec<SessionRecord>) -> Self {
        Self {
            kind: BatchKind::Sessions,
            created_at,
            sessions,
            timers: Vec::new(),
        }
    }

    pub fn timers(created_at: i64, timers: Vec<TimerRecord>) -> Self {
        Self {
            kind: BatchKind::Timers,
            created_at,
            sessions: Vec::new(),
            timers,
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len() + self.timers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty() && self.timers.is_empty()
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        match self.kind {
            BatchKind::Sessions => serde_json::to_string(&self.sessions),
            BatchKind::Timers => serde_json::to_string(&self.timers),
            BatchKind::Combined => serde_json::to_string(&CombinedPayload {
                ts: self.created_at,
                history: self.sessions.clone(),
                tomatos: self.timers.clone(),
            }),
        }
    }

    /// Rebuilds a batch from buffer file content. `created_at` comes from the
    /// file name except for combined batches, which carry their own `ts`.
    pub fn decode(kind: BatchKind, created_at: i64, content: &str) -> Result<Self, serde_json::Error> {
        match kind {
            BatchKind::Sessions => Ok(Self::sessions(created_at, serde_json::from_str(content)?)),
            BatchKind::Timers => Ok(Self::timers(created_at, serde_json::from_str(content)?)),
            BatchKind::Combined => {
                let payload: CombinedPayload = serde_json::from_str(content)?;
                Ok(Self {
                    kind: BatchKind::Combined,
                    created_at: payload.ts,
                    sessions: payload.history,
                    timers: payload.tomatos,
                })
            }
        }
    }
}
