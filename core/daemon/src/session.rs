//! Editor session entity.
//!
//! A session is one continuous span of focus on a file. It is opened by a
//! buffer-enter (or synthesized from a liveness beat), accumulates beats, and
//! is closed exactly once. Only closed sessions that pass validation are
//! converted into [`SessionRecord`]s for persistence.

use digitme_protocol::{BufferInfo, SessionRecord};
use once_cell::sync::Lazy;
use regex::Regex;

pub const IDLE_TIMEOUT_MS: i64 = 60_000;
pub const DEFAULT_PROJECT: &str = "na";
pub const UNKNOWN_FIELD: &str = "unknown";

// File-tree panels and similar editor-internal buffers.
static PSEUDO_BUFFER: Lazy<Regex> = Lazy::new(|| Regex::new(r"NERD_tree").expect("valid regex"));

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("Invalid session argument: {0}")]
    InvalidArgument(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub index: u64,
    pub filename: String,
    pub filetype: String,
    pub project: String,
    pub start: i64,
    pub end: Option<i64>,
    pub last_tick: i64,
    pub ticks: u64,
    pub marked: bool,
    idle_timeout_ms: i64,
}

impl Session {
    pub fn create(
        index: u64,
        filename: Option<&str>,
        filetype: Option<&str>,
        project: Option<&str>,
        ts: i64,
    ) -> Result<Self, SessionError> {
        let filename = filename
            .ok_or_else(|| SessionError::InvalidArgument("filename is required".to_string()))?;
        let filetype = filetype
            .ok_or_else(|| SessionError::InvalidArgument("filetype is required".to_string()))?;
        let project = project
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .unwrap_or(DEFAULT_PROJECT);

        Ok(Self {
            index,
            filename: filename.to_string(),
            filetype: filetype.to_string(),
            project: project.to_string(),
            start: ts,
            end: None,
            last_tick: ts,
            ticks: 0,
            marked: false,
            idle_timeout_ms: IDLE_TIMEOUT_MS,
        })
    }

    /// A placeholder for a session whose buffer is unknown (e.g. after a daemon restart).
    pub fn synthetic(index: u64, ts: i64) -> Self {
        Self {
            index,
            filename: String::new(),
            filetype: String::new(),
            project: DEFAULT_PROJECT.to_string(),
            start: ts,
            end: None,
            last_tick: ts,
            ticks: 0,
            marked: true,
            idle_timeout_ms: IDLE_TIMEOUT_MS,
        }
    }

    pub fn with_idle_timeout(mut self, idle_timeout_ms: i64) -> Self {
        self.idle_timeout_ms = idle_timeout_ms;
        self
    }

    pub fn is_expired(&self, ts: i64) -> bool {
        ts.saturating_sub(self.last_tick) > self.idle_timeout_ms
    }

    pub fn is_closed(&self) -> bool {
        self.end.is_some()
    }

    pub fn beat(&mut self, ts: i64) {
        self.last_tick = ts;
        self.ticks += 1;
    }

    /// Closes the session. A second close is a no-op.
    ///
    /// Marked sessions take their identity from `info`, falling back to
    /// `"unknown"`. Idle time past the timeout is never counted: an expired
    /// session ends at `last_tick + idle_timeout`.
    pub fn close(&mut self, ts: i64, info: Option<&BufferInfo>) {
        if self.is_closed() {
            return;
        }

        if self.marked {
            let patch = |value: Option<&String>| {
                value
                    .map(|candidate| candidate.trim())
                    .filter(|candidate| !candidate.is_empty())
                    .unwrap_or(UNKNOWN_FIELD)
                    .to_string()
            };
            self.filename = patch(info.and_then(|info| info.filename.as_ref()));
            self.filetype = patch(info.and_then(|info| info.filetype.as_ref()));
        }

        self.end = Some(if self.is_expired(ts) {
            self.last_tick.saturating_add(self.idle_timeout_ms)
        } else {
            ts
        });
    }

    pub fn validate(&self) -> bool {
        if self.ticks == 0 {
            return false;
        }
        if self.filename.is_empty() || self.filetype.is_empty() {
            return false;
        }
        !PSEUDO_BUFFER.is_match(&self.filename)
    }

    /// Wire form, available only once the session is closed and valid.
    pub fn to_record(&self) -> Option<SessionRecord> {
        let end = self.end?;
        if !self.validate() {
            return None;
        }
        Some(SessionRecord {
            filename: self.filename.clone(),
            filetype: self.filetype.clone(),
            project: self.project.clone(),
            start: self.start,
            end,
            last_tick: self.last_tick,
            ticks: self.ticks,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open(ts: i64) -> Session {
        Session::create(1, Some("a.py"), Some("python"), None, ts).expect("create")
    }

    #[test]
    fn create_requires_filename_and_filetype() {
        assert!(matches!(
            Session::create(1, None, Some("python"), None, 0),
            Err(SessionError::InvalidArgument(_))
        ));
        assert!(matches!(
            Session::create(1, Some("a.py"), None, None, 0),
            Err(SessionError::InvalidArgument(_))
        ));
    }

    #[test]
    fn project_defaults_to_na() {
        assert_eq!(open(0).project, DEFAULT_PROJECT);
        let session =
            Session::create(1, Some("a.py"), Some("python"), Some("digitme"), 0).expect("create");
        assert_eq!(session.project, "digitme");
    }

    #[test]
    fn expiry_is_strictly_after_timeout() {
        let session = open(1_000);
        assert!(!session.is_expired(1_000 + IDLE_TIMEOUT_MS));
        assert!(session.is_expired(1_000 + IDLE_TIMEOUT_MS + 1));
    }

    #[test]
    fn expiry_saturates_on_extreme_timestamps() {
        let session = open(1_000);
        assert!(!session.is_expired(i64::MIN));
        assert!(session.is_expired(i64::MAX));

        let mut late = open(i64::MAX - 10);
        late.beat(i64::MAX - 5);
        assert!(!late.is_expired(i64::MIN));
        late.close(i64::MAX, None);
        assert_eq!(late.end, Some(i64::MAX));
    }

    #[test]
    fn close_is_idempotent() {
        let mut session = open(0);
        session.beat(10);
        session.close(20, None);
        session.close(99, None);
        assert_eq!(session.end, Some(20));
    }

    #[test]
    fn close_backdates_expired_session() {
        let mut session = open(0);
        session.beat(5_000);
        session.close(5_000 + IDLE_TIMEOUT_MS + 1, None);
        assert_eq!(session.end, Some(5_000 + IDLE_TIMEOUT_MS));
    }

    #[test]
    fn marked_session_is_patched_at_close() {
        let mut session = Session::synthetic(2, 0);
        session.beat(1);
        let info = BufferInfo {
            filename: Some("b.rs".to_string()),
            filetype: Some("rust".to_string()),
            project: None,
        };
        session.close(2, Some(&info));
        assert_eq!(session.filename, "b.rs");
        assert_eq!(session.filetype, "rust");
    }

    #[test]
    fn marked_session_without_patch_becomes_unknown() {
        let mut session = Session::synthetic(2, 0);
        session.close(2, None);
        assert_eq!(session.filename, UNKNOWN_FIELD);
        assert_eq!(session.filetype, UNKNOWN_FIELD);
    }

    #[test]
    fn validation_rejects_pseudo_buffers_and_empty_sessions() {
        let mut nerd =
            Session::create(1, Some("NERD_tree_1"), Some("nerdtree"), None, 0).expect("create");
        nerd.beat(1);
        assert!(!nerd.validate());

        let untouched = open(0);
        assert!(!untouched.validate());

        let mut blank = Session::create(1, Some(""), Some("text"), None, 0).expect("create");
        blank.beat(1);
        assert!(!blank.validate());
    }

    #[test]
    fn record_requires_closed_valid_session() {
        let mut session = open(0);
        session.beat(10);
        assert!(session.to_record().is_none());

        session.close(30, None);
        let record = session.to_record().expect("record");
        assert_eq!(record.start, 0);
        assert_eq!(record.end, 30);
        assert_eq!(record.ticks, 1);
    }
}
