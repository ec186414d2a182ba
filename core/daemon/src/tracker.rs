//! Session lifecycle tracking.
//!
//! ```text
//! bufEnter             → close+stash current, open new session
//! ping (no current)    → synthetic marked session
//! ping (expired)       → close+stash current, open continuation (closed file)
//! ping                 → beat current
//! bufLeave             → close+stash current (anomaly if none)
//! ```

use digitme_protocol::{BufferInfo, SessionRecord};
use tracing::{debug, warn};

use crate::session::{Session, SessionError, IDLE_TIMEOUT_MS};

pub struct SessionTracker {
    current: Option<Session>,
    history: Vec<Session>,
    next_index: u64,
    idle_timeout_ms: i64,
}

impl Default for SessionTracker {
    fn default() -> Self {
        Self::new(IDLE_TIMEOUT_MS)
    }
}

impl SessionTracker {
    pub fn new(idle_timeout_ms: i64) -> Self {
        Self {
            current: None,
            history: Vec::new(),
            next_index: 0,
            idle_timeout_ms,
        }
    }

    pub fn current(&self) -> Option<&Session> {
        self.current.as_ref()
    }

    pub fn pending(&self) -> usize {
        self.history.len()
    }

    fn allocate_index(&mut self) -> u64 {
        self.next_index += 1;
        self.next_index
    }

    fn open(
        &mut self,
        filename: Option<&str>,
        filetype: Option<&str>,
        project: Option<&str>,
        ts: i64,
    ) -> Result<Session, SessionError> {
        let index = self.allocate_index();
        let session = Session::create(index, filename, filetype, project, ts)?
            .with_idle_timeout(self.idle_timeout_ms);
        debug!(
            index = session.index,
            filename = %session.filename,
            filetype = %session.filetype,
            "Session created"
        );
        Ok(session)
    }

    fn stash(&mut self, mut session: Session, ts: i64, info: Option<&BufferInfo>) {
        session.close(ts, info);
        debug!(
            index = session.index,
            filename = %session.filename,
            ticks = session.ticks,
            end = ?session.end,
            "Session stashed"
        );
        self.history.push(session);
    }

    pub fn on_liveness_beat(&mut self, ts: i64) {
        let Some(mut current) = self.current.take() else {
            let index = self.allocate_index();
            let session = Session::synthetic(index, ts).with_idle_timeout(self.idle_timeout_ms);
            debug!(index = session.index, "Marked session created");
            self.current = Some(session);
            return;
        };

        if current.is_expired(ts) {
            self.stash(current, ts, None);
            let Some(closed) = self.history.last() else {
                return;
            };
            let filename = closed.filename.clone();
            let filetype = closed.filetype.clone();
            let project = closed.project.clone();

            match self.open(Some(&filename), Some(&filetype), Some(&project), ts) {
                Ok(session) => self.current = Some(session),
                Err(err) => warn!(error = %err, "Failed to open continuation session"),
            }
            return;
        }

        current.beat(ts);
        self.current = Some(current);
    }

    pub fn on_buffer_enter(
        &mut self,
        ts: i64,
        filename: Option<&str>,
        filetype: Option<&str>,
        project: Option<&str>,
    ) -> Result<(), SessionError> {
        if let Some(current) = self.current.take() {
            self.stash(current, ts, None);
        }

        let session = self.open(filename, filetype, project, ts)?;
        self.current = Some(session);
        Ok(())
    }

    pub fn on_buffer_leave(&mut self, ts: i64, info: Option<&BufferInfo>) {
        match self.current.take() {
            Some(current) => self.stash(current, ts, info),
            None => warn!(ts, "Buffer leave received with no current session"),
        }
    }

    /// Returns and clears pending history, keeping only sessions fit for persistence.
    pub fn drain_history(&mut self) -> Vec<SessionRecord> {
        let drained = std::mem::take(&mut self.history);
        let total = drained.len();
        let records: Vec<SessionRecord> = drained.iter().filter_map(Session::to_record).collect();
        if records.len() < total {
            debug!(
                dropped = total - records.len(),
                kept = records.len(),
                "Invalid sessions filtered from history"
            );
        }
        records
    }
}
