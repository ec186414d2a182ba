//! Store-and-forward routing between the remote store and the local buffer.
//!
//! [`RelayCoordinator`] is pure bookkeeping: it decides where each batch goes
//! and returns [`Effect`]s for the runtime to execute off the timeline. The
//! outcome of every effect comes back as a [`Completion`]. The IO halves of
//! those effects, [`deliver`] and [`replay_buffer`], live here too.

use std::collections::{HashSet, VecDeque};
use std::path::PathBuf;
use tracing::{debug, error, info, warn};

use crate::batch::PendingBatch;
use crate::buffer::{BufferEntry, BufferError, LocalBuffer};
use crate::remote::{RemoteError, RemoteStore};

pub const DEFAULT_OVERFLOW_CAP: usize = 256;

#[derive(Debug)]
pub enum Effect {
    Send(PendingBatch),
    Write(PendingBatch),
    Replay { quarantined: HashSet<PathBuf> },
}

/// The part of a batch the remote did not accept.
#[derive(Debug)]
pub struct Undelivered {
    pub batch: PendingBatch,
    pub error: RemoteError,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReplayReport {
    pub delivered: usize,
    pub rejected: usize,
    pub malformed: Vec<PathBuf>,
    /// Replay stopped early because the link or the buffer failed.
    pub failed: bool,
}

#[derive(Debug)]
pub enum Completion {
    Sent(Result<(), Undelivered>),
    Written {
        batch: PendingBatch,
        result: Result<PathBuf, BufferError>,
    },
    Replayed(ReplayReport),
}

pub struct RelayCoordinator {
    live: bool,
    replaying: bool,
    replay_again: bool,
    deferred: Vec<PendingBatch>,
    overflow: VecDeque<PendingBatch>,
    overflow_cap: usize,
    quarantined: HashSet<PathBuf>,
}

impl Default for RelayCoordinator {
    fn default() -> Self {
        Self::new(DEFAULT_OVERFLOW_CAP)
    }
}

impl RelayCoordinator {
    pub fn new(overflow_cap: usize) -> Self {
        Self {
            live: false,
            replaying: false,
            replay_again: false,
            deferred: Vec::new(),
            overflow: VecDeque::new(),
            overflow_cap: overflow_cap.max(1),
            quarantined: HashSet::new(),
        }
    }

    pub fn is_live(&self) -> bool {
        self.live
    }

    pub fn is_replaying(&self) -> bool {
        self.replaying
    }

    pub fn deferred_len(&self) -> usize {
        self.deferred.len()
    }

    pub fn overflow_len(&self) -> usize {
        self.overflow.len()
    }

    /// Periodic flush: retries the overflow queue, then routes the new batch.
    pub fn on_flush(&mut self, batch: Option<PendingBatch>) -> Vec<Effect> {
        let mut effects = Vec::new();
        while let Some(retry) = self.overflow.pop_front() {
            effects.extend(self.route(retry));
        }
        if let Some(batch) = batch {
            effects.extend(self.route(batch));
        }
        effects
    }

    pub fn route(&mut self, batch: PendingBatch) -> Option<Effect> {
        if !self.live {
            return Some(Effect::Write(batch));
        }
        if self.replaying {
            debug!(records = batch.len(), "Batch deferred until replay finishes");
            self.deferred.push(batch);
            return None;
        }
        Some(Effect::Send(batch))
    }

    pub fn on_link_up(&mut self) -> Vec<Effect> {
        let was_live = self.live;
        self.live = true;
        if self.replaying {
            if was_live {
                debug!("Duplicate link-up during replay ignored");
            } else {
                self.replay_again = true;
            }
            return Vec::new();
        }
        self.start_replay()
    }

    pub fn on_link_down(&mut self) -> Vec<Effect> {
        self.live = false;
        self.replay_again = false;
        self.deferred.drain(..).map(Effect::Write).collect()
    }

    pub fn on_completion(&mut self, completion: Completion) -> Vec<Effect> {
        match completion {
            Completion::Sent(Ok(())) => Vec::new(),
            Completion::Sent(Err(Undelivered { batch, error })) => {
                warn!(
                    error = %error,
                    records = batch.len(),
                    kind = batch.kind.suffix(),
                    "Remote save failed; buffering locally"
                );
                vec![Effect::Write(batch)]
            }
            Completion::Written { result: Ok(_), .. } => Vec::new(),
            Completion::Written {
                batch,
                result: Err(err),
            } => {
                warn!(error = %err, records = batch.len(), "Buffer write failed; holding batch in memory");
                self.push_overflow(batch);
                Vec::new()
            }
            Completion::Replayed(report) => self.finish_replay(report),
        }
    }

    /// Batches that never reached the remote or the buffer.
    pub fn take_unsent(&mut self) -> Vec<PendingBatch> {
        let mut unsent: Vec<PendingBatch> = self.deferred.drain(..).collect();
        unsent.extend(self.overflow.drain(..));
        unsent
    }

    fn start_replay(&mut self) -> Vec<Effect> {
        self.replaying = true;
        self.replay_again = false;
        vec![Effect::Replay {
            quarantined: self.quarantined.clone(),
        }]
    }

    fn finish_replay(&mut self, report: ReplayReport) -> Vec<Effect> {
        self.replaying = false;
        for path in &report.malformed {
            error!(path = %path.display(), "Quarantined malformed buffer entry");
        }
        self.quarantined.extend(report.malformed.iter().cloned());
        info!(
            delivered = report.delivered,
            rejected = report.rejected,
            malformed = report.malformed.len(),
            quarantined = self.quarantined.len(),
            failed = report.failed,
            "Buffer replay finished"
        );

        if !self.live {
            return self.deferred.drain(..).map(Effect::Write).collect();
        }
        if self.replay_again {
            return self.start_replay();
        }
        self.deferred.drain(..).map(Effect::Send).collect()
    }

    fn push_overflow(&mut self, batch: PendingBatch) {
        if self.overflow.len() >= self.overflow_cap {
            if let Some(dropped) = self.overflow.pop_front() {
                error!(
                    records = dropped.len(),
                    created_at = dropped.created_at,
                    cap = self.overflow_cap,
                    "Overflow queue full; dropping oldest batch"
                );
            }
        }
        self.overflow.push_back(batch);
    }
}

/// Sends both halves of a batch. On failure only the unaccepted half is
/// returned; a link failure on sessions skips the timer call.
pub async fn deliver(remote: &dyn RemoteStore, batch: PendingBatch) -> Result<(), Undelivered> {
    let sessions_result = if batch.sessions.is_empty() {
        Ok(())
    } else {
        remote.save_sessions(&batch.sessions).await
    };

    let timers_result = match &sessions_result {
        Err(err) if err.is_link_failure() => Err(RemoteError::Unavailable),
        _ if batch.timers.is_empty() => Ok(()),
        _ => remote.save_timers(&batch.timers).await,
    };

    match (sessions_result, timers_result) {
        (Ok(()), Ok(())) => Ok(()),
        (Err(error), Ok(())) => Err(Undelivered {
            batch: PendingBatch::sessions(batch.created_at, batch.sessions),
            error,
        }),
        (Ok(()), Err(error)) => Err(Undelivered {
            batch: PendingBatch::timers(batch.created_at, batch.timers),
            error,
        }),
        (Err(error), Err(_)) => Err(Undelivered { batch, error }),
    }
}

/// Returns a claimed entry to the buffer. A failure leaves it claimed until
/// the next startup recovery.
async fn restore_entry(buffer: &LocalBuffer, entry: &BufferEntry) -> bool {
    match buffer.restore(entry).await {
        Ok(()) => true,
        Err(err) => {
            warn!(error = %err, path = %entry.path.display(), "Failed to restore buffer entry");
            false
        }
    }
}

/// Forwards buffered entries oldest first, deleting each once accepted.
pub async fn replay_buffer(
    buffer: &LocalBuffer,
    remote: &dyn RemoteStore,
    quarantined: &HashSet<PathBuf>,
) -> ReplayReport {
    let mut report = ReplayReport::default();
    let entries = match buffer.list().await {
        Ok(entries) => entries,
        Err(err) => {
            warn!(error = %err, "Failed to list buffer entries");
            report.failed = true;
            return report;
        }
    };

    for entry in entries {
        if quarantined.contains(&entry.path) {
            continue;
        }
        if !remote.is_live() {
            report.failed = true;
            break;
        }

        let claimed = match buffer.claim(&entry).await {
            Ok(claimed) => claimed,
            Err(err) => {
                warn!(error = %err, path = %entry.path.display(), "Failed to claim buffer entry");
                continue;
            }
        };

        let batch = match buffer.read(&entry, &claimed).await {
            Ok(batch) => batch,
            Err(err) => {
                restore_entry(buffer, &entry).await;
                match err {
                    BufferError::Malformed { .. } => report.malformed.push(entry.path.clone()),
                    BufferError::Io { .. } => {
                        warn!(error = %err, path = %entry.path.display(), "Failed to read buffer entry");
                        report.failed = true;
                    }
                }
                continue;
            }
        };

        let records = batch.len();
        match deliver(remote, batch).await {
            Ok(()) => {
                report.delivered += 1;
                debug!(path = %entry.path.display(), records, "Replayed buffer entry");
                if let Err(err) = buffer.delete(&claimed).await {
                    warn!(error = %err, path = %entry.path.display(), "Failed to delete replayed entry");
                    restore_entry(buffer, &entry).await;
                }
            }
            Err(undelivered) => {
                restore_entry(buffer, &entry).await;
                if undelivered.error.is_link_failure() {
                    warn!(error = %undelivered.error, "Replay interrupted by link failure");
                    report.failed = true;
                    break;
                }
                warn!(error = %undelivered.error, path = %entry.path.display(), "Remote rejected buffered entry");
                report.rejected += 1;
            }
        }
    }

    report
}
