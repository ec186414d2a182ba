//! Focus-interval ("tomato") state machine.
//!
//! ```text
//! Idle    --start(name)--> Running
//! Running --pause-------> Paused
//! Paused  --resume------> Running
//! Running --abandon-----> Idle      (abandoned record)
//! Running --tick@tEnd---> Finished --> Idle   (finished record, finish push)
//! ```
//!
//! Every transition yields a `change` push so editors can resync their
//! countdown. The machine never reads the clock; callers pass `now`.

use digitme_protocol::{
    Push, TimerOutcome, TimerRecord, TimerSnapshot, TimerState, DEFAULT_TIMER_NAME,
};
use std::collections::BTreeMap;
use tracing::{debug, info};

pub const DEFAULT_INTERVAL_MS: i64 = 25 * 60 * 1000;

#[derive(Debug, thiserror::Error, Clone, Copy, PartialEq, Eq)]
pub enum TimerError {
    #[error("an interval is already active")]
    AlreadyRunning,
    #[error("no interval is running")]
    NotRunning,
    #[error("no interval is paused")]
    NotPaused,
    #[error("interval is not registered")]
    UnknownInterval,
}

impl TimerError {
    /// Token forwarded verbatim to the editor in `{ok: 1, err}` replies.
    pub fn token(&self) -> &'static str {
        match self {
            TimerError::AlreadyRunning => "already_running",
            TimerError::NotRunning => "not_running",
            TimerError::NotPaused => "not_paused",
            TimerError::UnknownInterval => "unknown_interval",
        }
    }
}

#[derive(Debug, Clone)]
struct ActiveInterval {
    name: String,
    duration: i64,
    started_at: i64,
    t_end: i64,
    remaining: i64,
}

pub struct TimerMachine {
    intervals: BTreeMap<String, i64>,
    state: TimerState,
    active: Option<ActiveInterval>,
    history: Vec<TimerRecord>,
}

impl Default for TimerMachine {
    fn default() -> Self {
        Self::new(DEFAULT_INTERVAL_MS)
    }
}

impl TimerMachine {
    /// Creates a machine with the `default` interval registered.
    pub fn new(default_duration_ms: i64) -> Self {
        let mut machine = Self {
            intervals: BTreeMap::new(),
            state: TimerState::Idle,
            active: None,
            history: Vec::new(),
        };
        machine.add(DEFAULT_TIMER_NAME, default_duration_ms);
        machine
    }

    pub fn add(&mut self, name: &str, duration_ms: i64) {
        self.intervals.insert(name.to_string(), duration_ms.max(1));
    }

    pub fn state(&self) -> TimerState {
        self.state
    }

    pub fn snapshot(&self) -> TimerSnapshot {
        let active = self.active.as_ref();
        TimerSnapshot {
            state: self.state,
            t_end: self.t_end(),
            remaining: match self.state {
                TimerState::Paused => active.map(|interval| interval.remaining),
                _ => None,
            },
            name: active.map(|interval| interval.name.clone()),
        }
    }

    fn t_end(&self) -> Option<i64> {
        match self.state {
            TimerState::Running => self.active.as_ref().map(|interval| interval.t_end),
            _ => None,
        }
    }

    fn change(&self) -> Push {
        Push::Change {
            state: self.state,
            t_end: self.t_end(),
        }
    }

    pub fn start(&mut self, name: &str, now: i64) -> Result<Vec<Push>, TimerError> {
        if self.state != TimerState::Idle {
            return Err(TimerError::AlreadyRunning);
        }
        let duration = *self
            .intervals
            .get(name)
            .ok_or(TimerError::UnknownInterval)?;

        self.active = Some(ActiveInterval {
            name: name.to_string(),
            duration,
            started_at: now,
            t_end: now + duration,
            remaining: duration,
        });
        self.state = TimerState::Running;
        info!(name, t_end = now + duration, "Timer started");
        Ok(vec![self.change()])
    }

    pub fn pause(&mut self, now: i64) -> Result<Vec<Push>, TimerError> {
        if self.state != TimerState::Running {
            return Err(TimerError::NotRunning);
        }
        if let Some(interval) = self.active.as_mut() {
            interval.remaining = (interval.t_end - now).max(0);
        }
        self.state = TimerState::Paused;
        debug!("Timer paused");
        Ok(vec![self.change()])
    }

    pub fn resume(&mut self, now: i64) -> Result<Vec<Push>, TimerError> {
        if self.state != TimerState::Paused {
            return Err(TimerError::NotPaused);
        }
        if let Some(interval) = self.active.as_mut() {
            interval.t_end = now + interval.remaining;
        }
        self.state = TimerState::Running;
        debug!("Timer resumed");
        Ok(vec![self.change()])
    }

    pub fn abandon(&mut self, now: i64) -> Result<Vec<Push>, TimerError> {
        if self.state != TimerState::Running {
            return Err(TimerError::NotRunning);
        }
        if let Some(interval) = self.active.take() {
            self.history.push(TimerRecord {
                name: interval.name,
                start: interval.started_at,
                end: now,
                duration: interval.duration,
                status: TimerOutcome::Abandoned,
            });
        }
        self.state = TimerState::Idle;
        info!("Timer abandoned");
        Ok(vec![self.change()])
    }

    /// Advances the clock; finishes the running interval once `tEnd` is reached.
    pub fn tick(&mut self, now: i64) -> Vec<Push> {
        let due = matches!(
            (self.state, self.active.as_ref()),
            (TimerState::Running, Some(interval)) if now >= interval.t_end
        );
        if !due {
            return Vec::new();
        }

        // Finished is transient: the record is written and the machine resets in one step.
        self.state = TimerState::Finished;
        if let Some(interval) = self.active.take() {
            info!(name = %interval.name, "Timer finished");
            self.history.push(TimerRecord {
                name: interval.name,
                start: interval.started_at,
                end: interval.t_end,
                duration: interval.duration,
                status: TimerOutcome::Finished,
            });
        }
        self.state = TimerState::Idle;
        vec![Push::Finish, self.change()]
    }

    pub fn pending(&self) -> usize {
        self.history.len()
    }

    pub fn drain_history(&mut self) -> Vec<TimerRecord> {
        std::mem::take(&mut self.history)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINUTE: i64 = 60_000;

    fn machine() -> TimerMachine {
        TimerMachine::new(25 * MINUTE)
    }

    #[test]
    fn start_sets_end_and_emits_change() {
        let mut timer = machine();
        let notices = timer.start(DEFAULT_TIMER_NAME, 1_000).expect("start");
        assert_eq!(
            notices,
            vec![Push::Change {
                state: TimerState::Running,
                t_end: Some(1_000 + 25 * MINUTE)
            }]
        );
        assert_eq!(timer.snapshot().t_end, Some(1_000 + 25 * MINUTE));
    }

    #[test]
    fn start_while_running_is_rejected_without_side_effects() {
        let mut timer = machine();
        timer.start(DEFAULT_TIMER_NAME, 0).expect("start");
        let before = timer.snapshot();

        assert_eq!(
            timer.start(DEFAULT_TIMER_NAME, 5_000),
            Err(TimerError::AlreadyRunning)
        );
        assert_eq!(timer.snapshot(), before);
    }

    #[test]
    fn start_while_paused_is_rejected() {
        let mut timer = machine();
        timer.start(DEFAULT_TIMER_NAME, 0).expect("start");
        timer.pause(10).expect("pause");
        assert_eq!(
            timer.start(DEFAULT_TIMER_NAME, 20),
            Err(TimerError::AlreadyRunning)
        );
    }

    #[test]
    fn illegal_transitions_report_tokens() {
        let mut timer = machine();
        assert_eq!(timer.pause(0), Err(TimerError::NotRunning));
        assert_eq!(timer.resume(0), Err(TimerError::NotPaused));
        assert_eq!(timer.abandon(0), Err(TimerError::NotRunning));
        assert_eq!(timer.start("lunch", 0), Err(TimerError::UnknownInterval));
        assert_eq!(TimerError::NotRunning.token(), "not_running");
        assert_eq!(timer.state(), TimerState::Idle);
    }

    #[test]
    fn pause_resume_preserves_remaining_time() {
        let mut timer = machine();
        timer.start(DEFAULT_TIMER_NAME, 0).expect("start");
        timer.pause(10 * MINUTE).expect("pause");
        let paused = timer.snapshot();
        assert_eq!(paused.state, TimerState::Paused);
        assert_eq!(paused.remaining, Some(15 * MINUTE));
        assert_eq!(paused.t_end, None);

        timer.resume(40 * MINUTE).expect("resume");
        assert_eq!(timer.snapshot().t_end, Some(55 * MINUTE));
    }

    #[test]
    fn full_cycle_records_one_finish() {
        let mut timer = machine();
        timer.start(DEFAULT_TIMER_NAME, 0).expect("start");
        timer.pause(5 * MINUTE).expect("pause");
        timer.resume(10 * MINUTE).expect("resume");

        assert!(timer.tick(20 * MINUTE).is_empty());
        let notices = timer.tick(30 * MINUTE);
        assert_eq!(
            notices
                .iter()
                .filter(|notice| **notice == Push::Finish)
                .count(),
            1
        );
        assert!(timer.tick(31 * MINUTE).is_empty());
        assert_eq!(timer.state(), TimerState::Idle);

        let history = timer.drain_history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, TimerOutcome::Finished);
        assert_eq!(history[0].end, 30 * MINUTE);
        assert!(timer.drain_history().is_empty());
    }

    #[test]
    fn paused_interval_never_finishes() {
        let mut timer = machine();
        timer.start(DEFAULT_TIMER_NAME, 0).expect("start");
        timer.pause(MINUTE).expect("pause");
        assert!(timer.tick(60 * MINUTE).is_empty());
        assert_eq!(timer.state(), TimerState::Paused);
    }

    #[test]
    fn abandon_records_abandoned_interval() {
        let mut timer = machine();
        timer.add("short", 5 * MINUTE);
        timer.start("short", 0).expect("start");
        let notices = timer.abandon(MINUTE).expect("abandon");
        assert_eq!(
            notices,
            vec![Push::Change {
                state: TimerState::Idle,
                t_end: None
            }]
        );

        let history = timer.drain_history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].name, "short");
        assert_eq!(history[0].status, TimerOutcome::Abandoned);
    }
}
