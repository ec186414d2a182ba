//! The daemon's single sequential timeline.
//!
//! Every mutation of session, timer and relay state happens inside
//! [`Runtime::run`]. Buffer and remote IO is spawned off the loop; each task
//! posts a [`Completion`] back through the input channel, so state is never
//! touched concurrently.

use digitme_protocol::{Ack, EditorEvent, EditorReply, EditorRequest, Push};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::batch::PendingBatch;
use crate::buffer::LocalBuffer;
use crate::relay::{self, Completion, Effect, RelayCoordinator};
use crate::remote::{LinkStatus, RemoteStore};
use crate::timer::{TimerError, TimerMachine};
use crate::tracker::SessionTracker;

const TIMER_TICK: Duration = Duration::from_secs(1);

pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[derive(Debug)]
pub enum Input {
    Editor {
        request: EditorRequest,
        reply: Option<oneshot::Sender<EditorReply>>,
    },
    Completion(Completion),
}

#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    pub flush_interval: Duration,
    pub idle_timeout_ms: i64,
    pub default_timer_ms: i64,
    pub timer_intervals: BTreeMap<String, i64>,
    pub overflow_cap: usize,
}

pub struct Runtime {
    tracker: SessionTracker,
    timer: TimerMachine,
    relay: RelayCoordinator,
    buffer: LocalBuffer,
    remote: Arc<dyn RemoteStore>,
    pushes: broadcast::Sender<Push>,
    inputs: mpsc::UnboundedSender<Input>,
    in_flight: usize,
    flush_interval: Duration,
    clock: Box<dyn Fn() -> i64 + Send>,
}

impl Runtime {
    pub fn new(
        options: &RuntimeOptions,
        buffer: LocalBuffer,
        remote: Arc<dyn RemoteStore>,
        pushes: broadcast::Sender<Push>,
        inputs: mpsc::UnboundedSender<Input>,
    ) -> Self {
        let mut timer = TimerMachine::new(options.default_timer_ms);
        for (name, duration_ms) in &options.timer_intervals {
            timer.add(name, *duration_ms);
        }

        Self {
            tracker: SessionTracker::new(options.idle_timeout_ms),
            timer,
            relay: RelayCoordinator::new(options.overflow_cap),
            buffer,
            remote,
            pushes,
            inputs,
            in_flight: 0,
            flush_interval: options.flush_interval,
            clock: Box::new(now_millis),
        }
    }

    #[cfg(test)]
    pub fn with_clock(mut self, clock: impl Fn() -> i64 + Send + 'static) -> Self {
        self.clock = Box::new(clock);
        self
    }

    fn now(&self) -> i64 {
        (self.clock)()
    }

    /// Drives the loop until `shutdown` resolves, then persists what is left.
    pub async fn run(
        mut self,
        mut inputs: mpsc::UnboundedReceiver<Input>,
        mut links: mpsc::UnboundedReceiver<LinkStatus>,
        shutdown: impl Future<Output = ()>,
    ) {
        let mut flush = time::interval(self.flush_interval);
        flush.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        flush.tick().await;

        let mut timer_tick = time::interval(TIMER_TICK);
        timer_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        tokio::pin!(shutdown);
        info!(
            flush_interval_secs = self.flush_interval.as_secs(),
            buffer_dir = %self.buffer.dir().display(),
            "Runtime started"
        );

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                Some(input) = inputs.recv() => self.handle_input(input),
                Some(status) = links.recv() => self.handle_link(status),
                _ = flush.tick() => self.flush(),
                _ = timer_tick.tick() => self.tick_timer(),
            }
        }

        self.shutdown().await;
    }

    pub fn handle_input(&mut self, input: Input) {
        match input {
            Input::Editor { request, reply } => {
                let response = self.handle_editor(request);
                if let (Some(reply), Some(response)) = (reply, response) {
                    if reply.send(response).is_err() {
                        debug!("Editor client went away before reply");
                    }
                }
            }
            Input::Completion(completion) => {
                self.in_flight = self.in_flight.saturating_sub(1);
                let effects = self.relay.on_completion(completion);
                self.execute(effects);
            }
        }
    }

    fn handle_editor(&mut self, request: EditorRequest) -> Option<EditorReply> {
        let ts = request.ts;
        debug!(index = request.index, event = request.event.name(), ts, "Editor event");

        match request.event {
            EditorEvent::Ping => {
                self.tracker.on_liveness_beat(ts);
                None
            }
            EditorEvent::BufEnter(info) => {
                if let Err(err) = self.tracker.on_buffer_enter(
                    ts,
                    info.filename.as_deref(),
                    info.filetype.as_deref(),
                    info.project.as_deref(),
                ) {
                    warn!(error = %err, ts, "Rejected buffer enter");
                }
                None
            }
            EditorEvent::BufLeave(info) => {
                self.tracker.on_buffer_leave(ts, info.as_ref());
                None
            }
            EditorEvent::TimerQuery => Some(EditorReply::Timer(self.timer.snapshot())),
            EditorEvent::TimerStart { name } => {
                let result = self.timer.start(&name, self.now());
                Some(self.control(result))
            }
            EditorEvent::TimerPause => {
                let result = self.timer.pause(self.now());
                Some(self.control(result))
            }
            EditorEvent::TimerResume => {
                let result = self.timer.resume(self.now());
                Some(self.control(result))
            }
            EditorEvent::TimerAbandon => {
                let result = self.timer.abandon(self.now());
                Some(self.control(result))
            }
        }
    }

    fn control(&mut self, result: Result<Vec<Push>, TimerError>) -> EditorReply {
        match result {
            Ok(notices) => {
                self.broadcast(notices);
                EditorReply::Ack(Ack::success())
            }
            Err(err) => {
                debug!(error = %err, "Timer control rejected");
                EditorReply::Ack(Ack::failure(err.token()))
            }
        }
    }

    fn broadcast(&self, notices: Vec<Push>) {
        for notice in notices {
            // No subscribers simply means no editor is connected.
            let _ = self.pushes.send(notice);
        }
    }

    pub fn handle_link(&mut self, status: LinkStatus) {
        let effects = match status {
            LinkStatus::Up => self.relay.on_link_up(),
            LinkStatus::Down => self.relay.on_link_down(),
        };
        self.execute(effects);
    }

    pub fn flush(&mut self) {
        let now = self.now();
        debug!(
            sessions = self.tracker.pending(),
            timers = self.timer.pending(),
            deferred = self.relay.deferred_len(),
            overflow = self.relay.overflow_len(),
            replaying = self.relay.is_replaying(),
            "Flush tick"
        );
        let batch = PendingBatch::combined(
            now,
            self.tracker.drain_history(),
            self.timer.drain_history(),
        );
        if let Some(batch) = &batch {
            info!(
                sessions = batch.sessions.len(),
                timers = batch.timers.len(),
                live = self.relay.is_live(),
                "Flushing history"
            );
        }
        let effects = self.relay.on_flush(batch);
        self.execute(effects);
    }

    pub fn tick_timer(&mut self) {
        let notices = self.timer.tick(self.now());
        self.broadcast(notices);
    }

    fn execute(&mut self, effects: Vec<Effect>) {
        for effect in effects {
            self.in_flight += 1;
            let inputs = self.inputs.clone();
            match effect {
                Effect::Send(batch) => {
                    let remote = Arc::clone(&self.remote);
                    tokio::spawn(async move {
                        let result = relay::deliver(remote.as_ref(), batch).await;
                        let _ = inputs.send(Input::Completion(Completion::Sent(result)));
                    });
                }
                Effect::Write(batch) => {
                    let buffer = self.buffer.clone();
                    tokio::spawn(async move {
                        let result = buffer.write(&batch).await;
                        let _ = inputs.send(Input::Completion(Completion::Written { batch, result }));
                    });
                }
                Effect::Replay { quarantined } => {
                    let buffer = self.buffer.clone();
                    let remote = Arc::clone(&self.remote);
                    tokio::spawn(async move {
                        let report =
                            relay::replay_buffer(&buffer, remote.as_ref(), &quarantined).await;
                        let _ = inputs.send(Input::Completion(Completion::Replayed(report)));
                    });
                }
            }
        }
    }

    /// Writes remaining history and unsent batches to the buffer, best-effort.
    async fn shutdown(mut self) {
        let mut batches = self.relay.take_unsent();
        let now = self.now();
        if let Some(batch) = PendingBatch::combined(
            now,
            self.tracker.drain_history(),
            self.timer.drain_history(),
        ) {
            batches.push(batch);
        }

        info!(
            batches = batches.len(),
            in_flight = self.in_flight,
            open_session = self.tracker.current().is_some(),
            timer = self.timer.state().as_str(),
            "Runtime stopping"
        );
        for batch in batches {
            match self.buffer.write(&batch).await {
                Ok(path) => debug!(path = %path.display(), "Persisted batch on shutdown"),
                Err(err) => error!(error = %err, records = batch.len(), "Failed to persist batch on shutdown"),
            }
        }
    }
}
