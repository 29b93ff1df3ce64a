//! Reconciliation engine tying the stream pieces together.
//!
//! The transport pushes the full message list and its status through
//! [`ReconciliationEngine::observe`] (directly, through [`MessageObserver`], or
//! over a channel consumed by [`ReconciliationEngine::run`]). The engine
//! detects new turns, demultiplexes fresh fragments into the live snapshot,
//! runs the progress estimate while a response is outstanding, and freezes
//! each finished turn into history.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, mpsc, Notify};

use fathom_core::config::{FathomConfig, ProgressConfig};
use fathom_core::events::TurnEvent;
use fathom_core::types::{FacetSnapshot, Message, StreamStatus, Timestamp};

use crate::accumulator::TurnAccumulator;
use crate::error::Result;
use crate::history::TurnHistory;
use crate::pairing::{pair_turns, TurnView};
use crate::phase::{PhaseTracker, TurnPhase};
use crate::progress::{Clock, ProgressView, SystemClock};
use crate::timers::{TickOutcome, TimerHandle, TimerKind, TurnTimers};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// One push from the transport.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamUpdate {
    pub messages: Vec<Message>,
    pub status: StreamStatus,
}

/// Receiver side of the transport's push contract.
pub trait MessageObserver: Send + Sync {
    fn on_messages(&self, messages: &[Message], status: StreamStatus);
}

/// How the progress estimate draws its jitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Jitter {
    #[default]
    Random,
    Fixed(u32),
}

struct EngineState {
    accumulator: TurnAccumulator,
    history: TurnHistory,
    phase: PhaseTracker,
    timers: TurnTimers,
    messages: Vec<Message>,
    assistants_seen: usize,
}

pub struct ReconciliationEngine {
    state: Arc<Mutex<EngineState>>,
    events: broadcast::Sender<TurnEvent>,
    clock: Arc<dyn Clock>,
    jitter: Jitter,
    tick_interval: Duration,
    step_interval: Duration,
    shutdown: Arc<Notify>,
}

impl fmt::Debug for ReconciliationEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReconciliationEngine")
            .field("jitter", &self.jitter)
            .field("tick_interval", &self.tick_interval)
            .field("step_interval", &self.step_interval)
            .finish_non_exhaustive()
    }
}

impl ReconciliationEngine {
    /// Create an engine with validated progress tuning and the system clock.
    pub fn new(tuning: ProgressConfig) -> Result<Self> {
        tuning.validate()?;
        let tick_interval = Duration::from_millis(tuning.tick_interval_ms);
        let step_interval = Duration::from_millis(tuning.speed.cycle_ms());
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Ok(Self {
            state: Arc::new(Mutex::new(EngineState {
                accumulator: TurnAccumulator::new(tuning),
                history: TurnHistory::new(),
                phase: PhaseTracker::new(),
                timers: TurnTimers::new(),
                messages: Vec::new(),
                assistants_seen: 0,
            })),
            events,
            clock: Arc::new(SystemClock::new()),
            jitter: Jitter::Random,
            tick_interval,
            step_interval,
            shutdown: Arc::new(Notify::new()),
        })
    }

    pub fn from_config(config: &FathomConfig) -> Result<Self> {
        Self::new(config.progress.clone())
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = jitter;
        self
    }

    /// Subscribe to turn events. Events sent before subscribing are not replayed.
    pub fn subscribe(&self) -> broadcast::Receiver<TurnEvent> {
        self.events.subscribe()
    }

    fn lock(&self) -> MutexGuard<'_, EngineState> {
        lock_state(&self.state)
    }

    // ===== Observation =====

    /// Reconcile the engine with the transport's current message list.
    ///
    /// Idempotent: observing the same messages and status twice changes nothing
    /// the second time.
    pub fn observe(&self, messages: &[Message], status: StreamStatus) {
        let now = self.clock.now();
        let mut events = Vec::new();
        {
            let mut guard = self.lock();
            let state = &mut *guard;

            let assistant_positions: Vec<usize> = messages
                .iter()
                .enumerate()
                .filter(|(_, m)| m.is_assistant())
                .map(|(i, _)| i)
                .collect();

            if assistant_positions.len() < state.assistants_seen {
                tracing::warn!(
                    seen = state.assistants_seen,
                    now = assistant_positions.len(),
                    "Message list shrank; resetting conversation state"
                );
                Self::reset_state(state);
            }
            state.messages = messages.to_vec();

            // The open turn's message may have grown before anything newer arrived.
            self.ingest_open_turn(state, messages, &assistant_positions, now, &mut events);

            // New response slots, oldest first. Only the final message can still be streaming.
            let last_index = messages.len().saturating_sub(1);
            while state.assistants_seen < assistant_positions.len() {
                let turn = state.assistants_seen;
                let position = assistant_positions[turn];
                if !state.accumulator.is_frozen()
                    && state.accumulator.active_turn().is_some_and(|t| t < turn)
                {
                    self.complete_turn(state, StreamStatus::Ready, now, &mut events);
                }
                let live = position == last_index && status.is_in_flight();
                let query_chars = query_chars_before(messages, position);
                self.start_turn(state, turn, query_chars, live, now, &mut events);
                state.assistants_seen += 1;

                if position != last_index {
                    self.ingest(state, &messages[position], now, &mut events);
                    self.complete_turn(state, StreamStatus::Ready, now, &mut events);
                }
            }

            match messages.last() {
                Some(last) if last.is_user() => {
                    if status.is_in_flight() {
                        let turn = assistant_positions.len();
                        let query_chars = last.text().chars().count();
                        self.await_turn(state, turn, query_chars, now, &mut events);
                    }
                }
                Some(last) => {
                    let turn = assistant_positions.len().checked_sub(1);
                    if turn.is_some() && state.accumulator.active_turn() == turn {
                        self.ingest(state, last, now, &mut events);
                    }
                }
                None => {}
            }

            if !status.is_in_flight() && state.phase.current().is_in_flight() {
                self.complete_turn(state, status, now, &mut events);
            }
        }

        for event in events {
            tracing::trace!(event = event.event_name(), turn = event.turn(), "Turn event");
            let _ = self.events.send(event);
        }
    }

    /// Consume transport updates until the channel closes or [`Self::shutdown`] is called.
    pub async fn run(&self, mut updates: mpsc::Receiver<StreamUpdate>) {
        tracing::info!("Reconciliation engine started");
        loop {
            tokio::select! {
                update = updates.recv() => match update {
                    Some(update) => self.observe(&update.messages, update.status),
                    None => {
                        tracing::debug!("Update channel closed");
                        break;
                    }
                },
                _ = self.shutdown.notified() => {
                    tracing::info!("Reconciliation engine shutting down");
                    break;
                }
            }
        }
        self.lock().timers.cancel_all();
    }

    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }

    /// Forget every turn (conversation cleared).
    pub fn reset(&self) {
        Self::reset_state(&mut self.lock());
    }

    // ===== Queries =====

    pub fn view(&self) -> Vec<TurnView> {
        let state = self.lock();
        pair_turns(&state.messages, &state.accumulator, &state.history)
    }

    pub fn progress(&self) -> ProgressView {
        self.lock().accumulator.progress().view()
    }

    /// Live facets of the active turn.
    pub fn snapshot(&self) -> FacetSnapshot {
        self.lock().accumulator.snapshot().clone()
    }

    pub fn history_entry(&self, turn: usize) -> Option<FacetSnapshot> {
        self.lock().history.get(turn).cloned()
    }

    pub fn history_len(&self) -> usize {
        self.lock().history.len()
    }

    pub fn active_turn(&self) -> Option<usize> {
        self.lock().accumulator.active_turn()
    }

    pub fn sources_complete(&self) -> bool {
        self.lock().accumulator.sources_complete()
    }

    pub fn processed(&self) -> usize {
        self.lock().accumulator.processed()
    }

    pub fn phase(&self) -> TurnPhase {
        self.lock().phase.current()
    }

    /// Whether a response is outstanding; new submissions should wait.
    pub fn is_busy(&self) -> bool {
        self.phase().is_in_flight()
    }

    pub fn timers_armed(&self) -> bool {
        self.lock().timers.is_armed()
    }

    // ===== Manual driving =====

    /// Advance the progress clock now. Used when no runtime drives the timers.
    pub fn tick(&self) -> Option<ProgressView> {
        let now = self.clock.now();
        let (view, event) = {
            let mut state = self.lock();
            let progress = state.accumulator.progress_mut();
            let ticked = progress.tick(now)?;
            let event = progress_event(ticked.turn, ticked.fraction, ticked.remaining_secs, now);
            (progress.view(), event)
        };
        let _ = self.events.send(event);
        Some(view)
    }

    /// Advance the cosmetic step label now. Returns the new step index.
    pub fn cycle_step(&self) -> Option<usize> {
        let now = self.clock.now();
        let (turn, index) = {
            let mut state = self.lock();
            let progress = state.accumulator.progress_mut();
            let index = progress.advance_step()?;
            (progress.turn()?, index)
        };
        let _ = self.events.send(TurnEvent::StepAdvanced {
            turn,
            step_index: index,
            timestamp: Timestamp::from_datetime(now),
        });
        Some(index)
    }

    // ===== Transitions =====

    fn await_turn(
        &self,
        state: &mut EngineState,
        turn: usize,
        query_chars: usize,
        now: DateTime<Utc>,
        events: &mut Vec<TurnEvent>,
    ) {
        if state.accumulator.progress().turn() == Some(turn)
            || state.accumulator.active_turn().is_some_and(|t| t >= turn)
            || state.history.contains(turn)
        {
            return;
        }

        let phase_result = if state.phase.current().is_in_flight() {
            let superseded = state
                .accumulator
                .progress()
                .turn()
                .or(state.accumulator.active_turn());
            state.accumulator.freeze(&mut state.history);
            if let Some(previous) = superseded {
                tracing::info!(previous, turn, "Unfinished turn superseded by a new query");
                events.push(TurnEvent::TurnSuperseded {
                    turn: previous,
                    by: turn,
                    timestamp: Timestamp::from_datetime(now),
                });
            }
            state.phase.supersede(TurnPhase::Awaiting)
        } else {
            state.phase.transition(TurnPhase::Awaiting)
        };
        if let Err(e) = phase_result {
            tracing::warn!(error = %e, turn, "Unexpected phase change while awaiting");
        }

        self.start_progress(state, turn, query_chars, now);
        let estimated_total_secs = state
            .accumulator
            .progress()
            .state()
            .map_or(0, |p| p.estimated_total_secs);
        tracing::info!(turn, query_chars, estimated_total_secs, "Awaiting response");
        events.push(TurnEvent::TurnAwaiting {
            turn,
            query_chars,
            estimated_total_secs,
            timestamp: Timestamp::from_datetime(now),
        });
    }

    fn start_turn(
        &self,
        state: &mut EngineState,
        turn: usize,
        query_chars: usize,
        live: bool,
        now: DateTime<Utc>,
        events: &mut Vec<TurnEvent>,
    ) {
        if !state.accumulator.is_frozen() {
            if let Some(previous) = state.accumulator.active_turn().filter(|p| *p != turn) {
                state.accumulator.freeze(&mut state.history);
                events.push(TurnEvent::TurnSuperseded {
                    turn: previous,
                    by: turn,
                    timestamp: Timestamp::from_datetime(now),
                });
            }
        }

        if state.accumulator.progress().turn() != Some(turn) {
            state.timers.cancel_all();
        }
        state.accumulator.begin_turn_at(turn);

        let phase_result = if state.phase.current() == TurnPhase::Streaming {
            state.phase.supersede(TurnPhase::Streaming)
        } else {
            state.phase.transition(TurnPhase::Streaming)
        };
        if let Err(e) = phase_result {
            tracing::warn!(error = %e, turn, "Unexpected phase change while starting turn");
        }

        if live && !state.accumulator.progress().is_running() {
            self.start_progress(state, turn, query_chars, now);
        }
        events.push(TurnEvent::TurnStarted {
            turn,
            timestamp: Timestamp::from_datetime(now),
        });
    }

    fn ingest(
        &self,
        state: &mut EngineState,
        message: &Message,
        now: DateTime<Utc>,
        events: &mut Vec<TurnEvent>,
    ) {
        let Some(turn) = state.accumulator.active_turn() else {
            return;
        };
        let was_complete = state.accumulator.sources_complete();
        let Some(updates) = state.accumulator.ingest(&message.fragments) else {
            return;
        };
        let timestamp = Timestamp::from_datetime(now);

        for ignored in updates.ignored.iter() {
            events.push(TurnEvent::FragmentIgnored {
                turn,
                position: ignored.position,
                kind: ignored.kind.clone(),
                reason: ignored.reason.to_string(),
                timestamp,
            });
        }
        let kinds = updates.kinds();
        if !kinds.is_empty() {
            tracing::debug!(turn, ?kinds, "Facets updated");
            events.push(TurnEvent::FacetsUpdated {
                turn,
                kinds,
                timestamp,
            });
        }
        if !was_complete && state.accumulator.sources_complete() {
            events.push(TurnEvent::SourcesCompleted { turn, timestamp });
        }
    }

    fn ingest_open_turn(
        &self,
        state: &mut EngineState,
        messages: &[Message],
        assistant_positions: &[usize],
        now: DateTime<Utc>,
        events: &mut Vec<TurnEvent>,
    ) {
        if state.accumulator.is_frozen() {
            return;
        }
        let Some(&position) = state
            .accumulator
            .active_turn()
            .and_then(|turn| assistant_positions.get(turn))
        else {
            return;
        };
        self.ingest(state, &messages[position], now, events);
    }

    fn complete_turn(
        &self,
        state: &mut EngineState,
        status: StreamStatus,
        now: DateTime<Utc>,
        events: &mut Vec<TurnEvent>,
    ) {
        state.timers.cancel_all();
        // Progress may still name an older finished turn during catch-up, or a
        // newer awaited turn that never got a response slot.
        let turn = state
            .accumulator
            .progress()
            .turn()
            .max(state.accumulator.active_turn());
        state.accumulator.progress_mut().complete();
        if state.phase.current() == TurnPhase::Streaming {
            state.accumulator.freeze(&mut state.history);
        }
        if let Err(e) = state.phase.transition(TurnPhase::Complete) {
            tracing::warn!(error = %e, "Unexpected phase change while completing");
        }

        if status == StreamStatus::Error {
            tracing::warn!(turn = ?turn, "Response ended with a transport error");
        } else {
            tracing::info!(turn = ?turn, "Turn completed");
        }
        if let Some(turn) = turn {
            events.push(TurnEvent::TurnCompleted {
                turn,
                timestamp: Timestamp::from_datetime(now),
            });
        }
    }

    fn start_progress(
        &self,
        state: &mut EngineState,
        turn: usize,
        query_chars: usize,
        now: DateTime<Utc>,
    ) {
        state.timers.cancel_all();
        let progress = state.accumulator.progress_mut();
        let generation = match self.jitter {
            Jitter::Random => progress.start(turn, query_chars, now, &mut rand::rng()),
            Jitter::Fixed(jitter) => progress.start_with_jitter(turn, query_chars, now, jitter),
        };
        let clock_timer = self.spawn_progress_timer(generation);
        let step_timer = self.spawn_step_timer(generation);
        state.timers.arm(clock_timer, step_timer);
    }

    fn spawn_progress_timer(&self, generation: u64) -> Option<TimerHandle> {
        let shared = Arc::downgrade(&self.state);
        let events = self.events.clone();
        let clock = self.clock.clone();
        TimerHandle::spawn(TimerKind::ProgressClock, generation, self.tick_interval, move || {
            let Some(shared) = shared.upgrade() else {
                return TickOutcome::Stop;
            };
            let mut state = lock_state(&shared);
            let progress = state.accumulator.progress_mut();
            if !progress.is_current(generation) {
                return TickOutcome::Stop;
            }
            let now = clock.now();
            match progress.tick(now) {
                Some(ticked) => {
                    let event = progress_event(ticked.turn, ticked.fraction, ticked.remaining_secs, now);
                    let _ = events.send(event);
                    TickOutcome::Continue
                }
                None => TickOutcome::Stop,
            }
        })
    }

    fn spawn_step_timer(&self, generation: u64) -> Option<TimerHandle> {
        let shared = Arc::downgrade(&self.state);
        let events = self.events.clone();
        let clock = self.clock.clone();
        TimerHandle::spawn(TimerKind::StepCycle, generation, self.step_interval, move || {
            let Some(shared) = shared.upgrade() else {
                return TickOutcome::Stop;
            };
            let mut state = lock_state(&shared);
            let progress = state.accumulator.progress_mut();
            if !progress.is_current(generation) {
                return TickOutcome::Stop;
            }
            match (progress.advance_step(), progress.turn()) {
                (Some(step_index), Some(turn)) => {
                    let _ = events.send(TurnEvent::StepAdvanced {
                        turn,
                        step_index,
                        timestamp: Timestamp::from_datetime(clock.now()),
                    });
                    TickOutcome::Continue
                }
                _ => TickOutcome::Stop,
            }
        })
    }

    fn reset_state(state: &mut EngineState) {
        state.timers.cancel_all();
        state.accumulator.reset();
        state.history.clear();
        state.phase.reset();
        state.messages.clear();
        state.assistants_seen = 0;
    }
}

impl MessageObserver for ReconciliationEngine {
    fn on_messages(&self, messages: &[Message], status: StreamStatus) {
        self.observe(messages, status);
    }
}

fn lock_state(state: &Mutex<EngineState>) -> MutexGuard<'_, EngineState> {
    state.lock().unwrap_or_else(|poisoned| {
        tracing::error!("Engine state lock poisoned; continuing with the last state");
        PoisonError::into_inner(poisoned)
    })
}

fn progress_event(turn: usize, fraction: f64, remaining_secs: u32, now: DateTime<Utc>) -> TurnEvent {
    TurnEvent::ProgressTicked {
        turn,
        fraction,
        remaining_secs,
        timestamp: Timestamp::from_datetime(now),
    }
}

/// Characters of the user query answered by the response at `position`.
fn query_chars_before(messages: &[Message], position: usize) -> usize {
    messages[..position]
        .iter()
        .rev()
        .find(|m| m.is_user())
        .map_or(0, |m| m.text().chars().count())
}

// =============================================================================
// Tests
// =============================================================================
