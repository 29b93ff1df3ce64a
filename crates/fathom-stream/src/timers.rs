//! Periodic timer tasks driving the progress clock and step cycling.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// Which periodic signal a timer drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    ProgressClock,
    StepCycle,
}

/// What a tick callback wants the timer to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Continue,
    Stop,
}

/// A running periodic task. Dropping the handle cancels the task.
#[derive(Debug)]
pub struct TimerHandle {
    kind: TimerKind,
    generation: u64,
    shutdown: Arc<Notify>,
    task: JoinHandle<()>,
}

impl TimerHandle {
    /// Spawn a task calling `on_tick` every `period`, first after one full period.
    ///
    /// Returns `None` outside a tokio runtime; callers then drive ticks manually.
    pub fn spawn<F>(kind: TimerKind, generation: u64, period: Duration, mut on_tick: F) -> Option<Self>
    where
        F: FnMut() -> TickOutcome + Send + 'static,
    {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::debug!(?kind, generation, "No tokio runtime; timer not armed");
            return None;
        };

        let shutdown = Arc::new(Notify::new());
        let stop = shutdown.clone();
        let task = runtime.spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if on_tick() == TickOutcome::Stop {
                            tracing::trace!(?kind, generation, "Timer stopped itself");
                            break;
                        }
                    }
                    _ = stop.notified() => {
                        tracing::trace!(?kind, generation, "Timer shut down");
                        break;
                    }
                }
            }
        });

        Some(Self {
            kind,
            generation,
            shutdown,
            task,
        })
    }

    pub fn kind(&self) -> TimerKind {
        self.kind
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stop the task. Consumes the handle so it cannot be cancelled twice.
    pub fn cancel(self) {
        tracing::debug!(kind = ?self.kind, generation = self.generation, "Cancelling timer");
        self.shutdown.notify_one();
        // Drop aborts the task in case it is mid-tick
    }
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// The pair of timers belonging to the active turn.
#[derive(Debug, Default)]
pub struct TurnTimers {
    progress: Option<TimerHandle>,
    steps: Option<TimerHandle>,
}

impl TurnTimers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install freshly spawned timers, cancelling any previous ones first.
    pub fn arm(&mut self, progress: Option<TimerHandle>, steps: Option<TimerHandle>) {
        self.cancel_all();
        self.progress = progress;
        self.steps = steps;
    }

    /// Cancel both timers. Returns how many were running.
    pub fn cancel_all(&mut self) -> usize {
        let mut cancelled = 0;
        for handle in [self.progress.take(), self.steps.take()].into_iter().flatten() {
            handle.cancel();
            cancelled += 1;
        }
        cancelled
    }

    pub fn is_armed(&self) -> bool {
        self.progress.is_some() || self.steps.is_some()
    }

    /// Generation the armed timers were created for.
    pub fn generation(&self) -> Option<u64> {
        self.progress
            .as_ref()
            .or(self.steps.as_ref())
            .map(TimerHandle::generation)
    }
}

// =============================================================================
// Tests
// =============================================================================
