//! Heuristic progress estimate for an in-flight turn.
//!
//! The estimate is a UX approximation with no relation to backend progress:
//! a total duration derived from query length plus jitter, a fraction that
//! grows with elapsed whole seconds and stays below a ceiling until the
//! response completes, and a cosmetic step label that cycles independently.

use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use serde::Serialize;

use fathom_core::config::ProgressConfig;

// =============================================================================
// Clocks
// =============================================================================

/// Source of the current time for the progress estimate.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock anchored at construction and advanced by the tokio monotonic clock.
///
/// Follows paused tokio time in tests, and never jumps backwards when the
/// system clock is adjusted.
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    anchor_wall: DateTime<Utc>,
    anchor_instant: tokio::time::Instant,
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            anchor_wall: Utc::now(),
            anchor_instant: tokio::time::Instant::now(),
        }
    }
}

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        let elapsed = self.anchor_instant.elapsed();
        let elapsed = Duration::from_std(elapsed).unwrap_or(Duration::zero());
        self.anchor_wall + elapsed
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += by;
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(|e| e.into_inner()) = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

// =============================================================================
// Estimator
// =============================================================================

/// Progress state of one turn.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressState {
    pub turn: usize,
    pub started_at: DateTime<Utc>,
    pub estimated_total_secs: u32,
    pub elapsed_secs: u32,
    pub remaining_secs: u32,
    pub fraction: f64,
    pub step_index: usize,
    pub completed: bool,
}

/// Read-only progress data for presentation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressView {
    pub turn: Option<usize>,
    /// Timers are running for this turn.
    pub active: bool,
    pub completed: bool,
    pub fraction: f64,
    pub remaining_secs: u32,
    pub elapsed_secs: u32,
    pub estimated_total_secs: u32,
    pub step_index: usize,
    pub step_label: Option<String>,
}

/// Owns the progress state of the active turn.
///
/// Every start, completion and reset bumps a generation number. Timer tasks
/// capture the generation they were armed with and must check
/// [`ProgressEstimator::is_current`] before mutating, so a timer armed for an
/// older turn can never touch the state of a newer one.
#[derive(Debug, Clone)]
pub struct ProgressEstimator {
    tuning: ProgressConfig,
    steps: Vec<String>,
    state: Option<ProgressState>,
    generation: u64,
}

impl ProgressEstimator {
    pub fn new(tuning: ProgressConfig) -> Self {
        let steps = tuning
            .steps
            .iter()
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        Self {
            tuning,
            steps,
            state: None,
            generation: 0,
        }
    }

    pub fn tuning(&self) -> &ProgressConfig {
        &self.tuning
    }

    pub fn steps(&self) -> &[String] {
        &self.steps
    }

    pub fn state(&self) -> Option<&ProgressState> {
        self.state.as_ref()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Turn the current state belongs to, running or completed.
    pub fn turn(&self) -> Option<usize> {
        self.state.as_ref().map(|s| s.turn)
    }

    pub fn is_running(&self) -> bool {
        self.state.as_ref().is_some_and(|s| !s.completed)
    }

    /// Whether a timer armed with `generation` may still mutate the state.
    pub fn is_current(&self, generation: u64) -> bool {
        self.is_running() && self.generation == generation
    }

    /// Estimated total seconds for a query of `query_chars` characters.
    ///
    /// `jitter` is clamped to the configured maximum, so the result always lies
    /// in `[base, base + cap_extra + jitter_max]`.
    pub fn estimate_total_secs(&self, query_chars: usize, jitter: u32) -> u32 {
        let divisor = self.tuning.length_divisor.max(1) as usize;
        let extra = (query_chars / divisor).min(self.tuning.cap_extra_secs as usize) as u32;
        self.tuning.base_secs + extra + jitter.min(self.tuning.jitter_max_secs)
    }

    /// Start progress for `turn`, drawing jitter from `rng`. Returns the new generation.
    pub fn start<R: Rng>(
        &mut self,
        turn: usize,
        query_chars: usize,
        now: DateTime<Utc>,
        rng: &mut R,
    ) -> u64 {
        let jitter = rng.random_range(0..=self.tuning.jitter_max_secs);
        self.start_with_jitter(turn, query_chars, now, jitter)
    }

    /// Start progress for `turn` with a fixed jitter. Returns the new generation.
    pub fn start_with_jitter(
        &mut self,
        turn: usize,
        query_chars: usize,
        now: DateTime<Utc>,
        jitter: u32,
    ) -> u64 {
        let total = self.estimate_total_secs(query_chars, jitter);
        self.generation += 1;
        self.state = Some(ProgressState {
            turn,
            started_at: now,
            estimated_total_secs: total,
            elapsed_secs: 0,
            remaining_secs: total,
            fraction: 0.0,
            step_index: 0,
            completed: false,
        });
        tracing::debug!(
            turn,
            query_chars,
            estimated_total_secs = total,
            generation = self.generation,
            "Progress started"
        );
        self.generation
    }

    /// Recompute elapsed, remaining and fraction at `now`.
    ///
    /// Returns `None` when no turn is running. The fraction never decreases and
    /// never exceeds the configured ceiling while running.
    pub fn tick(&mut self, now: DateTime<Utc>) -> Option<&ProgressState> {
        let ceiling = self.tuning.max_active_fraction;
        let state = self.state.as_mut().filter(|s| !s.completed)?;

        let elapsed = (now - state.started_at).num_seconds().max(0);
        let elapsed = u32::try_from(elapsed).unwrap_or(u32::MAX);
        state.elapsed_secs = state.elapsed_secs.max(elapsed);
        state.remaining_secs = state
            .estimated_total_secs
            .saturating_sub(state.elapsed_secs);

        let total = f64::from(state.estimated_total_secs.max(1));
        let fraction = (f64::from(state.elapsed_secs) / total).min(ceiling);
        state.fraction = state.fraction.max(fraction);

        Some(&*state)
    }

    /// Advance the cosmetic step label, wrapping around. Returns the new index.
    pub fn advance_step(&mut self) -> Option<usize> {
        let step_count = self.steps.len().max(1);
        let state = self.state.as_mut().filter(|s| !s.completed)?;
        state.step_index = (state.step_index + 1) % step_count;
        Some(state.step_index)
    }

    /// Snap to full progress. Invalidates outstanding timers. Returns false if nothing was running.
    pub fn complete(&mut self) -> bool {
        let Some(state) = self.state.as_mut().filter(|s| !s.completed) else {
            return false;
        };
        state.completed = true;
        state.fraction = 1.0;
        state.remaining_secs = 0;
        self.generation += 1;
        tracing::debug!(turn = state.turn, elapsed_secs = state.elapsed_secs, "Progress completed");
        true
    }

    /// Drop the state entirely. Invalidates outstanding timers.
    pub fn reset(&mut self) {
        if let Some(state) = self.state.take() {
            tracing::debug!(turn = state.turn, "Progress reset");
        }
        self.generation += 1;
    }

    pub fn view(&self) -> ProgressView {
        match &self.state {
            Some(state) => ProgressView {
                turn: Some(state.turn),
                active: !state.completed,
                completed: state.completed,
                fraction: state.fraction,
                remaining_secs: state.remaining_secs,
                elapsed_secs: state.elapsed_secs,
                estimated_total_secs: state.estimated_total_secs,
                step_index: state.step_index,
                step_label: self.steps.get(state.step_index).cloned(),
            },
            None => ProgressView {
                turn: None,
                active: false,
                completed: false,
                fraction: 0.0,
                remaining_secs: 0,
                elapsed_secs: 0,
                estimated_total_secs: 0,
                step_index: 0,
                step_label: None,
            },
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
