//! Turn lifecycle phases.
//!
//! - Idle -> Awaiting (query submitted, no response yet)
//! - Idle -> Streaming (first observation already carries a response slot)
//! - Awaiting -> Streaming (response slot appeared)
//! - Awaiting -> Complete (transport gave up before any fragment)
//! - Streaming -> Complete (transport reported ready or error)
//! - Complete -> Awaiting | Streaming (next turn)
//! - Awaiting | Streaming -> Awaiting | Streaming (superseded by a newer turn)

use std::fmt;

use crate::error::{Result, StreamError};

/// Where the most recent turn is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TurnPhase {
    /// Nothing has been submitted yet.
    #[default]
    Idle,
    /// A query is waiting for its first response fragment.
    Awaiting,
    /// Response fragments are arriving.
    Streaming,
    /// The last response finished and was frozen into history.
    Complete,
}

impl fmt::Display for TurnPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TurnPhase::Idle => write!(f, "Idle"),
            TurnPhase::Awaiting => write!(f, "Awaiting"),
            TurnPhase::Streaming => write!(f, "Streaming"),
            TurnPhase::Complete => write!(f, "Complete"),
        }
    }
}

impl TurnPhase {
    /// Whether a response is outstanding.
    pub fn is_in_flight(&self) -> bool {
        matches!(self, TurnPhase::Awaiting | TurnPhase::Streaming)
    }

    /// Returns whether a regular transition from `self` to `target` is valid.
    pub fn can_transition_to(&self, target: &TurnPhase) -> bool {
        matches!(
            (self, target),
            (TurnPhase::Idle, TurnPhase::Awaiting)
                | (TurnPhase::Idle, TurnPhase::Streaming)
                | (TurnPhase::Awaiting, TurnPhase::Streaming)
                | (TurnPhase::Awaiting, TurnPhase::Complete)
                | (TurnPhase::Streaming, TurnPhase::Complete)
                | (TurnPhase::Complete, TurnPhase::Awaiting)
                | (TurnPhase::Complete, TurnPhase::Streaming)
        )
    }

    /// Returns whether `target` may replace an in-flight turn that a newer one superseded.
    pub fn can_supersede_to(&self, target: &TurnPhase) -> bool {
        self.is_in_flight() && target.is_in_flight()
    }
}

/// Tracks the phase of the current turn and validates every change.
#[derive(Debug, Clone, Default)]
pub struct PhaseTracker {
    phase: TurnPhase,
}

impl PhaseTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> TurnPhase {
        self.phase
    }

    /// Move to `target` along a regular edge.
    pub fn transition(&mut self, target: TurnPhase) -> Result<()> {
        if self.phase.can_transition_to(&target) {
            tracing::debug!("Turn phase: {} -> {}", self.phase, target);
            self.phase = target;
            Ok(())
        } else {
            Err(StreamError::InvalidTransition {
                from: self.phase,
                to: target,
            })
        }
    }

    /// Move to `target` because a newer turn replaced the in-flight one.
    pub fn supersede(&mut self, target: TurnPhase) -> Result<()> {
        if self.phase.can_supersede_to(&target) {
            tracing::debug!("Turn phase superseded: {} -> {}", self.phase, target);
            self.phase = target;
            Ok(())
        } else {
            Err(StreamError::InvalidTransition {
                from: self.phase,
                to: target,
            })
        }
    }

    /// Force the tracker back to Idle (conversation cleared).
    pub fn reset(&mut self) {
        if self.phase != TurnPhase::Idle {
            tracing::info!("Turn phase reset to Idle from {}", self.phase);
        }
        self.phase = TurnPhase::Idle;
    }
}

// =============================================================================
// Tests
// =============================================================================
