//! Fathom Stream crate - reconciliation of a streamed research answer into turns.
//!
//! Demultiplexes typed response fragments into a per-turn facet snapshot,
//! freezes each finished turn into an immutable history, runs a heuristic
//! progress estimate while a response is outstanding, and pairs the flat
//! message list into request/response turns for display.

pub mod accumulator;
pub mod demux;
pub mod engine;
pub mod error;
pub mod export;
pub mod history;
pub mod pairing;
pub mod phase;
pub mod progress;
pub mod submission;
pub mod timers;

pub use accumulator::TurnAccumulator;
pub use demux::{demultiplex, Demultiplexed, FacetUpdates, IgnoredFragment};
pub use engine::{Jitter, MessageObserver, ReconciliationEngine, StreamUpdate};
pub use error::{Result, StreamError};
pub use export::AnswerExport;
pub use history::TurnHistory;
pub use pairing::{last_user_query, pair_turns, TurnView};
pub use phase::TurnPhase;
pub use progress::{Clock, ManualClock, ProgressEstimator, ProgressView, SystemClock};
pub use submission::{SubmissionGate, SubmitOutcome};
