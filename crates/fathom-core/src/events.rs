use serde::{Deserialize, Serialize};

use crate::types::{FragmentKind, Timestamp};

/// Events emitted by the reconciliation engine as a turn progresses.
///
/// Consumed by the presentation collaborator through the engine's broadcast
/// subscription and by the replay CLI for its event log.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[non_exhaustive]
pub enum TurnEvent {
    /// A user query is waiting for its first response fragment.
    TurnAwaiting {
        turn: usize,
        query_chars: usize,
        estimated_total_secs: u32,
        timestamp: Timestamp,
    },

    /// A new assistant response slot appeared; the live snapshot was reset.
    TurnStarted { turn: usize, timestamp: Timestamp },

    /// One or more facets of the live snapshot were replaced.
    FacetsUpdated {
        turn: usize,
        kinds: Vec<FragmentKind>,
        timestamp: Timestamp,
    },

    /// The backend reported that source gathering is complete.
    SourcesCompleted { turn: usize, timestamp: Timestamp },

    /// The one-second progress clock advanced.
    ProgressTicked {
        turn: usize,
        fraction: f64,
        remaining_secs: u32,
        timestamp: Timestamp,
    },

    /// The cosmetic pipeline step label advanced.
    StepAdvanced {
        turn: usize,
        step_index: usize,
        timestamp: Timestamp,
    },

    /// The response finished and its snapshot was frozen into history.
    TurnCompleted { turn: usize, timestamp: Timestamp },

    /// An unfinished turn was abandoned because a newer query started.
    TurnSuperseded {
        turn: usize,
        by: usize,
        timestamp: Timestamp,
    },

    /// A fragment was skipped because it could not be classified.
    FragmentIgnored {
        turn: usize,
        position: usize,
        kind: String,
        reason: String,
        timestamp: Timestamp,
    },
}

impl TurnEvent {
    /// Returns the timestamp of the event.
    pub fn timestamp(&self) -> Timestamp {
        match self {
            TurnEvent::TurnAwaiting { timestamp, .. }
            | TurnEvent::TurnStarted { timestamp, .. }
            | TurnEvent::FacetsUpdated { timestamp, .. }
            | TurnEvent::SourcesCompleted { timestamp, .. }
            | TurnEvent::ProgressTicked { timestamp, .. }
            | TurnEvent::StepAdvanced { timestamp, .. }
            | TurnEvent::TurnCompleted { timestamp, .. }
            | TurnEvent::TurnSuperseded { timestamp, .. }
            | TurnEvent::FragmentIgnored { timestamp, .. } => *timestamp,
        }
    }

    /// Index of the turn the event belongs to.
    pub fn turn(&self) -> usize {
        match self {
            TurnEvent::TurnAwaiting { turn, .. }
            | TurnEvent::TurnStarted { turn, .. }
            | TurnEvent::FacetsUpdated { turn, .. }
            | TurnEvent::SourcesCompleted { turn, .. }
            | TurnEvent::ProgressTicked { turn, .. }
            | TurnEvent::StepAdvanced { turn, .. }
            | TurnEvent::TurnCompleted { turn, .. }
            | TurnEvent::TurnSuperseded { turn, .. }
            | TurnEvent::FragmentIgnored { turn, .. } => *turn,
        }
    }

    /// Returns a human-readable event name for logging.
    pub fn event_name(&self) -> &'static str {
        match self {
            TurnEvent::TurnAwaiting { .. } => "turn_awaiting",
            TurnEvent::TurnStarted { .. } => "turn_started",
            TurnEvent::FacetsUpdated { .. } => "facets_updated",
            TurnEvent::SourcesCompleted { .. } => "sources_completed",
            TurnEvent::ProgressTicked { .. } => "progress_ticked",
            TurnEvent::StepAdvanced { .. } => "step_advanced",
            TurnEvent::TurnCompleted { .. } => "turn_completed",
            TurnEvent::TurnSuperseded { .. } => "turn_superseded",
            TurnEvent::FragmentIgnored { .. } => "fragment_ignored",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_timestamp_and_turn() {
        let ts = Timestamp(1_700_000_000);
        let event = TurnEvent::TurnStarted { turn: 3, timestamp: ts };
        assert_eq!(event.timestamp(), ts);
        assert_eq!(event.turn(), 3);
    }

    #[test]
    fn test_event_name() {
        let event = TurnEvent::TurnSuperseded {
            turn: 0,
            by: 1,
            timestamp: Timestamp(1_700_000_000),
        };
        assert_eq!(event.event_name(), "turn_superseded");
    }

    #[test]
    fn test_event_serialization() {
        let event = TurnEvent::FacetsUpdated {
            turn: 1,
            kinds: vec![FragmentKind::Sources, FragmentKind::Ticker],
            timestamp: Timestamp(1_700_000_000),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("FacetsUpdated"));
        assert!(json.contains("sources"));
        let back: TurnEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
    }
}
