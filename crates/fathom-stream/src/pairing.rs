//! Groups the flat message sequence into request/response turns for display.

use serde::Serialize;

use fathom_core::types::{FacetSnapshot, Message};

use crate::accumulator::TurnAccumulator;
use crate::history::TurnHistory;

/// One displayed turn: a request, its response so far, and the facets to show.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TurnView {
    pub index: usize,
    pub query: String,
    /// `None` while no response message exists for the request.
    pub answer: Option<String>,
    pub facets: FacetSnapshot,
    /// Facets come from the live accumulator rather than history.
    pub live: bool,
}

impl TurnView {
    pub fn is_awaiting(&self) -> bool {
        self.answer.is_none()
    }
}

/// Pair `messages[2i]` with `messages[2i + 1]` for every turn `i`.
///
/// The last turn always reads the live accumulator when it is that turn's
/// accumulator, and is shown blank otherwise (its response has not started).
/// Every earlier turn reads its frozen history entry, or a blank snapshot when
/// none exists.
pub fn pair_turns(
    messages: &[Message],
    accumulator: &TurnAccumulator,
    history: &TurnHistory,
) -> Vec<TurnView> {
    let turn_count = messages.len().div_ceil(2);
    let mut turns = Vec::with_capacity(turn_count);

    for (index, pair) in messages.chunks(2).enumerate() {
        let request = &pair[0];
        let response = pair.get(1);
        if !request.is_user() {
            tracing::warn!(index, role = %request.role, "Turn does not start with a user message");
        }

        let is_last = index + 1 == turn_count;
        let (facets, live) = if is_last {
            if accumulator.active_turn() == Some(index) {
                (accumulator.snapshot().clone(), true)
            } else {
                (FacetSnapshot::default(), true)
            }
        } else {
            (history.get(index).cloned().unwrap_or_default(), false)
        };

        turns.push(TurnView {
            index,
            query: request.text(),
            answer: response.map(Message::text),
            facets,
            live,
        });
    }

    turns
}

/// Text of the most recent user message, for "rewrite" resubmission.
pub fn last_user_query(messages: &[Message]) -> Option<String> {
    messages
        .iter()
        .rev()
        .find(|m| m.is_user())
        .map(Message::text)
        .filter(|text| !text.trim().is_empty())
}

// =============================================================================
// Tests
// =============================================================================
