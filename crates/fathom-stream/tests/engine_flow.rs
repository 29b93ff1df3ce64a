//! End-to-end tests driving the reconciliation engine the way a transport does:
//! re-delivering the full message list on every push.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;

use fathom_core::config::ProgressConfig;
use fathom_core::events::TurnEvent;
use fathom_core::types::{
    Fragment, MalformedReason, Message, Source, SourcesPayload, StreamStatus, TickerSymbol,
};
use fathom_stream::{Jitter, ManualClock, ReconciliationEngine, TurnPhase};

// =============================================================================
// Helpers
// =============================================================================

fn t0() -> DateTime<Utc> {
    DateTime::from_timestamp(1_700_000_000, 0).unwrap()
}

/// Engine with a manual clock, for tests that run without a tokio runtime.
fn manual_engine() -> (ReconciliationEngine, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(t0()));
    let engine = ReconciliationEngine::new(ProgressConfig::default())
        .unwrap()
        .with_clock(clock.clone())
        .with_jitter(Jitter::Fixed(0));
    (engine, clock)
}

/// Engine on the tokio clock, for tests under paused time.
fn timed_engine() -> ReconciliationEngine {
    ReconciliationEngine::new(ProgressConfig::default())
        .unwrap()
        .with_jitter(Jitter::Fixed(0))
}

fn sources(count: usize) -> Fragment {
    Fragment::Sources(SourcesPayload {
        sources: (0..count)
            .map(|i| Source::new(format!("https://site{}.example/aapl", i), format!("AAPL {}", i)))
            .collect(),
        news: vec![],
        images: vec![],
    })
}

/// An assistant message that keeps its id as fragments are appended.
struct Streamed {
    message: Message,
}

impl Streamed {
    fn new() -> Self {
        Self {
            message: Message::assistant(vec![]),
        }
    }

    fn push(&mut self, fragment: Fragment) -> Message {
        self.message.fragments.push(fragment);
        self.message.clone()
    }
}

fn drain(rx: &mut broadcast::Receiver<TurnEvent>) -> Vec<TurnEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

// =============================================================================
// Turn lifecycle
// =============================================================================

#[test]
fn test_aapl_turn_freezes_and_next_turn_starts_blank() {
    let (engine, clock) = manual_engine();
    let query = Message::user("AAPL stock price");

    engine.observe(&[query.clone()], StreamStatus::Submitted);
    assert_eq!(engine.phase(), TurnPhase::Awaiting);

    let mut answer = Streamed::new();
    let mut push = |engine: &ReconciliationEngine, fragment: Fragment| {
        let reply = answer.push(fragment);
        engine.observe(&[query.clone(), reply], StreamStatus::Streaming);
    };

    push(&engine, sources(3));
    assert_eq!(engine.active_turn(), Some(0));
    push(&engine, Fragment::ticker("AAPL"));
    push(&engine, Fragment::status("Composing answer", true));
    assert!(engine.sources_complete());
    push(&engine, Fragment::text("Apple closed at $190."));

    clock.advance(chrono::Duration::seconds(4));
    engine.tick();
    let reply = answer.message.clone();
    engine.observe(&[query.clone(), reply.clone()], StreamStatus::Ready);

    assert_eq!(engine.phase(), TurnPhase::Complete);
    let frozen = engine.history_entry(0).unwrap();
    assert_eq!(frozen.sources().len(), 3);
    assert_eq!(frozen.ticker_symbol(), TickerSymbol::new("AAPL").as_ref());
    assert!(frozen.news.is_received());
    assert!(frozen.news().is_empty());
    assert!(frozen.images().is_empty());
    assert_eq!(frozen.status_text(), Some("Composing answer"));

    let progress = engine.progress();
    assert_eq!(progress.fraction, 1.0);
    assert_eq!(progress.remaining_secs, 0);

    // Second query: turn 1 starts with a fresh snapshot, turn 0 stays put
    let second = Message::user("MSFT stock price");
    let mut messages = vec![query, reply, second];
    engine.observe(&messages, StreamStatus::Submitted);
    messages.push(Message::assistant(vec![Fragment::ticker("MSFT")]));
    engine.observe(&messages, StreamStatus::Streaming);

    assert_eq!(engine.active_turn(), Some(1));
    let live = engine.snapshot();
    assert!(!live.sources.is_received());
    assert_eq!(live.ticker_symbol(), TickerSymbol::new("MSFT").as_ref());
    assert_eq!(engine.history_entry(0).unwrap(), frozen);

    let view = engine.view();
    assert_eq!(view.len(), 2);
    assert_eq!(view[0].facets, frozen);
    assert!(view[1].live);
}

#[test]
fn test_two_sources_fragments_in_one_batch_keep_latest() {
    let (engine, _clock) = manual_engine();
    let messages = vec![
        Message::user("AAPL stock price"),
        Message::assistant(vec![sources(7), Fragment::text("..."), sources(9)]),
    ];
    engine.observe(&messages, StreamStatus::Streaming);

    assert_eq!(engine.snapshot().sources().len(), 9);
    assert_eq!(engine.processed(), 3);
}

#[test]
fn test_repeated_observation_is_idempotent() {
    let (engine, _clock) = manual_engine();
    let mut rx = engine.subscribe();
    let messages = vec![
        Message::user("q"),
        Message::assistant(vec![sources(2), Fragment::ticker("AAPL")]),
    ];

    engine.observe(&messages, StreamStatus::Streaming);
    let first_events = drain(&mut rx);
    let first_snapshot = engine.snapshot();
    assert!(!first_events.is_empty());

    engine.observe(&messages, StreamStatus::Streaming);
    assert!(drain(&mut rx).is_empty());
    assert_eq!(engine.snapshot(), first_snapshot);
    assert_eq!(engine.processed(), 2);
}

#[test]
fn test_history_is_immutable_after_freeze() {
    let (engine, _clock) = manual_engine();
    let query = Message::user("q");
    let mut answer = Streamed::new();

    let reply = answer.push(sources(2));
    engine.observe(&[query.clone(), reply.clone()], StreamStatus::Ready);
    let frozen = engine.history_entry(0).unwrap();

    // A late push for the same turn carrying more fragments
    let late = answer.push(sources(5));
    engine.observe(&[query.clone(), late.clone()], StreamStatus::Ready);
    engine.observe(&[query, late], StreamStatus::Streaming);

    assert_eq!(engine.history_entry(0).unwrap(), frozen);
    assert_eq!(engine.snapshot().sources().len(), 2);
}

#[test]
fn test_tail_of_previous_turn_is_ingested_when_next_slot_arrives() {
    let (engine, _clock) = manual_engine();
    let mut rx = engine.subscribe();
    let first = Message::user("AAPL stock price");
    let mut answer = Streamed::new();

    let reply = answer.push(Fragment::ticker("AAPL"));
    engine.observe(&[first.clone(), reply], StreamStatus::Streaming);
    assert!(!engine.snapshot().sources.is_received());

    // The first answer grew and a whole second exchange landed in one push
    let reply = answer.push(sources(3));
    let second = Message::user("MSFT stock price");
    let messages = vec![first, reply, second, Message::assistant(vec![])];
    engine.observe(&messages, StreamStatus::Streaming);

    let frozen = engine.history_entry(0).unwrap();
    assert_eq!(frozen.sources().len(), 3);
    assert_eq!(frozen.ticker_symbol(), TickerSymbol::new("AAPL").as_ref());
    assert_eq!(engine.active_turn(), Some(1));
    assert!(!engine.snapshot().sources.is_received());
    assert_eq!(engine.phase(), TurnPhase::Streaming);

    let events = drain(&mut rx);
    assert!(events
        .iter()
        .any(|e| matches!(e, TurnEvent::TurnCompleted { turn: 0, .. })));
    assert!(events
        .iter()
        .all(|e| !matches!(e, TurnEvent::TurnSuperseded { .. })));
}

#[test]
fn test_catch_up_push_completes_observed_streaming_turn() {
    let (engine, _clock) = manual_engine();
    let first = Message::user("AAPL stock price");
    let mut answer = Streamed::new();

    engine.observe(&[first.clone()], StreamStatus::Submitted);
    let reply = answer.push(sources(1));
    engine.observe(&[first.clone(), reply], StreamStatus::Streaming);
    assert_eq!(engine.active_turn(), Some(0));
    let mut rx = engine.subscribe();

    // Reconnect: the transport replays the finished first answer plus two more exchanges
    answer.push(Fragment::ticker("AAPL"));
    answer.push(Fragment::status("Done", true));
    let reply = answer.push(sources(4));
    let messages = vec![
        first,
        reply,
        Message::user("MSFT stock price"),
        Message::assistant(vec![sources(2), Fragment::ticker("MSFT")]),
        Message::user("TSLA stock price"),
        Message::assistant(vec![Fragment::ticker("TSLA")]),
    ];
    engine.observe(&messages, StreamStatus::Ready);

    assert_eq!(engine.phase(), TurnPhase::Complete);
    assert_eq!(engine.history_len(), 3);

    let first_turn = engine.history_entry(0).unwrap();
    assert_eq!(first_turn.sources().len(), 4);
    assert_eq!(first_turn.ticker_symbol(), TickerSymbol::new("AAPL").as_ref());
    assert_eq!(first_turn.status_text(), Some("Done"));

    let second_turn = engine.history_entry(1).unwrap();
    assert_eq!(second_turn.sources().len(), 2);
    assert_eq!(second_turn.ticker_symbol(), TickerSymbol::new("MSFT").as_ref());

    let third_turn = engine.history_entry(2).unwrap();
    assert_eq!(third_turn.ticker_symbol(), TickerSymbol::new("TSLA").as_ref());
    assert_eq!(engine.progress().fraction, 1.0);

    let completed: Vec<usize> = drain(&mut rx)
        .into_iter()
        .filter_map(|e| match e {
            TurnEvent::TurnCompleted { turn, .. } => Some(turn),
            _ => None,
        })
        .collect();
    assert_eq!(completed, vec![0, 1, 2]);
}

#[test]
fn test_resubmission_ingests_previous_tail_before_superseding() {
    let (engine, _clock) = manual_engine();
    let mut rx = engine.subscribe();
    let first = Message::user("AAPL stock price");
    let mut answer = Streamed::new();

    let reply = answer.push(sources(1));
    engine.observe(&[first.clone(), reply], StreamStatus::Streaming);

    // The answer grew in the same push that carries the next query
    let reply = answer.push(Fragment::ticker("AAPL"));
    let second = Message::user("MSFT stock price");
    engine.observe(&[first, reply, second], StreamStatus::Submitted);

    assert_eq!(engine.phase(), TurnPhase::Awaiting);
    let frozen = engine.history_entry(0).unwrap();
    assert_eq!(frozen.sources().len(), 1);
    assert_eq!(frozen.ticker_symbol(), TickerSymbol::new("AAPL").as_ref());

    let events = drain(&mut rx);
    let updated_at = events
        .iter()
        .rposition(|e| matches!(e, TurnEvent::FacetsUpdated { turn: 0, .. }))
        .expect("tail should be applied to the first turn");
    let superseded_at = events
        .iter()
        .position(|e| matches!(e, TurnEvent::TurnSuperseded { turn: 0, by: 1, .. }))
        .expect("first turn should be superseded");
    assert!(updated_at < superseded_at);
}

#[test]
fn test_malformed_fragment_is_reported_and_skipped() {
    let (engine, _clock) = manual_engine();
    let mut rx = engine.subscribe();
    let messages = vec![
        Message::user("q"),
        Message::assistant(vec![
            Fragment::Malformed {
                kind: "data-sources".into(),
                reason: MalformedReason::MissingPayload,
            },
            Fragment::ticker("AAPL"),
        ]),
    ];
    engine.observe(&messages, StreamStatus::Streaming);

    let events = drain(&mut rx);
    assert!(events
        .iter()
        .any(|e| matches!(e, TurnEvent::FragmentIgnored { position: 0, .. })));
    assert!(engine.snapshot().ticker.is_received());
    assert!(!engine.snapshot().sources.is_received());
}

#[test]
fn test_status_completion_is_independent_of_turn_completion() {
    let (engine, _clock) = manual_engine();
    let messages = vec![
        Message::user("q"),
        Message::assistant(vec![Fragment::status("Searching", false)]),
    ];
    engine.observe(&messages, StreamStatus::Ready);

    assert_eq!(engine.phase(), TurnPhase::Complete);
    assert!(!engine.sources_complete());
}

// =============================================================================
// Progress timers (paused tokio time)
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_progress_is_monotonic_and_capped_until_completion() {
    let engine = timed_engine();
    let mut rx = engine.subscribe();
    let query = Message::user("AAPL stock price");
    engine.observe(&[query.clone()], StreamStatus::Submitted);
    assert!(engine.timers_armed());

    // Well past the 8 second estimate
    tokio::time::sleep(Duration::from_millis(12_500)).await;

    let fractions: Vec<f64> = drain(&mut rx)
        .into_iter()
        .filter_map(|e| match e {
            TurnEvent::ProgressTicked { fraction, .. } => Some(fraction),
            _ => None,
        })
        .collect();
    assert_eq!(fractions.len(), 12);
    assert!(fractions.windows(2).all(|w| w[0] <= w[1]));
    assert!(fractions.iter().all(|f| *f <= 0.95));
    assert_eq!(engine.progress().remaining_secs, 0);
    assert!((engine.progress().fraction - 0.95).abs() < 1e-9);

    let reply = Message::assistant(vec![Fragment::text("done")]);
    engine.observe(&[query, reply], StreamStatus::Ready);
    assert_eq!(engine.progress().fraction, 1.0);
    assert!(!engine.timers_armed());

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(drain(&mut rx)
        .iter()
        .all(|e| !matches!(e, TurnEvent::ProgressTicked { .. })));
}

#[tokio::test(start_paused = true)]
async fn test_resubmission_cancels_first_turn_timers() {
    let engine = timed_engine();
    let mut rx = engine.subscribe();
    let first = Message::user("AAPL stock price");
    engine.observe(&[first.clone()], StreamStatus::Submitted);

    let partial = Message::assistant(vec![sources(2)]);
    engine.observe(&[first.clone(), partial.clone()], StreamStatus::Streaming);

    tokio::time::sleep(Duration::from_millis(2_500)).await;
    let before = engine.progress();
    assert_eq!(before.turn, Some(0));
    assert_eq!(before.remaining_secs, 6);

    // Second query before the first finished
    let second = Message::user("MSFT stock price");
    engine.observe(&[first, partial, second], StreamStatus::Submitted);
    assert_eq!(engine.phase(), TurnPhase::Awaiting);
    assert_eq!(engine.history_entry(0).unwrap().sources().len(), 2);

    let events = drain(&mut rx);
    let superseded_at = events
        .iter()
        .position(|e| matches!(e, TurnEvent::TurnSuperseded { turn: 0, by: 1, .. }))
        .expect("first turn should be superseded");
    assert!(events[superseded_at..]
        .iter()
        .all(|e| !matches!(e, TurnEvent::ProgressTicked { turn: 0, .. })));

    tokio::time::sleep(Duration::from_millis(3_500)).await;

    let after = drain(&mut rx);
    assert!(after
        .iter()
        .all(|e| e.turn() == 1), "stale timer fired: {:?}", after);
    assert!(after
        .iter()
        .any(|e| matches!(e, TurnEvent::ProgressTicked { turn: 1, .. })));

    let progress = engine.progress();
    assert_eq!(progress.turn, Some(1));
    assert_eq!(progress.elapsed_secs, 3);
}

#[tokio::test(start_paused = true)]
async fn test_random_jitter_estimate_stays_in_bounds() {
    let engine = ReconciliationEngine::new(ProgressConfig::default()).unwrap();
    let mut rx = engine.subscribe();
    let long_query = "x".repeat(4_000);
    engine.observe(&[Message::user(long_query)], StreamStatus::Submitted);

    let total = drain(&mut rx)
        .into_iter()
        .find_map(|e| match e {
            TurnEvent::TurnAwaiting {
                estimated_total_secs,
                ..
            } => Some(estimated_total_secs),
            _ => None,
        })
        .unwrap();
    assert!((18..=20).contains(&total));
}

#[tokio::test(start_paused = true)]
async fn test_step_labels_cycle_while_awaiting() {
    let engine = timed_engine();
    engine.observe(&[Message::user("q")], StreamStatus::Submitted);
    assert_eq!(engine.progress().step_label.as_deref(), Some("Queuing request"));

    // Normal speed advances every second
    tokio::time::sleep(Duration::from_millis(2_500)).await;
    assert_eq!(engine.progress().step_index, 2);
    assert_eq!(engine.progress().step_label.as_deref(), Some("Fetching content"));
}
