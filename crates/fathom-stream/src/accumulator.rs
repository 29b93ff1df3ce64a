//! Live facet state of the active turn.

use std::collections::HashSet;

use fathom_core::config::ProgressConfig;
use fathom_core::types::{Facet, FacetSnapshot, Fragment, Source};

use crate::demux::{demultiplex, FacetUpdates};
use crate::history::TurnHistory;
use crate::progress::ProgressEstimator;

/// Owns the live snapshot and progress state of the active turn.
///
/// The snapshot only ever changes through [`TurnAccumulator::apply_updates`],
/// and once a turn is frozen into history it refuses updates until the next
/// [`TurnAccumulator::begin_turn_at`].
#[derive(Debug, Clone)]
pub struct TurnAccumulator {
    active_turn: Option<usize>,
    snapshot: FacetSnapshot,
    processed: usize,
    sources_complete: bool,
    frozen: bool,
    progress: ProgressEstimator,
}

impl TurnAccumulator {
    pub fn new(tuning: ProgressConfig) -> Self {
        Self {
            active_turn: None,
            snapshot: FacetSnapshot::default(),
            processed: 0,
            sources_complete: false,
            frozen: false,
            progress: ProgressEstimator::new(tuning),
        }
    }

    pub fn active_turn(&self) -> Option<usize> {
        self.active_turn
    }

    pub fn snapshot(&self) -> &FacetSnapshot {
        &self.snapshot
    }

    /// Fragments of the active response already demultiplexed.
    pub fn processed(&self) -> usize {
        self.processed
    }

    pub fn sources_complete(&self) -> bool {
        self.sources_complete
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    pub fn progress(&self) -> &ProgressEstimator {
        &self.progress
    }

    pub fn progress_mut(&mut self) -> &mut ProgressEstimator {
        &mut self.progress
    }

    /// Start the turn after the current one. Returns its index.
    pub fn begin_turn(&mut self) -> usize {
        let next = self.active_turn.map_or(0, |turn| turn + 1);
        self.begin_turn_at(next);
        next
    }

    /// Make `turn` the active turn with a blank snapshot.
    ///
    /// Progress already running for `turn` (started while the query was
    /// awaiting its response) is kept. Progress belonging to any other turn
    /// is dropped.
    pub fn begin_turn_at(&mut self, turn: usize) {
        if let Some(previous) = self.active_turn {
            if !self.frozen && previous != turn {
                tracing::warn!(previous, turn, "Starting a turn while the previous one is unfrozen");
            }
        }
        if self.progress.turn() != Some(turn) {
            self.progress.reset();
        }
        self.active_turn = Some(turn);
        self.snapshot = FacetSnapshot::default();
        self.processed = 0;
        self.sources_complete = false;
        self.frozen = false;
        tracing::info!(turn, "Turn started");
    }

    /// Demultiplex the unprocessed tail of `fragments` and apply it.
    ///
    /// Returns `None` when there is no active turn or it is already frozen.
    pub fn ingest(&mut self, fragments: &[Fragment]) -> Option<FacetUpdates> {
        let turn = self.active_turn?;
        if self.frozen {
            if fragments.len() > self.processed {
                tracing::debug!(turn, "Turn is frozen; ignoring late fragments");
            }
            return None;
        }
        let result = demultiplex(fragments, self.processed);
        self.processed = result.processed;
        self.apply_updates(&result.updates);
        Some(result.updates)
    }

    /// Replace each facet named in `updates`. Returns false if the turn is frozen.
    ///
    /// Sources, news and images are replaced together from a single payload,
    /// with sources deduplicated by url keeping the first occurrence.
    pub fn apply_updates(&mut self, updates: &FacetUpdates) -> bool {
        if self.frozen {
            return false;
        }
        if let Some(payload) = &updates.sources {
            self.snapshot.sources = Facet::Received(dedup_by_url(&payload.sources));
            self.snapshot.news = Facet::Received(payload.news.clone());
            self.snapshot.images = Facet::Received(payload.images.clone());
        }
        if let Some(ticker) = &updates.ticker {
            self.snapshot.ticker = Facet::Received(ticker.clone());
        }
        if let Some(questions) = &updates.follow_ups {
            self.snapshot.follow_ups = Facet::Received(questions.clone());
        }
        if let Some(status) = &updates.status {
            self.snapshot.status_text = Facet::Received(status.message.clone());
        }
        if updates.sources_complete && !self.sources_complete {
            tracing::debug!(turn = ?self.active_turn, "Sources complete");
            self.sources_complete = true;
        }
        true
    }

    /// Copy the live snapshot into `history` and stop accepting updates.
    ///
    /// Returns the frozen turn index, or `None` if there was nothing to freeze.
    pub fn freeze(&mut self, history: &mut TurnHistory) -> Option<usize> {
        let turn = self.active_turn?;
        if self.frozen {
            return None;
        }
        self.frozen = true;
        history.put(turn, self.snapshot.clone());
        tracing::info!(
            turn,
            sources = self.snapshot.sources().len(),
            follow_ups = self.snapshot.follow_ups().len(),
            "Turn frozen into history"
        );
        Some(turn)
    }

    /// Forget everything (conversation cleared).
    pub fn reset(&mut self) {
        self.progress.reset();
        self.active_turn = None;
        self.snapshot = FacetSnapshot::default();
        self.processed = 0;
        self.sources_complete = false;
        self.frozen = false;
    }
}

fn dedup_by_url(sources: &[Source]) -> Vec<Source> {
    let mut seen = HashSet::new();
    let mut unique = Vec::with_capacity(sources.len());
    for source in sources {
        if seen.insert(source.url.as_str()) {
            unique.push(source.clone());
        } else {
            tracing::debug!(url = %source.url, "Dropping duplicate source");
        }
    }
    unique
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use fathom_core::types::{ImageItem, NewsItem, SourcesPayload, TickerSymbol};

    fn accumulator() -> TurnAccumulator {
        TurnAccumulator::new(ProgressConfig::default())
    }

    fn sources_fragment(urls: &[&str]) -> Fragment {
        Fragment::Sources(SourcesPayload {
            sources: urls.iter().map(|u| Source::new(*u, *u)).collect(),
            news: vec![NewsItem {
                url: "https://news.example/a".into(),
                title: "A".into(),
                snippet: None,
                source: None,
                date: None,
                image: None,
            }],
            images: vec![ImageItem {
                url: "https://img.example/1.png".into(),
                title: None,
                thumbnail: None,
                source: None,
                width: None,
                height: None,
            }],
        })
    }

    #[test]
    fn test_begin_turn_resets_snapshot() {
        let mut acc = accumulator();
        assert_eq!(acc.begin_turn(), 0);
        acc.ingest(&[Fragment::ticker("AAPL")]);
        assert!(acc.snapshot().ticker.is_received());

        assert_eq!(acc.begin_turn(), 1);
        assert!(acc.snapshot().is_blank());
        assert_eq!(acc.processed(), 0);
        assert!(!acc.sources_complete());
    }

    #[test]
    fn test_ingest_without_turn_is_noop() {
        let mut acc = accumulator();
        assert!(acc.ingest(&[Fragment::ticker("AAPL")]).is_none());
        assert!(acc.snapshot().is_blank());
    }

    #[test]
    fn test_sources_group_replaced_together() {
        let mut acc = accumulator();
        acc.begin_turn();
        acc.ingest(&[sources_fragment(&["https://a.com", "https://b.com"])]);
        let snapshot = acc.snapshot();
        assert_eq!(snapshot.sources().len(), 2);
        assert_eq!(snapshot.news().len(), 1);
        assert_eq!(snapshot.images().len(), 1);
    }

    #[test]
    fn test_sources_are_deduplicated_by_url() {
        let mut acc = accumulator();
        acc.begin_turn();
        acc.ingest(&[sources_fragment(&[
            "https://a.com",
            "https://b.com",
            "https://a.com",
        ])]);
        let urls: Vec<&str> = acc.snapshot().sources().iter().map(|s| s.url.as_str()).collect();
        assert_eq!(urls, vec!["https://a.com", "https://b.com"]);
    }

    #[test]
    fn test_incremental_ingest_keeps_earlier_facets() {
        let mut acc = accumulator();
        acc.begin_turn();
        let mut fragments = vec![Fragment::ticker("AAPL")];
        acc.ingest(&fragments);

        fragments.push(Fragment::status("Searching", false));
        let updates = acc.ingest(&fragments).unwrap();
        assert!(updates.ticker.is_none());

        let snapshot = acc.snapshot();
        assert_eq!(snapshot.ticker_symbol(), TickerSymbol::new("AAPL").as_ref());
        assert_eq!(snapshot.status_text(), Some("Searching"));
        assert_eq!(acc.processed(), 2);
    }

    #[test]
    fn test_sources_complete_is_sticky_within_turn() {
        let mut acc = accumulator();
        acc.begin_turn();
        let mut fragments = vec![Fragment::status("Sources ready", true)];
        acc.ingest(&fragments);
        fragments.push(Fragment::status("Writing", false));
        acc.ingest(&fragments);
        assert!(acc.sources_complete());
    }

    #[test]
    fn test_freeze_blocks_further_updates() {
        let mut acc = accumulator();
        let mut history = TurnHistory::new();
        acc.begin_turn();
        let mut fragments = vec![sources_fragment(&["https://a.com"])];
        acc.ingest(&fragments);

        assert_eq!(acc.freeze(&mut history), Some(0));
        assert!(acc.is_frozen());
        assert_eq!(acc.freeze(&mut history), None);

        fragments.push(sources_fragment(&["https://x.com", "https://y.com"]));
        assert!(acc.ingest(&fragments).is_none());
        assert_eq!(acc.snapshot().sources().len(), 1);
        assert_eq!(history.get(0).unwrap().sources().len(), 1);
    }

    #[test]
    fn test_begin_turn_keeps_progress_for_same_turn() {
        let mut acc = accumulator();
        acc.progress_mut().start_with_jitter(0, 10, Utc::now(), 0);
        let generation = acc.progress().generation();

        acc.begin_turn_at(0);
        assert!(acc.progress().is_current(generation));

        acc.begin_turn_at(1);
        assert!(!acc.progress().is_current(generation));
        assert!(acc.progress().state().is_none());
    }

    #[test]
    fn test_reset() {
        let mut acc = accumulator();
        acc.begin_turn();
        acc.ingest(&[Fragment::ticker("AAPL")]);
        acc.reset();
        assert!(acc.active_turn().is_none());
        assert!(acc.snapshot().is_blank());
    }
}
