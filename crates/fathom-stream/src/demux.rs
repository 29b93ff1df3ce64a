//! Fragment demultiplexer.
//!
//! Classifies the not-yet-processed fragments of the most recent message into
//! facet kinds and keeps only the latest value of each kind. The caller owns
//! the processed count and passes it in by value; calling again with the same
//! count yields the same result, and calling with the returned count yields
//! nothing.

use fathom_core::types::{
    Fragment, FragmentKind, MalformedReason, SourcesPayload, Status, TickerSymbol,
};

/// A fragment that was skipped because it could not be classified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IgnoredFragment {
    /// Position of the fragment within its message.
    pub position: usize,
    pub kind: String,
    pub reason: MalformedReason,
}

/// Latest-value updates extracted from one batch of fragments.
///
/// At most one value per facet kind. `None` means "no fragment of this kind in
/// the batch", which is different from a fragment carrying an empty value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FacetUpdates {
    pub sources: Option<SourcesPayload>,
    pub ticker: Option<Option<TickerSymbol>>,
    pub follow_ups: Option<Vec<String>>,
    pub status: Option<Status>,
    /// A status fragment in the batch reported `is_complete`.
    pub sources_complete: bool,
    pub ignored: Vec<IgnoredFragment>,
}

impl FacetUpdates {
    /// True when the batch carries no facet value and no completion signal.
    pub fn is_empty(&self) -> bool {
        self.sources.is_none()
            && self.ticker.is_none()
            && self.follow_ups.is_none()
            && self.status.is_none()
            && !self.sources_complete
    }

    /// Facet kinds replaced by this batch, in a stable order.
    pub fn kinds(&self) -> Vec<FragmentKind> {
        let mut kinds = Vec::new();
        if self.sources.is_some() {
            kinds.push(FragmentKind::Sources);
        }
        if self.ticker.is_some() {
            kinds.push(FragmentKind::Ticker);
        }
        if self.follow_ups.is_some() {
            kinds.push(FragmentKind::FollowUp);
        }
        if self.status.is_some() {
            kinds.push(FragmentKind::Status);
        }
        kinds
    }
}

/// Result of one demultiplexer pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Demultiplexed {
    pub updates: FacetUpdates,
    /// Number of fragments processed after this pass. Store it for the next call.
    pub processed: usize,
}

/// Demultiplex `fragments[already_processed..]`.
pub fn demultiplex(fragments: &[Fragment], already_processed: usize) -> Demultiplexed {
    if already_processed > fragments.len() {
        tracing::warn!(
            processed = already_processed,
            fragments = fragments.len(),
            "Fragment sequence shrank below the processed count; nothing to apply"
        );
        return Demultiplexed {
            updates: FacetUpdates::default(),
            processed: already_processed,
        };
    }

    let mut updates = FacetUpdates::default();

    for (offset, fragment) in fragments[already_processed..].iter().enumerate() {
        let position = already_processed + offset;
        match fragment {
            Fragment::Text { .. } => {}
            Fragment::Sources(payload) => updates.sources = Some(payload.clone()),
            Fragment::Ticker { symbol } => updates.ticker = Some(symbol.clone()),
            Fragment::FollowUp { questions } => updates.follow_ups = Some(questions.clone()),
            Fragment::Status(status) => {
                if status.is_complete {
                    updates.sources_complete = true;
                }
                updates.status = Some(status.clone());
            }
            Fragment::Malformed { kind, reason } => {
                match reason {
                    MalformedReason::UnknownKind => {
                        tracing::debug!(position, kind = %kind, "Ignoring fragment of unknown kind");
                    }
                    _ => {
                        tracing::warn!(position, kind = %kind, reason = %reason, "Ignoring malformed fragment");
                    }
                }
                updates.ignored.push(IgnoredFragment {
                    position,
                    kind: kind.clone(),
                    reason: reason.clone(),
                });
            }
        }
    }

    tracing::trace!(
        from = already_processed,
        to = fragments.len(),
        kinds = ?updates.kinds(),
        "Demultiplexed fragment batch"
    );

    Demultiplexed {
        updates,
        processed: fragments.len(),
    }
}
