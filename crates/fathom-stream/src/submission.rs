//! Query submission gate.
//!
//! Decides whether a query may be sent now, must wait for a credential, or is
//! rejected outright.

use fathom_core::config::SubmissionConfig;

use crate::error::{Result, StreamError};

/// Result of a successful submission attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Send this (trimmed) query to the backend now.
    Accepted(String),
    /// Held until a credential is provided.
    Deferred,
}

#[derive(Debug, Clone)]
pub struct SubmissionGate {
    max_query_chars: usize,
    credential_present: bool,
    pending: Option<String>,
}

impl SubmissionGate {
    pub fn new(config: &SubmissionConfig, credential_present: bool) -> Self {
        Self {
            max_query_chars: config.max_query_chars,
            credential_present,
            pending: None,
        }
    }

    pub fn credential_present(&self) -> bool {
        self.credential_present
    }

    pub fn pending(&self) -> Option<&str> {
        self.pending.as_deref()
    }

    /// Validate `query` against the gate. `busy` is true while a turn is in flight.
    pub fn submit(&mut self, query: &str, busy: bool) -> Result<SubmitOutcome> {
        let query = query.trim();
        if query.is_empty() {
            return Err(StreamError::EmptyQuery);
        }
        let chars = query.chars().count();
        if chars > self.max_query_chars {
            return Err(StreamError::QueryTooLong {
                max: self.max_query_chars,
                actual: chars,
            });
        }
        if busy {
            tracing::debug!("Submission rejected while a response is in progress");
            return Err(StreamError::Busy);
        }
        if !self.credential_present {
            tracing::info!(chars, "No credential configured; holding query");
            self.pending = Some(query.to_string());
            return Ok(SubmitOutcome::Deferred);
        }
        Ok(SubmitOutcome::Accepted(query.to_string()))
    }

    /// Record that a credential is now available. Returns the held query, if any.
    pub fn credential_provided(&mut self) -> Option<String> {
        self.credential_present = true;
        let pending = self.pending.take();
        if pending.is_some() {
            tracing::info!("Releasing held query");
        }
        pending
    }
}
