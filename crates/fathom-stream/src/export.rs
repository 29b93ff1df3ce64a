//! Export of a finished answer as markdown, JSON, or a citation list.

use serde::Serialize;

use fathom_core::types::Source;

use crate::error::Result;
use crate::pairing::TurnView;

/// Number of sources opened by "open top sources".
pub const TOP_SOURCES: usize = 5;

/// A query, its answer and the sources backing it.
#[derive(Debug, Clone, Serialize)]
pub struct AnswerExport<'a> {
    pub query: &'a str,
    pub answer: &'a str,
    pub sources: &'a [Source],
}

impl<'a> AnswerExport<'a> {
    pub fn new(query: &'a str, answer: &'a str, sources: &'a [Source]) -> Self {
        Self {
            query,
            answer,
            sources,
        }
    }

    pub fn from_turn(turn: &'a TurnView) -> Self {
        Self {
            query: &turn.query,
            answer: turn.answer.as_deref().unwrap_or(""),
            sources: turn.facets.sources(),
        }
    }

    /// Markdown document with the query as heading. `None` when there is nothing to export.
    pub fn to_markdown(&self) -> Option<String> {
        let query = self.query.trim();
        let answer = self.answer.trim();
        if query.is_empty() && answer.is_empty() {
            return None;
        }

        let mut lines: Vec<String> = Vec::new();
        if !query.is_empty() {
            lines.push(format!("# {}", query));
        }
        if !answer.is_empty() {
            if !lines.is_empty() {
                lines.push(String::new());
            }
            lines.push(answer.to_string());
        }
        if !self.sources.is_empty() {
            lines.push(String::new());
            lines.push("## Sources".to_string());
            for (i, source) in self.sources.iter().enumerate() {
                let title = display_title(source);
                let site = source.site_label();
                let suffix = if site.is_empty() {
                    String::new()
                } else {
                    format!(" — {}", site)
                };
                lines.push(format!("{}. [{}]({}){}", i + 1, title, source.url, suffix));
            }
        }
        Some(lines.join("\n"))
    }

    /// Pretty-printed JSON of query, answer and sources.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Numbered citation list, one entry per source. `None` without sources.
    pub fn citations(&self) -> Option<String> {
        if self.sources.is_empty() {
            return None;
        }
        let entries: Vec<String> = self
            .sources
            .iter()
            .enumerate()
            .map(|(i, source)| {
                let site = source.site_label();
                let heading = if site.is_empty() {
                    format!("{}. {}", i + 1, display_title(source))
                } else {
                    format!("{}. {} — {}", i + 1, display_title(source), site)
                };
                format!("{}\n{}", heading, source.url)
            })
            .collect();
        Some(entries.join("\n\n"))
    }

    /// Urls of the first [`TOP_SOURCES`] sources.
    pub fn top_source_urls(&self) -> Vec<&'a str> {
        self.sources
            .iter()
            .take(TOP_SOURCES)
            .map(|s| s.url.as_str())
            .collect()
    }
}

fn display_title(source: &Source) -> &str {
    if source.title.trim().is_empty() {
        &source.url
    } else {
        &source.title
    }
}
