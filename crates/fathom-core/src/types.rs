use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// =============================================================================
// Enums
// =============================================================================

/// Author of a message in the conversation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
        }
    }
}

/// Lifecycle status reported by the transport alongside each message push.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamStatus {
    /// A query was handed to the backend; no response bytes yet.
    Submitted,
    /// Response fragments are arriving.
    Streaming,
    /// The last response finished (or nothing was ever sent).
    #[default]
    Ready,
    /// The last response ended with a transport error.
    Error,
}

impl StreamStatus {
    /// Whether a response is still being produced.
    pub fn is_in_flight(&self) -> bool {
        matches!(self, StreamStatus::Submitted | StreamStatus::Streaming)
    }
}

/// Discriminant of a [`Fragment`], used for logging and event payloads.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FragmentKind {
    Text,
    Sources,
    Ticker,
    FollowUp,
    Status,
    Malformed,
}

impl fmt::Display for FragmentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FragmentKind::Text => "text",
            FragmentKind::Sources => "sources",
            FragmentKind::Ticker => "ticker",
            FragmentKind::FollowUp => "followup",
            FragmentKind::Status => "status",
            FragmentKind::Malformed => "malformed",
        };
        f.write_str(name)
    }
}

// =============================================================================
// Facet entities
// =============================================================================

/// A web page retrieved for the answer. Keyed by `url` within one turn.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Source {
    pub url: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub site_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub favicon: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    /// Characters of raw content retrieved. Only drives a cosmetic counter.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_length: Option<usize>,
}

impl Source {
    pub fn new(url: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            title: title.into(),
            site_name: None,
            favicon: None,
            image: None,
            content_length: None,
        }
    }

    /// Display label for the site: the site name, or the url host without `www.`.
    pub fn site_label(&self) -> String {
        match self.site_name.as_deref() {
            Some(name) if !name.trim().is_empty() => name.to_string(),
            _ => host_of(&self.url).unwrap_or_default(),
        }
    }
}

/// A news article surfaced alongside the answer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewsItem {
    pub url: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snippet: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

/// An image result surfaced alongside the answer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageItem {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
}

/// A financial ticker symbol detected for the query (e.g. `AAPL`).
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TickerSymbol(String);

impl TickerSymbol {
    /// Create a symbol, trimming whitespace. Returns `None` for a blank symbol.
    pub fn new(symbol: impl AsRef<str>) -> Option<Self> {
        let trimmed = symbol.as_ref().trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(Self(trimmed.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TickerSymbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Human-readable backend status line.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    pub message: String,
    /// When true, the backend has finished gathering sources.
    pub is_complete: bool,
}

/// Payload of a `sources` fragment. The three lists always travel together.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourcesPayload {
    pub sources: Vec<Source>,
    pub news: Vec<NewsItem>,
    pub images: Vec<ImageItem>,
}

// =============================================================================
// Fragments and messages
// =============================================================================

/// Why a wire part could not be turned into a usable fragment.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MalformedReason {
    /// The part has no `type` field.
    MissingType,
    /// The `type` is not one the engine understands.
    UnknownKind,
    /// A known kind arrived without its payload.
    MissingPayload,
    /// The payload is present but does not decode.
    Invalid(String),
}

impl fmt::Display for MalformedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MalformedReason::MissingType => write!(f, "part has no type"),
            MalformedReason::UnknownKind => write!(f, "unknown fragment kind"),
            MalformedReason::MissingPayload => write!(f, "missing payload"),
            MalformedReason::Invalid(detail) => write!(f, "invalid payload: {}", detail),
        }
    }
}

/// One incremental unit of a streamed response.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "fragment", rename_all = "snake_case")]
pub enum Fragment {
    Text { text: String },
    Sources(SourcesPayload),
    Ticker { symbol: Option<TickerSymbol> },
    FollowUp { questions: Vec<String> },
    Status(Status),
    /// A fragment the decoder could not classify. Kept so positions stay aligned.
    Malformed { kind: String, reason: MalformedReason },
}

impl Fragment {
    pub fn text(text: impl Into<String>) -> Self {
        Fragment::Text { text: text.into() }
    }

    pub fn ticker(symbol: &str) -> Self {
        Fragment::Ticker {
            symbol: TickerSymbol::new(symbol),
        }
    }

    pub fn status(message: impl Into<String>, is_complete: bool) -> Self {
        Fragment::Status(Status {
            message: message.into(),
            is_complete,
        })
    }

    pub fn kind(&self) -> FragmentKind {
        match self {
            Fragment::Text { .. } => FragmentKind::Text,
            Fragment::Sources(_) => FragmentKind::Sources,
            Fragment::Ticker { .. } => FragmentKind::Ticker,
            Fragment::FollowUp { .. } => FragmentKind::FollowUp,
            Fragment::Status(_) => FragmentKind::Status,
            Fragment::Malformed { .. } => FragmentKind::Malformed,
        }
    }
}

/// A conversation message as exposed by the message store.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub role: Role,
    pub fragments: Vec<Fragment>,
}

impl Message {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            role: Role::User,
            fragments: vec![Fragment::text(text)],
        }
    }

    pub fn assistant(fragments: Vec<Fragment>) -> Self {
        Self {
            id: Uuid::new_v4(),
            role: Role::Assistant,
            fragments,
        }
    }

    pub fn is_user(&self) -> bool {
        self.role == Role::User
    }

    pub fn is_assistant(&self) -> bool {
        self.role == Role::Assistant
    }

    /// Concatenation of all text fragments, in order.
    pub fn text(&self) -> String {
        self.fragments
            .iter()
            .filter_map(|f| match f {
                Fragment::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }
}

// =============================================================================
// Facet snapshot
// =============================================================================

/// One facet of a turn: either not yet received, or the latest received value.
///
/// `Received(vec![])` is an explicit "backend sent nothing", distinct from `Absent`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "value", rename_all = "snake_case")]
pub enum Facet<T> {
    #[default]
    Absent,
    Received(T),
}

impl<T> Facet<T> {
    pub fn is_received(&self) -> bool {
        matches!(self, Facet::Received(_))
    }

    pub fn get(&self) -> Option<&T> {
        match self {
            Facet::Absent => None,
            Facet::Received(value) => Some(value),
        }
    }

    pub fn into_option(self) -> Option<T> {
        match self {
            Facet::Absent => None,
            Facet::Received(value) => Some(value),
        }
    }
}

/// All structured facets of one turn.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FacetSnapshot {
    pub sources: Facet<Vec<Source>>,
    pub news: Facet<Vec<NewsItem>>,
    pub images: Facet<Vec<ImageItem>>,
    pub ticker: Facet<Option<TickerSymbol>>,
    pub follow_ups: Facet<Vec<String>>,
    pub status_text: Facet<String>,
}

impl FacetSnapshot {
    /// Sources for display; empty when absent.
    pub fn sources(&self) -> &[Source] {
        self.sources.get().map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn news(&self) -> &[NewsItem] {
        self.news.get().map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn images(&self) -> &[ImageItem] {
        self.images.get().map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn follow_ups(&self) -> &[String] {
        self.follow_ups.get().map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn ticker_symbol(&self) -> Option<&TickerSymbol> {
        self.ticker.get().and_then(Option::as_ref)
    }

    pub fn status_text(&self) -> Option<&str> {
        self.status_text.get().map(String::as_str)
    }

    /// True when no facet has been received.
    pub fn is_blank(&self) -> bool {
        *self == FacetSnapshot::default()
    }
}

// =============================================================================
// Timestamp
// =============================================================================

/// Unix timestamp in seconds since epoch (UTC).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(pub i64);

impl Timestamp {
    pub fn from_datetime(dt: DateTime<Utc>) -> Self {
        Self(dt.timestamp())
    }

    pub fn to_datetime(&self) -> DateTime<Utc> {
        DateTime::from_timestamp(self.0, 0).unwrap_or_default()
    }
}

/// Host part of an http(s) url with a leading `www.` removed.
pub fn host_of(url: &str) -> Option<String> {
    let rest = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))?;
    let authority = rest.split(['/', '?', '#']).next()?;
    let host = authority.rsplit('@').next()?;
    let host = host.split(':').next()?;
    if host.is_empty() {
        return None;
    }
    Some(host.strip_prefix("www.").unwrap_or(host).to_lowercase())
}

// =============================================================================
// Tests
// =============================================================================
