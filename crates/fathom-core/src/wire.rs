//! Decoding of the transport's JSON message format into domain types.
//!
//! The transport delivers loosely-typed parts (`{"type": "data-sources", "data": {...}}`).
//! Every part decodes to exactly one [`Fragment`]; parts that cannot be classified
//! become [`Fragment::Malformed`] so that fragment positions in a message stay
//! aligned with the raw sequence.

use serde::Deserialize;
use serde_json::Value;
use uuid::Uuid;

use crate::error::{FathomError, Result};
use crate::types::{
    Fragment, ImageItem, MalformedReason, Message, NewsItem, Role, Source, SourcesPayload, Status,
    StreamStatus, TickerSymbol,
};

/// A message as it appears on the wire.
#[derive(Debug, Clone, Deserialize)]
pub struct WireMessage {
    #[serde(default)]
    pub id: Option<Uuid>,
    pub role: Role,
    #[serde(default)]
    pub parts: Vec<Value>,
}

impl WireMessage {
    pub fn into_message(self) -> Message {
        Message {
            id: self.id.unwrap_or_else(Uuid::new_v4),
            role: self.role,
            fragments: self.parts.iter().map(decode_fragment).collect(),
        }
    }
}

/// One push from the transport: the whole message list plus the stream status.
#[derive(Debug, Clone, Deserialize)]
pub struct WireUpdate {
    pub messages: Vec<WireMessage>,
    #[serde(default)]
    pub status: StreamStatus,
}

impl WireUpdate {
    pub fn into_parts(self) -> (Vec<Message>, StreamStatus) {
        let messages = self
            .messages
            .into_iter()
            .map(WireMessage::into_message)
            .collect();
        (messages, self.status)
    }
}

/// Parse one JSON-lines record of a recorded stream transcript.
pub fn parse_update_line(line: &str) -> Result<(Vec<Message>, StreamStatus)> {
    let update: WireUpdate = serde_json::from_str(line)
        .map_err(|e| FathomError::Decode(format!("invalid stream record: {}", e)))?;
    Ok(update.into_parts())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireSource {
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    site_name: Option<String>,
    #[serde(default)]
    favicon: Option<String>,
    #[serde(default)]
    image: Option<String>,
    #[serde(default)]
    markdown: Option<String>,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    content_length: Option<usize>,
}

impl WireSource {
    fn into_source(self) -> Option<Source> {
        let url = self.url.filter(|u| !u.trim().is_empty())?;
        let content_length = self.content_length.or_else(|| {
            self.markdown
                .as_deref()
                .or(self.content.as_deref())
                .map(|text| text.chars().count())
        });
        Some(Source {
            title: self.title.unwrap_or_else(|| url.clone()),
            url,
            site_name: self.site_name,
            favicon: self.favicon,
            image: self.image,
            content_length,
        })
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireSourcesData {
    #[serde(default)]
    sources: Vec<Value>,
    #[serde(default)]
    news_results: Vec<Value>,
    #[serde(default)]
    image_results: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct WireTickerData {
    #[serde(default)]
    symbol: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireFollowUpData {
    questions: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireStatusData {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    is_complete: bool,
}

fn malformed(kind: &str, reason: MalformedReason) -> Fragment {
    Fragment::Malformed {
        kind: kind.to_string(),
        reason,
    }
}

fn invalid(kind: &str, err: serde_json::Error) -> Fragment {
    malformed(kind, MalformedReason::Invalid(err.to_string()))
}

/// Decode a single wire part. Never fails: unusable parts become `Malformed`.
pub fn decode_fragment(part: &Value) -> Fragment {
    let Some(kind) = part.get("type").and_then(Value::as_str) else {
        return malformed("", MalformedReason::MissingType);
    };

    if kind == "text" {
        return match part.get("text").and_then(Value::as_str) {
            Some(text) => Fragment::text(text),
            None => malformed(kind, MalformedReason::MissingPayload),
        };
    }

    let data = match part.get("data") {
        Some(data @ Value::Object(_)) => data.clone(),
        Some(_) if is_known_data_kind(kind) => {
            return malformed(kind, MalformedReason::Invalid("data is not an object".to_string()))
        }
        None if is_known_data_kind(kind) => return malformed(kind, MalformedReason::MissingPayload),
        _ => return malformed(kind, MalformedReason::UnknownKind),
    };

    match kind {
        "data-sources" => match serde_json::from_value::<WireSourcesData>(data) {
            Ok(raw) => Fragment::Sources(decode_sources(raw)),
            Err(e) => invalid(kind, e),
        },
        "data-ticker" => match serde_json::from_value::<WireTickerData>(data) {
            Ok(raw) => Fragment::Ticker {
                symbol: raw.symbol.as_deref().and_then(TickerSymbol::new),
            },
            Err(e) => invalid(kind, e),
        },
        "data-followup" => match serde_json::from_value::<WireFollowUpData>(data) {
            Ok(raw) => Fragment::FollowUp {
                questions: raw
                    .questions
                    .into_iter()
                    .map(|q| q.trim().to_string())
                    .filter(|q| !q.is_empty())
                    .collect(),
            },
            Err(e) => invalid(kind, e),
        },
        "data-status" => match serde_json::from_value::<WireStatusData>(data) {
            Ok(raw) => Fragment::Status(Status {
                message: raw.message.unwrap_or_default(),
                is_complete: raw.is_complete,
            }),
            Err(e) => invalid(kind, e),
        },
        _ => malformed(kind, MalformedReason::UnknownKind),
    }
}

fn is_known_data_kind(kind: &str) -> bool {
    matches!(
        kind,
        "data-sources" | "data-ticker" | "data-followup" | "data-status"
    )
}

fn decode_sources(raw: WireSourcesData) -> SourcesPayload {
    let sources = raw
        .sources
        .into_iter()
        .filter_map(|value| match serde_json::from_value::<WireSource>(value) {
            Ok(source) => {
                let decoded = source.into_source();
                if decoded.is_none() {
                    tracing::warn!("Dropping source entry without url");
                }
                decoded
            }
            Err(e) => {
                tracing::warn!(error = %e, "Dropping undecodable source entry");
                None
            }
        })
        .collect();

    SourcesPayload {
        sources,
        news: decode_entries::<NewsItem>(raw.news_results, "news"),
        images: decode_entries::<ImageItem>(raw.image_results, "image"),
    }
}

fn decode_entries<T: for<'de> Deserialize<'de>>(values: Vec<Value>, label: &str) -> Vec<T> {
    values
        .into_iter()
        .filter_map(|value| match serde_json::from_value::<T>(value) {
            Ok(entry) => Some(entry),
            Err(e) => {
                tracing::warn!(entry = label, error = %e, "Dropping undecodable entry");
                None
            }
        })
        .collect()
}
