use std::fmt;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use super::{Database, Iter, MovieId, TryFromKeyValue};
use crate::filter::ParsedQuery;

/// The experimental condition a participant is working in.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Deserialize,
    Serialize,
    clap::ValueEnum,
)]
#[serde(rename_all = "snake_case")]
#[value(rename_all = "snake_case")]
pub(crate) enum Interface {
    Faceted,
    LlmAssist,
    LlmOnly,
}

impl Interface {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Interface::Faceted => "faceted",
            Interface::LlmAssist => "llm_assist",
            Interface::LlmOnly => "llm_only",
        }
    }
}

impl fmt::Display for Interface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Event vocabulary. Kinds outside the conventional set are kept verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) enum EventKind {
    TaskStarted,
    TaskCompleted,
    FilterChange,
    NlQuerySent,
    ParsedPreview,
    QueryConfirmed,
    QueryExecuted,
    RetrievalCompleted,
    AnswerGenerated,
    Other(String),
}

impl EventKind {
    pub(crate) fn as_str(&self) -> &str {
        match self {
            EventKind::TaskStarted => "task_started",
            EventKind::TaskCompleted => "task_completed",
            EventKind::FilterChange => "filter_change",
            EventKind::NlQuerySent => "nl_query_sent",
            EventKind::ParsedPreview => "parsed_preview",
            EventKind::QueryConfirmed => "query_confirmed",
            EventKind::QueryExecuted => "query_executed",
            EventKind::RetrievalCompleted => "retrieval_completed",
            EventKind::AnswerGenerated => "answer_generated",
            EventKind::Other(kind) => kind,
        }
    }
}

impl From<&str> for EventKind {
    fn from(kind: &str) -> Self {
        match kind {
            "task_started" => EventKind::TaskStarted,
            "task_completed" => EventKind::TaskCompleted,
            "filter_change" => EventKind::FilterChange,
            "nl_query_sent" => EventKind::NlQuerySent,
            "parsed_preview" => EventKind::ParsedPreview,
            "query_confirmed" => EventKind::QueryConfirmed,
            "query_executed" => EventKind::QueryExecuted,
            "retrieval_completed" => EventKind::RetrievalCompleted,
            "answer_generated" => EventKind::AnswerGenerated,
            other => EventKind::Other(other.to_string()),
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether an answer came from the model or from the count-only template.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum AnswerSource {
    #[default]
    Model,
    Fallback,
}

/// What the participant handed in at the end of a task. Anything beyond the
/// selected ids is kept as submitted.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub(crate) struct Submission {
    #[serde(default)]
    pub(crate) selected_movie_ids: Vec<MovieId>,
    #[serde(flatten)]
    pub(crate) extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub(crate) struct NlQuery {
    pub(crate) query: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub(crate) struct ParsedQueryPayload {
    pub(crate) parsed_query: ParsedQuery,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub(crate) struct QueryResults {
    pub(crate) result_count: usize,
    pub(crate) result_ids: Vec<MovieId>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub(crate) struct Retrieval {
    pub(crate) retrieved_count: usize,
    pub(crate) retrieved_ids: Vec<MovieId>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub(crate) struct GeneratedAnswer {
    pub(crate) answer: String,
    pub(crate) result_count: usize,
    #[serde(default)]
    pub(crate) source: AnswerSource,
}

/// An event's kind together with its payload. On the wire this is the pair
/// `event_type` / `payload`; a known kind whose payload does not have the
/// expected shape is kept as [`EventData::Other`].
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(from = "RawEventData", into = "RawEventData")]
pub(crate) enum EventData {
    TaskStarted,
    TaskCompleted(Submission),
    FilterChange(ParsedQuery),
    NlQuerySent(NlQuery),
    ParsedPreview(ParsedQueryPayload),
    QueryConfirmed(ParsedQueryPayload),
    QueryExecuted(QueryResults),
    RetrievalCompleted(Retrieval),
    AnswerGenerated(GeneratedAnswer),
    Other { event_type: String, payload: Value },
}

impl EventData {
    pub(crate) fn kind(&self) -> EventKind {
        match self {
            EventData::TaskStarted => EventKind::TaskStarted,
            EventData::TaskCompleted(_) => EventKind::TaskCompleted,
            EventData::FilterChange(_) => EventKind::FilterChange,
            EventData::NlQuerySent(_) => EventKind::NlQuerySent,
            EventData::ParsedPreview(_) => EventKind::ParsedPreview,
            EventData::QueryConfirmed(_) => EventKind::QueryConfirmed,
            EventData::QueryExecuted(_) => EventKind::QueryExecuted,
            EventData::RetrievalCompleted(_) => EventKind::RetrievalCompleted,
            EventData::AnswerGenerated(_) => EventKind::AnswerGenerated,
            EventData::Other { event_type, .. } => EventKind::from(event_type.as_str()),
        }
    }

    /// Builds event data from a kind name and an arbitrary payload.
    pub(crate) fn new(event_type: &str, payload: Value) -> Self {
        RawEventData {
            event_type: event_type.to_string(),
            payload,
        }
        .into()
    }

    pub(crate) fn results(ids: Vec<MovieId>) -> Self {
        EventData::QueryExecuted(QueryResults {
            result_count: ids.len(),
            result_ids: ids,
        })
    }
}

#[derive(Deserialize, Serialize)]
struct RawEventData {
    event_type: String,
    #[serde(default)]
    payload: Value,
}

fn typed<T: DeserializeOwned>(payload: &Value) -> Option<T> {
    serde_json::from_value(payload.clone()).ok()
}

impl From<RawEventData> for EventData {
    fn from(raw: RawEventData) -> Self {
        let payload = &raw.payload;
        let data = match EventKind::from(raw.event_type.as_str()) {
            EventKind::TaskStarted => Some(EventData::TaskStarted),
            EventKind::TaskCompleted => {
                if payload.is_null() {
                    Some(EventData::TaskCompleted(Submission::default()))
                } else {
                    typed(payload).map(EventData::TaskCompleted)
                }
            }
            EventKind::FilterChange => Some(EventData::FilterChange(ParsedQuery::from(
                payload.clone(),
            ))),
            EventKind::NlQuerySent => typed(payload).map(EventData::NlQuerySent),
            EventKind::ParsedPreview => typed(payload).map(EventData::ParsedPreview),
            EventKind::QueryConfirmed => typed(payload).map(EventData::QueryConfirmed),
            EventKind::QueryExecuted => typed(payload).map(EventData::QueryExecuted),
            EventKind::RetrievalCompleted => typed(payload).map(EventData::RetrievalCompleted),
            EventKind::AnswerGenerated => typed(payload).map(EventData::AnswerGenerated),
            EventKind::Other(_) => None,
        };
        data.unwrap_or_else(|| {
            debug!(event_type = %raw.event_type, "keeping event payload untyped");
            EventData::Other {
                event_type: raw.event_type,
                payload: raw.payload,
            }
        })
    }
}

impl From<EventData> for RawEventData {
    fn from(data: EventData) -> Self {
        let event_type = data.kind().as_str().to_string();
        // Payload types serialize to plain JSON objects, so conversion cannot fail.
        let payload = match data {
            EventData::TaskStarted => Value::Object(Map::new()),
            EventData::TaskCompleted(submission) => to_value(submission),
            EventData::FilterChange(query) => to_value(query),
            EventData::NlQuerySent(query) => to_value(query),
            EventData::ParsedPreview(parsed) | EventData::QueryConfirmed(parsed) => {
                to_value(parsed)
            }
            EventData::QueryExecuted(results) => to_value(results),
            EventData::RetrievalCompleted(retrieval) => to_value(retrieval),
            EventData::AnswerGenerated(answer) => to_value(answer),
            EventData::Other { payload, .. } => payload,
        };
        RawEventData {
            event_type,
            payload,
        }
    }
}

fn to_value<T: Serialize>(payload: T) -> Value {
    serde_json::to_value(payload).unwrap_or_default()
}

/// An immutable, timestamped interaction fact.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub(crate) struct Event {
    #[serde(default)]
    pub(crate) id: u64,
    pub(crate) timestamp: DateTime<Utc>,
    pub(crate) participant_id: String,
    pub(crate) interface: Interface,
    pub(crate) task_id: Option<String>,
    #[serde(flatten)]
    pub(crate) data: EventData,
}

impl Event {
    pub(crate) fn new(
        participant_id: &str,
        interface: Interface,
        task_id: Option<&str>,
        data: EventData,
    ) -> Self {
        Self {
            id: 0,
            timestamp: Utc::now(),
            participant_id: participant_id.to_string(),
            interface,
            task_id: task_id.map(str::to_string),
            data,
        }
    }

    #[cfg(test)]
    #[must_use]
    pub(crate) fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub(crate) fn kind(&self) -> EventKind {
        self.data.kind()
    }
}

impl TryFromKeyValue for Event {
    fn try_from_key_value(key: &[u8], value: &[u8]) -> Result<Self> {
        let id = u64::from_be_bytes(
            key.try_into()
                .with_context(|| format!("invalid event key {key:02x?}"))?,
        );
        let mut event: Event = serde_json::from_slice(value)
            .with_context(|| format!("invalid event record {id}"))?;
        event.id = id;
        Ok(event)
    }
}

#[derive(Debug, Default, Clone)]
pub(crate) struct EventFilter {
    pub(crate) participant_id: Option<String>,
    pub(crate) task_id: Option<String>,
    pub(crate) interface: Option<Interface>,
}

impl EventFilter {
    fn matches(&self, event: &Event) -> bool {
        self.participant_id
            .as_ref()
            .is_none_or(|id| *id == event.participant_id)
            && self
                .task_id
                .as_ref()
                .is_none_or(|id| event.task_id.as_ref() == Some(id))
            && self.interface.is_none_or(|i| i == event.interface)
    }
}

impl Database {
    /// Appends an event under a fresh monotonic id and returns it as stored.
    pub(crate) fn append_event(&self, mut event: Event) -> Result<Event> {
        event.id = self.db.generate_id()?;
        self.event_tree
            .insert(event.id.to_be_bytes(), serde_json::to_vec(&event)?)?;
        debug!(
            id = event.id,
            kind = %event.kind(),
            participant = %event.participant_id,
            "event logged"
        );
        Ok(event)
    }

    /// Returns matching events ordered by timestamp, then by id.
    pub(crate) fn events(&self, filter: &EventFilter) -> Result<Vec<Event>> {
        let mut events = Iter::<Event>::new(self.event_tree.iter())
            .filter(|event| event.as_ref().map_or(true, |event| filter.matches(event)))
            .collect::<Result<Vec<_>>>()?;
        events.sort_by(|a, b| (a.timestamp, a.id).cmp(&(b.timestamp, b.id)));
        Ok(events)
    }
}
