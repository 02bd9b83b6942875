use anyhow::Result;
use serde::Serialize;
use serde_json::Value;

use crate::{
    database::{
        Database, Event, EventData, GeneratedAnswer, Interface, Movie, NlQuery,
        ParsedQueryPayload, Retrieval, Submission,
    },
    engine::QueryEngine,
    filter::{ParsedQuery, STRUCTURED_LIMIT},
    rag::{AnswerSource, RagAnswer, RagPipeline},
    semantic_parsing::SemanticParser,
};

/// Who is acting, and on which task.
#[derive(Debug, Clone)]
pub(crate) struct SessionContext {
    pub(crate) participant_id: String,
    pub(crate) task_id: Option<String>,
}

impl SessionContext {
    pub(crate) fn new(participant_id: &str, task_id: Option<&str>) -> Self {
        Self {
            participant_id: participant_id.to_string(),
            task_id: task_id.map(str::to_string),
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct SearchResponse {
    pub(crate) results: Vec<Movie>,
    pub(crate) count: usize,
}

impl From<Vec<Movie>> for SearchResponse {
    fn from(results: Vec<Movie>) -> Self {
        Self {
            count: results.len(),
            results,
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct ParsePreview {
    pub(crate) parsed_query: ParsedQuery,
    pub(crate) human_readable: String,
}

/// The three interface conditions over one catalog. Every interaction point
/// records its events before returning.
pub(crate) struct Experiment {
    db: Database,
    engine: QueryEngine,
    parser: SemanticParser,
    rag: RagPipeline,
}

impl Experiment {
    pub(crate) fn new(
        db: Database,
        engine: QueryEngine,
        parser: SemanticParser,
        rag: RagPipeline,
    ) -> Self {
        Self {
            db,
            engine,
            parser,
            rag,
        }
    }

    pub(crate) fn log_event(
        &self,
        session: &SessionContext,
        interface: Interface,
        data: EventData,
    ) -> Result<Event> {
        self.db.append_event(Event::new(
            &session.participant_id,
            interface,
            session.task_id.as_deref(),
            data,
        ))
    }

    pub(crate) fn start_task(
        &self,
        session: &SessionContext,
        interface: Interface,
    ) -> Result<Event> {
        self.log_event(session, interface, EventData::TaskStarted)
    }

    pub(crate) fn complete_task(
        &self,
        session: &SessionContext,
        interface: Interface,
        submission: Submission,
    ) -> Result<Event> {
        self.log_event(session, interface, EventData::TaskCompleted(submission))
    }

    /// Manual filtering in the faceted condition.
    pub(crate) fn faceted_search(
        &self,
        session: &SessionContext,
        query: &ParsedQuery,
    ) -> Result<SearchResponse> {
        self.log_event(
            session,
            Interface::Faceted,
            EventData::FilterChange(query.clone()),
        )?;
        let results = self.engine.run(query, STRUCTURED_LIMIT)?;
        self.log_event(session, Interface::Faceted, executed(&results))?;
        Ok(results.into())
    }

    /// First half of the assisted condition: show what the model understood.
    pub(crate) async fn assist_parse(
        &self,
        session: &SessionContext,
        text: &str,
    ) -> Result<ParsePreview> {
        if text.trim().is_empty() {
            let parsed_query = ParsedQuery::default();
            return Ok(ParsePreview {
                human_readable: parsed_query.describe(),
                parsed_query,
            });
        }
        self.log_event(session, Interface::LlmAssist, nl_query(text))?;
        let parsed_query = self.parser.parse(text).await;
        self.log_event(
            session,
            Interface::LlmAssist,
            EventData::ParsedPreview(ParsedQueryPayload {
                parsed_query: parsed_query.clone(),
            }),
        )?;
        Ok(ParsePreview {
            human_readable: parsed_query.describe(),
            parsed_query,
        })
    }

    /// Second half of the assisted condition: run the query the participant
    /// confirmed, possibly after editing it.
    pub(crate) fn assist_execute(
        &self,
        session: &SessionContext,
        query: &ParsedQuery,
    ) -> Result<SearchResponse> {
        self.log_event(
            session,
            Interface::LlmAssist,
            EventData::QueryConfirmed(ParsedQueryPayload {
                parsed_query: query.clone(),
            }),
        )?;
        let results = self.engine.run(query, STRUCTURED_LIMIT)?;
        self.log_event(session, Interface::LlmAssist, executed(&results))?;
        Ok(results.into())
    }

    /// The conversational condition.
    pub(crate) async fn llm_only_search(
        &self,
        session: &SessionContext,
        text: &str,
    ) -> Result<RagAnswer> {
        if text.trim().is_empty() {
            return Ok(RagAnswer {
                answer: String::new(),
                evidence: Vec::new(),
                parsed_query: ParsedQuery::default(),
                source: AnswerSource::Fallback,
            });
        }
        self.log_event(session, Interface::LlmOnly, nl_query(text))?;
        let answer = self.rag.answer(text).await?;
        let retrieved_ids: Vec<_> = answer.evidence.iter().map(|m| m.id).collect();
        self.log_event(
            session,
            Interface::LlmOnly,
            EventData::RetrievalCompleted(Retrieval {
                retrieved_count: retrieved_ids.len(),
                retrieved_ids,
            }),
        )?;
        self.log_event(
            session,
            Interface::LlmOnly,
            EventData::AnswerGenerated(GeneratedAnswer {
                answer: answer.answer.clone(),
                result_count: answer.evidence.len(),
                source: answer.source,
            }),
        )?;
        Ok(answer)
    }

    /// Records an event of any kind, for interactions outside the search
    /// paths.
    pub(crate) fn log_raw(
        &self,
        session: &SessionContext,
        interface: Interface,
        event_type: &str,
        payload: Value,
    ) -> Result<Event> {
        self.log_event(session, interface, EventData::new(event_type, payload))
    }
}

fn nl_query(text: &str) -> EventData {
    EventData::NlQuerySent(NlQuery {
        query: text.to_string(),
    })
}

fn executed(results: &[Movie]) -> EventData {
    EventData::results(results.iter().map(|m| m.id).collect())
}
