use std::{
    collections::BTreeSet,
    sync::{Arc, LazyLock},
};

use anyhow::Result;
use regex::Regex;
use serde::Serialize;
use tracing::{info, warn};

use crate::{
    database::{Movie, MovieId},
    engine::QueryEngine,
    filter::{ParsedQuery, RETRIEVAL_LIMIT},
    llm::ModelHandle,
    semantic_parsing::SemanticParser,
    utils::format_dollars,
};

pub(crate) use crate::database::AnswerSource;

const SYSTEM_PROMPT: &str = "You are a helpful movie database assistant. Provide clear, \
    accurate answers based only on the provided data.";

static CITED_ID: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bID\s*[:#]?\s*(\d+)").expect("citation regex is valid")
});

#[derive(Debug, Clone)]
pub(crate) struct RagOptions {
    pub(crate) retrieval_limit: usize,
    pub(crate) evidence_rows: usize,
    pub(crate) citation_check: bool,
}

impl Default for RagOptions {
    fn default() -> Self {
        Self {
            retrieval_limit: RETRIEVAL_LIMIT,
            evidence_rows: 50,
            citation_check: true,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct RagAnswer {
    pub(crate) answer: String,
    pub(crate) evidence: Vec<Movie>,
    pub(crate) parsed_query: ParsedQuery,
    pub(crate) source: AnswerSource,
}

/// Answers a question in prose, grounded in the rows the structured engine
/// returns for the parsed question.
#[derive(Clone)]
pub(crate) struct RagPipeline {
    parser: SemanticParser,
    engine: QueryEngine,
    model: ModelHandle,
    options: RagOptions,
    /// Catalog titles checked against answers, read once per pipeline.
    titles: Arc<Vec<(MovieId, String)>>,
}

impl RagPipeline {
    pub(crate) fn new(
        parser: SemanticParser,
        engine: QueryEngine,
        model: ModelHandle,
        options: RagOptions,
    ) -> Result<Self> {
        let mut titles = Vec::new();
        if options.citation_check {
            for movie in engine.database().movies() {
                let movie = movie?;
                if is_distinctive(&movie.title) {
                    titles.push((movie.id, movie.title.trim().to_string()));
                }
            }
        }
        Ok(Self {
            parser,
            engine,
            model,
            options,
            titles: Arc::new(titles),
        })
    }

    pub(crate) async fn answer(&self, question: &str) -> Result<RagAnswer> {
        let parsed_query = self.parser.parse(question).await;
        let limit = self.options.retrieval_limit.min(RETRIEVAL_LIMIT);
        let evidence = self.engine.run(&parsed_query, limit)?;
        info!(count = evidence.len(), "retrieved evidence");

        if evidence.is_empty() {
            return Ok(RagAnswer {
                answer: fallback_answer(0),
                evidence,
                parsed_query,
                source: AnswerSource::Fallback,
            });
        }

        let prompt =
            answer_prompt(question, &evidence, &parsed_query, self.options.evidence_rows);
        let (answer, source) = match self.model.complete(SYSTEM_PROMPT, &prompt).await {
            Ok(answer) if answer.trim().is_empty() => {
                warn!("model returned an empty answer");
                (fallback_answer(evidence.len()), AnswerSource::Fallback)
            }
            Ok(answer) => {
                if self.options.citation_check && !self.is_grounded(&answer, &evidence) {
                    warn!("answer cites movies outside the evidence, using the template");
                    (fallback_answer(evidence.len()), AnswerSource::Fallback)
                } else {
                    (answer, AnswerSource::Model)
                }
            }
            Err(e) => {
                warn!("answer generation failed, using the template: {e}");
                (fallback_answer(evidence.len()), AnswerSource::Fallback)
            }
        };

        Ok(RagAnswer {
            answer,
            evidence,
            parsed_query,
            source,
        })
    }

    /// Rejects answers that cite an id outside the evidence or name a catalog
    /// title that is not part of it. Titles match case-sensitively as whole
    /// phrases.
    fn is_grounded(&self, answer: &str, evidence: &[Movie]) -> bool {
        let evidence_ids: BTreeSet<MovieId> = evidence.iter().map(|m| m.id).collect();
        for caps in CITED_ID.captures_iter(answer) {
            let id = caps.get(1).and_then(|m| m.as_str().parse::<MovieId>().ok());
            if id.is_none_or(|id| !evidence_ids.contains(&id)) {
                info!(cited = &caps[0], "answer cites an id outside the evidence");
                return false;
            }
        }

        let masked = mask_titles(answer, evidence);
        let outside = self
            .titles
            .iter()
            .filter(|(id, _)| !evidence_ids.contains(id))
            .find(|(_, title)| contains_phrase(&masked, title));
        if let Some((_, title)) = outside {
            info!(%title, "answer names a movie outside the evidence");
            return false;
        }
        true
    }
}

pub(crate) fn fallback_answer(count: usize) -> String {
    format!("I found {count} movies matching your criteria. Please review the results below.")
}

fn answer_prompt(
    question: &str,
    evidence: &[Movie],
    parsed_query: &ParsedQuery,
    evidence_rows: usize,
) -> String {
    let shown = evidence.len().min(evidence_rows);
    let ordering = parsed_query
        .sort
        .map_or_else(|| "catalog order".to_string(), |sort| format!("sorted by {sort}"));
    format!(
        "You are answering a question about movies from a database.\n\n\
        User question: \"{question}\"\n\n\
        The database returned {total} matching movies in {ordering}. \
        The first {shown} are listed here:\n\n\
        {table}\n\
        Provide a clear, concise answer to the question, formatted as:\n\
        1. A brief summary statement (e.g. \"I found {total} movies matching your criteria:\")\n\
        2. A list of the movies with key details (title, year, runtime, revenue if relevant)\n\
        3. If sorting was requested, how they are ordered\n\n\
        Only mention movies that are in the table above.",
        total = evidence.len(),
        table = evidence_table(&evidence[..shown]),
    )
}

fn evidence_table(movies: &[Movie]) -> String {
    let rows: Vec<String> = movies
        .iter()
        .map(|movie| {
            let year = movie
                .release_year
                .map_or_else(|| "N/A".to_string(), |y| y.to_string());
            let runtime = movie
                .runtime
                .map_or_else(|| "N/A".to_string(), |m| format!("{m} min"));
            let gender = movie.lead_gender.map_or("N/A", |g| g.as_str());
            format!(
                "{} | {} | {year} | {runtime} | {} | {gender} | {} | {}\n",
                movie.id,
                movie.title,
                movie.genres.join(", "),
                money(movie.budget),
                money(movie.revenue),
            )
        })
        .collect();
    format!(
        "ID | Title | Year | Runtime | Genres | Lead Gender | Budget | Revenue\n{}\n{}",
        "-".repeat(80),
        rows.concat()
    )
}

fn money(amount: Option<f64>) -> String {
    amount
        .filter(|a| *a != 0.0)
        .map_or_else(|| "N/A".to_string(), format_dollars)
}

/// Blanks out evidence titles so that a short outside title contained in one
/// of them is not reported. Longer titles go first.
fn mask_titles(answer: &str, evidence: &[Movie]) -> String {
    let mut titles: Vec<&str> = evidence.iter().map(|m| m.title.as_str()).collect();
    titles.sort_by_key(|t| std::cmp::Reverse(t.len()));
    let mut masked = answer.to_string();
    for title in titles.into_iter().filter(|t| !t.trim().is_empty()) {
        masked = masked.replace(title, " ");
    }
    masked
}

fn is_distinctive(title: &str) -> bool {
    let title = title.trim();
    title.chars().count() >= 3 && !title.chars().all(|c| c.is_ascii_digit())
}

fn contains_phrase(text: &str, phrase: &str) -> bool {
    text.match_indices(phrase).any(|(start, _)| {
        let before = text[..start].chars().next_back();
        let after = text[start + phrase.len()..].chars().next();
        !before.is_some_and(char::is_alphanumeric) && !after.is_some_and(char::is_alphanumeric)
    })
}
