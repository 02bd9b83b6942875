use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::{filter::ParsedQuery, llm::ModelHandle};

const SCHEMA_DOC: &str = include_str!("schema.txt");

const SYSTEM_PROMPT: &str = "You are a precise query parser. Return only valid JSON.";

fn instruction(schema_doc: &str, user_query: &str) -> String {
    format!(
        "You are a query parser for a movie database. Convert the natural language query \
        below into structured filters and sorting options.\n\n\
        {schema_doc}\n\
        User query: \"{user_query}\"\n\n\
        There are some rules you must follow:\n\
        - Only include filters the query explicitly mentions. Use null for everything else.\n\
        - For genres, list every genre mentioned (\"dramas or thrillers\" -> [\"Drama\", \"Thriller\"]).\n\
        - Year bounds are inclusive: \"after 2015\" -> release_year_min 2016, \
        \"before 2020\" -> release_year_max 2019.\n\
        - Runtime is in minutes: \"under 100 minutes\" -> runtime_max 99.\n\
        - Budget and revenue are plain numbers: \"under $10M\" -> budget_max 10000000.\n\
        - Detect sorting from phrases such as \"sort by\", \"order by\", \"highest\" or \"lowest\".\n\
        - Return ONLY the JSON object, no other text.\n"
    )
}

/// Turns free text into a [`ParsedQuery`] through a language model.
#[derive(Clone)]
pub(crate) struct SemanticParser {
    model: ModelHandle,
}

impl SemanticParser {
    pub(crate) fn new(model: ModelHandle) -> Self {
        Self { model }
    }

    /// Parses `text` into filters and sort. Every failure, from a missing key
    /// to a reply without JSON, yields the empty query.
    pub(crate) async fn parse(&self, text: &str) -> ParsedQuery {
        let text = text.trim();
        if text.is_empty() {
            return ParsedQuery::default();
        }

        let start = std::time::Instant::now();
        let reply = match self
            .model
            .complete(SYSTEM_PROMPT, &instruction(SCHEMA_DOC, text))
            .await
        {
            Ok(reply) => reply,
            Err(e) => {
                warn!("query parsing failed, using no filters: {e}");
                return ParsedQuery::default();
            }
        };
        info!(
            elapsed = start.elapsed().as_secs_f64(),
            "model replied to parse request"
        );

        let Some(object) = extract_json_object(&reply) else {
            warn!("model reply has no JSON object, using no filters");
            debug!(%reply, "unparseable reply");
            return ParsedQuery::default();
        };
        ParsedQuery::from(Value::Object(object))
    }
}

/// Finds the first top-level balanced `{...}` span in `text` that parses as
/// a JSON object. A span that fails to parse is skipped whole, so a nested
/// object is never returned in place of its invalid parent. Braces inside
/// string literals are skipped.
pub(crate) fn extract_json_object(text: &str) -> Option<Map<String, Value>> {
    let mut offset = 0;
    while let Some(found) = text[offset..].find('{') {
        let start = offset + found;
        let end = start + balanced_end(&text[start..])?;
        if let Ok(Value::Object(map)) = serde_json::from_str(&text[start..end]) {
            return Some(map);
        }
        offset = end;
    }
    None
}

/// Returns the byte length of the balanced object at the start of `text`.
fn balanced_end(text: &str) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, c) in text.char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(i + 1);
                }
            }
            _ => {}
        }
    }
    None
}
