//! The filter and sort vocabulary shared by the manual and the model-driven
//! query paths.
//!
//! Both paths produce the same wire shape:
//!
//! ```json
//! {
//!   "filters": { "genres": ["Drama"], "budget_max": 10000000 },
//!   "sort": { "field": "revenue", "direction": "desc" }
//! }
//! ```
//!
//! Deserialization never fails on a JSON value. Nulls are treated as absent,
//! and a known field carrying a value of the wrong type is kept in
//! [`Filters::invalid`], which makes the whole query match nothing.

use std::{collections::BTreeMap, fmt};

use num_traits::ToPrimitive;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::{
    database::Movie,
    utils::{format_dollars, title_case},
};

/// Ceiling on the number of rows a structured query returns.
pub(crate) const STRUCTURED_LIMIT: usize = 1000;
/// Ceiling on the number of rows retrieved as evidence for an answer.
pub(crate) const RETRIEVAL_LIMIT: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum LeadGender {
    Female,
    Male,
    Mixed,
    Unknown,
}

impl LeadGender {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            LeadGender::Female => "female",
            LeadGender::Male => "male",
            LeadGender::Mixed => "mixed",
            LeadGender::Unknown => "unknown",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "female" => Some(Self::Female),
            "male" => Some(Self::Male),
            "mixed" => Some(Self::Mixed),
            "unknown" => Some(Self::Unknown),
            _ => None,
        }
    }
}

impl fmt::Display for LeadGender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum SortField {
    ReleaseYear,
    Runtime,
    Budget,
    Revenue,
    Title,
}

impl SortField {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            SortField::ReleaseYear => "release_year",
            SortField::Runtime => "runtime",
            SortField::Budget => "budget",
            SortField::Revenue => "revenue",
            SortField::Title => "title",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "release_year" => Some(Self::ReleaseYear),
            "runtime" => Some(Self::Runtime),
            "budget" => Some(Self::Budget),
            "revenue" => Some(Self::Revenue),
            "title" => Some(Self::Title),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) enum SortDirection {
    #[default]
    #[serde(rename = "asc", alias = "ascending")]
    Ascending,
    #[serde(rename = "desc", alias = "descending")]
    Descending,
}

impl SortDirection {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "asc" | "ascending" => Some(Self::Ascending),
            "desc" | "descending" => Some(Self::Descending),
            _ => None,
        }
    }

    pub(crate) fn as_word(self) -> &'static str {
        match self {
            SortDirection::Ascending => "ascending",
            SortDirection::Descending => "descending",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct Sort {
    pub(crate) field: SortField,
    #[serde(default)]
    pub(crate) direction: SortDirection,
}

impl Sort {
    #[cfg(test)]
    pub(crate) fn new(field: SortField, direction: SortDirection) -> Self {
        Self { field, direction }
    }

    /// Reads a sort object leniently. A missing or unknown field means catalog
    /// order; an unknown direction means ascending.
    fn from_value(value: Value) -> Option<Self> {
        let Value::Object(map) = value else {
            return None;
        };
        let field = match map.get("field") {
            Some(Value::String(name)) => {
                let Some(field) = SortField::parse(name) else {
                    warn!(field = %name, "unknown sort field; using catalog order");
                    return None;
                };
                field
            }
            _ => return None,
        };
        let direction = map
            .get("direction")
            .and_then(Value::as_str)
            .and_then(SortDirection::parse)
            .unwrap_or_default();
        Some(Self { field, direction })
    }
}

impl fmt::Display for Sort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.field.as_str(), self.direction.as_word())
    }
}

/// Optional per-attribute constraints. All present constraints must hold;
/// within `genres`, one listed genre is enough.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "Value")]
pub(crate) struct Filters {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) genres: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) lead_gender: Option<LeadGender>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) release_year_min: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) release_year_max: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) runtime_min: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) runtime_max: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) budget_min: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) budget_max: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) revenue_min: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) revenue_max: Option<f64>,
    /// Known fields whose values had the wrong type, kept verbatim so the
    /// query still matches nothing after a round trip.
    #[serde(flatten)]
    pub(crate) invalid: BTreeMap<String, Value>,
}

impl Filters {
    fn from_map(map: Map<String, Value>) -> Self {
        let mut filters = Self::default();
        for (key, value) in map {
            if value.is_null() {
                continue;
            }
            let accepted = match key.as_str() {
                "genres" => genre_list(&value).map(|genres| {
                    filters.genres = (!genres.is_empty()).then_some(genres);
                }),
                "lead_gender" => value
                    .as_str()
                    .and_then(LeadGender::parse)
                    .map(|gender| filters.lead_gender = Some(gender)),
                "release_year_min" => integer(&value).map(|v| filters.release_year_min = Some(v)),
                "release_year_max" => integer(&value).map(|v| filters.release_year_max = Some(v)),
                "runtime_min" => integer(&value).map(|v| filters.runtime_min = Some(v)),
                "runtime_max" => integer(&value).map(|v| filters.runtime_max = Some(v)),
                "budget_min" => value.as_f64().map(|v| filters.budget_min = Some(v)),
                "budget_max" => value.as_f64().map(|v| filters.budget_max = Some(v)),
                "revenue_min" => value.as_f64().map(|v| filters.revenue_min = Some(v)),
                "revenue_max" => value.as_f64().map(|v| filters.revenue_max = Some(v)),
                _ => {
                    debug!(field = %key, "ignoring unknown filter field");
                    continue;
                }
            };
            if accepted.is_none() {
                debug!(field = %key, %value, "filter value has the wrong type");
                filters.invalid.insert(key, value);
            }
        }
        filters
    }

    /// Returns `true` if no constraint is present.
    pub(crate) fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Returns `false` if some record could never match: a value had the
    /// wrong type or a range has its minimum above its maximum.
    pub(crate) fn is_satisfiable(&self) -> bool {
        self.invalid.is_empty()
            && ordered(self.release_year_min, self.release_year_max)
            && ordered(self.runtime_min, self.runtime_max)
            && ordered(self.budget_min, self.budget_max)
            && ordered(self.revenue_min, self.revenue_max)
    }

    pub(crate) fn matches(&self, movie: &Movie) -> bool {
        self.genres
            .as_ref()
            .is_none_or(|genres| genres.iter().any(|genre| movie.genres.contains(genre)))
            && self
                .lead_gender
                .is_none_or(|gender| movie.lead_gender == Some(gender))
            && within(movie.release_year, self.release_year_min, self.release_year_max)
            && within(movie.runtime, self.runtime_min, self.runtime_max)
            && within(movie.budget, self.budget_min, self.budget_max)
            && within(movie.revenue, self.revenue_min, self.revenue_max)
    }

    fn describe_into(&self, parts: &mut Vec<String>) {
        if let Some(genres) = &self.genres {
            parts.push(format!("Genres: {}", genres.join(", ")));
        }
        if let Some(gender) = self.lead_gender {
            parts.push(format!("Lead gender: {}", title_case(gender.as_str())));
        }
        if let Some(year) = self.release_year_min {
            parts.push(format!("Release year: {year}+"));
        }
        if let Some(year) = self.release_year_max {
            parts.push(format!("Release year: ≤{year}"));
        }
        if let Some(minutes) = self.runtime_min {
            parts.push(format!("Runtime: ≥{minutes} min"));
        }
        if let Some(minutes) = self.runtime_max {
            parts.push(format!("Runtime: ≤{minutes} min"));
        }
        if let Some(amount) = self.budget_min {
            parts.push(format!("Budget: ≥{}", format_dollars(amount)));
        }
        if let Some(amount) = self.budget_max {
            parts.push(format!("Budget: ≤{}", format_dollars(amount)));
        }
        if let Some(amount) = self.revenue_min {
            parts.push(format!("Revenue: ≥{}", format_dollars(amount)));
        }
        if let Some(amount) = self.revenue_max {
            parts.push(format!("Revenue: ≤{}", format_dollars(amount)));
        }
        for (field, value) in &self.invalid {
            parts.push(format!("Unrecognized {field}: {value}"));
        }
    }
}

impl From<Value> for Filters {
    fn from(value: Value) -> Self {
        match value {
            Value::Object(map) => Self::from_map(map),
            Value::Null => Self::default(),
            other => {
                let mut filters = Self::default();
                filters.invalid.insert("filters".to_string(), other);
                filters
            }
        }
    }
}

/// A complete query: constraints plus an optional ordering.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "Value")]
pub(crate) struct ParsedQuery {
    pub(crate) filters: Filters,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) sort: Option<Sort>,
}

impl ParsedQuery {
    /// Renders the query as the one-line preview shown to participants.
    pub(crate) fn describe(&self) -> String {
        let mut parts = Vec::new();
        self.filters.describe_into(&mut parts);
        if let Some(sort) = &self.sort {
            parts.push(format!("Sort: {sort}"));
        }
        if parts.is_empty() {
            "No filters applied".to_string()
        } else {
            parts.join("; ")
        }
    }
}

impl From<Value> for ParsedQuery {
    fn from(value: Value) -> Self {
        match value {
            Value::Object(mut map) => {
                let sort = map.remove("sort").and_then(Sort::from_value);
                // Without the wrapper, the remaining keys are the filters.
                let filters = match map.remove("filters") {
                    Some(filters) => Filters::from(filters),
                    None => Filters::from_map(map),
                };
                Self { filters, sort }
            }
            Value::Null => Self::default(),
            other => {
                let mut query = Self::default();
                query.filters.invalid.insert("query".to_string(), other);
                query
            }
        }
    }
}

fn genre_list(value: &Value) -> Option<Vec<String>> {
    value
        .as_array()?
        .iter()
        .map(|genre| genre.as_str().map(str::to_string))
        .collect()
}

/// Accepts JSON integers and floats without a fractional part.
fn integer(value: &Value) -> Option<i32> {
    if let Some(v) = value.as_i64() {
        return i32::try_from(v).ok();
    }
    value
        .as_f64()
        .filter(|v| v.fract() == 0.0)
        .and_then(|v| v.to_i32())
}

fn ordered<T: PartialOrd>(min: Option<T>, max: Option<T>) -> bool {
    match (min, max) {
        (Some(min), Some(max)) => min <= max,
        _ => true,
    }
}

/// Records without a value for a constrained attribute never match.
fn within<T: PartialOrd>(value: Option<T>, min: Option<T>, max: Option<T>) -> bool {
    if min.is_none() && max.is_none() {
        return true;
    }
    let Some(value) = value else {
        return false;
    };
    min.is_none_or(|min| value >= min) && max.is_none_or(|max| value <= max)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn movie(genres: &[&str], year: Option<i32>) -> Movie {
        Movie {
            id: 1,
            title: "Test".to_string(),
            release_year: year,
            runtime: Some(100),
            genres: genres.iter().map(ToString::to_string).collect(),
            lead_gender: Some(LeadGender::Female),
            budget: Some(5_000_000.0),
            revenue: None,
            language: None,
            synopsis: None,
        }
    }

    #[test]
    fn nulls_are_absent() {
        let query: ParsedQuery = serde_json::from_value(json!({
            "filters": {
                "genres": null,
                "lead_gender": null,
                "release_year_min": 2016,
                "budget_max": null
            },
            "sort": { "field": null, "direction": null }
        }))
        .unwrap();

        assert_eq!(query.filters.release_year_min, Some(2016));
        assert!(query.filters.genres.is_none());
        assert!(query.filters.budget_max.is_none());
        assert!(query.sort.is_none());
        assert!(query.filters.is_satisfiable());
    }

    #[test]
    fn wrong_types_make_the_query_unsatisfiable() {
        let query: ParsedQuery = serde_json::from_value(json!({
            "filters": { "release_year_min": "2016", "genres": ["Drama"] }
        }))
        .unwrap();

        assert!(!query.filters.is_satisfiable());
        assert_eq!(query.filters.genres, Some(vec!["Drama".to_string()]));
        assert_eq!(query.filters.invalid.get("release_year_min"), Some(&json!("2016")));

        let round_trip: ParsedQuery =
            serde_json::from_value(serde_json::to_value(&query).unwrap()).unwrap();
        assert!(!round_trip.filters.is_satisfiable());
    }

    #[test]
    fn unknown_gender_label_is_a_wrong_type() {
        let filters = Filters::from(json!({ "lead_gender": "robot" }));
        assert!(!filters.is_satisfiable());

        let filters = Filters::from(json!({ "lead_gender": "Female" }));
        assert_eq!(filters.lead_gender, Some(LeadGender::Female));
    }

    #[test]
    fn inverted_ranges_are_unsatisfiable() {
        for field in ["release_year", "runtime", "budget", "revenue"] {
            let mut map = Map::new();
            map.insert(format!("{field}_min"), json!(200));
            map.insert(format!("{field}_max"), json!(100));
            let filters = Filters::from(Value::Object(map));
            assert!(!filters.is_satisfiable(), "{field}");
        }
    }

    #[test]
    fn integral_floats_are_integers() {
        let filters = Filters::from(json!({ "runtime_max": 99.0, "runtime_min": 80.5 }));
        assert_eq!(filters.runtime_max, Some(99));
        assert!(filters.invalid.contains_key("runtime_min"));
    }

    #[test]
    fn empty_genre_list_is_no_constraint() {
        let filters = Filters::from(json!({ "genres": [] }));
        assert!(filters.is_empty());
        assert!(filters.matches(&movie(&[], Some(2000))));
    }

    #[test]
    fn genres_are_or_matched() {
        let filters = Filters::from(json!({ "genres": ["Drama", "Thriller"] }));
        assert!(filters.matches(&movie(&["Thriller", "Crime"], Some(2000))));
        assert!(filters.matches(&movie(&["Drama"], Some(2000))));
        assert!(!filters.matches(&movie(&["Comedy"], Some(2000))));
        assert!(!filters.matches(&movie(&["drama"], Some(2000))));
    }

    #[test]
    fn missing_attribute_fails_a_range() {
        let filters = Filters::from(json!({ "revenue_min": 0 }));
        assert!(!filters.matches(&movie(&["Drama"], Some(2000))));

        let filters = Filters::from(json!({ "release_year_min": 1990, "release_year_max": 2000 }));
        assert!(filters.matches(&movie(&["Drama"], Some(2000))));
        assert!(!filters.matches(&movie(&["Drama"], None)));
    }

    #[test]
    fn sort_is_read_leniently() {
        let query = ParsedQuery::from(json!({
            "filters": {},
            "sort": { "field": "revenue", "direction": "DESC" }
        }));
        assert_eq!(
            query.sort,
            Some(Sort::new(SortField::Revenue, SortDirection::Descending))
        );

        let query = ParsedQuery::from(json!({ "sort": { "field": "revenue" } }));
        assert_eq!(
            query.sort,
            Some(Sort::new(SortField::Revenue, SortDirection::Ascending))
        );

        let query = ParsedQuery::from(json!({ "sort": { "field": "popularity" } }));
        assert!(query.sort.is_none());
    }

    #[test]
    fn serializes_the_wire_shape() {
        let query = ParsedQuery::from(json!({
            "filters": { "genres": ["Drama"], "budget_max": 10_000_000 },
            "sort": { "field": "revenue", "direction": "descending" }
        }));
        assert_eq!(
            serde_json::to_value(&query).unwrap(),
            json!({
                "filters": { "genres": ["Drama"], "budget_max": 10_000_000.0 },
                "sort": { "field": "revenue", "direction": "desc" }
            })
        );
    }

    #[test]
    fn bare_filter_object_is_accepted() {
        let query = ParsedQuery::from(json!({ "genres": ["Horror"] }));
        assert_eq!(query.filters.genres, Some(vec!["Horror".to_string()]));
    }

    #[test]
    fn bare_filters_beside_a_sort_are_kept() {
        let query = ParsedQuery::from(json!({
            "genres": ["Horror"],
            "release_year_min": 2010,
            "sort": { "field": "title", "direction": "asc" }
        }));
        assert_eq!(query.filters.genres, Some(vec!["Horror".to_string()]));
        assert_eq!(query.filters.release_year_min, Some(2010));
        assert_eq!(
            query.sort,
            Some(Sort::new(SortField::Title, SortDirection::Ascending))
        );
    }

    #[test]
    fn non_object_query_matches_nothing() {
        let query = ParsedQuery::from(json!("dramas please"));
        assert!(!query.filters.is_satisfiable());
        assert!(ParsedQuery::from(Value::Null).filters.is_satisfiable());
    }

    #[test]
    fn describes_the_preview() {
        let query = ParsedQuery::from(json!({
            "filters": {
                "genres": ["Drama", "Thriller"],
                "lead_gender": "female",
                "release_year_min": 2016,
                "budget_max": 10_000_000
            },
            "sort": { "field": "revenue", "direction": "desc" }
        }));
        assert_eq!(
            query.describe(),
            "Genres: Drama, Thriller; Lead gender: Female; Release year: 2016+; \
             Budget: ≤$10,000,000; Sort: revenue (descending)"
        );
        assert_eq!(ParsedQuery::default().describe(), "No filters applied");
    }
}
