use std::cmp::Ordering;

use anyhow::Result;
use tracing::debug;

use crate::{
    database::{Database, Movie},
    filter::{Filters, ParsedQuery, Sort, SortDirection, SortField, STRUCTURED_LIMIT},
};

/// Runs filter queries against the catalog. Never calls a model and has no
/// side effects, so every interface condition gets identical results for
/// identical input.
#[derive(Clone)]
pub(crate) struct QueryEngine {
    db: Database,
    max_limit: usize,
}

impl QueryEngine {
    pub(crate) fn new(db: Database) -> Self {
        Self {
            db,
            max_limit: STRUCTURED_LIMIT,
        }
    }

    #[must_use]
    pub(crate) fn with_max_limit(mut self, max_limit: usize) -> Self {
        self.max_limit = max_limit.min(STRUCTURED_LIMIT);
        self
    }

    pub(crate) fn database(&self) -> &Database {
        &self.db
    }

    /// Returns at most `limit` movies satisfying every constraint in
    /// `filters`, in catalog order or in `sort` order with ties broken by id.
    ///
    /// Malformed filters match nothing; this never fails on filter content.
    pub(crate) fn execute(
        &self,
        filters: &Filters,
        sort: Option<&Sort>,
        limit: usize,
    ) -> Result<Vec<Movie>> {
        let limit = limit.min(self.max_limit);
        if limit == 0 || !filters.is_satisfiable() {
            debug!(limit, "query cannot match any movie");
            return Ok(Vec::new());
        }

        let mut matched = Vec::new();
        for movie in self.db.movies() {
            let movie = movie?;
            if !filters.matches(&movie) {
                continue;
            }
            matched.push(movie);
            if sort.is_none() && matched.len() == limit {
                break;
            }
        }

        if let Some(sort) = sort {
            matched.sort_by(|a, b| compare(a, b, sort));
            matched.truncate(limit);
        }
        debug!(
            count = matched.len(),
            limit,
            unfiltered = filters.is_empty(),
            "query executed"
        );
        Ok(matched)
    }

    pub(crate) fn run(&self, query: &ParsedQuery, limit: usize) -> Result<Vec<Movie>> {
        self.execute(&query.filters, query.sort.as_ref(), limit)
    }
}

/// Orders by the sort key with missing values last in either direction,
/// then by id ascending.
fn compare(a: &Movie, b: &Movie, sort: &Sort) -> Ordering {
    let by_key = match sort.field {
        SortField::ReleaseYear => {
            nulls_last(a.release_year, b.release_year, sort.direction, Ord::cmp)
        }
        SortField::Runtime => nulls_last(a.runtime, b.runtime, sort.direction, Ord::cmp),
        SortField::Budget => nulls_last(a.budget, b.budget, sort.direction, f64::total_cmp),
        SortField::Revenue => nulls_last(a.revenue, b.revenue, sort.direction, f64::total_cmp),
        SortField::Title => directed(a.title.cmp(&b.title), sort.direction),
    };
    by_key.then_with(|| a.id.cmp(&b.id))
}

fn nulls_last<T>(
    a: Option<T>,
    b: Option<T>,
    direction: SortDirection,
    cmp: impl Fn(&T, &T) -> Ordering,
) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => directed(cmp(&a, &b), direction),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

fn directed(ordering: Ordering, direction: SortDirection) -> Ordering {
    match direction {
        SortDirection::Ascending => ordering,
        SortDirection::Descending => ordering.reverse(),
    }
}
