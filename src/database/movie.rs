use std::collections::BTreeSet;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use super::{Database, Iter, TryFromKeyValue};
use crate::filter::LeadGender;

pub(crate) type MovieId = u64;

/// A catalog record. Stored once at import and never mutated.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub(crate) struct Movie {
    pub(crate) id: MovieId,
    pub(crate) title: String,
    pub(crate) release_year: Option<i32>,
    /// Minutes.
    pub(crate) runtime: Option<i32>,
    #[serde(default)]
    pub(crate) genres: Vec<String>,
    pub(crate) lead_gender: Option<LeadGender>,
    pub(crate) budget: Option<f64>,
    pub(crate) revenue: Option<f64>,
    pub(crate) language: Option<String>,
    #[serde(alias = "overview")]
    pub(crate) synopsis: Option<String>,
}

impl Movie {
    #[cfg(test)]
    pub(crate) fn new(id: MovieId, title: &str) -> Self {
        Self {
            id,
            title: title.to_string(),
            release_year: None,
            runtime: None,
            genres: Vec::new(),
            lead_gender: None,
            budget: None,
            revenue: None,
            language: None,
            synopsis: None,
        }
    }
}

impl TryFromKeyValue for Movie {
    fn try_from_key_value(key: &[u8], value: &[u8]) -> Result<Self> {
        let movie: Movie = bincode::deserialize(value)
            .with_context(|| format!("invalid movie record under key {key:02x?}"))?;
        Ok(movie)
    }
}

#[derive(Debug, Default, PartialEq, Eq, Serialize)]
pub(crate) struct CatalogStatistics {
    pub(crate) total_movies: usize,
    pub(crate) with_release_year: usize,
    pub(crate) with_runtime: usize,
    pub(crate) with_budget: usize,
    pub(crate) with_revenue: usize,
    pub(crate) genres: usize,
}

impl Database {
    pub(crate) fn insert_movies(&self, movies: Vec<Movie>) -> Result<usize> {
        let count = movies.len();
        for movie in movies {
            Database::insert(&movie.id.to_be_bytes(), &movie, &self.movie_tree)?;
        }
        info!(count, "imported movies");
        Ok(count)
    }

    /// Iterates the catalog in identity order.
    pub(crate) fn movies(&self) -> Iter<Movie> {
        Iter::new(self.movie_tree.iter())
    }

    pub(crate) fn movie(&self, id: MovieId) -> Result<Option<Movie>> {
        self.movie_tree
            .get(id.to_be_bytes())?
            .map(|value| Movie::try_from_key_value(&id.to_be_bytes(), &value))
            .transpose()
    }

    /// Looks up several records, returned in identity order. Unknown ids are
    /// skipped.
    pub(crate) fn movies_by_ids(&self, ids: &[MovieId]) -> Result<Vec<Movie>> {
        let ids: BTreeSet<MovieId> = ids.iter().copied().collect();
        let mut movies = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(movie) = self.movie(id)? {
                movies.push(movie);
            }
        }
        Ok(movies)
    }

    pub(crate) fn distinct_genres(&self) -> Result<Vec<String>> {
        let mut genres = BTreeSet::new();
        for movie in self.movies() {
            genres.extend(movie?.genres);
        }
        Ok(genres.into_iter().collect())
    }

    pub(crate) fn movie_count(&self) -> usize {
        self.movie_tree.len()
    }

    pub(crate) fn statistics(&self) -> Result<CatalogStatistics> {
        let mut stats = CatalogStatistics::default();
        let mut genres = BTreeSet::new();
        for movie in self.movies() {
            let movie = movie?;
            stats.total_movies += 1;
            stats.with_release_year += usize::from(movie.release_year.is_some());
            stats.with_runtime += usize::from(movie.runtime.is_some());
            stats.with_budget += usize::from(movie.budget.is_some());
            stats.with_revenue += usize::from(movie.revenue.is_some());
            genres.extend(movie.genres);
        }
        stats.genres = genres.len();
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::TestDatabase;

    fn catalog() -> Vec<Movie> {
        let mut arrival = Movie::new(30, "Arrival");
        arrival.genres = vec!["Drama".into(), "Science Fiction".into()];
        arrival.release_year = Some(2016);
        arrival.budget = Some(47_000_000.0);
        let mut heat = Movie::new(4, "Heat");
        heat.genres = vec!["Crime".into(), "Drama".into()];
        heat.runtime = Some(170);
        let mut up = Movie::new(12, "Up");
        up.genres = vec!["Animation".into()];
        up.revenue = Some(735_099_082.0);
        vec![arrival, heat, up]
    }

    #[test]
    fn iterates_in_identity_order() {
        let test = TestDatabase::with_movies(catalog());
        let ids: Vec<MovieId> = test.db.movies().map(|m| m.unwrap().id).collect();
        assert_eq!(ids, vec![4, 12, 30]);
        assert_eq!(test.db.movie_count(), 3);
    }

    #[test]
    fn looks_up_many_in_identity_order() {
        let test = TestDatabase::with_movies(catalog());
        let titles: Vec<String> = test
            .db
            .movies_by_ids(&[30, 999, 4, 30])
            .unwrap()
            .into_iter()
            .map(|m| m.title)
            .collect();
        assert_eq!(titles, vec!["Heat", "Arrival"]);
        assert!(test.db.movie(999).unwrap().is_none());
    }

    #[test]
    fn distinct_genres_are_sorted() {
        let test = TestDatabase::with_movies(catalog());
        assert_eq!(
            test.db.distinct_genres().unwrap(),
            vec!["Animation", "Crime", "Drama", "Science Fiction"]
        );
    }

    #[test]
    fn counts_known_attributes() {
        let test = TestDatabase::with_movies(catalog());
        assert_eq!(
            test.db.statistics().unwrap(),
            CatalogStatistics {
                total_movies: 3,
                with_release_year: 1,
                with_runtime: 1,
                with_budget: 1,
                with_revenue: 1,
                genres: 4,
            }
        );
    }

    #[test]
    fn import_accepts_overview_alias() {
        let movies: Vec<Movie> = serde_json::from_str(
            r#"[{"id": 1, "title": "Alien", "release_year": 1979, "runtime": 117,
                 "genres": ["Horror"], "lead_gender": "female", "budget": 11000000,
                 "revenue": null, "language": "en", "overview": "In space."}]"#,
        )
        .unwrap();
        assert_eq!(movies[0].synopsis.as_deref(), Some("In space."));
        assert_eq!(movies[0].lead_gender, Some(LeadGender::Female));
        assert_eq!(movies[0].budget, Some(11_000_000.0));
    }
}
