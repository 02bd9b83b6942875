mod event;
mod movie;

use std::{marker::PhantomData, path::Path};

use anyhow::Result;
use serde::Serialize;
use sled::{Db, Tree};

pub(crate) use self::{
    event::{
        AnswerSource, Event, EventData, EventFilter, EventKind, GeneratedAnswer, Interface,
        NlQuery, ParsedQueryPayload, Retrieval, Submission,
    },
    movie::{Movie, MovieId},
};

const MOVIE_TREE: &str = "movies";
const EVENT_TREE: &str = "events";

#[derive(Clone)]
pub(crate) struct Database {
    db: Db,
    movie_tree: Tree,
    event_tree: Tree,
}

impl Database {
    pub(crate) fn connect(path: &Path) -> Result<Database> {
        let db = sled::open(path)?;
        let movie_tree = db.open_tree(MOVIE_TREE)?;
        let event_tree = db.open_tree(EVENT_TREE)?;
        Ok(Database {
            db,
            movie_tree,
            event_tree,
        })
    }

    pub(crate) fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }

    fn insert<T: Serialize>(key: &[u8], value: T, tree: &Tree) -> Result<()> {
        tree.insert(key, bincode::serialize(&value)?)?;
        Ok(())
    }
}

pub(crate) trait TryFromKeyValue: Sized {
    fn try_from_key_value(key: &[u8], value: &[u8]) -> Result<Self>;
}

pub(crate) struct Iter<T> {
    inner: sled::Iter,
    phantom: PhantomData<T>,
}

impl<T> Iter<T> {
    pub(crate) fn new(inner: sled::Iter) -> Self {
        Self {
            inner,
            phantom: PhantomData,
        }
    }
}

impl<T: TryFromKeyValue> Iterator for Iter<T> {
    type Item = Result<T>;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next().map(|item| {
            let (key, value) = item?;
            T::try_from_key_value(&key, &value)
        })
    }
}

#[cfg(test)]
pub(crate) struct TestDatabase {
    _dir: tempfile::TempDir, // keeps the data directory alive for the test
    pub(crate) db: Database,
}

#[cfg(test)]
impl TestDatabase {
    pub(crate) fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::connect(dir.path()).unwrap();
        Self { _dir: dir, db }
    }

    pub(crate) fn with_movies(movies: Vec<Movie>) -> Self {
        let test = Self::new();
        test.db.insert_movies(movies).unwrap();
        test
    }
}
