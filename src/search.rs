// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2025 Daniel Negri
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Full-text search over the catalog.
//!
//! The index is a denormalized copy of book text. It is fed through
//! [`IndexFeed`](crate::IndexFeed) after store commits and may lag behind
//! the store; callers that need exact answers read the store instead.

use crate::base::BookId;
use crate::book::Book;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::collections::HashMap;
use thiserror::Error;

/// Failures of a search backend.
///
/// These never escape [`Library::search_books`](crate::Library::search_books),
/// which falls back to a store scan.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SearchError {
    #[error("search index unavailable: {0}")]
    Unavailable(String),

    #[error("search query failed: {0}")]
    Query(String),
}

/// The indexed text of one book.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookDocument {
    pub id: BookId,
    pub title: String,
    pub author: String,
    pub content: String,
}

impl From<&Book> for BookDocument {
    fn from(book: &Book) -> Self {
        Self {
            id: book.id,
            title: book.title.clone(),
            author: book.author.clone(),
            content: book.content.clone(),
        }
    }
}

/// A ranked text index over books.
pub trait SearchIndex: Send + Sync {
    /// Inserts or replaces the document with the same id.
    fn upsert(&self, doc: &BookDocument) -> Result<(), SearchError>;

    /// Removing an unknown id is not an error.
    fn delete(&self, id: BookId) -> Result<(), SearchError>;

    /// Ids of matching books, best match first.
    fn query(&self, query: &str) -> Result<Vec<BookId>, SearchError>;
}

/// Splits on non-alphanumeric characters and lowercases.
pub fn tokenize(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|token| !token.is_empty())
        .map(str::to_lowercase)
}

/// In-process inverted index.
///
/// Documents match when they contain every query term. Scores are summed
/// `tf * idf` with `idf = ln(1 + N / df)`; equal scores rank by id.
#[derive(Debug, Default)]
pub struct InvertedIndex {
    /// term -> (book -> term frequency)
    postings: DashMap<String, HashMap<BookId, u32>>,
    /// book -> distinct terms, for removal
    documents: DashMap<BookId, Vec<String>>,
}

impl InvertedIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of indexed documents.
    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    fn unlink(&self, id: BookId, terms: &[String]) {
        for term in terms {
            if let Entry::Occupied(mut entry) = self.postings.entry(term.clone()) {
                entry.get_mut().remove(&id);
                if entry.get().is_empty() {
                    entry.remove();
                }
            }
        }
    }
}

impl SearchIndex for InvertedIndex {
    fn upsert(&self, doc: &BookDocument) -> Result<(), SearchError> {
        let mut frequencies: HashMap<String, u32> = HashMap::new();
        for field in [&doc.title, &doc.author, &doc.content] {
            for token in tokenize(field) {
                *frequencies.entry(token).or_default() += 1;
            }
        }

        // The document entry stays locked while postings change, so
        // concurrent upserts of one book apply one after the other.
        let mut entry = self.documents.entry(doc.id).or_default();
        let stale = std::mem::take(entry.value_mut());
        self.unlink(doc.id, &stale);

        let mut terms = Vec::with_capacity(frequencies.len());
        for (term, tf) in frequencies {
            self.postings
                .entry(term.clone())
                .or_default()
                .insert(doc.id, tf);
            terms.push(term);
        }
        *entry.value_mut() = terms;
        Ok(())
    }

    fn delete(&self, id: BookId) -> Result<(), SearchError> {
        if let Entry::Occupied(entry) = self.documents.entry(id) {
            self.unlink(id, entry.get());
            entry.remove();
        }
        Ok(())
    }

    fn query(&self, query: &str) -> Result<Vec<BookId>, SearchError> {
        let mut terms: Vec<String> = tokenize(query).collect();
        terms.sort();
        terms.dedup();
        if terms.is_empty() {
            return Ok(Vec::new());
        }

        let total = self.documents.len().max(1) as f64;
        let mut scores: Option<HashMap<BookId, f64>> = None;
        for term in &terms {
            let Some(posting) = self.postings.get(term) else {
                return Ok(Vec::new());
            };
            let idf = (1.0 + total / posting.len() as f64).ln();
            scores = Some(match scores {
                None => posting
                    .iter()
                    .map(|(&id, &tf)| (id, f64::from(tf) * idf))
                    .collect(),
                Some(previous) => previous
                    .into_iter()
                    .filter_map(|(id, score)| {
                        posting.get(&id).map(|&tf| (id, score + f64::from(tf) * idf))
                    })
                    .collect(),
            });
        }

        let mut ranked: Vec<(BookId, f64)> = scores.unwrap_or_default().into_iter().collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
        Ok(ranked.into_iter().map(|(id, _)| id).collect())
    }
}
