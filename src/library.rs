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

//! Catalog facade.
//!
//! [`Library`] owns an [`Engine`] and the search index. Catalog writes go
//! through the store first; the changed book id is published to the
//! [`IndexFeed`] only after the transaction commits, and the feed indexes
//! whatever row is committed when it syncs.

use crate::base::{BookId, MemberId};
use crate::book::{Book, BookSummary};
use crate::credential::{CredentialVerifier, validate_password};
use crate::engine::{Engine, ReadAccess, ReadingGrant, ReserveOutcome, ReturnOutcome};
use crate::index_feed::{IndexFeed, SyncError};
use crate::member::Member;
use crate::record::CheckoutRecord;
use crate::search::{BookDocument, InvertedIndex, SearchIndex};
use crate::store::{Store, StoreTxn};
use crate::CirculationError;
use std::io::Read;
use std::sync::Arc;
use tracing::{debug, warn};

/// Books, members and circulation behind one handle.
pub struct Library<S: Store> {
    engine: Engine<S>,
    index: Arc<dyn SearchIndex>,
    feed: IndexFeed,
}

impl<S: Store> Library<S> {
    /// Creates a library with an in-process [`InvertedIndex`].
    ///
    /// The index starts empty; call [`Library::reindex`] when the store
    /// already holds books.
    pub fn new(store: Arc<S>, verifier: Arc<dyn CredentialVerifier>) -> Self {
        Self::with_index(store, verifier, Arc::new(InvertedIndex::new()))
    }

    pub fn with_index(
        store: Arc<S>,
        verifier: Arc<dyn CredentialVerifier>,
        index: Arc<dyn SearchIndex>,
    ) -> Self {
        Library {
            engine: Engine::new(store, verifier),
            index,
            feed: IndexFeed::new(),
        }
    }

    pub fn engine(&self) -> &Engine<S> {
        &self.engine
    }

    /// Pending index updates.
    pub fn feed(&self) -> &IndexFeed {
        &self.feed
    }

    // === Books ===

    /// Adds a book and returns its id.
    ///
    /// # Errors
    ///
    /// [`CirculationError::InvalidInput`] if the title or author is blank.
    pub fn add_book(
        &self,
        title: &str,
        author: &str,
        content: &str,
    ) -> Result<BookId, CirculationError> {
        let title = require_text("title", title)?;
        let author = require_text("author", author)?;

        let id = self
            .engine
            .atomically(|txn| txn.insert_book(title, author, content))?;

        self.feed.publish(id);
        debug!(book = %id, "book added");
        Ok(id)
    }

    /// Adds a book whose content is read from `reader`.
    pub fn add_book_from_reader(
        &self,
        title: &str,
        author: &str,
        reader: impl Read,
    ) -> Result<BookId, CirculationError> {
        let content = read_content(reader)?;
        self.add_book(title, author, &content)
    }

    /// Replaces a book's content.
    pub fn update_book_content(&self, book: BookId, content: &str) -> Result<(), CirculationError> {
        self.engine.atomically(|txn| {
            if !txn.set_book_content(book, content)? {
                return Err(CirculationError::BookNotFound(book));
            }
            Ok(())
        })?;

        self.feed.publish(book);
        debug!(book = %book, "book content updated");
        Ok(())
    }

    pub fn update_book_content_from_reader(
        &self,
        book: BookId,
        reader: impl Read,
    ) -> Result<(), CirculationError> {
        let content = read_content(reader)?;
        self.update_book_content(book, &content)
    }

    /// Deletes a book with its checkout history.
    ///
    /// # Errors
    ///
    /// - [`CirculationError::BookNotFound`]
    /// - [`CirculationError::BookInCirculation`] - The book is checked out or
    ///   has open reservations.
    pub fn remove_book(&self, book: BookId) -> Result<(), CirculationError> {
        self.engine.atomically(|txn| {
            let current = txn
                .book_summary(book)?
                .ok_or(CirculationError::BookNotFound(book))?;
            if !current.is_available() || !txn.reservations_for_book(book)?.is_empty() {
                return Err(CirculationError::BookInCirculation(book));
            }
            txn.delete_book(book)?;
            Ok(())
        })?;

        self.feed.publish(book);
        debug!(book = %book, "book removed");
        Ok(())
    }

    pub fn book(&self, book: BookId) -> Result<Book, CirculationError> {
        self.engine
            .atomically(|txn| txn.book(book))?
            .ok_or(CirculationError::BookNotFound(book))
    }

    /// All books ordered by id.
    pub fn books(&self) -> Result<Vec<BookSummary>, CirculationError> {
        self.engine.atomically(|txn| txn.books())
    }

    /// Every checkout of the book, newest first.
    pub fn book_history(&self, book: BookId) -> Result<Vec<CheckoutRecord>, CirculationError> {
        self.engine.atomically(|txn| {
            if txn.book_summary(book)?.is_none() {
                return Err(CirculationError::BookNotFound(book));
            }
            txn.checkout_history(book)
        })
    }

    // === Search ===

    /// Ranked full-text search over title, author and content.
    ///
    /// Falls back to a substring match on title and author, ordered by id,
    /// when the index cannot answer.
    pub fn search_books(&self, query: &str) -> Result<Vec<BookSummary>, CirculationError> {
        let query = query.trim();
        if query.is_empty() {
            return Ok(Vec::new());
        }

        match self.indexed_search(query) {
            Ok(ids) => self.engine.atomically(|txn| {
                let mut hits = Vec::with_capacity(ids.len());
                for id in ids {
                    // The index may still list a book removed since the last sync.
                    if let Some(summary) = txn.book_summary(id)? {
                        hits.push(summary);
                    }
                }
                Ok(hits)
            }),
            Err(SyncError::Index(err)) => {
                warn!(error = %err, "search index failed; falling back to catalog scan");
                self.engine.atomically(|txn| txn.find_books(query))
            }
            Err(SyncError::Store(err)) => Err(err),
        }
    }

    fn indexed_search(&self, query: &str) -> Result<Vec<BookId>, SyncError> {
        self.sync_index()?;
        Ok(self.index.query(query)?)
    }

    fn sync_index(&self) -> Result<usize, SyncError> {
        self.feed.sync(self.index.as_ref(), |book| {
            self.engine
                .atomically(|txn| Ok(txn.book(book)?.map(|b| BookDocument::from(&b))))
        })
    }

    /// Queues every book for indexing and syncs the index.
    ///
    /// Returns the number of books in the catalog. Index failures are logged
    /// and the updates stay queued for the next sync.
    pub fn reindex(&self) -> Result<usize, CirculationError> {
        let books = self.engine.atomically(|txn| txn.books())?;

        let count = books.len();
        for summary in &books {
            self.feed.publish(summary.id);
        }
        if let Err(err) = self.sync_index() {
            warn!(error = %err, pending = self.feed.len(), "reindex incomplete");
        }
        Ok(count)
    }

    // === Members ===

    /// Registers a member with a password.
    ///
    /// The password is hashed before the store lock is taken.
    pub fn add_member(&self, name: &str, password: &str) -> Result<MemberId, CirculationError> {
        let name = require_text("name", name)?;
        validate_password(password)?;
        let hash = self.engine.verifier().hash(password)?;

        let id = self
            .engine
            .atomically(|txn| txn.insert_member(name, Some(&hash)))?;
        debug!(member = %id, "member added");
        Ok(id)
    }

    /// Registers a member without a password, as migrated records are.
    ///
    /// The member cannot authenticate until [`Library::reset_password`].
    pub fn add_legacy_member(&self, name: &str) -> Result<MemberId, CirculationError> {
        let name = require_text("name", name)?;
        let id = self.engine.atomically(|txn| txn.insert_member(name, None))?;
        debug!(member = %id, "legacy member added");
        Ok(id)
    }

    pub fn member(&self, member: MemberId) -> Result<Member, CirculationError> {
        self.engine
            .atomically(|txn| txn.member(member))?
            .ok_or(CirculationError::MemberNotFound(member))
    }

    pub fn members(&self) -> Result<Vec<Member>, CirculationError> {
        self.engine.atomically(|txn| txn.members())
    }

    /// Sets a new password.
    pub fn reset_password(&self, member: MemberId, password: &str) -> Result<(), CirculationError> {
        validate_password(password)?;
        let hash = self.engine.verifier().hash(password)?;

        self.engine.atomically(|txn| {
            if txn.set_credential(member, Some(&hash))? {
                Ok(())
            } else {
                Err(CirculationError::MemberNotFound(member))
            }
        })?;
        debug!(member = %member, "password reset");
        Ok(())
    }

    // === Queues and loans ===

    /// Members waiting for the book, next in line first.
    pub fn reservation_queue(&self, book: BookId) -> Result<Vec<Member>, CirculationError> {
        self.engine.atomically(|txn| {
            if txn.book_summary(book)?.is_none() {
                return Err(CirculationError::BookNotFound(book));
            }
            let mut queue = Vec::new();
            for reservation in txn.reservations_for_book(book)? {
                if let Some(member) = txn.member(reservation.member_id)? {
                    queue.push(member);
                }
            }
            Ok(queue)
        })
    }

    /// Books the member is waiting for, oldest reservation first.
    pub fn member_reservations(
        &self,
        member: MemberId,
    ) -> Result<Vec<BookSummary>, CirculationError> {
        self.engine.atomically(|txn| {
            if txn.member(member)?.is_none() {
                return Err(CirculationError::MemberNotFound(member));
            }
            let mut books = Vec::new();
            for reservation in txn.reservations_for_member(member)? {
                if let Some(book) = txn.book_summary(reservation.book_id)? {
                    books.push(book);
                }
            }
            Ok(books)
        })
    }

    /// Open checkouts held by the member.
    pub fn member_checkouts(
        &self,
        member: MemberId,
    ) -> Result<Vec<CheckoutRecord>, CirculationError> {
        self.engine.atomically(|txn| {
            if txn.member(member)?.is_none() {
                return Err(CirculationError::MemberNotFound(member));
            }
            txn.open_checkouts_for_member(member)
        })
    }

    // === Circulation ===

    pub fn checkout_book(
        &self,
        book: BookId,
        member: MemberId,
    ) -> Result<CheckoutRecord, CirculationError> {
        self.engine.checkout_book(book, member)
    }

    pub fn reserve_book(
        &self,
        book: BookId,
        member: MemberId,
    ) -> Result<ReserveOutcome, CirculationError> {
        self.engine.reserve_book(book, member)
    }

    pub fn return_book(&self, book: BookId) -> Result<ReturnOutcome, CirculationError> {
        self.engine.return_book(book)
    }

    pub fn return_book_as(
        &self,
        book: BookId,
        member: MemberId,
    ) -> Result<ReturnOutcome, CirculationError> {
        self.engine.return_book_as(book, member)
    }

    pub fn cancel_reservation(&self, book: BookId, member: MemberId) -> Result<(), CirculationError> {
        self.engine.cancel_reservation(book, member)
    }

    pub fn authenticate_member(
        &self,
        member: MemberId,
        password: &str,
    ) -> Result<Member, CirculationError> {
        self.engine.authenticate_member(member, password)
    }

    pub fn read_access(&self, book: BookId, member: MemberId) -> Result<ReadAccess, CirculationError> {
        self.engine.read_access(book, member)
    }

    pub fn begin_reading(
        &self,
        book: BookId,
        member: MemberId,
        page_size: usize,
    ) -> Result<ReadingGrant, CirculationError> {
        self.engine.begin_reading(book, member, page_size)
    }

    pub fn read_page(
        &self,
        book: BookId,
        member: MemberId,
        page: usize,
        page_size: usize,
    ) -> Result<String, CirculationError> {
        self.engine.read_page(book, member, page, page_size)
    }
}

fn require_text<'a>(field: &str, value: &'a str) -> Result<&'a str, CirculationError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(CirculationError::InvalidInput(format!(
            "{field} cannot be empty"
        )));
    }
    Ok(trimmed)
}

fn read_content(mut reader: impl Read) -> Result<String, CirculationError> {
    let mut content = String::new();
    reader
        .read_to_string(&mut content)
        .map_err(|e| CirculationError::InvalidInput(format!("failed to read content: {e}")))?;
    Ok(content)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn require_text_trims_and_rejects_blank() {
        assert_eq!(require_text("title", "  Dune ").unwrap(), "Dune");
        assert_eq!(
            require_text("author", " \t"),
            Err(CirculationError::InvalidInput("author cannot be empty".into()))
        );
    }

    #[test]
    fn read_content_rejects_invalid_utf8() {
        let bytes: &[u8] = &[0xff, 0xfe, 0xfd];
        assert!(matches!(
            read_content(bytes),
            Err(CirculationError::InvalidInput(_))
        ));
        assert_eq!(read_content("plain text".as_bytes()).unwrap(), "plain text");
    }
}
