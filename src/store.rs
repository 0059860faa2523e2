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

//! Catalog store abstraction.
//!
//! The store is a passive record holder. Every read and write happens inside
//! a [`StoreTxn`] obtained from [`Store::begin`]; the transaction holds the
//! store's write lock until it is committed, rolled back, or dropped.
//! Dropping an unfinished transaction rolls it back.
//!
//! Implementations:
//! - [`MemoryStore`](crate::MemoryStore): in-process tables, one table-level lock.
//! - [`SqliteStore`](crate::SqliteStore): SQLite file or in-memory database.

use crate::base::{BookId, CheckoutId, MemberId, ReservationId};
use crate::book::{Book, BookSummary, ContentMeta};
use crate::member::Member;
use crate::record::{CheckoutRecord, Reservation};
use crate::CirculationError;
use chrono::{DateTime, Utc};
use std::time::Duration;

/// How long [`Store::begin`] waits for the lock unless configured otherwise.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// Longest lock wait a store accepts. SQLite takes its busy timeout as
/// `i32` milliseconds.
pub const MAX_LOCK_TIMEOUT: Duration = Duration::from_millis(i32::MAX as u64);

/// Shorthand for store results.
pub type StoreResult<T> = Result<T, CirculationError>;

/// A transactional record store shared by all callers.
pub trait Store: Send + Sync {
    type Txn<'a>: StoreTxn
    where
        Self: 'a;

    /// Opens a transaction, waiting at most the configured lock timeout.
    ///
    /// # Errors
    ///
    /// [`CirculationError::LockTimeout`] if the lock could not be acquired.
    fn begin(&self) -> StoreResult<Self::Txn<'_>>;
}

/// An open transaction against a [`Store`].
pub trait StoreTxn {
    /// Makes all writes of this transaction durable and visible.
    fn commit(self) -> StoreResult<()>;

    /// Discards all writes of this transaction.
    fn rollback(self) -> StoreResult<()>;

    // === Books ===

    fn insert_book(&mut self, title: &str, author: &str, content: &str) -> StoreResult<BookId>;
    fn book(&mut self, id: BookId) -> StoreResult<Option<Book>>;
    /// The book without its content.
    fn book_summary(&mut self, id: BookId) -> StoreResult<Option<BookSummary>>;
    /// All books ordered by id, without content.
    fn books(&mut self) -> StoreResult<Vec<BookSummary>>;
    /// Returns `false` if the book does not exist.
    fn set_book_content(&mut self, id: BookId, content: &str) -> StoreResult<bool>;
    /// Deletes the book with its checkout and reservation rows.
    fn delete_book(&mut self, id: BookId) -> StoreResult<bool>;
    /// Sets the borrower; availability follows.
    fn set_borrower(&mut self, id: BookId, borrower: Option<MemberId>) -> StoreResult<()>;
    /// Length and emptiness of the content, read without loading it.
    /// `None` if the book does not exist.
    fn content_meta(&mut self, id: BookId) -> StoreResult<Option<ContentMeta>>;
    /// Characters `[offset, offset + len)` of the content.
    fn content_chunk(
        &mut self,
        id: BookId,
        offset: usize,
        len: usize,
    ) -> StoreResult<Option<String>>;
    /// Case-insensitive substring match on title or author, ordered by id.
    fn find_books(&mut self, needle: &str) -> StoreResult<Vec<BookSummary>>;

    // === Members ===

    fn insert_member(&mut self, name: &str, credential_hash: Option<&str>)
    -> StoreResult<MemberId>;
    fn member(&mut self, id: MemberId) -> StoreResult<Option<Member>>;
    fn members(&mut self) -> StoreResult<Vec<Member>>;
    /// Returns `false` if the member does not exist.
    fn set_credential(&mut self, id: MemberId, credential_hash: Option<&str>)
    -> StoreResult<bool>;

    // === Checkouts ===

    fn open_checkout(&mut self, book: BookId) -> StoreResult<Option<CheckoutRecord>>;
    fn insert_checkout(
        &mut self,
        book: BookId,
        member: MemberId,
        at: DateTime<Utc>,
    ) -> StoreResult<CheckoutRecord>;
    fn close_checkout(&mut self, id: CheckoutId, at: DateTime<Utc>) -> StoreResult<()>;
    /// Every checkout of a book, newest first.
    fn checkout_history(&mut self, book: BookId) -> StoreResult<Vec<CheckoutRecord>>;
    fn open_checkouts_for_member(&mut self, member: MemberId)
    -> StoreResult<Vec<CheckoutRecord>>;

    // === Reservations ===

    fn open_reservation(
        &mut self,
        book: BookId,
        member: MemberId,
    ) -> StoreResult<Option<Reservation>>;
    fn insert_reservation(
        &mut self,
        book: BookId,
        member: MemberId,
        at: DateTime<Utc>,
    ) -> StoreResult<Reservation>;
    /// Oldest open reservation for the book.
    fn next_reservation(&mut self, book: BookId) -> StoreResult<Option<Reservation>>;
    fn fulfill_reservation(&mut self, id: ReservationId, at: DateTime<Utc>) -> StoreResult<()>;
    fn delete_reservation(&mut self, id: ReservationId) -> StoreResult<()>;
    /// Open reservations for the book in FIFO order.
    fn reservations_for_book(&mut self, book: BookId) -> StoreResult<Vec<Reservation>>;
    /// Open reservations of the member, oldest first.
    fn reservations_for_member(&mut self, member: MemberId) -> StoreResult<Vec<Reservation>>;
}
