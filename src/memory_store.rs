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

//! In-process catalog store.
//!
//! All tables sit behind a single [`parking_lot::Mutex`], so a transaction is
//! simply the held lock. Writes go straight to the tables and push the prior
//! row onto an undo journal; rollback replays the journal backwards.
//!
//! # Example
//!
//! ```
//! use circulation_rs::{MemoryStore, Store, StoreTxn};
//!
//! let store = MemoryStore::new();
//! let mut txn = store.begin().unwrap();
//! let id = txn.insert_book("Dune", "Frank Herbert", "").unwrap();
//! txn.rollback().unwrap();
//!
//! let mut txn = store.begin().unwrap();
//! assert!(txn.book(id).unwrap().is_none());
//! ```

use crate::base::{BookId, CheckoutId, MemberId, ReservationId};
use crate::book::{self, Book, BookSummary, ContentMeta};
use crate::member::Member;
use crate::record::{CheckoutRecord, Reservation};
use crate::store::{DEFAULT_LOCK_TIMEOUT, Store, StoreResult, StoreTxn};
use crate::CirculationError;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, MutexGuard};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;

#[derive(Debug, Clone, Copy, Default)]
struct Sequences {
    book: i64,
    member: i64,
    checkout: i64,
    reservation: i64,
}

#[derive(Debug, Default)]
struct Tables {
    books: BTreeMap<BookId, Book>,
    members: BTreeMap<MemberId, Member>,
    checkouts: BTreeMap<CheckoutId, CheckoutRecord>,
    reservations: BTreeMap<ReservationId, Reservation>,
    sequences: Sequences,
}

impl Tables {
    fn assert_invariants(&self) {
        let mut open_by_book: HashMap<BookId, MemberId> = HashMap::new();
        for checkout in self.checkouts.values().filter(|c| c.is_open()) {
            let previous = open_by_book.insert(checkout.book_id, checkout.member_id);
            debug_assert!(
                previous.is_none(),
                "Invariant violated: book {} has more than one open checkout",
                checkout.book_id
            );
        }
        for book in self.books.values() {
            debug_assert_eq!(
                book.borrower,
                open_by_book.get(&book.id).copied(),
                "Invariant violated: borrower of book {} disagrees with its open checkout",
                book.id
            );
        }
        let mut open_pairs = HashSet::new();
        for reservation in self.reservations.values().filter(|r| r.is_open()) {
            debug_assert!(
                open_pairs.insert((reservation.book_id, reservation.member_id)),
                "Invariant violated: member {} has two open reservations on book {}",
                reservation.member_id,
                reservation.book_id
            );
        }
    }
}

/// Prior state of one row, restored on rollback.
#[derive(Debug)]
enum Undo {
    Book(BookId, Option<Book>),
    Member(MemberId, Option<Member>),
    Checkout(CheckoutId, Option<CheckoutRecord>),
    Reservation(ReservationId, Option<Reservation>),
    Sequences(Sequences),
}

fn restore<K: Ord, V>(table: &mut BTreeMap<K, V>, key: K, prior: Option<V>) {
    match prior {
        Some(row) => {
            table.insert(key, row);
        }
        None => {
            table.remove(&key);
        }
    }
}

/// Catalog store kept entirely in memory.
///
/// Each instance is independent, which makes it the store of choice for
/// tests and embedding.
#[derive(Debug)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
    lock_timeout: Duration,
}

impl MemoryStore {
    /// Creates an empty store with the default lock timeout.
    pub fn new() -> Self {
        Self::with_lock_timeout(DEFAULT_LOCK_TIMEOUT)
    }

    /// Creates an empty store whose transactions wait at most `lock_timeout`
    /// for the table lock.
    pub fn with_lock_timeout(lock_timeout: Duration) -> Self {
        Self {
            tables: Mutex::new(Tables::default()),
            lock_timeout,
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Store for MemoryStore {
    type Txn<'a> = MemoryTxn<'a>;

    fn begin(&self) -> StoreResult<MemoryTxn<'_>> {
        let tables = self
            .tables
            .try_lock_for(self.lock_timeout)
            .ok_or(CirculationError::LockTimeout)?;
        Ok(MemoryTxn {
            tables,
            undo: Vec::new(),
            finished: false,
        })
    }
}

/// Transaction over a [`MemoryStore`]; holds the table lock until finished.
#[derive(Debug)]
pub struct MemoryTxn<'a> {
    tables: MutexGuard<'a, Tables>,
    undo: Vec<Undo>,
    finished: bool,
}

impl MemoryTxn<'_> {
    fn undo_all(&mut self) {
        let tables = &mut *self.tables;
        while let Some(entry) = self.undo.pop() {
            match entry {
                Undo::Book(id, prior) => restore(&mut tables.books, id, prior),
                Undo::Member(id, prior) => restore(&mut tables.members, id, prior),
                Undo::Checkout(id, prior) => restore(&mut tables.checkouts, id, prior),
                Undo::Reservation(id, prior) => restore(&mut tables.reservations, id, prior),
                Undo::Sequences(prior) => tables.sequences = prior,
            }
        }
    }

    fn next_id(&mut self, pick: fn(&mut Sequences) -> &mut i64) -> i64 {
        self.undo.push(Undo::Sequences(self.tables.sequences));
        let sequence = pick(&mut self.tables.sequences);
        *sequence += 1;
        *sequence
    }

    fn put_book(&mut self, book: Book) {
        let id = book.id;
        let prior = self.tables.books.insert(id, book);
        self.undo.push(Undo::Book(id, prior));
    }

    fn put_member(&mut self, member: Member) {
        let id = member.id;
        let prior = self.tables.members.insert(id, member);
        self.undo.push(Undo::Member(id, prior));
    }

    fn put_checkout(&mut self, checkout: CheckoutRecord) {
        let id = checkout.id;
        let prior = self.tables.checkouts.insert(id, checkout);
        self.undo.push(Undo::Checkout(id, prior));
    }

    fn put_reservation(&mut self, reservation: Reservation) {
        let id = reservation.id;
        let prior = self.tables.reservations.insert(id, reservation);
        self.undo.push(Undo::Reservation(id, prior));
    }

    fn remove_reservation(&mut self, id: ReservationId) {
        if let Some(prior) = self.tables.reservations.remove(&id) {
            self.undo.push(Undo::Reservation(id, Some(prior)));
        }
    }

    fn remove_checkout(&mut self, id: CheckoutId) {
        if let Some(prior) = self.tables.checkouts.remove(&id) {
            self.undo.push(Undo::Checkout(id, Some(prior)));
        }
    }

    fn existing_book(&self, id: BookId) -> StoreResult<&Book> {
        self.tables
            .books
            .get(&id)
            .ok_or(CirculationError::BookNotFound(id))
    }

    fn open_reservations(&self) -> impl Iterator<Item = &Reservation> {
        self.tables.reservations.values().filter(|r| r.is_open())
    }
}

impl Drop for MemoryTxn<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.undo_all();
        }
    }
}

impl StoreTxn for MemoryTxn<'_> {
    fn commit(mut self) -> StoreResult<()> {
        if cfg!(debug_assertions) {
            self.tables.assert_invariants();
        }
        self.undo.clear();
        self.finished = true;
        Ok(())
    }

    fn rollback(mut self) -> StoreResult<()> {
        self.undo_all();
        self.finished = true;
        Ok(())
    }

    fn insert_book(&mut self, title: &str, author: &str, content: &str) -> StoreResult<BookId> {
        let id = BookId(self.next_id(|s| &mut s.book));
        self.put_book(Book::new(id, title, author, content));
        Ok(id)
    }

    fn book(&mut self, id: BookId) -> StoreResult<Option<Book>> {
        Ok(self.tables.books.get(&id).cloned())
    }

    fn book_summary(&mut self, id: BookId) -> StoreResult<Option<BookSummary>> {
        Ok(self.tables.books.get(&id).map(Book::summary))
    }

    fn books(&mut self) -> StoreResult<Vec<BookSummary>> {
        Ok(self.tables.books.values().map(Book::summary).collect())
    }

    fn set_book_content(&mut self, id: BookId, content: &str) -> StoreResult<bool> {
        let Some(mut book) = self.tables.books.get(&id).cloned() else {
            return Ok(false);
        };
        book.content = content.to_owned();
        self.put_book(book);
        Ok(true)
    }

    fn delete_book(&mut self, id: BookId) -> StoreResult<bool> {
        let Some(prior) = self.tables.books.remove(&id) else {
            return Ok(false);
        };
        self.undo.push(Undo::Book(id, Some(prior)));

        let checkouts: Vec<CheckoutId> = self
            .tables
            .checkouts
            .values()
            .filter(|c| c.book_id == id)
            .map(|c| c.id)
            .collect();
        for checkout in checkouts {
            self.remove_checkout(checkout);
        }

        let reservations: Vec<ReservationId> = self
            .tables
            .reservations
            .values()
            .filter(|r| r.book_id == id)
            .map(|r| r.id)
            .collect();
        for reservation in reservations {
            self.remove_reservation(reservation);
        }
        Ok(true)
    }

    fn set_borrower(&mut self, id: BookId, borrower: Option<MemberId>) -> StoreResult<()> {
        let mut book = self.existing_book(id)?.clone();
        book.borrower = borrower;
        self.put_book(book);
        Ok(())
    }

    fn content_meta(&mut self, id: BookId) -> StoreResult<Option<ContentMeta>> {
        Ok(self.tables.books.get(&id).map(Book::content_meta))
    }

    fn content_chunk(
        &mut self,
        id: BookId,
        offset: usize,
        len: usize,
    ) -> StoreResult<Option<String>> {
        Ok(self
            .tables
            .books
            .get(&id)
            .map(|b| book::content_chunk(&b.content, offset, len)))
    }

    fn find_books(&mut self, needle: &str) -> StoreResult<Vec<BookSummary>> {
        let needle = needle.to_lowercase();
        Ok(self
            .tables
            .books
            .values()
            .filter(|b| {
                b.title.to_lowercase().contains(&needle) || b.author.to_lowercase().contains(&needle)
            })
            .map(Book::summary)
            .collect())
    }

    fn insert_member(
        &mut self,
        name: &str,
        credential_hash: Option<&str>,
    ) -> StoreResult<MemberId> {
        let id = MemberId(self.next_id(|s| &mut s.member));
        self.put_member(Member {
            id,
            name: name.to_owned(),
            credential_hash: credential_hash.map(str::to_owned),
        });
        Ok(id)
    }

    fn member(&mut self, id: MemberId) -> StoreResult<Option<Member>> {
        Ok(self.tables.members.get(&id).cloned())
    }

    fn members(&mut self) -> StoreResult<Vec<Member>> {
        Ok(self.tables.members.values().cloned().collect())
    }

    fn set_credential(
        &mut self,
        id: MemberId,
        credential_hash: Option<&str>,
    ) -> StoreResult<bool> {
        let Some(mut member) = self.tables.members.get(&id).cloned() else {
            return Ok(false);
        };
        member.credential_hash = credential_hash.map(str::to_owned);
        self.put_member(member);
        Ok(true)
    }

    fn open_checkout(&mut self, book: BookId) -> StoreResult<Option<CheckoutRecord>> {
        // The open checkout, if any, is the book's most recent one.
        Ok(self
            .tables
            .checkouts
            .values()
            .rev()
            .find(|c| c.book_id == book && c.is_open())
            .cloned())
    }

    fn insert_checkout(
        &mut self,
        book: BookId,
        member: MemberId,
        at: DateTime<Utc>,
    ) -> StoreResult<CheckoutRecord> {
        if self.open_checkout(book)?.is_some() {
            return Err(CirculationError::Storage(format!(
                "constraint failed: book {book} already has an open checkout"
            )));
        }
        let record = CheckoutRecord {
            id: CheckoutId(self.next_id(|s| &mut s.checkout)),
            book_id: book,
            member_id: member,
            started_at: at,
            ended_at: None,
        };
        self.put_checkout(record.clone());
        Ok(record)
    }

    fn close_checkout(&mut self, id: CheckoutId, at: DateTime<Utc>) -> StoreResult<()> {
        let mut record = self
            .tables
            .checkouts
            .get(&id)
            .cloned()
            .ok_or_else(|| CirculationError::Storage(format!("checkout {id} not found")))?;
        record.ended_at = Some(at);
        self.put_checkout(record);
        Ok(())
    }

    fn checkout_history(&mut self, book: BookId) -> StoreResult<Vec<CheckoutRecord>> {
        Ok(self
            .tables
            .checkouts
            .values()
            .rev()
            .filter(|c| c.book_id == book)
            .cloned()
            .collect())
    }

    fn open_checkouts_for_member(
        &mut self,
        member: MemberId,
    ) -> StoreResult<Vec<CheckoutRecord>> {
        Ok(self
            .tables
            .checkouts
            .values()
            .filter(|c| c.member_id == member && c.is_open())
            .cloned()
            .collect())
    }

    fn open_reservation(
        &mut self,
        book: BookId,
        member: MemberId,
    ) -> StoreResult<Option<Reservation>> {
        Ok(self
            .open_reservations()
            .find(|r| r.book_id == book && r.member_id == member)
            .cloned())
    }

    fn insert_reservation(
        &mut self,
        book: BookId,
        member: MemberId,
        at: DateTime<Utc>,
    ) -> StoreResult<Reservation> {
        if self.open_reservation(book, member)?.is_some() {
            return Err(CirculationError::Storage(format!(
                "constraint failed: member {member} already has an open reservation on book {book}"
            )));
        }
        let reservation = Reservation {
            id: ReservationId(self.next_id(|s| &mut s.reservation)),
            book_id: book,
            member_id: member,
            created_at: at,
            fulfilled_at: None,
        };
        self.put_reservation(reservation.clone());
        Ok(reservation)
    }

    fn next_reservation(&mut self, book: BookId) -> StoreResult<Option<Reservation>> {
        Ok(self
            .open_reservations()
            .filter(|r| r.book_id == book)
            .min_by_key(|r| r.queue_key())
            .cloned())
    }

    fn fulfill_reservation(&mut self, id: ReservationId, at: DateTime<Utc>) -> StoreResult<()> {
        let mut reservation =
            self.tables.reservations.get(&id).cloned().ok_or_else(|| {
                CirculationError::Storage(format!("reservation {id} not found"))
            })?;
        reservation.fulfilled_at = Some(at);
        self.put_reservation(reservation);
        Ok(())
    }

    fn delete_reservation(&mut self, id: ReservationId) -> StoreResult<()> {
        self.remove_reservation(id);
        Ok(())
    }

    fn reservations_for_book(&mut self, book: BookId) -> StoreResult<Vec<Reservation>> {
        let mut queue: Vec<Reservation> = self
            .open_reservations()
            .filter(|r| r.book_id == book)
            .cloned()
            .collect();
        queue.sort_by_key(Reservation::queue_key);
        Ok(queue)
    }

    fn reservations_for_member(&mut self, member: MemberId) -> StoreResult<Vec<Reservation>> {
        let mut reservations: Vec<Reservation> = self
            .open_reservations()
            .filter(|r| r.member_id == member)
            .cloned()
            .collect();
        reservations.sort_by_key(Reservation::queue_key);
        Ok(reservations)
    }
}
