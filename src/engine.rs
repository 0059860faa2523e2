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

//! Circulation engine.
//!
//! The [`Engine`] moves books between members. Per book the state machine is
//! `Available ⇄ CheckedOut`; while checked out, a book collects a FIFO queue
//! of reservations that decides who gets it next.
//!
//! # Operations
//!
//! - **Checkout**: lend an available book.
//! - **Reserve**: lend at once if available, else join the queue.
//! - **Return**: close the checkout and hand the book to the head of the
//!   queue, or make it available.
//! - **Cancel**: leave a queue.
//! - **Authenticate**: check a member's password.
//! - **Read**: page through a book the member holds, checking it out first
//!   if it is available.
//!
//! # Thread Safety
//!
//! Every operation is a single store transaction. Conflicting operations
//! serialize on the store lock, so concurrent callers observe either the
//! state before or after another operation, never a mix.

use crate::base::{BookId, MemberId};
use crate::book::page_count;
use crate::credential::CredentialVerifier;
use crate::member::Member;
use crate::record::{CheckoutRecord, Reservation};
use crate::store::{Store, StoreTxn};
use crate::CirculationError;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Arc, OnceLock};
use tracing::{debug, warn};

/// Result of [`Engine::reserve_book`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ReserveOutcome {
    /// The book was available and is now checked out to the member.
    ImmediateCheckout(CheckoutRecord),
    /// The member joined the queue at the 1-based `position`.
    Queued {
        reservation: Reservation,
        position: usize,
    },
}

/// Result of a return.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ReturnOutcome {
    /// Holder of the checkout that was closed.
    pub returned_by: MemberId,
    /// Member whose reservation was fulfilled, if the queue was not empty.
    pub assigned_to: Option<MemberId>,
}

/// What a member may do with a book's text. See [`Engine::read_access`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReadAccess {
    pub book_exists: bool,
    pub member_exists: bool,
    /// Only evaluated when both book and member exist.
    pub has_content: bool,
    pub can_auto_checkout: bool,
    pub can_read: bool,
    pub title: Option<String>,
    pub author: Option<String>,
    pub member_name: Option<String>,
    /// In characters.
    pub content_len: usize,
}

/// Permission to page through a book, from [`Engine::begin_reading`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReadingGrant {
    pub book: BookId,
    pub member: MemberId,
    pub title: String,
    pub author: String,
    pub reader_name: String,
    pub content_len: usize,
    pub page_size: usize,
    pub page_count: usize,
    /// `true` if the book was available and got checked out for reading.
    pub auto_checked_out: bool,
}

/// Circulation state machine over a [`Store`].
///
/// # Invariants
///
/// - A book is available exactly when it has no borrower.
/// - A book has at most one open checkout, held by its borrower.
/// - A member has at most one open reservation per book.
/// - Returned books go to the oldest open reservation first.
pub struct Engine<S: Store> {
    store: Arc<S>,
    verifier: Arc<dyn CredentialVerifier>,
    /// Hash checked for unknown members so they cost as much as known ones.
    decoy: OnceLock<Option<String>>,
}

impl<S: Store> Engine<S> {
    pub fn new(store: Arc<S>, verifier: Arc<dyn CredentialVerifier>) -> Self {
        Engine {
            store,
            verifier,
            decoy: OnceLock::new(),
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn verifier(&self) -> &dyn CredentialVerifier {
        self.verifier.as_ref()
    }

    /// Runs `f` in one transaction, committing on `Ok` and rolling back on
    /// `Err`.
    pub(crate) fn atomically<'s, T, F>(&'s self, f: F) -> Result<T, CirculationError>
    where
        S: 's,
        F: FnOnce(&mut S::Txn<'s>) -> Result<T, CirculationError>,
    {
        let mut txn = self.store.begin()?;
        match f(&mut txn) {
            Ok(value) => {
                txn.commit()?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback_err) = txn.rollback() {
                    warn!(error = %rollback_err, "rollback failed");
                }
                Err(err)
            }
        }
    }

    /// Checks out an available book.
    ///
    /// # Errors
    ///
    /// - [`CirculationError::BookNotFound`] - Unknown book.
    /// - [`CirculationError::BookUnavailable`] - Someone holds the book.
    /// - [`CirculationError::MemberNotFound`] - Unknown member.
    pub fn checkout_book(
        &self,
        book: BookId,
        member: MemberId,
    ) -> Result<CheckoutRecord, CirculationError> {
        let record = self.atomically(|txn| {
            let current = txn
                .book_summary(book)?
                .ok_or(CirculationError::BookNotFound(book))?;
            if !current.is_available() {
                return Err(CirculationError::BookUnavailable(book));
            }
            require_member(txn, member)?;
            lend(txn, book, member, Utc::now())
        })?;

        debug!(book = %book, member = %member, "book checked out");
        Ok(record)
    }

    /// Checks out the book if it is available, otherwise queues the member.
    ///
    /// # Errors
    ///
    /// Checked in this order:
    /// - [`CirculationError::BookNotFound`]
    /// - [`CirculationError::MemberNotFound`]
    /// - [`CirculationError::AlreadyCheckedOutBySelf`] - The member holds the book.
    /// - [`CirculationError::DuplicateReservation`] - The member is already queued.
    pub fn reserve_book(
        &self,
        book: BookId,
        member: MemberId,
    ) -> Result<ReserveOutcome, CirculationError> {
        let outcome = self.atomically(|txn| {
            let current = txn
                .book_summary(book)?
                .ok_or(CirculationError::BookNotFound(book))?;
            require_member(txn, member)?;

            if let Some(open) = txn.open_checkout(book)? {
                if open.member_id == member {
                    return Err(CirculationError::AlreadyCheckedOutBySelf);
                }
            }
            if txn.open_reservation(book, member)?.is_some() {
                return Err(CirculationError::DuplicateReservation);
            }

            let now = Utc::now();
            if current.is_available() {
                return Ok(ReserveOutcome::ImmediateCheckout(lend(txn, book, member, now)?));
            }

            // Never stamp a reservation before the current tail, so queue
            // order matches arrival order even if the clock steps back.
            let queue = txn.reservations_for_book(book)?;
            let created_at = queue.last().map_or(now, |tail| now.max(tail.created_at));
            let reservation = txn.insert_reservation(book, member, created_at)?;
            Ok(ReserveOutcome::Queued {
                reservation,
                position: queue.len() + 1,
            })
        })?;

        match &outcome {
            ReserveOutcome::ImmediateCheckout(_) => {
                debug!(book = %book, member = %member, "reservation checked out immediately")
            }
            ReserveOutcome::Queued { position, .. } => {
                debug!(book = %book, member = %member, position, "reservation queued")
            }
        }
        Ok(outcome)
    }

    /// Returns a book on behalf of whoever holds it.
    ///
    /// If the queue is not empty, the oldest reservation is fulfilled and the
    /// book goes straight to that member.
    ///
    /// # Errors
    ///
    /// [`CirculationError::BookNotCheckedOut`] if the book has no open
    /// checkout; nothing changes in that case.
    pub fn return_book(&self, book: BookId) -> Result<ReturnOutcome, CirculationError> {
        self.return_checked(book, None)
    }

    /// Like [`Engine::return_book`], but only the borrower may return.
    ///
    /// # Errors
    ///
    /// - [`CirculationError::BookNotCheckedOut`]
    /// - [`CirculationError::NotBorrower`] - Another member holds the book.
    pub fn return_book_as(
        &self,
        book: BookId,
        member: MemberId,
    ) -> Result<ReturnOutcome, CirculationError> {
        self.return_checked(book, Some(member))
    }

    fn return_checked(
        &self,
        book: BookId,
        returner: Option<MemberId>,
    ) -> Result<ReturnOutcome, CirculationError> {
        let outcome = self.atomically(|txn| {
            let checkout = txn
                .open_checkout(book)?
                .ok_or(CirculationError::BookNotCheckedOut(book))?;
            if returner.is_some_and(|member| member != checkout.member_id) {
                return Err(CirculationError::NotBorrower(book));
            }

            let now = Utc::now();
            txn.close_checkout(checkout.id, now)?;

            let assigned_to = match txn.next_reservation(book)? {
                Some(next) => {
                    txn.fulfill_reservation(next.id, now)?;
                    lend(txn, book, next.member_id, now)?;
                    Some(next.member_id)
                }
                None => {
                    txn.set_borrower(book, None)?;
                    None
                }
            };

            Ok(ReturnOutcome {
                returned_by: checkout.member_id,
                assigned_to,
            })
        })?;

        debug!(
            book = %book,
            member = %outcome.returned_by,
            assigned_to = ?outcome.assigned_to,
            "book returned"
        );
        Ok(outcome)
    }

    /// Removes the member's open reservation for the book.
    ///
    /// # Errors
    ///
    /// [`CirculationError::NoActiveReservation`] if the member is not queued.
    pub fn cancel_reservation(&self, book: BookId, member: MemberId) -> Result<(), CirculationError> {
        self.atomically(|txn| {
            let reservation = txn
                .open_reservation(book, member)?
                .ok_or(CirculationError::NoActiveReservation { book, member })?;
            txn.delete_reservation(reservation.id)
        })?;

        debug!(book = %book, member = %member, "reservation cancelled");
        Ok(())
    }

    /// Checks a member's password.
    ///
    /// The member is read in a short transaction and the hash is verified
    /// after the store lock is released.
    ///
    /// # Errors
    ///
    /// - [`CirculationError::InvalidCredential`] - Wrong password or unknown
    ///   member. Both cases produce the same error.
    /// - [`CirculationError::NoCredentialSet`] - The member must reset the
    ///   password first.
    pub fn authenticate_member(
        &self,
        member: MemberId,
        password: &str,
    ) -> Result<Member, CirculationError> {
        let Some(found) = self.atomically(|txn| txn.member(member))? else {
            self.verify_decoy(password);
            return Err(CirculationError::InvalidCredential);
        };
        let Some(hash) = found.credential_hash.as_deref() else {
            return Err(CirculationError::NoCredentialSet);
        };
        if !self.verifier.verify(password, hash)? {
            return Err(CirculationError::InvalidCredential);
        }
        Ok(found)
    }

    fn verify_decoy(&self, password: &str) {
        let decoy = self
            .decoy
            .get_or_init(|| self.verifier.hash("not-a-member-password").ok());
        if let Some(hash) = decoy {
            // Only the time spent matters here.
            let _ = self.verifier.verify(password, hash);
        }
    }

    /// Reports whether `member` could read `book` right now. Changes nothing.
    pub fn read_access(&self, book: BookId, member: MemberId) -> Result<ReadAccess, CirculationError> {
        self.atomically(|txn| {
            let found_book = txn.book_summary(book)?;
            let content = txn.content_meta(book)?.unwrap_or_default();
            let found_member = txn.member(member)?;

            let mut access = ReadAccess {
                book_exists: found_book.is_some(),
                member_exists: found_member.is_some(),
                title: found_book.as_ref().map(|b| b.title.clone()),
                author: found_book.as_ref().map(|b| b.author.clone()),
                member_name: found_member.map(|m| m.name),
                content_len: content.len,
                ..ReadAccess::default()
            };
            if let (Some(found_book), true) = (&found_book, access.member_exists) {
                access.has_content = content.has_text;
                access.can_auto_checkout = found_book.is_available();
                access.can_read = access.has_content
                    && (found_book.is_available() || found_book.borrower == Some(member));
            }
            Ok(access)
        })
    }

    /// Opens a book for reading, checking it out to the reader if it is
    /// available.
    ///
    /// # Errors
    ///
    /// Checked in this order:
    /// - [`CirculationError::BookNotFound`]
    /// - [`CirculationError::MemberNotFound`]
    /// - [`CirculationError::NoContent`] - Blank text; no checkout happens.
    /// - [`CirculationError::HeldByAnotherMember`]
    pub fn begin_reading(
        &self,
        book: BookId,
        member: MemberId,
        page_size: usize,
    ) -> Result<ReadingGrant, CirculationError> {
        validate_page_size(page_size)?;

        let grant = self.atomically(|txn| {
            let current = txn
                .book_summary(book)?
                .ok_or(CirculationError::BookNotFound(book))?;
            let reader = txn
                .member(member)?
                .ok_or(CirculationError::MemberNotFound(member))?;
            let content = txn.content_meta(book)?.unwrap_or_default();
            if !content.has_text {
                return Err(CirculationError::NoContent);
            }

            let auto_checked_out = match current.borrower {
                None => {
                    lend(txn, book, member, Utc::now())?;
                    true
                }
                Some(holder) if holder == member => false,
                Some(_) => return Err(CirculationError::HeldByAnotherMember),
            };

            Ok(ReadingGrant {
                book,
                member,
                title: current.title,
                author: current.author,
                reader_name: reader.name,
                content_len: content.len,
                page_size,
                page_count: page_count(content.len, page_size),
                auto_checked_out,
            })
        })?;

        if grant.auto_checked_out {
            debug!(book = %book, member = %member, "book checked out for reading");
        }
        Ok(grant)
    }

    /// Returns page `page` (0-based) of a book the member holds.
    ///
    /// A page past the end is empty.
    ///
    /// # Errors
    ///
    /// - [`CirculationError::BookNotFound`]
    /// - [`CirculationError::BookNotCheckedOut`] - Nobody holds the book.
    /// - [`CirculationError::HeldByAnotherMember`]
    pub fn read_page(
        &self,
        book: BookId,
        member: MemberId,
        page: usize,
        page_size: usize,
    ) -> Result<String, CirculationError> {
        validate_page_size(page_size)?;

        self.atomically(|txn| {
            let current = txn
                .book_summary(book)?
                .ok_or(CirculationError::BookNotFound(book))?;
            match current.borrower {
                None => return Err(CirculationError::BookNotCheckedOut(book)),
                Some(holder) if holder != member => {
                    return Err(CirculationError::HeldByAnotherMember);
                }
                Some(_) => {}
            }

            let Some(offset) = page.checked_mul(page_size) else {
                return Ok(String::new());
            };
            Ok(txn.content_chunk(book, offset, page_size)?.unwrap_or_default())
        })
    }
}

fn validate_page_size(page_size: usize) -> Result<(), CirculationError> {
    if page_size == 0 {
        return Err(CirculationError::InvalidInput(
            "page size must be positive".to_owned(),
        ));
    }
    Ok(())
}

fn require_member<T: StoreTxn>(txn: &mut T, member: MemberId) -> Result<(), CirculationError> {
    match txn.member(member)? {
        Some(_) => Ok(()),
        None => Err(CirculationError::MemberNotFound(member)),
    }
}

/// Opens a checkout and records the borrower.
fn lend<T: StoreTxn>(
    txn: &mut T,
    book: BookId,
    member: MemberId,
    at: DateTime<Utc>,
) -> Result<CheckoutRecord, CirculationError> {
    let record = txn.insert_checkout(book, member, at)?;
    txn.set_borrower(book, Some(member))?;
    Ok(record)
}
