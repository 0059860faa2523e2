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

//! Error types for circulation and catalog operations.

use crate::base::{BookId, MemberId};
use thiserror::Error;

/// Message shared by every authentication failure that could otherwise
/// reveal whether a member id exists.
pub const AUTH_FAILED_MESSAGE: &str = "invalid member ID or password";

/// Coarse classification of a [`CirculationError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// A referenced book or member does not exist.
    NotFound,
    /// The operation is incompatible with the current circulation state.
    Conflict,
    /// The caller is not allowed to perform the operation.
    Unauthorized,
    /// Lock contention; the operation may be retried as-is.
    Transient,
    /// The request itself is malformed.
    Invalid,
    /// The storage or hashing backend failed.
    Storage,
}

/// Circulation and catalog errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CirculationError {
    /// Referenced book does not exist
    #[error("book {0} not found")]
    BookNotFound(BookId),

    /// Referenced member does not exist
    #[error("member {0} not found")]
    MemberNotFound(MemberId),

    /// Direct checkout of a book that is already out
    #[error("book {0} is already checked out")]
    BookUnavailable(BookId),

    /// Member tried to reserve a book they currently hold
    #[error("you can't reserve this book because you have already checked it out")]
    AlreadyCheckedOutBySelf,

    /// Member already waits in this book's queue
    #[error("you already have a reservation for this book")]
    DuplicateReservation,

    /// Return of a book without an open checkout
    #[error("book {0} is not checked out")]
    BookNotCheckedOut(BookId),

    /// Reading a book someone else holds; never names the borrower
    #[error("book is currently checked out by another member")]
    HeldByAnotherMember,

    /// Removal of a book that is checked out or has a queue
    #[error("book {0} is checked out or has pending reservations")]
    BookInCirculation(BookId),

    /// Wrong password, or unknown member id
    #[error("{}", AUTH_FAILED_MESSAGE)]
    InvalidCredential,

    /// Legacy member without a password hash
    #[error("no password is set for this account; a password reset is required")]
    NoCredentialSet,

    /// No open reservation for this (book, member) pair
    #[error("no active reservation found for member {member} on book {book}")]
    NoActiveReservation { book: BookId, member: MemberId },

    /// Return attempted by someone other than the borrower
    #[error("book {0} is checked out by another member")]
    NotBorrower(BookId),

    /// Store lock could not be acquired in time
    #[error("timed out waiting for a store lock; try again")]
    LockTimeout,

    /// Request failed validation
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Book content is empty or whitespace only
    #[error("book has no content to read")]
    NoContent,

    /// Storage backend failure
    #[error("storage error: {0}")]
    Storage(String),

    /// Password hashing backend failure
    #[error("credential error: {0}")]
    Credential(String),
}

impl CirculationError {
    /// Classifies the error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::BookNotFound(_) | Self::MemberNotFound(_) => ErrorKind::NotFound,
            Self::BookUnavailable(_)
            | Self::AlreadyCheckedOutBySelf
            | Self::DuplicateReservation
            | Self::BookNotCheckedOut(_)
            | Self::HeldByAnotherMember
            | Self::BookInCirculation(_) => ErrorKind::Conflict,
            Self::InvalidCredential
            | Self::NoCredentialSet
            | Self::NoActiveReservation { .. }
            | Self::NotBorrower(_) => ErrorKind::Unauthorized,
            Self::LockTimeout => ErrorKind::Transient,
            Self::InvalidInput(_) | Self::NoContent => ErrorKind::Invalid,
            Self::Storage(_) | Self::Credential(_) => ErrorKind::Storage,
        }
    }

    /// Returns `true` if retrying the same call may succeed.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }
}

impl From<rusqlite::Error> for CirculationError {
    fn from(err: rusqlite::Error) -> Self {
        use rusqlite::ErrorCode;

        match err.sqlite_error_code() {
            Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) => Self::LockTimeout,
            _ => Self::Storage(err.to_string()),
        }
    }
}

impl From<bcrypt::BcryptError> for CirculationError {
    fn from(err: bcrypt::BcryptError) -> Self {
        Self::Credential(err.to_string())
    }
}
