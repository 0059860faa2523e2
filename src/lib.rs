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

//! # Circulation
//!
//! This library tracks books, members, checkouts and FIFO reservation queues
//! for a small lending library, with password authentication and full-text
//! search.
//!
//! ## Core Components
//!
//! - [`Engine`]: Circulation state machine (checkout, reserve, return, cancel)
//! - [`Library`]: Catalog facade combining the engine with search
//! - [`Store`]: Transactional record store, either [`MemoryStore`] or [`SqliteStore`]
//! - [`CredentialVerifier`]: Password hashing, bcrypt by default
//! - [`CirculationError`]: Error types for circulation failures
//!
//! ## Example
//!
//! ```
//! use circulation_rs::{BcryptVerifier, Library, MemoryStore, ReserveOutcome};
//! use std::sync::Arc;
//!
//! let library = Library::new(Arc::new(MemoryStore::new()), Arc::new(BcryptVerifier::new(4)));
//!
//! let book = library.add_book("Dune", "Frank Herbert", "A beginning is the time...").unwrap();
//! let alice = library.add_member("Alice", "alice-secret").unwrap();
//! let bob = library.add_member("Bob", "bob-secret").unwrap();
//!
//! library.checkout_book(book, alice).unwrap();
//! let outcome = library.reserve_book(book, bob).unwrap();
//! assert!(matches!(outcome, ReserveOutcome::Queued { position: 1, .. }));
//!
//! // Returning hands the book to the head of the queue.
//! let returned = library.return_book(book).unwrap();
//! assert_eq!(returned.assigned_to, Some(bob));
//! ```
//!
//! ## Thread Safety
//!
//! Every operation runs as one store transaction. Operations may be called
//! from any number of threads; conflicting ones serialize on the store lock.

mod base;
mod book;
pub mod config;
mod credential;
mod engine;
pub mod error;
pub mod import;
mod index_feed;
mod library;
mod member;
mod memory_store;
mod record;
pub mod search;
mod sqlite_store;
mod store;

pub use base::{BookId, CheckoutId, MemberId, ReservationId};
pub use book::{Book, BookSummary, ContentMeta, content_chunk, page_count};
pub use config::{Config, ConfigError};
pub use credential::{BcryptVerifier, CredentialVerifier, MAX_BCRYPT_COST, MIN_BCRYPT_COST};
pub use engine::{Engine, ReadAccess, ReadingGrant, ReserveOutcome, ReturnOutcome};
pub use error::{AUTH_FAILED_MESSAGE, CirculationError, ErrorKind};
pub use import::{ImportError, ImportReport, import_manifest};
pub use index_feed::{IndexFeed, SyncError};
pub use library::Library;
pub use member::Member;
pub use memory_store::{MemoryStore, MemoryTxn};
pub use record::{CheckoutRecord, Reservation};
pub use search::{BookDocument, InvertedIndex, SearchError, SearchIndex};
pub use sqlite_store::{SqliteStore, SqliteTxn};
pub use store::{DEFAULT_LOCK_TIMEOUT, MAX_LOCK_TIMEOUT, Store, StoreResult, StoreTxn};
