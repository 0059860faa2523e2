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

//! Thread-safe queue of pending search-index updates.
//!
//! Catalog writes publish the id of the changed book once their transaction
//! has committed. The feed does not carry document text: [`IndexFeed::sync`]
//! loads each book's current row when it applies the update, so the index
//! follows commit order whatever order the ids were published in. A missing
//! row removes the book from the index.

use crate::base::BookId;
use crate::error::CirculationError;
use crate::search::{BookDocument, SearchError, SearchIndex};
use crossbeam::queue::SegQueue;
use dashmap::DashSet;
use parking_lot::Mutex;
use thiserror::Error;

/// Why a sync stopped early.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The index rejected an update.
    #[error(transparent)]
    Index(#[from] SearchError),

    /// The book could not be loaded from the store.
    #[error(transparent)]
    Store(#[from] CirculationError),
}

/// Books whose index entry is out of date.
///
/// A [`DashSet`] holds the pending book ids and a [`SegQueue`] keeps them in
/// FIFO order of first publication. A book id is queued exactly while it is
/// pending. Syncs run one at a time.
#[derive(Debug, Default)]
pub struct IndexFeed {
    pending: DashSet<BookId>,
    order: SegQueue<BookId>,
    syncing: Mutex<()>,
}

impl IndexFeed {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks a book as changed. Publishing a pending book is a no-op.
    pub fn publish(&self, book: BookId) {
        if self.pending.insert(book) {
            self.order.push(book);
        }
    }

    /// Number of books with pending updates.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Applies pending updates to `index` in FIFO order.
    ///
    /// `load` returns the book's current document, or `None` once the book
    /// is gone. A book is unmarked before it is loaded, so a commit that
    /// lands during the sync publishes it again and it is applied once more.
    ///
    /// Returns the number of updates applied.
    ///
    /// # Errors
    ///
    /// Stops at the first failure and returns it. The failed book goes back
    /// to the end of the queue.
    pub fn sync<F>(&self, index: &dyn SearchIndex, mut load: F) -> Result<usize, SyncError>
    where
        F: FnMut(BookId) -> Result<Option<BookDocument>, CirculationError>,
    {
        let _guard = self.syncing.lock();
        let mut applied = 0;
        while let Some(book) = self.order.pop() {
            if self.pending.remove(&book).is_none() {
                continue;
            }
            if let Err(err) = apply(index, book, &mut load) {
                self.publish(book);
                return Err(err);
            }
            applied += 1;
        }
        Ok(applied)
    }
}

fn apply<F>(index: &dyn SearchIndex, book: BookId, load: &mut F) -> Result<(), SyncError>
where
    F: FnMut(BookId) -> Result<Option<BookDocument>, CirculationError>,
{
    match load(book)? {
        Some(doc) => index.upsert(&doc)?,
        None => index.delete(book)?,
    }
    Ok(())
}
