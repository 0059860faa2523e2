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

//! Catalog book records.
//!
//! A book is either available or held by exactly one member. Availability is
//! derived from the borrower so the two can never disagree:
//!
//! ```
//! use circulation_rs::{Book, BookId, MemberId};
//!
//! let mut book = Book::new(BookId(1), "Dune", "Frank Herbert", "");
//! assert!(book.is_available());
//!
//! book.borrower = Some(MemberId(7));
//! assert!(!book.is_available());
//! ```

use crate::base::{BookId, MemberId};
use serde::ser::{Serialize, SerializeStruct, Serializer};

/// A book with its full text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Book {
    pub id: BookId,
    pub title: String,
    pub author: String,
    pub content: String,
    /// Member holding the open checkout, if any.
    pub borrower: Option<MemberId>,
}

impl Book {
    pub fn new(
        id: BookId,
        title: impl Into<String>,
        author: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id,
            title: title.into(),
            author: author.into(),
            content: content.into(),
            borrower: None,
        }
    }

    pub fn is_available(&self) -> bool {
        self.borrower.is_none()
    }

    /// Returns `true` if the content holds anything besides whitespace.
    pub fn has_content(&self) -> bool {
        !self.content.trim().is_empty()
    }

    /// Length of the content in characters.
    pub fn content_len(&self) -> usize {
        self.content.chars().count()
    }

    pub fn content_meta(&self) -> ContentMeta {
        ContentMeta {
            len: self.content_len(),
            has_text: self.has_content(),
        }
    }

    /// Drops the content.
    pub fn summary(&self) -> BookSummary {
        BookSummary {
            id: self.id,
            title: self.title.clone(),
            author: self.author.clone(),
            borrower: self.borrower,
        }
    }
}

/// What reading needs to know about a book's content, without the text.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ContentMeta {
    /// Length in characters.
    pub len: usize,
    /// `false` when the content is empty or only whitespace.
    pub has_text: bool,
}

/// Book metadata without content, used for listings and search results.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookSummary {
    pub id: BookId,
    pub title: String,
    pub author: String,
    pub borrower: Option<MemberId>,
}

impl BookSummary {
    pub fn is_available(&self) -> bool {
        self.borrower.is_none()
    }
}

impl Serialize for BookSummary {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut state = serializer.serialize_struct("BookSummary", 5)?;
        state.serialize_field("id", &self.id)?;
        state.serialize_field("title", &self.title)?;
        state.serialize_field("author", &self.author)?;
        state.serialize_field("available", &self.is_available())?;
        state.serialize_field("borrower", &self.borrower)?;
        state.end()
    }
}

/// Returns the characters `[offset, offset + len)` of `content`.
///
/// Offsets are counted in characters, not bytes, so multi-byte text is never
/// split inside a code point. Out-of-range offsets yield an empty string.
pub fn content_chunk(content: &str, offset: usize, len: usize) -> String {
    content.chars().skip(offset).take(len).collect()
}

/// Number of pages of `page_size` characters needed for `content_len`
/// characters.
pub fn page_count(content_len: usize, page_size: usize) -> usize {
    if page_size == 0 {
        return 0;
    }
    content_len.div_ceil(page_size)
}
