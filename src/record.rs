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

//! Checkout and reservation records.
//!
//! Both records are *open* until their closing timestamp is set:
//! - [`CheckoutRecord`]: open → closed (via return)
//! - [`Reservation`]: open → fulfilled (via return of the book), or deleted
//!   (via cancellation)

use crate::base::{BookId, CheckoutId, MemberId, ReservationId};
use chrono::{DateTime, Utc};
use serde::Serialize;

/// One period of custody of a book by a member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckoutRecord {
    pub id: CheckoutId,
    pub book_id: BookId,
    pub member_id: MemberId,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl CheckoutRecord {
    pub fn is_open(&self) -> bool {
        self.ended_at.is_none()
    }
}

/// A member's place in a book's queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Reservation {
    pub id: ReservationId,
    pub book_id: BookId,
    pub member_id: MemberId,
    pub created_at: DateTime<Utc>,
    pub fulfilled_at: Option<DateTime<Utc>>,
}

impl Reservation {
    pub fn is_open(&self) -> bool {
        self.fulfilled_at.is_none()
    }

    /// FIFO key: creation time, then id for reservations created in the
    /// same instant.
    pub fn queue_key(&self) -> (DateTime<Utc>, ReservationId) {
        (self.created_at, self.id)
    }
}
