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

//! SQLite-backed catalog store.
//!
//! Transactions start with `BEGIN IMMEDIATE`, which takes SQLite's write lock
//! up front. Two processes sharing a database file therefore serialize their
//! circulation operations instead of failing at commit time. Within one
//! process the connection sits behind a [`parking_lot::Mutex`]. Both waits
//! are bounded by the lock timeout and surface as
//! [`CirculationError::LockTimeout`].
//!
//! The schema mirrors the circulation invariants:
//! - `CHECK (available = (borrower_id IS NULL))` on `books`
//! - a unique partial index allowing one open checkout per book
//! - a unique partial index allowing one open reservation per (book, member)

use crate::base::{BookId, CheckoutId, MemberId, ReservationId};
use crate::book::{Book, BookSummary, ContentMeta};
use crate::member::Member;
use crate::record::{CheckoutRecord, Reservation};
use crate::store::{DEFAULT_LOCK_TIMEOUT, MAX_LOCK_TIMEOUT, Store, StoreResult, StoreTxn};
use crate::CirculationError;
use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::{Mutex, MutexGuard};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, params};
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

const SCHEMA_VERSION: i64 = 1;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS members (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    name            TEXT NOT NULL,
    credential_hash TEXT
);

CREATE TABLE IF NOT EXISTS books (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    title       TEXT NOT NULL,
    author      TEXT NOT NULL,
    content     TEXT NOT NULL DEFAULT '',
    available   INTEGER NOT NULL DEFAULT 1,
    borrower_id INTEGER REFERENCES members(id),
    CHECK (available = (borrower_id IS NULL))
);

CREATE TABLE IF NOT EXISTS checkouts (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    book_id    INTEGER NOT NULL REFERENCES books(id) ON DELETE CASCADE,
    member_id  INTEGER NOT NULL REFERENCES members(id),
    started_at TEXT NOT NULL,
    ended_at   TEXT
);

CREATE UNIQUE INDEX IF NOT EXISTS checkouts_open_per_book
    ON checkouts(book_id) WHERE ended_at IS NULL;
CREATE INDEX IF NOT EXISTS checkouts_by_member ON checkouts(member_id);

CREATE TABLE IF NOT EXISTS reservations (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    book_id      INTEGER NOT NULL REFERENCES books(id) ON DELETE CASCADE,
    member_id    INTEGER NOT NULL REFERENCES members(id),
    created_at   TEXT NOT NULL,
    fulfilled_at TEXT
);

CREATE UNIQUE INDEX IF NOT EXISTS reservations_open_per_member
    ON reservations(book_id, member_id) WHERE fulfilled_at IS NULL;
CREATE INDEX IF NOT EXISTS reservations_queue ON reservations(book_id, created_at, id);
CREATE INDEX IF NOT EXISTS reservations_by_member ON reservations(member_id);
"#;

const CHECKOUT_COLUMNS: &str = "id, book_id, member_id, started_at, ended_at";
const RESERVATION_COLUMNS: &str = "id, book_id, member_id, created_at, fulfilled_at";

/// Characters with the Unicode `White_Space` property, as SQL `trim` input.
const WHITESPACE: &str = "char(9, 10, 11, 12, 13, 32, 133, 160, 5760, 8192, 8193, 8194, \
    8195, 8196, 8197, 8198, 8199, 8200, 8201, 8202, 8232, 8233, 8239, 8287, 12288)";

/// Catalog store persisted in SQLite.
#[derive(Debug)]
pub struct SqliteStore {
    conn: Mutex<Connection>,
    lock_timeout: Duration,
}

impl SqliteStore {
    /// Opens (or creates) the database at `path` and applies the schema.
    ///
    /// The parent directory is created if missing so a first run succeeds.
    pub fn open(path: impl AsRef<Path>, lock_timeout: Duration) -> StoreResult<Self> {
        let path = path.as_ref();
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir).map_err(|e| {
                CirculationError::Storage(format!("create {}: {e}", dir.display()))
            })?;
        }
        let conn = Connection::open(path)?;
        // WAL lets readers proceed while a writer holds the lock.
        let mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        info!(path = %path.display(), journal_mode = %mode, "opened sqlite store");
        Self::init(conn, lock_timeout)
    }

    /// Opens a private in-memory database.
    pub fn open_in_memory() -> StoreResult<Self> {
        Self::init(Connection::open_in_memory()?, DEFAULT_LOCK_TIMEOUT)
    }

    fn init(mut conn: Connection, lock_timeout: Duration) -> StoreResult<Self> {
        if lock_timeout > MAX_LOCK_TIMEOUT {
            return Err(CirculationError::InvalidInput(format!(
                "lock timeout of {}ms exceeds {}ms",
                lock_timeout.as_millis(),
                MAX_LOCK_TIMEOUT.as_millis()
            )));
        }
        conn.busy_timeout(lock_timeout)?;
        conn.pragma_update(None, "foreign_keys", true)?;
        migrate(&mut conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            lock_timeout,
        })
    }
}

fn migrate(conn: &mut Connection) -> StoreResult<()> {
    conn.execute_batch("CREATE TABLE IF NOT EXISTS meta (key TEXT PRIMARY KEY, value TEXT);")?;

    let current: Option<String> = conn
        .query_row("SELECT value FROM meta WHERE key = 'schema_version'", [], |row| {
            row.get(0)
        })
        .optional()?;
    let current = current.and_then(|v| v.parse::<i64>().ok()).unwrap_or(0);
    if current >= SCHEMA_VERSION {
        return Ok(());
    }

    let tx = conn.transaction()?;
    tx.execute_batch(SCHEMA)?;
    tx.execute(
        "INSERT INTO meta(key, value) VALUES ('schema_version', ?1)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        params![SCHEMA_VERSION.to_string()],
    )?;
    tx.commit()?;
    info!(from = current, to = SCHEMA_VERSION, "applied schema migration");
    Ok(())
}

impl Store for SqliteStore {
    type Txn<'a> = SqliteTxn<'a>;

    fn begin(&self) -> StoreResult<SqliteTxn<'_>> {
        let conn = self
            .conn
            .try_lock_for(self.lock_timeout)
            .ok_or(CirculationError::LockTimeout)?;
        conn.execute_batch("BEGIN IMMEDIATE")?;
        Ok(SqliteTxn {
            conn,
            finished: false,
        })
    }
}

/// Transaction over a [`SqliteStore`].
#[derive(Debug)]
pub struct SqliteTxn<'a> {
    conn: MutexGuard<'a, Connection>,
    finished: bool,
}

impl Drop for SqliteTxn<'_> {
    fn drop(&mut self) {
        if !self.finished {
            if let Err(err) = self.conn.execute_batch("ROLLBACK") {
                warn!(error = %err, "rollback of abandoned transaction failed");
            }
        }
    }
}

fn format_timestamp(at: DateTime<Utc>) -> String {
    // Fixed-width so that text order equals time order.
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(idx: usize, text: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn timestamp(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let text: String = row.get(idx)?;
    parse_timestamp(idx, &text)
}

fn optional_timestamp(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let text: Option<String> = row.get(idx)?;
    text.map(|t| parse_timestamp(idx, &t)).transpose()
}

fn book_summary_row(row: &Row<'_>) -> rusqlite::Result<BookSummary> {
    Ok(BookSummary {
        id: BookId(row.get(0)?),
        title: row.get(1)?,
        author: row.get(2)?,
        borrower: row.get::<_, Option<i64>>(3)?.map(MemberId),
    })
}

fn member_row(row: &Row<'_>) -> rusqlite::Result<Member> {
    Ok(Member {
        id: MemberId(row.get(0)?),
        name: row.get(1)?,
        credential_hash: row.get(2)?,
    })
}

fn checkout_row(row: &Row<'_>) -> rusqlite::Result<CheckoutRecord> {
    Ok(CheckoutRecord {
        id: CheckoutId(row.get(0)?),
        book_id: BookId(row.get(1)?),
        member_id: MemberId(row.get(2)?),
        started_at: timestamp(row, 3)?,
        ended_at: optional_timestamp(row, 4)?,
    })
}

fn reservation_row(row: &Row<'_>) -> rusqlite::Result<Reservation> {
    Ok(Reservation {
        id: ReservationId(row.get(0)?),
        book_id: BookId(row.get(1)?),
        member_id: MemberId(row.get(2)?),
        created_at: timestamp(row, 3)?,
        fulfilled_at: optional_timestamp(row, 4)?,
    })
}

/// Escapes `%`, `_` and `\` for a `LIKE ... ESCAPE '\'` pattern.
fn like_pattern(needle: &str) -> String {
    let mut pattern = String::with_capacity(needle.len() + 2);
    pattern.push('%');
    for c in needle.chars() {
        if matches!(c, '%' | '_' | '\\') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push('%');
    pattern
}

impl SqliteTxn<'_> {
    fn query_checkouts(
        &self,
        filter: &str,
        param: i64,
    ) -> StoreResult<Vec<CheckoutRecord>> {
        let sql = format!("SELECT {CHECKOUT_COLUMNS} FROM checkouts WHERE {filter}");
        let mut stmt = self.conn.prepare_cached(&sql)?;
        let rows = stmt.query_map(params![param], checkout_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn query_reservations(
        &self,
        filter: &str,
        param: i64,
    ) -> StoreResult<Vec<Reservation>> {
        let sql = format!("SELECT {RESERVATION_COLUMNS} FROM reservations WHERE {filter}");
        let mut stmt = self.conn.prepare_cached(&sql)?;
        let rows = stmt.query_map(params![param], reservation_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }
}

impl StoreTxn for SqliteTxn<'_> {
    fn commit(mut self) -> StoreResult<()> {
        self.conn.execute_batch("COMMIT")?;
        self.finished = true;
        Ok(())
    }

    fn rollback(mut self) -> StoreResult<()> {
        self.finished = true;
        self.conn.execute_batch("ROLLBACK")?;
        Ok(())
    }

    fn insert_book(&mut self, title: &str, author: &str, content: &str) -> StoreResult<BookId> {
        self.conn
            .prepare_cached("INSERT INTO books(title, author, content) VALUES (?1, ?2, ?3)")?
            .execute(params![title, author, content])?;
        Ok(BookId(self.conn.last_insert_rowid()))
    }

    fn book(&mut self, id: BookId) -> StoreResult<Option<Book>> {
        let book = self
            .conn
            .prepare_cached(
                "SELECT id, title, author, content, borrower_id FROM books WHERE id = ?1",
            )?
            .query_row(params![id.0], |row| {
                Ok(Book {
                    id: BookId(row.get(0)?),
                    title: row.get(1)?,
                    author: row.get(2)?,
                    content: row.get(3)?,
                    borrower: row.get::<_, Option<i64>>(4)?.map(MemberId),
                })
            })
            .optional()?;
        Ok(book)
    }

    fn book_summary(&mut self, id: BookId) -> StoreResult<Option<BookSummary>> {
        let summary = self
            .conn
            .prepare_cached("SELECT id, title, author, borrower_id FROM books WHERE id = ?1")?
            .query_row(params![id.0], book_summary_row)
            .optional()?;
        Ok(summary)
    }

    fn books(&mut self) -> StoreResult<Vec<BookSummary>> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT id, title, author, borrower_id FROM books ORDER BY id")?;
        let rows = stmt.query_map([], book_summary_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn set_book_content(&mut self, id: BookId, content: &str) -> StoreResult<bool> {
        let changed = self
            .conn
            .prepare_cached("UPDATE books SET content = ?2 WHERE id = ?1")?
            .execute(params![id.0, content])?;
        Ok(changed > 0)
    }

    fn delete_book(&mut self, id: BookId) -> StoreResult<bool> {
        let changed = self
            .conn
            .prepare_cached("DELETE FROM books WHERE id = ?1")?
            .execute(params![id.0])?;
        Ok(changed > 0)
    }

    fn set_borrower(&mut self, id: BookId, borrower: Option<MemberId>) -> StoreResult<()> {
        let changed = self
            .conn
            .prepare_cached("UPDATE books SET available = ?2, borrower_id = ?3 WHERE id = ?1")?
            .execute(params![id.0, borrower.is_none(), borrower.map(|m| m.0)])?;
        if changed == 0 {
            return Err(CirculationError::BookNotFound(id));
        }
        Ok(())
    }

    fn content_meta(&mut self, id: BookId) -> StoreResult<Option<ContentMeta>> {
        // length() counts characters for TEXT values.
        let sql = format!(
            "SELECT length(content), length(trim(content, {WHITESPACE})) > 0
             FROM books WHERE id = ?1"
        );
        let meta = self
            .conn
            .prepare_cached(&sql)?
            .query_row(params![id.0], |row| {
                Ok(ContentMeta {
                    len: usize::try_from(row.get::<_, i64>(0)?).unwrap_or(0),
                    has_text: row.get(1)?,
                })
            })
            .optional()?;
        Ok(meta)
    }

    fn content_chunk(
        &mut self,
        id: BookId,
        offset: usize,
        len: usize,
    ) -> StoreResult<Option<String>> {
        // An offset SQLite cannot address is past the end of any text.
        let Ok(start) = i64::try_from(offset) else {
            return Ok(self.book_summary(id)?.map(|_| String::new()));
        };
        let start = start.saturating_add(1);
        let len = i64::try_from(len).unwrap_or(i64::MAX);
        let chunk = self
            .conn
            .prepare_cached("SELECT substr(content, ?2, ?3) FROM books WHERE id = ?1")?
            .query_row(params![id.0, start, len], |row| row.get(0))
            .optional()?;
        Ok(chunk)
    }

    fn find_books(&mut self, needle: &str) -> StoreResult<Vec<BookSummary>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT id, title, author, borrower_id FROM books
             WHERE title LIKE ?1 ESCAPE '\\' OR author LIKE ?1 ESCAPE '\\'
             ORDER BY id",
        )?;
        let rows = stmt.query_map(params![like_pattern(needle)], book_summary_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn insert_member(
        &mut self,
        name: &str,
        credential_hash: Option<&str>,
    ) -> StoreResult<MemberId> {
        self.conn
            .prepare_cached("INSERT INTO members(name, credential_hash) VALUES (?1, ?2)")?
            .execute(params![name, credential_hash])?;
        Ok(MemberId(self.conn.last_insert_rowid()))
    }

    fn member(&mut self, id: MemberId) -> StoreResult<Option<Member>> {
        let member = self
            .conn
            .prepare_cached("SELECT id, name, credential_hash FROM members WHERE id = ?1")?
            .query_row(params![id.0], member_row)
            .optional()?;
        Ok(member)
    }

    fn members(&mut self) -> StoreResult<Vec<Member>> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT id, name, credential_hash FROM members ORDER BY id")?;
        let rows = stmt.query_map([], member_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn set_credential(
        &mut self,
        id: MemberId,
        credential_hash: Option<&str>,
    ) -> StoreResult<bool> {
        let changed = self
            .conn
            .prepare_cached("UPDATE members SET credential_hash = ?2 WHERE id = ?1")?
            .execute(params![id.0, credential_hash])?;
        Ok(changed > 0)
    }

    fn open_checkout(&mut self, book: BookId) -> StoreResult<Option<CheckoutRecord>> {
        Ok(self
            .query_checkouts("book_id = ?1 AND ended_at IS NULL", book.0)?
            .into_iter()
            .next())
    }

    fn insert_checkout(
        &mut self,
        book: BookId,
        member: MemberId,
        at: DateTime<Utc>,
    ) -> StoreResult<CheckoutRecord> {
        self.conn
            .prepare_cached(
                "INSERT INTO checkouts(book_id, member_id, started_at) VALUES (?1, ?2, ?3)",
            )?
            .execute(params![book.0, member.0, format_timestamp(at)])?;
        Ok(CheckoutRecord {
            id: CheckoutId(self.conn.last_insert_rowid()),
            book_id: book,
            member_id: member,
            started_at: at,
            ended_at: None,
        })
    }

    fn close_checkout(&mut self, id: CheckoutId, at: DateTime<Utc>) -> StoreResult<()> {
        let changed = self
            .conn
            .prepare_cached("UPDATE checkouts SET ended_at = ?2 WHERE id = ?1")?
            .execute(params![id.0, format_timestamp(at)])?;
        if changed == 0 {
            return Err(CirculationError::Storage(format!("checkout {id} not found")));
        }
        Ok(())
    }

    fn checkout_history(&mut self, book: BookId) -> StoreResult<Vec<CheckoutRecord>> {
        self.query_checkouts("book_id = ?1 ORDER BY id DESC", book.0)
    }

    fn open_checkouts_for_member(
        &mut self,
        member: MemberId,
    ) -> StoreResult<Vec<CheckoutRecord>> {
        self.query_checkouts("member_id = ?1 AND ended_at IS NULL ORDER BY id", member.0)
    }

    fn open_reservation(
        &mut self,
        book: BookId,
        member: MemberId,
    ) -> StoreResult<Option<Reservation>> {
        let sql = format!(
            "SELECT {RESERVATION_COLUMNS} FROM reservations
             WHERE book_id = ?1 AND member_id = ?2 AND fulfilled_at IS NULL"
        );
        let reservation = self
            .conn
            .prepare_cached(&sql)?
            .query_row(params![book.0, member.0], reservation_row)
            .optional()?;
        Ok(reservation)
    }

    fn insert_reservation(
        &mut self,
        book: BookId,
        member: MemberId,
        at: DateTime<Utc>,
    ) -> StoreResult<Reservation> {
        self.conn
            .prepare_cached(
                "INSERT INTO reservations(book_id, member_id, created_at) VALUES (?1, ?2, ?3)",
            )?
            .execute(params![book.0, member.0, format_timestamp(at)])?;
        Ok(Reservation {
            id: ReservationId(self.conn.last_insert_rowid()),
            book_id: book,
            member_id: member,
            created_at: at,
            fulfilled_at: None,
        })
    }

    fn next_reservation(&mut self, book: BookId) -> StoreResult<Option<Reservation>> {
        Ok(self
            .query_reservations(
                "book_id = ?1 AND fulfilled_at IS NULL ORDER BY created_at, id LIMIT 1",
                book.0,
            )?
            .into_iter()
            .next())
    }

    fn fulfill_reservation(&mut self, id: ReservationId, at: DateTime<Utc>) -> StoreResult<()> {
        let changed = self
            .conn
            .prepare_cached("UPDATE reservations SET fulfilled_at = ?2 WHERE id = ?1")?
            .execute(params![id.0, format_timestamp(at)])?;
        if changed == 0 {
            return Err(CirculationError::Storage(format!("reservation {id} not found")));
        }
        Ok(())
    }

    fn delete_reservation(&mut self, id: ReservationId) -> StoreResult<()> {
        self.conn
            .prepare_cached("DELETE FROM reservations WHERE id = ?1")?
            .execute(params![id.0])?;
        Ok(())
    }

    fn reservations_for_book(&mut self, book: BookId) -> StoreResult<Vec<Reservation>> {
        self.query_reservations(
            "book_id = ?1 AND fulfilled_at IS NULL ORDER BY created_at, id",
            book.0,
        )
    }

    fn reservations_for_member(&mut self, member: MemberId) -> StoreResult<Vec<Reservation>> {
        self.query_reservations(
            "member_id = ?1 AND fulfilled_at IS NULL ORDER BY created_at, id",
            member.0,
        )
    }
}
