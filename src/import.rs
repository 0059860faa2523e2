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

//! Bulk import of books from a CSV manifest.
//!
//! # Manifest Format
//!
//! ```csv
//! title,author,path
//! 1984,George Orwell,texts/1984.txt
//! Animal Farm,George Orwell,texts/animal_farm.txt
//! ```
//!
//! Relative paths are resolved against the manifest's directory.

use crate::library::Library;
use crate::store::Store;
use csv::{ReaderBuilder, Trim};
use serde::Deserialize;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum ImportError {
    #[error("failed to open manifest {}: {source}", path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to read manifest: {0}")]
    Csv(#[from] csv::Error),
}

/// Outcome of an import run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportReport {
    pub imported: usize,
    pub skipped: usize,
}

#[derive(Debug, Deserialize)]
struct ManifestRow {
    title: String,
    author: String,
    path: PathBuf,
}

/// Imports every book listed in the manifest at `manifest`.
pub fn import_manifest<S: Store>(
    library: &Library<S>,
    manifest: &Path,
) -> Result<ImportReport, ImportError> {
    let file = File::open(manifest).map_err(|source| ImportError::Open {
        path: manifest.to_path_buf(),
        source,
    })?;
    let base_dir = manifest.parent().unwrap_or_else(|| Path::new(""));
    import_from_reader(library, BufReader::new(file), base_dir)
}

/// Streams manifest rows from `reader`, adding one book per row.
///
/// Malformed rows, unreadable files and rejected books are logged, counted
/// as skipped and do not stop the import.
///
/// # Errors
///
/// Only a failure to read the manifest itself, such as a missing header.
pub fn import_from_reader<S: Store, R: Read>(
    library: &Library<S>,
    reader: R,
    base_dir: &Path,
) -> Result<ImportReport, ImportError> {
    let mut rdr = ReaderBuilder::new()
        .trim(Trim::All)
        .has_headers(true)
        .from_reader(reader);
    // Surface a missing or unreadable header before touching any rows.
    rdr.headers()?;

    let mut report = ImportReport::default();
    for result in rdr.deserialize::<ManifestRow>() {
        let row = match result {
            Ok(row) => row,
            Err(err) => {
                warn!(error = %err, "skipping malformed manifest row");
                report.skipped += 1;
                continue;
            }
        };

        let path = base_dir.join(&row.path);
        let added = File::open(&path)
            .map_err(|e| e.to_string())
            .and_then(|file| {
                library
                    .add_book_from_reader(&row.title, &row.author, BufReader::new(file))
                    .map_err(|e| e.to_string())
            });
        match added {
            Ok(book) => {
                debug!(book = %book, path = %path.display(), "imported book");
                report.imported += 1;
            }
            Err(err) => {
                warn!(path = %path.display(), error = %err, "skipping book");
                report.skipped += 1;
            }
        }
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credential::{BcryptVerifier, MIN_BCRYPT_COST};
    use crate::memory_store::MemoryStore;
    use std::fs;
    use std::io::Cursor;
    use std::sync::Arc;

    fn library() -> Library<MemoryStore> {
        Library::new(
            Arc::new(MemoryStore::new()),
            Arc::new(BcryptVerifier::new(MIN_BCRYPT_COST)),
        )
    }

    #[test]
    fn imports_rows_relative_to_base_dir() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("texts")).unwrap();
        fs::write(dir.path().join("texts/1984.txt"), "It was a bright cold day").unwrap();
        fs::write(dir.path().join("texts/farm.txt"), "Mr. Jones, of the Manor Farm").unwrap();
        let manifest = dir.path().join("manifest.csv");
        fs::write(
            &manifest,
            "title,author,path\n\
             1984,George Orwell,texts/1984.txt\n\
             Animal Farm , George Orwell , texts/farm.txt\n",
        )
        .unwrap();

        let library = library();
        let report = import_manifest(&library, &manifest).unwrap();

        assert_eq!(report, ImportReport { imported: 2, skipped: 0 });
        let books = library.books().unwrap();
        assert_eq!(books[1].title, "Animal Farm");
        assert_eq!(library.book(books[0].id).unwrap().content, "It was a bright cold day");
    }

    #[test]
    fn bad_rows_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("ok.txt"), "text").unwrap();
        let csv = "title,author,path\n\
                   Good,Someone,ok.txt\n\
                   Missing,Someone,nowhere.txt\n\
                   ,Someone,ok.txt\n\
                   too,few\n";

        let library = library();
        let report = import_from_reader(&library, Cursor::new(csv), dir.path()).unwrap();

        assert_eq!(report, ImportReport { imported: 1, skipped: 3 });
        assert_eq!(library.books().unwrap().len(), 1);
    }

    #[test]
    fn missing_manifest_is_an_error() {
        let result = import_manifest(&library(), Path::new("/nonexistent/manifest.csv"));
        assert!(matches!(result, Err(ImportError::Open { .. })));
    }
}
