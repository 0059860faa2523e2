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

use anyhow::{Context, bail};
use circulation_rs::{
    BcryptVerifier, BookId, BookSummary, CheckoutRecord, Config, Library, Member, MemberId,
    ReserveOutcome, SqliteStore, Store, import_manifest,
};
use clap::{Args, Parser, Subcommand};
use csv::Writer;
use std::fs::File;
use std::io::{BufReader, Write};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tracing::warn;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Library circulation - manage books, members, loans and reservations
///
/// Listings are written to stdout as CSV; logs go to stderr.
#[derive(Parser, Debug)]
#[command(name = "circulation")]
#[command(about = "A library circulation service", long_about = None)]
struct Cli {
    /// TOML config file
    #[arg(short, long, env = "CIRCULATION_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    /// SQLite database file, overriding `database.path` from the config
    #[arg(long, env = "CIRCULATION_DB", value_name = "FILE")]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

/// Credentials of the member performing a circulation command.
#[derive(Args, Debug)]
struct Auth {
    /// Member ID
    #[arg(long)]
    member: i64,

    #[command(flatten)]
    password: Password,
}

#[derive(Args, Debug)]
struct Password {
    /// Password; prefer the environment variable over the command line
    #[arg(long, env = "CIRCULATION_PASSWORD", hide_env_values = true)]
    password: String,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Add a book, optionally reading its text from a file
    AddBook {
        title: String,
        author: String,
        #[arg(long, value_name = "FILE")]
        content_file: Option<PathBuf>,
    },
    /// Replace a book's text with the contents of a file
    UpdateContent {
        book: i64,
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },
    /// Remove a book that is on the shelf
    RemoveBook { book: i64 },
    /// List all books
    ListBooks,
    /// Search titles, authors and text
    Search { query: String },
    /// Register a member
    AddMember {
        name: String,
        #[command(flatten)]
        password: Password,
    },
    /// List all members
    ListMembers,
    /// Set a new password for a member
    ResetPassword {
        member: i64,
        #[command(flatten)]
        password: Password,
    },
    /// Check out an available book
    Checkout {
        book: i64,
        #[command(flatten)]
        auth: Auth,
    },
    /// Return a book you hold
    Return {
        book: i64,
        #[command(flatten)]
        auth: Auth,
    },
    /// Reserve a book, checking it out if it is available
    Reserve {
        book: i64,
        #[command(flatten)]
        auth: Auth,
    },
    /// Cancel your reservation for a book
    Cancel {
        book: i64,
        #[command(flatten)]
        auth: Auth,
    },
    /// Show the queue for a book, or the reservations of a member
    Reservations {
        #[arg(long, conflicts_with = "member", required_unless_present = "member")]
        book: Option<i64>,
        #[arg(long)]
        member: Option<i64>,
    },
    /// Show the checkout history of a book
    History { book: i64 },
    /// Read a page of a book, checking it out if it is available
    Read {
        book: i64,
        #[command(flatten)]
        auth: Auth,
        /// Page number, starting at 1
        #[arg(long, default_value_t = 1)]
        page: usize,
    },
    /// Import books listed in a CSV manifest (title,author,path)
    Import {
        #[arg(value_name = "FILE")]
        manifest: PathBuf,
    },
}

fn main() {
    let cli = Cli::parse();

    if let Err(e) = run(cli) {
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    init_tracing(&config.log.filter);

    let verifier = Arc::new(BcryptVerifier::new(config.auth.bcrypt_cost));
    let store = match cli.db.as_ref().or(config.database.path.as_ref()) {
        Some(path) => SqliteStore::open(path, config.lock_timeout())
            .with_context(|| format!("failed to open database {}", path.display()))?,
        None => {
            warn!("no database configured; changes will not persist");
            SqliteStore::open_in_memory()?
        }
    };

    let library = Library::new(Arc::new(store), verifier);
    execute(&library, cli.command, &config, std::io::stdout().lock())
}

fn init_tracing(filter: &str) {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn execute<S: Store, W: Write>(
    library: &Library<S>,
    command: Command,
    config: &Config,
    mut out: W,
) -> anyhow::Result<()> {
    match command {
        Command::AddBook {
            title,
            author,
            content_file,
        } => {
            let id = match content_file {
                Some(path) => {
                    let file = File::open(&path)
                        .with_context(|| format!("failed to open {}", path.display()))?;
                    library.add_book_from_reader(&title, &author, BufReader::new(file))?
                }
                None => library.add_book(&title, &author, "")?,
            };
            writeln!(out, "Added book {id}")?;
        }
        Command::UpdateContent { book, file } => {
            let reader = File::open(&file)
                .with_context(|| format!("failed to open {}", file.display()))?;
            library.update_book_content_from_reader(BookId(book), BufReader::new(reader))?;
            writeln!(out, "Updated content of book {book}")?;
        }
        Command::RemoveBook { book } => {
            library.remove_book(BookId(book))?;
            writeln!(out, "Removed book {book}")?;
        }
        Command::ListBooks => write_books(&library.books()?, out)?,
        Command::Search { query } => {
            library.reindex()?;
            write_books(&library.search_books(&query)?, out)?;
        }
        Command::AddMember { name, password } => {
            let id = library.add_member(&name, &password.password)?;
            writeln!(out, "Added member {id}")?;
        }
        Command::ListMembers => write_members(&library.members()?, out)?,
        Command::ResetPassword { member, password } => {
            library.reset_password(MemberId(member), &password.password)?;
            writeln!(out, "Password reset for member {member}")?;
        }
        Command::Checkout { book, auth } => {
            let member = authenticate(library, &auth)?;
            library.checkout_book(BookId(book), member.id)?;
            writeln!(out, "Book {book} checked out to {}", member.name)?;
        }
        Command::Return { book, auth } => {
            let member = authenticate(library, &auth)?;
            let outcome = library.return_book_as(BookId(book), member.id)?;
            match outcome.assigned_to {
                Some(next) => writeln!(
                    out,
                    "Book {book} returned and checked out to member {next} from the queue"
                )?,
                None => writeln!(out, "Book {book} returned")?,
            }
        }
        Command::Reserve { book, auth } => {
            let member = authenticate(library, &auth)?;
            match library.reserve_book(BookId(book), member.id)? {
                ReserveOutcome::ImmediateCheckout(_) => {
                    writeln!(out, "Book {book} was available and is now checked out to you")?
                }
                ReserveOutcome::Queued { position, .. } => {
                    writeln!(out, "Reserved book {book}; you are number {position} in the queue")?
                }
            }
        }
        Command::Cancel { book, auth } => {
            let member = authenticate(library, &auth)?;
            library.cancel_reservation(BookId(book), member.id)?;
            writeln!(out, "Cancelled reservation for book {book}")?;
        }
        Command::Reservations { book, member } => match (book, member) {
            (Some(book), _) => write_members(&library.reservation_queue(BookId(book))?, out)?,
            (None, Some(member)) => {
                write_books(&library.member_reservations(MemberId(member))?, out)?
            }
            (None, None) => bail!("either --book or --member is required"),
        },
        Command::History { book } => write_checkouts(&library.book_history(BookId(book))?, out)?,
        Command::Read { book, auth, page } => {
            let member = authenticate(library, &auth)?;
            let Some(index) = page.checked_sub(1) else {
                bail!("pages are numbered from 1");
            };
            let page_size = config.reading.page_size;
            let grant = library.begin_reading(BookId(book), member.id, page_size)?;
            let text = library.read_page(BookId(book), member.id, index, page_size)?;
            writeln!(
                out,
                "{} by {} - page {page} of {}",
                grant.title, grant.author, grant.page_count
            )?;
            writeln!(out, "{text}")?;
        }
        Command::Import { manifest } => {
            let report = import_manifest(library, &manifest)?;
            writeln!(
                out,
                "Imported {} book(s), skipped {}",
                report.imported, report.skipped
            )?;
        }
    }
    Ok(())
}

fn authenticate<S: Store>(library: &Library<S>, auth: &Auth) -> anyhow::Result<Member> {
    Ok(library.authenticate_member(MemberId(auth.member), &auth.password.password)?)
}

/// Writes book listings as CSV.
///
/// # CSV Format
///
/// Columns: `id, title, author, available, borrower`
///
/// ```csv
/// id,title,author,available,borrower
/// 1,Dune,Frank Herbert,false,2
/// 2,Emma,Jane Austen,true,
/// ```
fn write_books<W: Write>(books: &[BookSummary], writer: W) -> Result<(), csv::Error> {
    let mut wtr = Writer::from_writer(writer);
    for book in books {
        wtr.serialize(book)?;
    }
    wtr.flush()?;
    Ok(())
}

/// Writes members as CSV with columns `id, name, password_set`.
fn write_members<W: Write>(members: &[Member], writer: W) -> Result<(), csv::Error> {
    let mut wtr = Writer::from_writer(writer);
    for member in members {
        wtr.serialize(member)?;
    }
    wtr.flush()?;
    Ok(())
}

/// Writes checkout records as CSV, newest first as given.
fn write_checkouts<W: Write>(records: &[CheckoutRecord], writer: W) -> Result<(), csv::Error> {
    let mut wtr = Writer::from_writer(writer);
    for record in records {
        wtr.serialize(record)?;
    }
    wtr.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use circulation_rs::{MIN_BCRYPT_COST, MemoryStore};
    use clap::CommandFactory;

    fn library() -> Library<MemoryStore> {
        Library::new(
            Arc::new(MemoryStore::new()),
            Arc::new(BcryptVerifier::new(MIN_BCRYPT_COST)),
        )
    }

    fn run_command(library: &Library<MemoryStore>, args: &[&str]) -> anyhow::Result<String> {
        let cli = Cli::try_parse_from(std::iter::once("circulation").chain(args.iter().copied()))?;
        let mut out = Vec::new();
        execute(library, cli.command, &Config::default(), &mut out)?;
        Ok(String::from_utf8(out)?)
    }

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn list_books_writes_csv() {
        let library = library();
        run_command(&library, &["add-book", "Dune", "Frank Herbert"]).unwrap();
        run_command(&library, &["add-book", "Emma", "Jane Austen"]).unwrap();

        let output = run_command(&library, &["list-books"]).unwrap();
        assert_eq!(
            output,
            "id,title,author,available,borrower\n\
             1,Dune,Frank Herbert,true,\n\
             2,Emma,Jane Austen,true,\n"
        );
    }

    #[test]
    fn circulation_commands_authenticate() {
        let library = library();
        run_command(&library, &["add-book", "Dune", "Frank Herbert"]).unwrap();
        run_command(&library, &["add-member", "Alice", "--password", "s3cret"]).unwrap();

        let denied = run_command(
            &library,
            &["checkout", "1", "--member", "1", "--password", "wrong"],
        );
        assert_eq!(
            denied.unwrap_err().to_string(),
            circulation_rs::AUTH_FAILED_MESSAGE
        );

        let output = run_command(
            &library,
            &["checkout", "1", "--member", "1", "--password", "s3cret"],
        )
        .unwrap();
        assert_eq!(output, "Book 1 checked out to Alice\n");
    }

    #[test]
    fn reserve_and_return_report_the_queue() {
        let library = library();
        run_command(&library, &["add-book", "Dune", "Frank Herbert"]).unwrap();
        run_command(&library, &["add-member", "Alice", "--password", "a"]).unwrap();
        run_command(&library, &["add-member", "Bob", "--password", "b"]).unwrap();

        let first = run_command(&library, &["reserve", "1", "--member", "1", "--password", "a"]);
        assert_eq!(
            first.unwrap(),
            "Book 1 was available and is now checked out to you\n"
        );
        let second = run_command(&library, &["reserve", "1", "--member", "2", "--password", "b"]);
        assert_eq!(
            second.unwrap(),
            "Reserved book 1; you are number 1 in the queue\n"
        );

        let queue = run_command(&library, &["reservations", "--book", "1"]).unwrap();
        assert_eq!(queue, "id,name,password_set\n2,Bob,true\n");

        // Only the holder may return.
        assert!(run_command(&library, &["return", "1", "--member", "2", "--password", "b"]).is_err());
        let returned =
            run_command(&library, &["return", "1", "--member", "1", "--password", "a"]).unwrap();
        assert_eq!(
            returned,
            "Book 1 returned and checked out to member 2 from the queue\n"
        );
    }

    #[test]
    fn read_prints_requested_page() {
        let library = library();
        library.add_book("Short", "Author", &"x".repeat(1600)).unwrap();
        library.add_member("Reader", "pw").unwrap();

        let output = run_command(
            &library,
            &["read", "1", "--member", "1", "--password", "pw", "--page", "2"],
        )
        .unwrap();
        assert_eq!(output, format!("Short by Author - page 2 of 2\n{}\n", "x".repeat(100)));

        let page_zero = run_command(
            &library,
            &["read", "1", "--member", "1", "--password", "pw", "--page", "0"],
        );
        assert!(page_zero.is_err());
    }

    #[test]
    fn reservations_requires_book_or_member() {
        let result = Cli::try_parse_from(["circulation", "reservations"]);
        assert!(result.is_err());
    }
}
