//! Simple REST API server example for the circulation engine.
//!
//! Run with: `cargo run --example server`
//!
//! ## Endpoints
//!
//! - `POST /books` - Add a book
//! - `GET /books` - List all books
//! - `GET /books/{id}/queue` - Members waiting for a book
//! - `GET /search?q=...` - Full-text search
//! - `POST /members` - Register a member
//! - `POST /books/{id}/checkout` - Check out a book
//! - `POST /books/{id}/reserve` - Reserve a book (checks out if available)
//! - `POST /books/{id}/return` - Return a book
//! - `POST /books/{id}/cancel` - Cancel a reservation
//!
//! ## Example Usage
//!
//! ```bash
//! # Add a book and a member
//! curl -X POST http://localhost:3000/books \
//!   -H "Content-Type: application/json" \
//!   -d '{"title": "Dune", "author": "Frank Herbert", "content": "A beginning is the time..."}'
//! curl -X POST http://localhost:3000/members \
//!   -H "Content-Type: application/json" \
//!   -d '{"name": "Alice", "password": "alice-secret"}'
//!
//! # Reserve
//! curl -X POST http://localhost:3000/books/1/reserve \
//!   -H "Content-Type: application/json" \
//!   -d '{"member": 1, "password": "alice-secret"}'
//!
//! # Search
//! curl 'http://localhost:3000/search?q=dune'
//! ```

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use circulation_rs::{
    BcryptVerifier, BookId, BookSummary, CirculationError, Library, MemberId, MemoryStore,
    ReserveOutcome, ReturnOutcome,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

// === Request/Response DTOs ===

#[derive(Debug, Deserialize)]
pub struct NewBook {
    pub title: String,
    pub author: String,
    #[serde(default)]
    pub content: String,
}

#[derive(Debug, Deserialize)]
pub struct NewMember {
    pub name: String,
    pub password: String,
}

/// Credentials sent with every circulation request.
#[derive(Debug, Deserialize)]
pub struct Credentials {
    pub member: i64,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct SearchParams {
    pub q: String,
}

#[derive(Debug, Serialize)]
pub struct Created {
    pub id: i64,
}

/// Response body for errors.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

// === Application State ===

/// Shared application state containing the library.
#[derive(Clone)]
pub struct AppState {
    pub library: Arc<Library<MemoryStore>>,
}

// === Error Handling ===

/// Wrapper for converting `CirculationError` into HTTP responses.
pub struct AppError(CirculationError);

impl From<CirculationError> for AppError {
    fn from(err: CirculationError) -> Self {
        AppError(err)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code) = match &self.0 {
            CirculationError::BookNotFound(_) => (StatusCode::NOT_FOUND, "BOOK_NOT_FOUND"),
            CirculationError::MemberNotFound(_) => (StatusCode::NOT_FOUND, "MEMBER_NOT_FOUND"),
            CirculationError::BookUnavailable(_) => (StatusCode::CONFLICT, "BOOK_UNAVAILABLE"),
            CirculationError::AlreadyCheckedOutBySelf => {
                (StatusCode::CONFLICT, "ALREADY_CHECKED_OUT")
            }
            CirculationError::DuplicateReservation => {
                (StatusCode::CONFLICT, "DUPLICATE_RESERVATION")
            }
            CirculationError::BookNotCheckedOut(_) => {
                (StatusCode::CONFLICT, "BOOK_NOT_CHECKED_OUT")
            }
            CirculationError::HeldByAnotherMember => (StatusCode::CONFLICT, "HELD_BY_ANOTHER"),
            CirculationError::BookInCirculation(_) => {
                (StatusCode::CONFLICT, "BOOK_IN_CIRCULATION")
            }
            CirculationError::InvalidCredential => {
                (StatusCode::UNAUTHORIZED, "INVALID_CREDENTIAL")
            }
            CirculationError::NoCredentialSet => (StatusCode::UNAUTHORIZED, "NO_CREDENTIAL_SET"),
            CirculationError::NoActiveReservation { .. } => {
                (StatusCode::NOT_FOUND, "NO_ACTIVE_RESERVATION")
            }
            CirculationError::NotBorrower(_) => (StatusCode::FORBIDDEN, "NOT_BORROWER"),
            CirculationError::LockTimeout => (StatusCode::SERVICE_UNAVAILABLE, "LOCK_TIMEOUT"),
            CirculationError::InvalidInput(_) => (StatusCode::BAD_REQUEST, "INVALID_INPUT"),
            CirculationError::NoContent => (StatusCode::UNPROCESSABLE_ENTITY, "NO_CONTENT"),
            CirculationError::Storage(_) | CirculationError::Credential(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL")
            }
        };

        (
            status,
            Json(ErrorResponse {
                error: self.0.to_string(),
                code: code.to_string(),
            }),
        )
            .into_response()
    }
}

/// Runs a library call off the async runtime; hashing and store locks block.
async fn blocking<T, F>(state: AppState, f: F) -> Result<T, AppError>
where
    T: Send + 'static,
    F: FnOnce(&Library<MemoryStore>) -> Result<T, CirculationError> + Send + 'static,
{
    tokio::task::spawn_blocking(move || f(state.library.as_ref()))
        .await
        .map_err(|e| AppError(CirculationError::Storage(e.to_string())))?
        .map_err(AppError)
}

fn authenticate(
    library: &Library<MemoryStore>,
    credentials: &Credentials,
) -> Result<MemberId, CirculationError> {
    let member = library.authenticate_member(MemberId(credentials.member), &credentials.password)?;
    Ok(member.id)
}

// === Handlers ===

/// POST /books - Add a book.
async fn add_book(
    State(state): State<AppState>,
    Json(request): Json<NewBook>,
) -> Result<(StatusCode, Json<Created>), AppError> {
    let id = blocking(state, move |library| {
        library.add_book(&request.title, &request.author, &request.content)
    })
    .await?;
    Ok((StatusCode::CREATED, Json(Created { id: id.0 })))
}

/// GET /books - List all books.
async fn list_books(State(state): State<AppState>) -> Result<Json<Vec<BookSummary>>, AppError> {
    Ok(Json(blocking(state, |library| library.books()).await?))
}

/// GET /books/{id}/queue - Member ids waiting for the book, next first.
async fn book_queue(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<Vec<MemberId>>, AppError> {
    let queue = blocking(state, move |library| library.reservation_queue(BookId(id))).await?;
    Ok(Json(queue.into_iter().map(|member| member.id).collect()))
}

/// GET /search?q=... - Ranked search.
async fn search(
    State(state): State<AppState>,
    Query(params): Query<SearchParams>,
) -> Result<Json<Vec<BookSummary>>, AppError> {
    Ok(Json(blocking(state, move |library| library.search_books(&params.q)).await?))
}

/// POST /members - Register a member.
async fn add_member(
    State(state): State<AppState>,
    Json(request): Json<NewMember>,
) -> Result<(StatusCode, Json<Created>), AppError> {
    let id = blocking(state, move |library| {
        library.add_member(&request.name, &request.password)
    })
    .await?;
    Ok((StatusCode::CREATED, Json(Created { id: id.0 })))
}

/// POST /books/{id}/checkout
async fn checkout(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(credentials): Json<Credentials>,
) -> Result<StatusCode, AppError> {
    blocking(state, move |library| {
        let member = authenticate(library, &credentials)?;
        library.checkout_book(BookId(id), member)
    })
    .await?;
    Ok(StatusCode::CREATED)
}

/// POST /books/{id}/reserve
async fn reserve(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(credentials): Json<Credentials>,
) -> Result<Json<ReserveOutcome>, AppError> {
    let outcome = blocking(state, move |library| {
        let member = authenticate(library, &credentials)?;
        library.reserve_book(BookId(id), member)
    })
    .await?;
    Ok(Json(outcome))
}

/// POST /books/{id}/return
async fn return_book(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(credentials): Json<Credentials>,
) -> Result<Json<ReturnOutcome>, AppError> {
    let outcome = blocking(state, move |library| {
        let member = authenticate(library, &credentials)?;
        library.return_book_as(BookId(id), member)
    })
    .await?;
    Ok(Json(outcome))
}

/// POST /books/{id}/cancel
async fn cancel(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(credentials): Json<Credentials>,
) -> Result<StatusCode, AppError> {
    blocking(state, move |library| {
        let member = authenticate(library, &credentials)?;
        library.cancel_reservation(BookId(id), member)
    })
    .await?;
    Ok(StatusCode::NO_CONTENT)
}

// === Router ===

fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/books", post(add_book).get(list_books))
        .route("/books/{id}/queue", get(book_queue))
        .route("/books/{id}/checkout", post(checkout))
        .route("/books/{id}/reserve", post(reserve))
        .route("/books/{id}/return", post(return_book))
        .route("/books/{id}/cancel", post(cancel))
        .route("/members", post(add_member))
        .route("/search", get(search))
        .with_state(state)
}

// === Main ===

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(fmt::layer())
        .init();

    let library = Library::new(
        Arc::new(MemoryStore::new()),
        Arc::new(BcryptVerifier::default()),
    );
    let state = AppState {
        library: Arc::new(library),
    };

    let app = create_router(state);

    let listener = TcpListener::bind("127.0.0.1:3000").await.unwrap();
    println!("Circulation API server running on http://127.0.0.1:3000");
    println!();
    println!("Endpoints:");
    println!("  POST /books                - Add a book");
    println!("  GET  /books                - List all books");
    println!("  GET  /books/:id/queue      - Reservation queue");
    println!("  POST /books/:id/checkout   - Check out");
    println!("  POST /books/:id/reserve    - Reserve");
    println!("  POST /books/:id/return     - Return");
    println!("  POST /books/:id/cancel     - Cancel reservation");
    println!("  POST /members              - Register a member");
    println!("  GET  /search?q=            - Search");

    axum::serve(listener, app).await.unwrap();
}
