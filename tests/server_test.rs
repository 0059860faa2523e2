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

//! Integration tests for the REST API server with concurrent requests.
//!
//! These tests verify that concurrent reservations over HTTP keep the
//! one-holder and FIFO guarantees of the engine.

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use circulation_rs::{
    BcryptVerifier, BookId, BookSummary, CirculationError, Library, MIN_BCRYPT_COST, MemberId,
    MemoryStore, ReserveOutcome, ReturnOutcome,
};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;

// === DTOs (duplicated from the server demo for test isolation) ===

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewBook {
    pub title: String,
    pub author: String,
    #[serde(default)]
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewMember {
    pub name: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credentials {
    pub member: i64,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct SearchParams {
    pub q: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Created {
    pub id: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

// === Server Setup ===

#[derive(Clone)]
pub struct AppState {
    pub library: Arc<Library<MemoryStore>>,
}

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

async fn list_books(State(state): State<AppState>) -> Result<Json<Vec<BookSummary>>, AppError> {
    Ok(Json(blocking(state, |library| library.books()).await?))
}

async fn book_queue(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<Vec<MemberId>>, AppError> {
    let queue = blocking(state, move |library| library.reservation_queue(BookId(id))).await?;
    Ok(Json(queue.into_iter().map(|member| member.id).collect()))
}

async fn search(
    State(state): State<AppState>,
    Query(params): Query<SearchParams>,
) -> Result<Json<Vec<BookSummary>>, AppError> {
    Ok(Json(blocking(state, move |library| library.search_books(&params.q)).await?))
}

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

fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/books", post(add_book).get(list_books))
        .route("/books/{id}/queue", get(book_queue))
        .route("/books/{id}/reserve", post(reserve))
        .route("/books/{id}/return", post(return_book))
        .route("/books/{id}/cancel", post(cancel))
        .route("/members", post(add_member))
        .route("/search", get(search))
        .with_state(state)
}

/// Test server that binds to an ephemeral port.
struct TestServer {
    base_url: String,
    library: Arc<Library<MemoryStore>>,
}

impl TestServer {
    async fn new() -> Self {
        let library = Arc::new(Library::new(
            Arc::new(MemoryStore::new()),
            Arc::new(BcryptVerifier::new(MIN_BCRYPT_COST)),
        ));
        let state = AppState {
            library: library.clone(),
        };

        let app = create_router(state);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let base_url = format!("http://{}", addr);

        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        // Wait for server to be ready by polling with retries
        let client = Client::new();
        let health_url = format!("{}/books", base_url);
        for _ in 0..50 {
            match client.get(&health_url).send().await {
                Ok(_) => break,
                Err(_) => tokio::time::sleep(tokio::time::Duration::from_millis(50)).await,
            }
        }

        TestServer { base_url, library }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn create_book(&self, client: &Client, title: &str, content: &str) -> i64 {
        let response = client
            .post(self.url("/books"))
            .json(&NewBook {
                title: title.to_string(),
                author: "Test Author".to_string(),
                content: content.to_string(),
            })
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        response.json::<Created>().await.unwrap().id
    }

    /// Registers `count` members whose password is `pw-{id}`.
    async fn create_members(&self, client: &Client, count: usize) -> Vec<Credentials> {
        let mut members = Vec::with_capacity(count);
        for i in 0..count {
            let password = format!("pw-{i}");
            let response = client
                .post(self.url("/members"))
                .json(&NewMember {
                    name: format!("Member {i}"),
                    password: password.clone(),
                })
                .send()
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::CREATED);
            let id = response.json::<Created>().await.unwrap().id;
            members.push(Credentials {
                member: id,
                password,
            });
        }
        members
    }
}

// === Tests ===
// These tests are ignored in CI due to connection issues on some platforms.
// Run manually with: cargo test --test server_test -- --ignored

/// Many members reserve the same available book at once.
/// Exactly one gets it; the others are queued at distinct positions.
#[tokio::test]
#[ignore = "requires running server, may fail in CI"]
async fn concurrent_reservations_single_book() {
    let server = TestServer::new().await;
    let client = Client::new();

    const NUM_MEMBERS: usize = 100;

    let book = server.create_book(&client, "Contested", "").await;
    let members = server.create_members(&client, NUM_MEMBERS).await;
    let start = Instant::now();

    let mut handles = Vec::with_capacity(NUM_MEMBERS);
    for credentials in members {
        let client = client.clone();
        let url = server.url(&format!("/books/{book}/reserve"));

        let handle = tokio::spawn(async move {
            let response = client.post(&url).json(&credentials).send().await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            response.json::<serde_json::Value>().await.unwrap()
        });
        handles.push(handle);
    }

    let results: Vec<_> = futures::future::join_all(handles).await;
    let elapsed = start.elapsed();
    println!(
        "{} reservations in {:?} ({:.0} req/s)",
        NUM_MEMBERS,
        elapsed,
        NUM_MEMBERS as f64 / elapsed.as_secs_f64()
    );

    let bodies: Vec<serde_json::Value> = results.into_iter().map(|r| r.unwrap()).collect();
    let immediate = bodies
        .iter()
        .filter(|b| b["outcome"] == "immediate_checkout")
        .count();
    assert_eq!(immediate, 1, "Exactly one reservation checks out");

    let mut positions: Vec<u64> = bodies
        .iter()
        .filter(|b| b["outcome"] == "queued")
        .map(|b| b["position"].as_u64().unwrap())
        .collect();
    positions.sort_unstable();
    assert_eq!(positions, (1..NUM_MEMBERS as u64).collect::<Vec<_>>());

    let queue: Vec<MemberId> = client
        .get(server.url(&format!("/books/{book}/queue")))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(queue.len(), NUM_MEMBERS - 1);
}

/// The same member reserving a held book many times is queued once.
#[tokio::test]
#[ignore = "requires running server, may fail in CI"]
async fn concurrent_duplicate_reservations_rejected() {
    let server = TestServer::new().await;
    let client = Client::new();

    const NUM_DUPLICATES: usize = 50;

    let book = server.create_book(&client, "Popular", "").await;
    let members = server.create_members(&client, 2).await;
    let holder = &members[0];
    let waiter = members[1].clone();

    let response = client
        .post(server.url(&format!("/books/{book}/reserve")))
        .json(holder)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let mut handles = Vec::with_capacity(NUM_DUPLICATES);
    for _ in 0..NUM_DUPLICATES {
        let client = client.clone();
        let url = server.url(&format!("/books/{book}/reserve"));
        let credentials = waiter.clone();

        handles.push(tokio::spawn(async move {
            client
                .post(&url)
                .json(&credentials)
                .send()
                .await
                .unwrap()
                .status()
        }));
    }

    let results: Vec<_> = futures::future::join_all(handles).await;
    let successful = results
        .iter()
        .filter(|r| *r.as_ref().unwrap() == StatusCode::OK)
        .count();
    let conflicts = results
        .iter()
        .filter(|r| *r.as_ref().unwrap() == StatusCode::CONFLICT)
        .count();

    assert_eq!(successful, 1, "Exactly one reservation should succeed");
    assert_eq!(conflicts, NUM_DUPLICATES - 1, "Others should be conflicts");
    assert_eq!(
        server.library.reservation_queue(BookId(book)).unwrap().len(),
        1
    );
}

/// Returns hand the book down the queue in arrival order.
#[tokio::test]
#[ignore = "requires running server, may fail in CI"]
async fn returns_follow_queue_order() {
    let server = TestServer::new().await;
    let client = Client::new();

    let book = server.create_book(&client, "Relay", "").await;
    let members = server.create_members(&client, 5).await;

    // Sequential reservations so arrival order is known.
    for credentials in &members {
        let response = client
            .post(server.url(&format!("/books/{book}/reserve")))
            .json(credentials)
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    // Only the holder may return.
    let response = client
        .post(server.url(&format!("/books/{book}/return")))
        .json(&members[1])
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    for (i, credentials) in members.iter().enumerate() {
        let response = client
            .post(server.url(&format!("/books/{book}/return")))
            .json(credentials)
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let outcome: serde_json::Value = response.json().await.unwrap();
        assert_eq!(outcome["returned_by"], credentials.member);
        match members.get(i + 1) {
            Some(next) => assert_eq!(outcome["assigned_to"], next.member),
            None => assert!(outcome["assigned_to"].is_null()),
        }
    }

    let books: Vec<serde_json::Value> = client
        .get(server.url("/books"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(books[0]["available"], true);
}

/// Wrong passwords and unknown members are indistinguishable.
#[tokio::test]
#[ignore = "requires running server, may fail in CI"]
async fn bad_credentials_are_rejected_uniformly() {
    let server = TestServer::new().await;
    let client = Client::new();

    let book = server.create_book(&client, "Locked", "").await;
    let members = server.create_members(&client, 1).await;

    let attempts = [
        Credentials {
            member: members[0].member,
            password: "wrong".to_string(),
        },
        Credentials {
            member: 9_999,
            password: "pw-0".to_string(),
        },
    ];

    let mut bodies = Vec::new();
    for credentials in &attempts {
        let response = client
            .post(server.url(&format!("/books/{book}/reserve")))
            .json(credentials)
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        bodies.push(response.json::<ErrorResponse>().await.unwrap());
    }

    assert_eq!(bodies[0].error, bodies[1].error);
    assert_eq!(bodies[0].code, "INVALID_CREDENTIAL");
    assert!(server.library.book(BookId(book)).unwrap().is_available());
}

/// Cancellations racing with reservations never leave duplicates behind.
#[tokio::test]
#[ignore = "requires running server, may fail in CI"]
async fn concurrent_reserve_and_cancel() {
    let server = TestServer::new().await;
    let client = Client::new();

    const NUM_MEMBERS: usize = 40;

    let book = server.create_book(&client, "Churn", "").await;
    let members = server.create_members(&client, NUM_MEMBERS + 1).await;
    let response = client
        .post(server.url(&format!("/books/{book}/reserve")))
        .json(&members[0])
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let mut handles = Vec::new();
    for credentials in members.into_iter().skip(1) {
        let client = client.clone();
        let reserve_url = server.url(&format!("/books/{book}/reserve"));
        let cancel_url = server.url(&format!("/books/{book}/cancel"));

        handles.push(tokio::spawn(async move {
            for _ in 0..3 {
                let _ = client.post(&reserve_url).json(&credentials).send().await;
                let _ = client.post(&cancel_url).json(&credentials).send().await;
            }
            client
                .post(&reserve_url)
                .json(&credentials)
                .send()
                .await
                .unwrap()
                .status()
        }));
    }

    let results: Vec<_> = futures::future::join_all(handles).await;
    assert!(results.iter().all(|r| *r.as_ref().unwrap() == StatusCode::OK));

    let queue = server.library.reservation_queue(BookId(book)).unwrap();
    assert_eq!(queue.len(), NUM_MEMBERS);
    let mut ids: Vec<MemberId> = queue.iter().map(|m| m.id).collect();
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), NUM_MEMBERS);
}

/// Search reflects books added through the API.
#[tokio::test]
#[ignore = "requires running server, may fail in CI"]
async fn search_finds_created_books() {
    let server = TestServer::new().await;
    let client = Client::new();

    let dune = server
        .create_book(&client, "Dune", "The spice must flow.")
        .await;
    server
        .create_book(&client, "Emma", "Handsome, clever, and rich.")
        .await;

    let hits: Vec<serde_json::Value> = client
        .get(server.url("/search?q=spice"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0]["id"], dune);
}
