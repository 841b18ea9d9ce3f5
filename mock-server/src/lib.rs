//! In-process emulation of the remote API, used by integration tests.
//!
//! Routes mirror the real endpoints' paths (with the `.json` suffix) and
//! their response shapes: tagged objects with nested users and tweets,
//! cursored listings, `{"errors": [...]}` bodies for API-level failures,
//! rate-limit headers, and CRLF or length-delimited streams.

use std::collections::{BTreeMap, HashMap};
use std::convert::Infallible;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    extract::{Multipart, Path, Query, Request, State},
    http::{header, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Form, Json, Router,
};
use bytes::Bytes;
use serde_json::{json, Value};
use tokio::{net::TcpListener, sync::RwLock};

/// Users `1..=FOLLOWER_COUNT` exist and all follow the authenticated account.
pub const FOLLOWER_COUNT: u64 = 6;
pub const DEFAULT_PAGE_SIZE: usize = 2;
/// Cursors at or beyond this magnitude encode a page index.
pub const CURSOR_BASE: i64 = 1000;
pub const RATE_LIMIT: u32 = 15;
pub const RATE_LIMIT_RESET: i64 = 1_700_000_000;
/// A bearer token the server treats as revoked.
pub const REVOKED_TOKEN: &str = "revoked";
/// `users/show` sleeps this long for the screen name `slow`.
pub const SLOW_RESPONSE: Duration = Duration::from_millis(1500);
const KEEP_ALIVE: Duration = Duration::from_millis(50);
const FIRST_TWEET_ID: u64 = 100;

#[derive(Debug)]
pub struct Db {
    tweets: RwLock<BTreeMap<u64, Value>>,
    next_id: AtomicU64,
    remaining: AtomicU32,
}

impl Db {
    pub fn seeded() -> Self {
        let tweets = [
            (1, "hello world", 1),
            (2, "rust streams all the way down", 2),
            (3, "paging through followers", 3),
        ]
        .into_iter()
        .map(|(id, text, author)| (id, tweet(id, text, author)))
        .collect();
        Self {
            tweets: RwLock::new(tweets),
            next_id: AtomicU64::new(FIRST_TWEET_ID),
            remaining: AtomicU32::new(RATE_LIMIT),
        }
    }

    fn rate_limit_headers(&self) -> [(&'static str, String); 3] {
        let remaining = self
            .remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some(n.saturating_sub(1)))
            .unwrap_or(0)
            .saturating_sub(1);
        [
            ("x-rate-limit-limit", RATE_LIMIT.to_string()),
            ("x-rate-limit-remaining", remaining.to_string()),
            ("x-rate-limit-reset", RATE_LIMIT_RESET.to_string()),
        ]
    }
}

pub type SharedDb = Arc<Db>;

/// A user, with their latest tweet embedded under `status`.
pub fn user(id: u64) -> Value {
    let mut user = user_summary(id);
    user["status"] = json!({
        "id": 500 + id,
        "id_str": (500 + id).to_string(),
        "text": format!("latest from user{id}"),
    });
    user
}

fn user_summary(id: u64) -> Value {
    json!({
        "id": id,
        "id_str": id.to_string(),
        "screen_name": format!("user{id}"),
        "name": format!("User {id}"),
        "followers_count": id * 10,
    })
}

pub fn tweet(id: u64, text: &str, author: u64) -> Value {
    json!({
        "id": id,
        "id_str": id.to_string(),
        "text": text,
        "user": user_summary(author),
    })
}

/// Page index for a cursor: `-1` is the first page, `CURSOR_BASE + p` and
/// `-(CURSOR_BASE + p)` both name page `p`.
pub fn decode_cursor(cursor: i64) -> Option<usize> {
    match cursor {
        -1 => Some(0),
        c if c >= CURSOR_BASE => usize::try_from(c - CURSOR_BASE).ok(),
        c if c <= -CURSOR_BASE => usize::try_from(-c - CURSOR_BASE).ok(),
        _ => None,
    }
}

/// `(next, previous)` cursors for page `page` of `pages`, `0` meaning none.
pub fn page_cursors(page: usize, pages: usize) -> (i64, i64) {
    let page = page as i64;
    let next = if page + 1 < pages as i64 {
        CURSOR_BASE + page + 1
    } else {
        0
    };
    let previous = if page > 0 { -(CURSOR_BASE + page - 1) } else { 0 };
    (next, previous)
}

pub fn app() -> Router {
    app_with(Arc::new(Db::seeded()))
}

pub fn app_with(db: SharedDb) -> Router {
    Router::new()
        .route("/users/show.json", get(show_user))
        .route("/users/lookup.json", get(lookup_users))
        .route("/followers/list.json", get(list_followers))
        .route("/followers/ids.json", get(follower_ids))
        .route("/statuses/home_timeline.json", get(home_timeline))
        .route("/statuses/show/{file}", get(show_tweet))
        .route("/statuses/update.json", post(update_status))
        .route("/statuses/destroy/{file}", post(destroy_tweet))
        .route("/statuses/retweet/{file}", post(retweet))
        .route("/search/tweets.json", get(search_tweets))
        .route("/media/upload.json", post(upload_media))
        .route("/application/rate_limit_status.json", get(rate_limit_status))
        .route("/statuses/sample.json", get(sample_stream))
        .route("/statuses/filter.json", post(filter_stream))
        .layer(middleware::from_fn(authorize))
        .with_state(db)
}

pub async fn run(listener: TcpListener) -> Result<(), std::io::Error> {
    axum::serve(listener, app()).await
}

/// Install the fmt subscriber, honouring `RUST_LOG` and defaulting to `info`.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

pub fn api_error(status: StatusCode, code: i64, message: &str) -> Response {
    (
        status,
        Json(json!({"errors": [{"code": code, "message": message}]})),
    )
        .into_response()
}

async fn authorize(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let uri = request.uri().clone();
    let revoked = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == format!("Bearer {REVOKED_TOKEN}"));
    let response = if revoked {
        api_error(StatusCode::UNAUTHORIZED, 89, "Invalid or expired token.")
    } else {
        next.run(request).await
    };
    tracing::info!(%method, %uri, status = response.status().as_u16(), "request");
    response
}

fn path_id(file: &str) -> Option<u64> {
    file.strip_suffix(".json").unwrap_or(file).parse().ok()
}

fn split_list(value: &str) -> impl Iterator<Item = &str> {
    value.split(',').map(str::trim).filter(|s| !s.is_empty())
}

fn find_user(params: &HashMap<String, String>) -> Result<u64, Response> {
    let id = match (params.get("user_id"), params.get("screen_name")) {
        (Some(id), _) => id.parse().ok(),
        (None, Some(name)) => name.strip_prefix("user").and_then(|n| n.parse().ok()),
        (None, None) => {
            return Err(api_error(
                StatusCode::BAD_REQUEST,
                38,
                "screen_name parameter is missing.",
            ))
        }
    };
    id.filter(|id| (1..=FOLLOWER_COUNT).contains(id))
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, 50, "User not found."))
}

async fn show_user(
    State(db): State<SharedDb>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    if params.get("screen_name").is_some_and(|n| n == "slow") {
        tokio::time::sleep(SLOW_RESPONSE).await;
    }
    match find_user(&params) {
        Ok(id) => (db.rate_limit_headers(), Json(user(id))).into_response(),
        Err(response) => response,
    }
}

async fn lookup_users(Query(params): Query<HashMap<String, String>>) -> Response {
    let ids: Vec<u64> = match (params.get("user_id"), params.get("screen_name")) {
        (Some(ids), _) => split_list(ids).filter_map(|id| id.parse().ok()).collect(),
        (None, Some(names)) => split_list(names)
            .filter_map(|n| n.strip_prefix("user").and_then(|n| n.parse().ok()))
            .collect(),
        (None, None) => Vec::new(),
    };
    let users: Vec<Value> = ids
        .into_iter()
        .filter(|id| (1..=FOLLOWER_COUNT).contains(id))
        .map(user)
        .collect();
    if users.is_empty() {
        return api_error(
            StatusCode::NOT_FOUND,
            17,
            "No user matches for specified terms.",
        );
    }
    Json(users).into_response()
}

/// Slice the follower ids of user 1 by cursor and `count`.
fn follower_page(params: &HashMap<String, String>) -> Result<(Vec<u64>, i64, i64), Response> {
    let cursor = params
        .get("cursor")
        .map_or(Ok(-1), |c| c.parse::<i64>())
        .map_err(|_| api_error(StatusCode::BAD_REQUEST, 44, "cursor parameter is invalid."))?;
    let size = params
        .get("count")
        .and_then(|c| c.parse::<usize>().ok())
        .filter(|&c| c > 0)
        .unwrap_or(DEFAULT_PAGE_SIZE);
    let pages = (FOLLOWER_COUNT as usize).div_ceil(size);
    let page = decode_cursor(cursor)
        .filter(|&p| p < pages)
        .ok_or_else(|| api_error(StatusCode::BAD_REQUEST, 44, "cursor parameter is invalid."))?;
    let ids = (1..=FOLLOWER_COUNT).skip(page * size).take(size).collect();
    let (next, previous) = page_cursors(page, pages);
    Ok((ids, next, previous))
}

fn cursor_fields(body: &mut Value, next: i64, previous: i64) {
    body["next_cursor"] = json!(next);
    body["next_cursor_str"] = json!(next.to_string());
    body["previous_cursor"] = json!(previous);
    body["previous_cursor_str"] = json!(previous.to_string());
}

async fn list_followers(
    State(db): State<SharedDb>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let (ids, next, previous) = match follower_page(&params) {
        Ok(page) => page,
        Err(response) => return response,
    };
    let mut body = json!({ "users": ids.into_iter().map(user).collect::<Vec<_>>() });
    cursor_fields(&mut body, next, previous);
    (db.rate_limit_headers(), Json(body)).into_response()
}

async fn follower_ids(Query(params): Query<HashMap<String, String>>) -> Response {
    let (ids, next, previous) = match follower_page(&params) {
        Ok(page) => page,
        Err(response) => return response,
    };
    let stringify = params.get("stringify_ids").is_some_and(|s| s == "true");
    let ids: Vec<Value> = ids
        .into_iter()
        .map(|id| if stringify { json!(id.to_string()) } else { json!(id) })
        .collect();
    let mut body = json!({ "ids": ids });
    cursor_fields(&mut body, next, previous);
    Json(body).into_response()
}

async fn home_timeline(
    State(db): State<SharedDb>,
    Query(params): Query<HashMap<String, String>>,
) -> Json<Vec<Value>> {
    let count = params
        .get("count")
        .and_then(|c| c.parse().ok())
        .unwrap_or(20);
    let tweets = db.tweets.read().await;
    Json(tweets.values().rev().take(count).cloned().collect())
}

async fn show_tweet(State(db): State<SharedDb>, Path(file): Path<String>) -> Response {
    let tweets = db.tweets.read().await;
    match path_id(&file).and_then(|id| tweets.get(&id)) {
        Some(tweet) => Json(tweet.clone()).into_response(),
        None => api_error(StatusCode::NOT_FOUND, 34, "Sorry, that page does not exist."),
    }
}

async fn update_status(
    State(db): State<SharedDb>,
    Form(params): Form<HashMap<String, String>>,
) -> Response {
    let Some(text) = params.get("status") else {
        return api_error(StatusCode::FORBIDDEN, 170, "Missing required parameter: status.");
    };
    if text.chars().count() > 280 {
        return api_error(StatusCode::FORBIDDEN, 186, "Tweet needs to be a bit shorter.");
    }
    let id = db.next_id.fetch_add(1, Ordering::SeqCst);
    let mut created = tweet(id, text, 1);
    if let Some(reply_to) = params.get("in_reply_to_status_id").and_then(|r| r.parse::<u64>().ok()) {
        created["in_reply_to_status_id"] = json!(reply_to);
    }
    if let Some(media) = params.get("media_ids") {
        created["media_ids"] = json!(split_list(media).collect::<Vec<_>>());
    }
    db.tweets.write().await.insert(id, created.clone());
    Json(created).into_response()
}

async fn destroy_tweet(State(db): State<SharedDb>, Path(file): Path<String>) -> Response {
    let removed = match path_id(&file) {
        Some(id) => db.tweets.write().await.remove(&id),
        None => None,
    };
    match removed {
        Some(tweet) => Json(tweet).into_response(),
        None => api_error(StatusCode::NOT_FOUND, 144, "No status found with that ID."),
    }
}

async fn retweet(State(db): State<SharedDb>, Path(file): Path<String>) -> Response {
    let original = match path_id(&file) {
        Some(id) => db.tweets.read().await.get(&id).cloned(),
        None => None,
    };
    let Some(original) = original else {
        return api_error(StatusCode::NOT_FOUND, 144, "No status found with that ID.");
    };
    let id = db.next_id.fetch_add(1, Ordering::SeqCst);
    let text = format!("RT {}", original["text"].as_str().unwrap_or_default());
    let mut created = tweet(id, &text, 1);
    created["retweeted_status"] = original;
    db.tweets.write().await.insert(id, created.clone());
    Json(created).into_response()
}

async fn search_tweets(
    State(db): State<SharedDb>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let Some(query) = params.get("q") else {
        return api_error(StatusCode::BAD_REQUEST, 25, "Query parameters are missing.");
    };
    let statuses: Vec<Value> = db
        .tweets
        .read()
        .await
        .values()
        .filter(|t| t["text"].as_str().is_some_and(|text| text.contains(query.as_str())))
        .cloned()
        .collect();
    Json(json!({
        "statuses": statuses,
        "search_metadata": {"query": query, "count": statuses.len()},
    }))
    .into_response()
}

async fn upload_media(mut multipart: Multipart) -> Response {
    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(err) => return err.into_response(),
        };
        if field.name() != Some("media") {
            continue;
        }
        let filename = field.file_name().unwrap_or_default().to_string();
        let content_type = field
            .content_type()
            .unwrap_or("application/octet-stream")
            .to_string();
        let data = match field.bytes().await {
            Ok(data) => data,
            Err(err) => return err.into_response(),
        };
        let media_id = 7_000 + data.len() as u64;
        return Json(json!({
            "media_id": media_id,
            "media_id_string": media_id.to_string(),
            "media_key": uuid::Uuid::new_v4().to_string(),
            "size": data.len(),
            "filename": filename,
            "image": {"image_type": content_type},
        }))
        .into_response();
    }
    api_error(StatusCode::BAD_REQUEST, 38, "media parameter is missing.")
}

async fn rate_limit_status(State(db): State<SharedDb>) -> Json<Value> {
    let remaining = db.remaining.load(Ordering::SeqCst);
    Json(json!({
        "resources": {
            "followers": {
                "/followers/list": {
                    "limit": RATE_LIMIT,
                    "remaining": remaining,
                    "reset": RATE_LIMIT_RESET,
                }
            }
        }
    }))
}

async fn sample_stream(
    State(db): State<SharedDb>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let records: Vec<Value> = db.tweets.read().await.values().cloned().collect();
    stream_response(records, &params)
}

async fn filter_stream(
    State(db): State<SharedDb>,
    Form(params): Form<HashMap<String, String>>,
) -> Response {
    let track: Vec<String> = params
        .get("track")
        .map(|t| split_list(t).map(str::to_string).collect())
        .unwrap_or_default();
    let records: Vec<Value> = db
        .tweets
        .read()
        .await
        .values()
        .filter(|t| {
            let text = t["text"].as_str().unwrap_or_default();
            track.iter().any(|term| text.contains(term.as_str()))
        })
        .cloned()
        .collect();
    stream_response(records, &params)
}

/// Emit `records` as a chunked body. Every frame is split across two writes
/// so clients see partial records; `stall_warnings=true` keeps the
/// connection open with keep-alive lines after the last record.
fn stream_response(records: Vec<Value>, params: &HashMap<String, String>) -> Response {
    let length = params.get("delimited").is_some_and(|d| d == "length");
    let hold_open = params.get("stall_warnings").is_some_and(|s| s == "true");
    let body = async_stream::stream! {
        yield Ok::<Bytes, Infallible>(Bytes::from_static(b"\r\n"));
        for record in records {
            let line = format!("{record}\r\n");
            let frame = if length {
                format!("{}\r\n{line}", line.len())
            } else {
                line
            };
            let mut tail = Bytes::from(frame);
            let head = tail.split_to(tail.len() / 2);
            yield Ok(head);
            tokio::time::sleep(Duration::from_millis(5)).await;
            yield Ok(tail);
        }
        while hold_open {
            tokio::time::sleep(KEEP_ALIVE).await;
            yield Ok(Bytes::from_static(b"\r\n"));
        }
    };
    (
        [(header::CONTENT_TYPE, "application/json")],
        Body::from_stream(body),
    )
        .into_response()
}
