use crate::config::Settings;
use crate::favorites::{FavoritesStore, FavoritesUpdate};
use crate::geo::{self, Coordinates, LocationError, ReportedLocation, DEFAULT_CINEMA_COUNT};
use crate::list::{ListAction, ListSession, ListSnapshot};
use crate::models::{MovieDetail, MovieSummary};
use crate::storage::{FileStorage, KeyValueStorage};
use crate::tmdb::{image_url, CatalogApi, CatalogError, ImageSize, TmdbClient};
use crate::utils;
use anyhow::Result;
use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

const MAX_BODY_BYTES: usize = 64 * 1024;
pub const MAX_LIST_SESSIONS: usize = 64;
const LIST_IDLE_TTL: Duration = Duration::from_secs(30 * 60);
const MAX_CINEMAS: usize = 50;

#[derive(Clone)]
pub struct AppState {
    pub catalog: Arc<dyn CatalogApi>,
    pub favorites: Arc<Mutex<FavoritesStore>>,
    pub lists: Arc<Mutex<ListRegistry>>,
}

impl AppState {
    pub fn new(catalog: Arc<dyn CatalogApi>, favorites: FavoritesStore) -> Self {
        Self {
            catalog,
            favorites: Arc::new(Mutex::new(favorites)),
            lists: Arc::new(Mutex::new(ListRegistry::default())),
        }
    }
}

struct MountedList {
    session: ListSession,
    last_used: Instant,
    /// Monotonic use counter; orders sessions touched within the same instant.
    touched: u64,
}

/// Mounted list screens, one controller each. Shells that vanish without
/// unmounting are reclaimed: idle sessions expire, and at the cap the least
/// recently used one makes room.
#[derive(Default)]
pub struct ListRegistry {
    next_id: u64,
    clock: u64,
    sessions: HashMap<u64, MountedList>,
}

impl ListRegistry {
    fn mount(&mut self, catalog: Arc<dyn CatalogApi>) -> (u64, ListSession) {
        let now = Instant::now();
        let before = self.sessions.len();
        self.sessions
            .retain(|_, m| now.duration_since(m.last_used) <= LIST_IDLE_TTL);
        if self.sessions.len() < before {
            info!("Expired {} idle list session(s)", before - self.sessions.len());
        }
        if self.sessions.len() >= MAX_LIST_SESSIONS {
            let oldest = self
                .sessions
                .iter()
                .min_by_key(|(_, m)| m.touched)
                .map(|(id, _)| *id);
            if let Some(id) = oldest {
                self.sessions.remove(&id);
                warn!("List session cap reached; evicted least recently used session {}", id);
            }
        }

        self.next_id += 1;
        self.clock += 1;
        let session = ListSession::new(catalog);
        self.sessions.insert(
            self.next_id,
            MountedList {
                session: session.clone(),
                last_used: now,
                touched: self.clock,
            },
        );
        (self.next_id, session)
    }

    fn get(&mut self, id: u64) -> Option<ListSession> {
        self.clock += 1;
        let clock = self.clock;
        self.sessions.get_mut(&id).map(|m| {
            m.last_used = Instant::now();
            m.touched = clock;
            m.session.clone()
        })
    }

    fn unmount(&mut self, id: u64) -> bool {
        self.sessions.remove(&id).is_some()
    }
}

pub async fn run_server(settings: Settings) -> Result<()> {
    let catalog: Arc<dyn CatalogApi> = Arc::new(TmdbClient::from_settings(&settings)?);
    let files = FileStorage::new(&settings.data_dir);
    info!("Favorites stored under {}", files.dir().display());
    let storage: Arc<dyn KeyValueStorage> = Arc::new(files);
    let favorites = FavoritesStore::load(storage).await;

    let state = AppState::new(catalog, favorites);
    let favorites = state.favorites.clone();
    let app = build_router(state);

    info!("Listening on {}", settings.bind);
    let listener = tokio::net::TcpListener::bind(settings.bind).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    let pending = favorites.lock().await.flush();
    match pending.wait().await {
        Ok(()) => info!("Favorites flushed"),
        Err(e) => warn!("Favorites may be out of date on disk: {}", e),
    }
    Ok(())
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/lists", post(mount_list))
        .route("/lists/:id", get(get_list).delete(unmount_list))
        .route("/lists/:id/query", put(set_query))
        .route("/lists/:id/search", post(search))
        .route("/lists/:id/clear", post(clear_search))
        .route("/lists/:id/more", post(load_more))
        .route("/lists/:id/refresh", post(refresh))
        .route("/lists/:id/retry", post(retry))
        .route("/lists/:id/dismiss", post(dismiss_error))
        .route("/movies/:id", get(movie_details))
        .route("/genres", get(genres))
        .route("/genres/:id/movies", get(movies_by_genre))
        .route("/favorites", get(list_favorites))
        .route("/favorites/toggle", post(toggle_favorite))
        .route(
            "/favorites/:id",
            get(favorite_status).delete(remove_favorite),
        )
        .route("/cinemas", get(nearby_cinemas))
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> &'static str {
    "OK"
}

fn error_response(status: StatusCode, code: &str, message: impl Into<String>) -> Response {
    (
        status,
        Json(json!({ "error": code, "message": message.into() })),
    )
        .into_response()
}

fn catalog_error_response(err: &CatalogError) -> Response {
    warn!("Catalog request failed: {}", err);
    if err.status() == Some(404) {
        return error_response(StatusCode::NOT_FOUND, "not_found", "Movie not found");
    }
    match err {
        CatalogError::Timeout { .. } => error_response(
            StatusCode::GATEWAY_TIMEOUT,
            "catalog_timeout",
            "The movie catalog took too long to respond",
        ),
        _ => error_response(
            StatusCode::BAD_GATEWAY,
            "catalog_unavailable",
            "The movie catalog is unavailable",
        ),
    }
}

fn unknown_list(id: u64) -> Response {
    error_response(
        StatusCode::NOT_FOUND,
        "unknown_list",
        format!("No list session {id}"),
    )
}

#[derive(Serialize)]
struct ListEnvelope {
    id: u64,
    state: ListSnapshot,
}

/// Runs the transition now and lets the fetch finish in the background;
/// the shell polls `GET /lists/:id` for the outcome.
async fn dispatch_in_background(session: &ListSession, action: ListAction) -> ListSnapshot {
    if let Some(request) = session.dispatch(action).await {
        let session = session.clone();
        tokio::spawn(async move {
            // `run` logs stale responses itself.
            let _ = session.run(request).await;
        });
    }
    session.snapshot().await
}

async fn list_action(state: &AppState, id: u64, actions: Vec<ListAction>) -> Response {
    let Some(session) = state.lists.lock().await.get(id) else {
        return unknown_list(id);
    };
    let mut latest = None;
    for action in actions {
        latest = Some(dispatch_in_background(&session, action).await);
    }
    let snapshot = match latest {
        Some(s) => s,
        None => session.snapshot().await,
    };
    Json(ListEnvelope {
        id,
        state: snapshot,
    })
    .into_response()
}

async fn mount_list(State(state): State<AppState>) -> Response {
    let (id, session) = state.lists.lock().await.mount(state.catalog.clone());
    info!("Mounted list session {}", id);
    let snapshot = dispatch_in_background(&session, ListAction::Start).await;
    (
        StatusCode::CREATED,
        Json(ListEnvelope {
            id,
            state: snapshot,
        }),
    )
        .into_response()
}

async fn get_list(State(state): State<AppState>, Path(id): Path<u64>) -> Response {
    list_action(&state, id, Vec::new()).await
}

async fn unmount_list(State(state): State<AppState>, Path(id): Path<u64>) -> Response {
    if state.lists.lock().await.unmount(id) {
        info!("Unmounted list session {}", id);
        StatusCode::NO_CONTENT.into_response()
    } else {
        unknown_list(id)
    }
}

#[derive(Deserialize)]
struct QueryBody {
    query: String,
}

#[derive(Deserialize, Default)]
struct SearchBody {
    #[serde(default)]
    query: Option<String>,
}

async fn set_query(
    State(state): State<AppState>,
    Path(id): Path<u64>,
    Json(body): Json<QueryBody>,
) -> Response {
    list_action(&state, id, vec![ListAction::SetQuery(body.query)]).await
}

async fn search(
    State(state): State<AppState>,
    Path(id): Path<u64>,
    body: Bytes,
) -> Response {
    // An empty body commits the draft query as it stands.
    let body: SearchBody = if body.iter().all(u8::is_ascii_whitespace) {
        SearchBody::default()
    } else {
        match serde_json::from_slice(&body) {
            Ok(b) => b,
            Err(e) => {
                return error_response(
                    StatusCode::BAD_REQUEST,
                    "invalid_body",
                    format!("Search body must be {{\"query\": string}}: {e}"),
                )
            }
        }
    };
    let mut actions = Vec::with_capacity(2);
    if let Some(query) = body.query {
        debug!(list = id, query = %query, "Search submitted");
        actions.push(ListAction::SetQuery(query));
    }
    actions.push(ListAction::Search);
    list_action(&state, id, actions).await
}

async fn clear_search(State(state): State<AppState>, Path(id): Path<u64>) -> Response {
    list_action(&state, id, vec![ListAction::ClearSearch]).await
}

async fn load_more(State(state): State<AppState>, Path(id): Path<u64>) -> Response {
    list_action(&state, id, vec![ListAction::LoadMore]).await
}

async fn refresh(State(state): State<AppState>, Path(id): Path<u64>) -> Response {
    list_action(&state, id, vec![ListAction::Refresh]).await
}

async fn retry(State(state): State<AppState>, Path(id): Path<u64>) -> Response {
    list_action(&state, id, vec![ListAction::Retry]).await
}

async fn dismiss_error(State(state): State<AppState>, Path(id): Path<u64>) -> Response {
    list_action(&state, id, vec![ListAction::DismissError]).await
}

#[derive(Serialize)]
struct MovieView {
    #[serde(flatten)]
    detail: MovieDetail,
    year: Option<i32>,
    rating: String,
    runtime_label: Option<String>,
    budget_label: String,
    revenue_label: String,
    language: String,
    poster_url: String,
    backdrop_url: String,
    is_favorite: bool,
}

impl MovieView {
    fn new(detail: MovieDetail, is_favorite: bool) -> Self {
        Self {
            year: utils::release_year(&detail.release_date),
            rating: utils::rating_label(detail.vote_average),
            runtime_label: detail.runtime.filter(|m| *m > 0).map(utils::format_runtime),
            budget_label: utils::format_usd(detail.budget),
            revenue_label: utils::format_usd(detail.revenue),
            language: detail.original_language.to_uppercase(),
            poster_url: image_url(detail.poster_path.as_deref(), ImageSize::W500),
            backdrop_url: image_url(detail.backdrop_path.as_deref(), ImageSize::Original),
            is_favorite,
            detail,
        }
    }
}

async fn movie_details(State(state): State<AppState>, Path(id): Path<i64>) -> Response {
    match state.catalog.fetch_details(id).await {
        Ok(detail) => {
            let is_favorite = state.favorites.lock().await.is_favorite(detail.id);
            Json(MovieView::new(detail, is_favorite)).into_response()
        }
        Err(e) => catalog_error_response(&e),
    }
}

async fn genres(State(state): State<AppState>) -> Response {
    match state.catalog.fetch_genres().await {
        Ok(genres) => Json(json!({ "genres": genres })).into_response(),
        Err(e) => catalog_error_response(&e),
    }
}

#[derive(Deserialize)]
struct PageQuery {
    page: Option<u32>,
}

async fn movies_by_genre(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Query(q): Query<PageQuery>,
) -> Response {
    let page = q.page.unwrap_or(1).max(1);
    match state.catalog.fetch_by_genre(id, page).await {
        Ok(movies) => Json(movies).into_response(),
        Err(e) => catalog_error_response(&e),
    }
}

fn favorites_body(update: FavoritesUpdate) -> Response {
    // Callers do not wait for the write; the store logs failures.
    let FavoritesUpdate {
        movie_id,
        is_favorite,
        changed,
        favorites,
        persisted: _,
    } = update;
    Json(json!({
        "id": movie_id,
        "favorite": is_favorite,
        "changed": changed,
        "count": favorites.len(),
        "favorites": favorites,
    }))
    .into_response()
}

async fn list_favorites(State(state): State<AppState>) -> Response {
    let favorites = state.favorites.lock().await.favorites();
    Json(json!({ "count": favorites.len(), "favorites": favorites })).into_response()
}

async fn favorite_status(State(state): State<AppState>, Path(id): Path<i64>) -> Response {
    let favorite = state.favorites.lock().await.is_favorite(id);
    Json(json!({ "id": id, "favorite": favorite })).into_response()
}

async fn toggle_favorite(
    State(state): State<AppState>,
    Json(movie): Json<MovieSummary>,
) -> Response {
    let update = state.favorites.lock().await.toggle(movie);
    info!(
        "Favorite {} {}",
        update.movie_id,
        if update.is_favorite { "added" } else { "removed" }
    );
    favorites_body(update)
}

async fn remove_favorite(State(state): State<AppState>, Path(id): Path<i64>) -> Response {
    let update = state.favorites.lock().await.remove(id);
    favorites_body(update)
}

#[derive(Deserialize)]
struct CinemaQuery {
    lat: Option<f64>,
    lon: Option<f64>,
    count: Option<usize>,
    #[serde(default)]
    denied: bool,
}

async fn nearby_cinemas(Query(q): Query<CinemaQuery>) -> Response {
    let provider = if q.denied {
        ReportedLocation::Denied
    } else {
        let (Some(lat), Some(lon)) = (q.lat, q.lon) else {
            return error_response(
                StatusCode::BAD_REQUEST,
                "missing_location",
                "lat and lon are required unless denied=true",
            );
        };
        match Coordinates::new(lat, lon) {
            Ok(c) => ReportedLocation::Position(c),
            Err(e) => {
                return error_response(
                    StatusCode::UNPROCESSABLE_ENTITY,
                    "invalid_location",
                    e.to_string(),
                )
            }
        }
    };
    let count = q.count.unwrap_or(DEFAULT_CINEMA_COUNT).clamp(1, MAX_CINEMAS);

    let mut rng = StdRng::from_entropy();
    match geo::find_nearby(&provider, count, &mut rng).await {
        Ok(nearby) => {
            let cinemas: Vec<_> = nearby
                .cinemas
                .iter()
                .map(|c| {
                    json!({
                        "cinema": c,
                        "distance_label": utils::format_distance_km(c.distance_km),
                    })
                })
                .collect();
            Json(json!({ "origin": nearby.origin, "cinemas": cinemas })).into_response()
        }
        Err(LocationError::PermissionDenied) => error_response(
            StatusCode::FORBIDDEN,
            "permission_denied",
            "Please enable location services to find nearby cinemas.",
        ),
        Err(e @ LocationError::Unavailable(_)) => error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "location_unavailable",
            e.to_string(),
        ),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        term.recv().await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Shutdown signal received (Ctrl+C)");
        }
        _ = terminate => {
            info!("Shutdown signal received (SIGTERM)");
        }
    }
}
