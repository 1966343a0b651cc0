//! Movie list controller: popular/search modes, paging, refresh.
//!
//! Transitions are synchronous and emit a [`LoadRequest`]; the catalog call
//! happens outside the lock and its result is folded back with
//! [`ListController::apply`]. Every transition that starts a new query
//! session bumps the generation, so late responses from a superseded query
//! are recognised and dropped.

use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::models::{MoviePage, MovieSummary};
use crate::tmdb::{CatalogApi, CatalogError, CatalogResult};

pub const LOAD_FAILED_MESSAGE: &str = "Failed to load movies. Please try again.";
pub const REFRESH_FAILED_MESSAGE: &str = "Couldn't refresh movies. Showing previous results.";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "query", rename_all = "snake_case")]
pub enum ListMode {
    Popular,
    Search(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadPhase {
    Initial,
    LoadMore,
    Refresh,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ListStatus {
    Idle,
    Loading,
    LoadingMore,
    Refreshing,
    Loaded,
    Error { phase: LoadPhase, message: String },
}

impl ListStatus {
    fn in_flight(&self) -> bool {
        matches!(
            self,
            ListStatus::Loading | ListStatus::LoadingMore | ListStatus::Refreshing
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListAction {
    Start,
    SetQuery(String),
    Search,
    ClearSearch,
    LoadMore,
    Refresh,
    Retry,
    DismissError,
}

/// One catalog fetch the controller is waiting on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadRequest {
    pub generation: u64,
    pub mode: ListMode,
    pub page: u32,
    pub phase: LoadPhase,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ListError {
    #[error("response for generation {got} arrived after generation {latest} started")]
    StaleResponse { got: u64, latest: u64 },
}

#[derive(Debug, Clone, Serialize)]
pub struct ListSnapshot {
    pub mode: ListMode,
    pub query: String,
    pub page: u32,
    pub items: Vec<MovieSummary>,
    pub has_more: bool,
    pub status: ListStatus,
    /// Message for a dismissible banner; pagination failures never set it.
    pub banner: Option<String>,
}

#[derive(Debug)]
pub struct ListController {
    mode: ListMode,
    query: String,
    page: u32,
    items: Vec<MovieSummary>,
    has_more: bool,
    status: ListStatus,
    generation: u64,
}

impl Default for ListController {
    fn default() -> Self {
        Self::new()
    }
}

impl ListController {
    pub fn new() -> Self {
        Self {
            mode: ListMode::Popular,
            query: String::new(),
            page: 1,
            items: Vec::new(),
            has_more: false,
            status: ListStatus::Idle,
            generation: 0,
        }
    }

    pub fn mode(&self) -> &ListMode {
        &self.mode
    }

    pub fn query(&self) -> &str {
        &self.query
    }

    pub fn page(&self) -> u32 {
        self.page
    }

    pub fn items(&self) -> &[MovieSummary] {
        &self.items
    }

    pub fn has_more(&self) -> bool {
        self.has_more
    }

    pub fn status(&self) -> &ListStatus {
        &self.status
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn banner(&self) -> Option<&str> {
        match &self.status {
            ListStatus::Error {
                phase: LoadPhase::Initial | LoadPhase::Refresh,
                message,
            } => Some(message),
            _ => None,
        }
    }

    pub fn snapshot(&self) -> ListSnapshot {
        ListSnapshot {
            mode: self.mode.clone(),
            query: self.query.clone(),
            page: self.page,
            items: self.items.clone(),
            has_more: self.has_more,
            status: self.status.clone(),
            banner: self.banner().map(str::to_string),
        }
    }

    /// Applies a user action. Returns the fetch to perform, if any.
    pub fn handle(&mut self, action: ListAction) -> Option<LoadRequest> {
        match action {
            ListAction::Start | ListAction::Retry => Some(self.begin_initial()),
            ListAction::SetQuery(text) => {
                self.query = text;
                None
            }
            ListAction::Search => {
                let trimmed = self.query.trim();
                self.mode = if trimmed.is_empty() {
                    ListMode::Popular
                } else {
                    ListMode::Search(trimmed.to_string())
                };
                Some(self.begin_initial())
            }
            ListAction::ClearSearch => {
                self.query.clear();
                self.mode = ListMode::Popular;
                Some(self.begin_initial())
            }
            ListAction::LoadMore => self.begin_load_more(),
            ListAction::Refresh => self.begin_refresh(),
            ListAction::DismissError => {
                if matches!(self.status, ListStatus::Error { .. }) {
                    self.status = if self.items.is_empty() {
                        ListStatus::Idle
                    } else {
                        ListStatus::Loaded
                    };
                }
                None
            }
        }
    }

    fn begin_initial(&mut self) -> LoadRequest {
        self.generation += 1;
        self.page = 1;
        self.items.clear();
        self.has_more = false;
        self.status = ListStatus::Loading;
        self.request(1, LoadPhase::Initial)
    }

    fn begin_load_more(&mut self) -> Option<LoadRequest> {
        // Scroll events fire in bursts; one page fetch at a time.
        if !self.has_more || self.status.in_flight() {
            return None;
        }
        self.status = ListStatus::LoadingMore;
        Some(self.request(self.page + 1, LoadPhase::LoadMore))
    }

    fn begin_refresh(&mut self) -> Option<LoadRequest> {
        if matches!(self.status, ListStatus::Loading | ListStatus::Refreshing) {
            return None;
        }
        self.generation += 1;
        self.status = ListStatus::Refreshing;
        Some(self.request(1, LoadPhase::Refresh))
    }

    fn request(&self, page: u32, phase: LoadPhase) -> LoadRequest {
        LoadRequest {
            generation: self.generation,
            mode: self.mode.clone(),
            page,
            phase,
        }
    }

    /// Folds a catalog response into the list. Superseded responses are
    /// rejected without touching any state.
    pub fn apply(
        &mut self,
        request: &LoadRequest,
        result: CatalogResult<MoviePage>,
    ) -> Result<(), ListError> {
        if request.generation != self.generation {
            return Err(ListError::StaleResponse {
                got: request.generation,
                latest: self.generation,
            });
        }

        match result {
            Ok(page) => {
                if request.page == 1 {
                    self.items = page.results;
                } else {
                    self.items.extend(page.results);
                }
                self.has_more = request.page < page.total_pages;
                self.page = request.page;
                self.status = ListStatus::Loaded;
            }
            Err(err) => self.fail(request.phase, &err),
        }
        Ok(())
    }

    fn fail(&mut self, phase: LoadPhase, err: &CatalogError) {
        warn!(?phase, network = err.is_network(), "Movie list load failed: {}", err);
        match phase {
            LoadPhase::Initial => {
                self.items.clear();
                self.has_more = false;
                self.status = ListStatus::Error {
                    phase,
                    message: LOAD_FAILED_MESSAGE.to_string(),
                };
            }
            LoadPhase::LoadMore => {
                // Keep what is on screen and stop asking for more.
                self.has_more = false;
                self.status = ListStatus::Error {
                    phase,
                    message: LOAD_FAILED_MESSAGE.to_string(),
                };
            }
            LoadPhase::Refresh => {
                self.status = ListStatus::Error {
                    phase,
                    message: REFRESH_FAILED_MESSAGE.to_string(),
                };
            }
        }
    }
}

/// Picks the endpoint for a request: search for a non-blank query, else popular.
pub async fn fetch_page(
    catalog: &dyn CatalogApi,
    request: &LoadRequest,
) -> CatalogResult<MoviePage> {
    match &request.mode {
        ListMode::Search(query) if !query.trim().is_empty() => {
            catalog.search(query, request.page).await
        }
        _ => catalog.fetch_popular(request.page).await,
    }
}

/// A mounted list screen: one controller plus the catalog it loads from.
#[derive(Clone)]
pub struct ListSession {
    catalog: Arc<dyn CatalogApi>,
    controller: Arc<Mutex<ListController>>,
}

impl ListSession {
    pub fn new(catalog: Arc<dyn CatalogApi>) -> Self {
        Self {
            catalog,
            controller: Arc::new(Mutex::new(ListController::new())),
        }
    }

    pub async fn snapshot(&self) -> ListSnapshot {
        self.controller.lock().await.snapshot()
    }

    /// Runs the transition only; the caller decides when to [`run`](Self::run) the fetch.
    pub async fn dispatch(&self, action: ListAction) -> Option<LoadRequest> {
        self.controller.lock().await.handle(action)
    }

    /// Fetches and applies one request. The lock is not held while fetching.
    pub async fn run(&self, request: LoadRequest) -> Result<(), ListError> {
        let result = fetch_page(self.catalog.as_ref(), &request).await;
        let mut controller = self.controller.lock().await;
        match controller.apply(&request, result) {
            Ok(()) => {
                info!(
                    page = request.page,
                    items = controller.items().len(),
                    "Movie list updated"
                );
                Ok(())
            }
            Err(stale) => {
                debug!(
                    generation = request.generation,
                    page = request.page,
                    "Discarding stale movie list response"
                );
                Err(stale)
            }
        }
    }

    /// Dispatches and awaits the resulting fetch, if any.
    pub async fn perform(&self, action: ListAction) -> Result<ListSnapshot, ListError> {
        if let Some(request) = self.dispatch(action).await {
            self.run(request).await?;
        }
        Ok(self.snapshot().await)
    }
}
