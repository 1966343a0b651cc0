use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use cinelist::app::{build_router, AppState, MAX_LIST_SESSIONS};
use cinelist::favorites::{FavoritesStore, FAVORITES_KEY};
use cinelist::list::LOAD_FAILED_MESSAGE;
use cinelist::models::{Genre, MovieDetail, MoviePage, MovieSummary, ProductionCompany};
use cinelist::storage::MemoryStorage;
use cinelist::tmdb::{CatalogApi, CatalogError, CatalogResult};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tower::util::ServiceExt;

#[derive(Default)]
struct FakeCatalog {
    pages: HashMap<(String, u32), MoviePage>,
    details: HashMap<i64, MovieDetail>,
}

impl FakeCatalog {
    fn with_page(mut self, source: &str, number: u32, ids: &[i64], total_pages: u32) -> Self {
        let page = MoviePage {
            page: number,
            results: ids.iter().copied().map(movie).collect(),
            total_pages,
            total_results: u64::from(total_pages) * 20,
        };
        self.pages.insert((source.to_string(), number), page);
        self
    }

    fn with_detail(mut self, detail: MovieDetail) -> Self {
        self.details.insert(detail.id, detail);
        self
    }

    fn respond(&self, source: &str, page: u32) -> CatalogResult<MoviePage> {
        self.pages
            .get(&(source.to_string(), page))
            .cloned()
            .ok_or_else(|| status_error(500))
    }
}

fn status_error(status: u16) -> CatalogError {
    CatalogError::Status {
        url: "https://catalog.test/3/movie".to_string(),
        status,
        body: "{}".to_string(),
    }
}

#[async_trait::async_trait]
impl CatalogApi for FakeCatalog {
    async fn fetch_popular(&self, page: u32) -> CatalogResult<MoviePage> {
        self.respond("popular", page)
    }

    async fn fetch_details(&self, id: i64) -> CatalogResult<MovieDetail> {
        match id {
            500 => Err(status_error(500)),
            _ => self.details.get(&id).cloned().ok_or_else(|| status_error(404)),
        }
    }

    async fn search(&self, query: &str, page: u32) -> CatalogResult<MoviePage> {
        self.respond(query, page)
    }

    async fn fetch_genres(&self) -> CatalogResult<Vec<Genre>> {
        Ok(vec![
            Genre {
                id: 28,
                name: "Action".to_string(),
            },
            Genre {
                id: 35,
                name: "Comedy".to_string(),
            },
        ])
    }

    async fn fetch_by_genre(&self, genre_id: i64, page: u32) -> CatalogResult<MoviePage> {
        self.respond(&format!("genre:{genre_id}"), page)
    }
}

fn movie(id: i64) -> MovieSummary {
    MovieSummary {
        id,
        title: format!("Movie {id}"),
        poster_path: Some(format!("/p{id}.jpg")),
        release_date: "2021-06-04".to_string(),
        vote_average: 7.26,
    }
}

fn fight_club() -> MovieDetail {
    MovieDetail {
        id: 550,
        title: "Fight Club".to_string(),
        poster_path: Some("/pB8BM7pdSp6B6Ih7QZ4DrQ3PmJK.jpg".to_string()),
        release_date: "1999-10-15".to_string(),
        vote_average: 8.4,
        overview: "A ticking-time-bomb insomniac...".to_string(),
        runtime: Some(139),
        budget: 63_000_000,
        revenue: 100_853_753,
        genres: vec![Genre {
            id: 18,
            name: "Drama".to_string(),
        }],
        production_companies: vec![ProductionCompany {
            id: 508,
            name: "Regency Enterprises".to_string(),
        }],
        status: "Released".to_string(),
        original_language: "en".to_string(),
        backdrop_path: None,
        tagline: Some("Mischief. Mayhem. Soap.".to_string()),
    }
}

async fn app_with(catalog: FakeCatalog) -> (Router, Arc<MemoryStorage>) {
    let storage = Arc::new(MemoryStorage::new());
    let favorites = FavoritesStore::load(storage.clone()).await;
    let state = AppState::new(Arc::new(catalog), favorites);
    (build_router(state), storage)
}

async fn send(app: &Router, req: Request<Body>) -> (StatusCode, Value) {
    let res = app.clone().oneshot(req).await.unwrap();
    let status = res.status();
    let bytes = axum::body::to_bytes(res.into_body(), usize::MAX)
        .await
        .unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or_else(|_| {
            Value::String(String::from_utf8_lossy(&bytes).into_owned())
        })
    };
    (status, body)
}

fn get(uri: &str) -> Request<Body> {
    Request::get(uri).body(Body::empty()).unwrap()
}

fn post(uri: &str) -> Request<Body> {
    Request::post(uri).body(Body::empty()).unwrap()
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::post(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn item_ids(body: &Value) -> Vec<i64> {
    body["state"]["items"]
        .as_array()
        .map(|items| items.iter().filter_map(|m| m["id"].as_i64()).collect())
        .unwrap_or_default()
}

async fn wait_for_list<F>(app: &Router, id: i64, done: F) -> Value
where
    F: Fn(&Value) -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        let (status, body) = send(app, get(&format!("/lists/{id}"))).await;
        assert_eq!(status, StatusCode::OK);
        if done(&body) {
            return body;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for list {id}; last state: {body}");
        }
        tokio::task::yield_now().await;
    }
}

fn state_is(body: &Value, state: &str) -> bool {
    body["state"]["status"]["state"] == state
}

#[tokio::test]
async fn health_is_ok() {
    let (app, _) = app_with(FakeCatalog::default()).await;
    let (status, body) = send(&app, get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, Value::String("OK".to_string()));
}

#[tokio::test]
async fn mounted_list_loads_and_pages() {
    let catalog = FakeCatalog::default()
        .with_page("popular", 1, &[1, 2], 2)
        .with_page("popular", 2, &[3, 4], 2);
    let (app, _) = app_with(catalog).await;

    let (status, body) = send(&app, post("/lists")).await;
    assert_eq!(status, StatusCode::CREATED);
    let id = body["id"].as_i64().unwrap();

    let body = wait_for_list(&app, id, |b| state_is(b, "loaded")).await;
    assert_eq!(item_ids(&body), vec![1, 2]);
    assert_eq!(body["state"]["has_more"], true);

    let (status, _) = send(&app, post(&format!("/lists/{id}/more"))).await;
    assert_eq!(status, StatusCode::OK);
    let body = wait_for_list(&app, id, |b| item_ids(b).len() == 4).await;
    assert_eq!(item_ids(&body), vec![1, 2, 3, 4]);
    assert_eq!(body["state"]["has_more"], false);
    assert_eq!(body["state"]["page"], 2);
}

#[tokio::test]
async fn search_replaces_results_and_clear_returns_to_popular() {
    let catalog = FakeCatalog::default()
        .with_page("popular", 1, &[1, 2], 1)
        .with_page("alien", 1, &[348, 126889], 1);
    let (app, _) = app_with(catalog).await;

    let (_, body) = send(&app, post("/lists")).await;
    let id = body["id"].as_i64().unwrap();
    wait_for_list(&app, id, |b| state_is(b, "loaded")).await;

    let (status, body) = send(
        &app,
        post_json(&format!("/lists/{id}/search"), json!({ "query": "alien" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"]["mode"]["kind"], "search");
    let body = wait_for_list(&app, id, |b| item_ids(b) == vec![348, 126889]).await;
    assert_eq!(body["state"]["query"], "alien");

    send(&app, post(&format!("/lists/{id}/clear"))).await;
    let body = wait_for_list(&app, id, |b| {
        state_is(b, "loaded") && b["state"]["mode"]["kind"] == "popular"
    })
    .await;
    assert_eq!(item_ids(&body), vec![1, 2]);
    assert_eq!(body["state"]["query"], "");
}

#[tokio::test]
async fn failed_first_page_shows_banner_until_dismissed() {
    let (app, _) = app_with(FakeCatalog::default()).await;

    let (_, body) = send(&app, post("/lists")).await;
    let id = body["id"].as_i64().unwrap();

    let body = wait_for_list(&app, id, |b| state_is(b, "error")).await;
    assert_eq!(body["state"]["banner"], LOAD_FAILED_MESSAGE);
    assert!(item_ids(&body).is_empty());

    let (_, body) = send(&app, post(&format!("/lists/{id}/dismiss"))).await;
    assert!(body["state"]["banner"].is_null());
}

#[tokio::test]
async fn unknown_and_unmounted_lists_are_not_found() {
    let catalog = FakeCatalog::default().with_page("popular", 1, &[1], 1);
    let (app, _) = app_with(catalog).await;

    let (status, body) = send(&app, get("/lists/99")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "unknown_list");

    let (_, body) = send(&app, post("/lists")).await;
    let id = body["id"].as_i64().unwrap();
    let req = Request::delete(format!("/lists/{id}"))
        .body(Body::empty())
        .unwrap();
    let (status, _) = send(&app, req).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, _) = send(&app, post(&format!("/lists/{id}/refresh"))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn mounting_past_the_cap_evicts_least_recently_used() {
    let catalog = FakeCatalog::default().with_page("popular", 1, &[1], 1);
    let (app, _) = app_with(catalog).await;

    let mut ids = Vec::new();
    for _ in 0..MAX_LIST_SESSIONS {
        let (status, body) = send(&app, post("/lists")).await;
        assert_eq!(status, StatusCode::CREATED);
        ids.push(body["id"].as_i64().unwrap());
    }
    // Touch the oldest so the second-oldest becomes the eviction candidate.
    let (status, _) = send(&app, get(&format!("/lists/{}", ids[0]))).await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = send(&app, post("/lists")).await;
    assert_eq!(status, StatusCode::CREATED);
    let newest = body["id"].as_i64().unwrap();

    let (status, body) = send(&app, get(&format!("/lists/{}", ids[1]))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "unknown_list");
    for id in [ids[0], ids[2], newest] {
        let (status, _) = send(&app, get(&format!("/lists/{id}"))).await;
        assert_eq!(status, StatusCode::OK, "list {id} should survive");
    }

    let (status, _) = send(&app, post("/lists")).await;
    assert_eq!(status, StatusCode::CREATED);
    let (status, _) = send(&app, get(&format!("/lists/{}", ids[3]))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn malformed_search_body_is_rejected() {
    let catalog = FakeCatalog::default()
        .with_page("popular", 1, &[1, 2], 1)
        .with_page("alien", 1, &[348], 1);
    let (app, _) = app_with(catalog).await;

    let (_, body) = send(&app, post("/lists")).await;
    let id = body["id"].as_i64().unwrap();
    wait_for_list(&app, id, |b| state_is(b, "loaded")).await;

    let req = Request::post(format!("/lists/{id}/search"))
        .header("content-type", "application/json")
        .body(Body::from("{\"query\": 42"))
        .unwrap();
    let (status, body) = send(&app, req).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "invalid_body");

    let (_, body) = send(&app, get(&format!("/lists/{id}"))).await;
    assert_eq!(body["state"]["mode"]["kind"], "popular");
    assert_eq!(item_ids(&body), vec![1, 2]);

    // An empty body still commits the draft query.
    let req = Request::put(format!("/lists/{id}/query"))
        .header("content-type", "application/json")
        .body(Body::from(json!({ "query": "alien" }).to_string()))
        .unwrap();
    send(&app, req).await;
    let (status, body) = send(&app, post(&format!("/lists/{id}/search"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"]["mode"]["query"], "alien");
    wait_for_list(&app, id, |b| item_ids(b) == vec![348]).await;
}

#[tokio::test]
async fn movie_details_are_formatted_for_display() {
    let (app, _) = app_with(FakeCatalog::default().with_detail(fight_club())).await;

    let (status, body) = send(&app, get("/movies/550")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["title"], "Fight Club");
    assert_eq!(body["year"], 1999);
    assert_eq!(body["rating"], "⭐ 8.4");
    assert_eq!(body["runtime_label"], "2h 19m");
    assert_eq!(body["budget_label"], "$63,000,000");
    assert_eq!(body["revenue_label"], "$100,853,753");
    assert_eq!(body["language"], "EN");
    assert_eq!(
        body["poster_url"],
        "https://image.tmdb.org/t/p/w500/pB8BM7pdSp6B6Ih7QZ4DrQ3PmJK.jpg"
    );
    assert_eq!(
        body["backdrop_url"],
        "https://via.placeholder.com/500x750?text=No+Image"
    );
    assert_eq!(body["is_favorite"], false);
}

#[tokio::test]
async fn movie_detail_errors_map_to_status_codes() {
    let (app, _) = app_with(FakeCatalog::default()).await;

    let (status, body) = send(&app, get("/movies/1")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "not_found");

    let (status, body) = send(&app, get("/movies/500")).await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(body["error"], "catalog_unavailable");
}

#[tokio::test]
async fn genres_and_genre_pages() {
    let catalog = FakeCatalog::default().with_page("genre:28", 2, &[7, 8], 3);
    let (app, _) = app_with(catalog).await;

    let (status, body) = send(&app, get("/genres")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["genres"][0]["name"], "Action");

    let (status, body) = send(&app, get("/genres/28/movies?page=2")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["page"], 2);
    assert_eq!(body["results"][1]["id"], 8);

    let (status, _) = send(&app, get("/genres/28/movies")).await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
}

#[tokio::test]
async fn favorites_toggle_and_persist() {
    let (app, storage) = app_with(FakeCatalog::default().with_detail(fight_club())).await;
    let summary = serde_json::to_value(fight_club().summary()).unwrap();

    let (status, body) = send(&app, post_json("/favorites/toggle", summary.clone())).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["favorite"], true);
    assert_eq!(body["changed"], true);
    assert_eq!(body["count"], 1);

    let (_, body) = send(&app, get("/favorites/550")).await;
    assert_eq!(body["favorite"], true);
    let (_, body) = send(&app, get("/movies/550")).await;
    assert_eq!(body["is_favorite"], true);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        if let Some(blob) = storage.peek(FAVORITES_KEY) {
            let saved: Vec<MovieSummary> = serde_json::from_str(&blob).unwrap();
            if saved.len() == 1 {
                assert_eq!(saved[0].title, "Fight Club");
                break;
            }
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for favorites to persist");
        }
        tokio::task::yield_now().await;
    }

    let (_, body) = send(&app, post_json("/favorites/toggle", summary)).await;
    assert_eq!(body["favorite"], false);
    assert_eq!(body["count"], 0);

    let req = Request::delete("/favorites/550").body(Body::empty()).unwrap();
    let (status, body) = send(&app, req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["changed"], false);

    let (_, body) = send(&app, get("/favorites")).await;
    assert_eq!(body["count"], 0);
}

#[tokio::test]
async fn nearby_cinemas_are_sorted() {
    let (app, _) = app_with(FakeCatalog::default()).await;

    let (status, body) = send(&app, get("/cinemas?lat=40.7128&lon=-74.006&count=6")).await;
    assert_eq!(status, StatusCode::OK);
    let cinemas = body["cinemas"].as_array().unwrap();
    assert_eq!(cinemas.len(), 6);
    let distances: Vec<f64> = cinemas
        .iter()
        .map(|c| c["cinema"]["distance_km"].as_f64().unwrap())
        .collect();
    assert!(distances.windows(2).all(|w| w[0] <= w[1]));
    assert!(cinemas[0]["distance_label"].as_str().unwrap().ends_with(" km"));
}

#[tokio::test]
async fn cinemas_report_permission_denied_and_bad_input() {
    let (app, _) = app_with(FakeCatalog::default()).await;

    let (status, body) = send(&app, get("/cinemas?denied=true")).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"], "permission_denied");

    let (status, body) = send(&app, get("/cinemas?lat=10")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "missing_location");

    let (status, body) = send(&app, get("/cinemas?lat=95&lon=0")).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["error"], "invalid_location");
}
