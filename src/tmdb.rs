use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::config::Settings;
use crate::models::{Genre, MovieDetail, MoviePage};

pub const TMDB_BASE: &str = "https://api.themoviedb.org/3";
const IMAGE_BASE: &str = "https://image.tmdb.org/t/p";
pub const PLACEHOLDER_IMAGE: &str = "https://via.placeholder.com/500x750?text=No+Image";
const MAX_ERROR_BODY: usize = 512;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("request to {url} failed: {source}")]
    Network {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("request to {url} timed out")]
    Timeout { url: String },

    #[error("{url} -> HTTP {status}: {body}")]
    Status { url: String, status: u16, body: String },

    #[error("unexpected JSON from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

impl CatalogError {
    /// Transport-level failure, as opposed to a well-formed but unusable response.
    pub fn is_network(&self) -> bool {
        matches!(
            self,
            CatalogError::Network { .. } | CatalogError::Timeout { .. } | CatalogError::Status { .. }
        )
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            CatalogError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

pub type CatalogResult<T> = Result<T, CatalogError>;

#[async_trait]
pub trait CatalogApi: Send + Sync {
    async fn fetch_popular(&self, page: u32) -> CatalogResult<MoviePage>;
    async fn fetch_details(&self, id: i64) -> CatalogResult<MovieDetail>;
    async fn search(&self, query: &str, page: u32) -> CatalogResult<MoviePage>;
    async fn fetch_genres(&self) -> CatalogResult<Vec<Genre>>;
    async fn fetch_by_genre(&self, genre_id: i64, page: u32) -> CatalogResult<MoviePage>;
}

#[derive(Clone)]
pub struct TmdbClient {
    client: Client,
    base_url: String,
    api_key: String,
}

// Keeps the API key out of logs.
impl fmt::Debug for TmdbClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TmdbClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl TmdbClient {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        use anyhow::Context;

        let user_agent = format!("cinelist/{}", env!("CARGO_PKG_VERSION"));
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(timeout)
            .user_agent(user_agent)
            .build()
            .context("Failed to build TMDB HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        })
    }

    pub fn from_settings(settings: &Settings) -> anyhow::Result<Self> {
        Self::new(
            settings.tmdb_base_url.clone(),
            settings.tmdb_api_key.clone(),
            settings.http_timeout,
        )
    }

    fn endpoint(&self, path: &str, params: &[(&str, String)]) -> String {
        let mut url = format!("{}{path}?api_key={}", self.base_url, self.api_key);
        for (name, value) in params {
            url.push('&');
            url.push_str(name);
            url.push('=');
            url.push_str(&urlencoding::encode(value));
        }
        url
    }

    async fn get_json<T: for<'de> Deserialize<'de>>(&self, url: &str) -> CatalogResult<T> {
        // Never echo the key back through errors or logs.
        let redacted = redact_api_key(url);
        debug!(url = %redacted, "GET");

        let res = self.client.get(url).send().await.map_err(|e| transport_error(&redacted, e))?;
        let status = res.status();
        let text = res.text().await.map_err(|e| transport_error(&redacted, e))?;
        if !status.is_success() {
            return Err(CatalogError::Status {
                url: redacted,
                status: status.as_u16(),
                body: text.chars().take(MAX_ERROR_BODY).collect(),
            });
        }
        serde_json::from_str(&text).map_err(|source| CatalogError::Decode {
            url: redacted,
            source,
        })
    }
}

#[async_trait]
impl CatalogApi for TmdbClient {
    async fn fetch_popular(&self, page: u32) -> CatalogResult<MoviePage> {
        let url = self.endpoint("/movie/popular", &[("page", page.to_string())]);
        self.get_json(&url).await
    }

    async fn fetch_details(&self, id: i64) -> CatalogResult<MovieDetail> {
        let url = self.endpoint(&format!("/movie/{id}"), &[]);
        self.get_json(&url).await
    }

    async fn search(&self, query: &str, page: u32) -> CatalogResult<MoviePage> {
        let url = self.endpoint(
            "/search/movie",
            &[("query", query.to_string()), ("page", page.to_string())],
        );
        self.get_json(&url).await
    }

    async fn fetch_genres(&self) -> CatalogResult<Vec<Genre>> {
        #[derive(Deserialize)]
        struct GenreList {
            genres: Vec<Genre>,
        }

        let url = self.endpoint("/genre/movie/list", &[]);
        let data: GenreList = self.get_json(&url).await?;
        Ok(data.genres)
    }

    async fn fetch_by_genre(&self, genre_id: i64, page: u32) -> CatalogResult<MoviePage> {
        let url = self.endpoint(
            "/discover/movie",
            &[("with_genres", genre_id.to_string()), ("page", page.to_string())],
        );
        self.get_json(&url).await
    }
}

fn transport_error(url: &str, source: reqwest::Error) -> CatalogError {
    if source.is_timeout() {
        CatalogError::Timeout {
            url: url.to_string(),
        }
    } else {
        CatalogError::Network {
            url: url.to_string(),
            source: source.without_url(),
        }
    }
}

fn redact_api_key(url: &str) -> String {
    let Some(start) = url.find("api_key=") else {
        return url.to_string();
    };
    let value_start = start + "api_key=".len();
    let value_end = url[value_start..]
        .find('&')
        .map(|i| value_start + i)
        .unwrap_or(url.len());
    format!("{}***{}", &url[..value_start], &url[value_end..])
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageSize {
    W92,
    W154,
    W185,
    W342,
    #[default]
    W500,
    W780,
    Original,
}

impl ImageSize {
    pub fn as_str(self) -> &'static str {
        match self {
            ImageSize::W92 => "w92",
            ImageSize::W154 => "w154",
            ImageSize::W185 => "w185",
            ImageSize::W342 => "w342",
            ImageSize::W500 => "w500",
            ImageSize::W780 => "w780",
            ImageSize::Original => "original",
        }
    }
}

/// Full image URL for a catalog path, or the placeholder when there is no image.
pub fn image_url(path: Option<&str>, size: ImageSize) -> String {
    match path.map(str::trim).filter(|p| !p.is_empty()) {
        Some(p) => format!("{IMAGE_BASE}/{}{p}", size.as_str()),
        None => PLACEHOLDER_IMAGE.to_string(),
    }
}
