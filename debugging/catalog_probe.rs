//! Query the movie catalog through the library client and print the result.
//! Usage:
//!   cargo run --bin catalog_probe -- popular [page]
//!   cargo run --bin catalog_probe -- search <query> [page]
//!   cargo run --bin catalog_probe -- movie <tmdb_id>
//!   cargo run --bin catalog_probe -- genres
//!   cargo run --bin catalog_probe -- genre <genre_id> [page]
//! Requires TMDB_API_KEY in the environment (.env supported).

use anyhow::{Context, Result};
use cinelist::config::Settings;
use cinelist::tmdb::{image_url, CatalogApi, ImageSize, TmdbClient};
use cinelist::utils;
use dotenvy::dotenv;
use serde_json::{json, Value};
use std::env;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq)]
enum Command {
    Popular,
    Search,
    Movie,
    Genres,
    Genre,
}

impl FromStr for Command {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "popular" => Ok(Command::Popular),
            "search" => Ok(Command::Search),
            "movie" => Ok(Command::Movie),
            "genres" => Ok(Command::Genres),
            "genre" => Ok(Command::Genre),
            _ => Err(anyhow::anyhow!(
                "command must be one of: popular, search, movie, genres, genre"
            )),
        }
    }
}

fn usage() -> ! {
    eprintln!("Usage: cargo run --bin catalog_probe -- popular [page]");
    eprintln!("       cargo run --bin catalog_probe -- search <query> [page]");
    eprintln!("       cargo run --bin catalog_probe -- movie <tmdb_id>");
    eprintln!("       cargo run --bin catalog_probe -- genres");
    eprintln!("       cargo run --bin catalog_probe -- genre <genre_id> [page]");
    std::process::exit(1);
}

fn page_arg(arg: Option<&String>) -> Result<u32> {
    match arg {
        Some(raw) => {
            let page: u32 = raw.parse().context("page must be a positive integer")?;
            Ok(page.max(1))
        }
        None => Ok(1),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        usage();
    }

    let command = Command::from_str(&args[1])?;
    let settings = Settings::from_env()?;
    let client = TmdbClient::from_settings(&settings)?;

    let output: Value = match command {
        Command::Popular => {
            let page = client.fetch_popular(page_arg(args.get(2))?).await?;
            serde_json::to_value(page)?
        }
        Command::Search => {
            let Some(query) = args.get(2) else { usage() };
            let page = client.search(query, page_arg(args.get(3))?).await?;
            serde_json::to_value(page)?
        }
        Command::Movie => {
            let Some(raw) = args.get(2) else { usage() };
            let id: i64 = raw.parse().context("tmdb_id must be an integer")?;
            let detail = client.fetch_details(id).await?;
            json!({
                "id": detail.id,
                "title": detail.title,
                "tagline": detail.tagline,
                "year": utils::release_year(&detail.release_date),
                "rating": utils::rating_label(detail.vote_average),
                "runtime": detail.runtime.map(utils::format_runtime),
                "budget": utils::format_usd(detail.budget),
                "revenue": utils::format_usd(detail.revenue),
                "genres": detail.genres.iter().map(|g| g.name.clone()).collect::<Vec<_>>(),
                "poster": image_url(detail.poster_path.as_deref(), ImageSize::W500),
                "backdrop": image_url(detail.backdrop_path.as_deref(), ImageSize::Original),
            })
        }
        Command::Genres => serde_json::to_value(client.fetch_genres().await?)?,
        Command::Genre => {
            let Some(raw) = args.get(2) else { usage() };
            let id: i64 = raw.parse().context("genre_id must be an integer")?;
            let page = client.fetch_by_genre(id, page_arg(args.get(3))?).await?;
            serde_json::to_value(page)?
        }
    };

    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
