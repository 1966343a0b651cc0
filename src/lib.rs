pub mod app;
pub mod config;
pub mod favorites;
pub mod geo;
pub mod list;
pub mod models;
pub mod storage;
pub mod tmdb;
pub mod utils;
