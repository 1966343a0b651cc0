//! Persisted favorites set.
//!
//! Membership changes apply to memory immediately; the whole set is then
//! handed to a background writer that overwrites the stored blob. Writes land
//! in mutation order, and a failed write never undoes the in-memory change.
//! Removing a movie and re-adding it as the very next change puts it back in
//! its old slot, so a double toggle leaves the sequence as it was.

use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::models::MovieSummary;
use crate::storage::{KeyValueStorage, StorageError};

pub const FAVORITES_KEY: &str = "favorites";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("failed to persist favorites: {0}")]
pub struct PersistError(String);

/// Resolves once the write triggered by a mutation has been attempted.
/// Dropping it is fine; the write still happens.
#[derive(Debug)]
pub struct PersistSignal(oneshot::Receiver<Result<(), PersistError>>);

impl PersistSignal {
    fn ready() -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(Ok(()));
        Self(rx)
    }

    pub async fn wait(self) -> Result<(), PersistError> {
        match self.0.await {
            Ok(result) => result,
            Err(_) => Err(PersistError("favorites writer stopped".to_string())),
        }
    }
}

#[derive(Debug)]
pub struct FavoritesUpdate {
    pub movie_id: i64,
    pub is_favorite: bool,
    /// False when the call left the set as it was (e.g. adding a present movie).
    pub changed: bool,
    pub favorites: Vec<MovieSummary>,
    pub persisted: PersistSignal,
}

struct PersistJob {
    /// `None` is a flush marker: nothing new to write.
    blob: Option<String>,
    done: oneshot::Sender<Result<(), PersistError>>,
}

pub struct FavoritesStore {
    items: Vec<MovieSummary>,
    ids: HashSet<i64>,
    /// Id and position of the last removal, cleared by any other change.
    last_removed: Option<(i64, usize)>,
    writer: mpsc::UnboundedSender<PersistJob>,
}

impl FavoritesStore {
    /// Reads the saved set once. Missing or unreadable data starts an empty set.
    /// Must be called inside a tokio runtime; it spawns the writer task.
    pub async fn load(storage: Arc<dyn KeyValueStorage>) -> Self {
        let saved = match storage.get(FAVORITES_KEY).await {
            Ok(Some(blob)) => match parse_blob(&blob) {
                Ok(items) => items,
                Err(e) => {
                    warn!("Ignoring saved favorites: {}", e);
                    Vec::new()
                }
            },
            Ok(None) => Vec::new(),
            Err(e) => {
                warn!("Could not read saved favorites, starting empty: {}", e);
                Vec::new()
            }
        };

        let mut ids = HashSet::with_capacity(saved.len());
        let items: Vec<MovieSummary> = saved.into_iter().filter(|m| ids.insert(m.id)).collect();
        info!("Loaded {} favorite(s)", items.len());

        let (writer, jobs) = mpsc::unbounded_channel();
        tokio::spawn(run_writer(storage, jobs));

        Self {
            items,
            ids,
            last_removed: None,
            writer,
        }
    }

    pub fn is_favorite(&self, id: i64) -> bool {
        self.ids.contains(&id)
    }

    pub fn favorites(&self) -> Vec<MovieSummary> {
        self.items.clone()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Removes the movie if present, otherwise stores the full summary.
    pub fn toggle(&mut self, movie: MovieSummary) -> FavoritesUpdate {
        if self.is_favorite(movie.id) {
            self.remove(movie.id)
        } else {
            self.add(movie)
        }
    }

    pub fn add(&mut self, movie: MovieSummary) -> FavoritesUpdate {
        let movie_id = movie.id;
        if !self.ids.insert(movie_id) {
            return self.unchanged(movie_id);
        }
        debug!(movie_id, title = %movie.title, "favorite added");
        match self.last_removed.take() {
            Some((id, index)) if id == movie_id => {
                self.items.insert(index.min(self.items.len()), movie);
            }
            _ => self.items.push(movie),
        }
        self.changed(movie_id)
    }

    pub fn remove(&mut self, id: i64) -> FavoritesUpdate {
        if !self.ids.remove(&id) {
            return self.unchanged(id);
        }
        debug!(movie_id = id, "favorite removed");
        self.last_removed = self
            .items
            .iter()
            .position(|m| m.id == id)
            .map(|index| (id, index));
        self.items.retain(|m| m.id != id);
        self.changed(id)
    }

    fn unchanged(&self, movie_id: i64) -> FavoritesUpdate {
        FavoritesUpdate {
            movie_id,
            is_favorite: self.is_favorite(movie_id),
            changed: false,
            favorites: self.favorites(),
            persisted: PersistSignal::ready(),
        }
    }

    fn changed(&self, movie_id: i64) -> FavoritesUpdate {
        FavoritesUpdate {
            movie_id,
            is_favorite: self.is_favorite(movie_id),
            changed: true,
            favorites: self.favorites(),
            persisted: self.persist(),
        }
    }

    /// Resolves once every write queued before this call has been attempted.
    /// Carries the result of the last of those writes.
    pub fn flush(&self) -> PersistSignal {
        self.enqueue(None)
    }

    fn persist(&self) -> PersistSignal {
        match serde_json::to_string(&self.items) {
            Ok(blob) => self.enqueue(Some(blob)),
            Err(e) => {
                warn!("Failed to serialize favorites: {}", e);
                let (done, signal) = oneshot::channel();
                let _ = done.send(Err(PersistError(e.to_string())));
                PersistSignal(signal)
            }
        }
    }

    fn enqueue(&self, blob: Option<String>) -> PersistSignal {
        let (done, signal) = oneshot::channel();
        if let Err(mpsc::error::SendError(job)) = self.writer.send(PersistJob { blob, done }) {
            let _ = job
                .done
                .send(Err(PersistError("favorites writer stopped".to_string())));
        }
        PersistSignal(signal)
    }
}

fn parse_blob(blob: &str) -> Result<Vec<MovieSummary>, StorageError> {
    serde_json::from_str(blob).map_err(|e| StorageError::Corrupt {
        key: FAVORITES_KEY.to_string(),
        reason: e.to_string(),
    })
}

async fn run_writer(
    storage: Arc<dyn KeyValueStorage>,
    mut jobs: mpsc::UnboundedReceiver<PersistJob>,
) {
    let mut last_result: Result<(), PersistError> = Ok(());
    while let Some(job) = jobs.recv().await {
        // Only the newest snapshot matters; fold queued jobs into one write.
        let mut blob = job.blob;
        let mut waiters = vec![job.done];
        while let Ok(next) = jobs.try_recv() {
            if next.blob.is_some() {
                blob = next.blob;
            }
            waiters.push(next.done);
        }

        if let Some(blob) = blob {
            last_result = match storage.set(FAVORITES_KEY, blob).await {
                Ok(()) => Ok(()),
                Err(e) => {
                    warn!("Failed to persist favorites: {}", e);
                    Err(PersistError(e.to_string()))
                }
            };
        }
        let result = last_result.clone();
        for waiter in waiters {
            let _ = waiter.send(result.clone());
        }
    }
    debug!("favorites writer stopped");
}
