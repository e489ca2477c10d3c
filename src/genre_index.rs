//! Artist → genre cache populated by enrichment and persisted per user.
//!
//! An entry with an empty genre list means "looked up, nothing known"; an
//! artist with no entry was never looked up (or its batch failed).

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use log::{debug, info};

use crate::error::StoreError;

const ARTIFACT_PREFIX: &str = "artistGenres_";
const ARTIFACT_EXTENSION: &str = "json";

/// What the index knows about one artist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenreLookup<'a> {
    Known(&'a [String]),
    NoGenresKnown,
    NotLookedUp,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(transparent)]
pub struct GenreIndex {
    entries: BTreeMap<String, Vec<String>>,
}

impl GenreIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(&self, artist: &str) -> GenreLookup<'_> {
        match self.entries.get(artist) {
            Some(genres) if genres.is_empty() => GenreLookup::NoGenresKnown,
            Some(genres) => GenreLookup::Known(genres),
            None => GenreLookup::NotLookedUp,
        }
    }

    pub fn contains(&self, artist: &str) -> bool {
        self.entries.contains_key(artist)
    }

    /// Writes an artist's genres once. Returns `false` (and keeps the first
    /// value) when the artist already has an entry.
    pub fn record(&mut self, artist: &str, genres: Vec<String>) -> bool {
        if self.contains(artist) {
            return false;
        }
        let mut unique = Vec::with_capacity(genres.len());
        for genre in genres {
            let genre = genre.trim().to_string();
            if !genre.is_empty() && !unique.contains(&genre) {
                unique.push(genre);
            }
        }
        self.entries.insert(artist.to_string(), unique);
        true
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Entries in artist-name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.entries
            .iter()
            .map(|(artist, genres)| (artist.as_str(), genres.as_slice()))
    }

    pub fn load(path: &Path) -> Result<Self, StoreError> {
        let raw = fs::read_to_string(path).map_err(|source| StoreError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| StoreError::Parse {
            context: path.display().to_string(),
            source,
        })
    }

    pub fn save(&self, path: &Path) -> Result<(), StoreError> {
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|source| StoreError::Write {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let json = serde_json::to_string_pretty(self).map_err(|source| StoreError::Parse {
            context: format!("genre index for {}", path.display()),
            source,
        })?;
        fs::write(path, json).map_err(|source| StoreError::Write {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// Percent-encoded user id; distinct ids always give distinct file names.
pub(crate) fn file_name_component(user: &str) -> String {
    urlencoding::encode(user).into_owned()
}

/// Deterministic artifact file name for a user, e.g. `artistGenres_alice.json`.
pub fn artifact_file_name(user: &str) -> String {
    format!(
        "{ARTIFACT_PREFIX}{}.{ARTIFACT_EXTENSION}",
        file_name_component(user)
    )
}

/// Decodes the user id back out of an artifact file name.
pub fn user_from_artifact_file_name(file_name: &str) -> Option<String> {
    let encoded = file_name
        .strip_prefix(ARTIFACT_PREFIX)?
        .strip_suffix(".json")
        .filter(|user| !user.is_empty())?;
    urlencoding::decode(encoded).ok().map(|user| user.into_owned())
}

/// Directory of per-user genre artifacts; presence of a fresh artifact is the cache hit.
#[derive(Debug, Clone)]
pub struct ArtifactCache {
    dir: PathBuf,
    max_age: Option<Duration>,
}

impl ArtifactCache {
    pub fn new(dir: impl Into<PathBuf>, max_age: Option<Duration>) -> Self {
        Self {
            dir: dir.into(),
            max_age,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, user: &str) -> PathBuf {
        self.dir.join(artifact_file_name(user))
    }

    /// Whether a usable artifact exists for the user.
    pub fn is_fresh(&self, user: &str) -> bool {
        let path = self.path_for(user);
        let Ok(metadata) = fs::metadata(&path) else {
            return false;
        };
        let Some(max_age) = self.max_age else {
            return metadata.is_file();
        };
        let age = metadata
            .modified()
            .ok()
            .and_then(|modified| SystemTime::now().duration_since(modified).ok())
            .unwrap_or_default();
        if age > max_age {
            debug!(
                "Genre artifact {} is stale ({:?} old, max {:?})",
                path.display(),
                age,
                max_age
            );
            return false;
        }
        metadata.is_file()
    }

    /// Loads the artifact when it is fresh.
    pub fn load(&self, user: &str) -> Result<Option<GenreIndex>, StoreError> {
        if !self.is_fresh(user) {
            return Ok(None);
        }
        GenreIndex::load(&self.path_for(user)).map(Some)
    }

    pub fn store(&self, user: &str, index: &GenreIndex) -> Result<PathBuf, StoreError> {
        let path = self.path_for(user);
        index.save(&path)?;
        info!(
            "Saved genre artifact for {} ({} artists) to {}",
            user,
            index.len(),
            path.display()
        );
        Ok(path)
    }
}
