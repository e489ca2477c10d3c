//! Offline preparation: combines per-user export folders into one event log
//! and merges per-user genre artifacts into one document.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use serde_json::{Map, Value};

use crate::error::StoreError;
use crate::genre_index::{user_from_artifact_file_name, GenreIndex};

const MUSIC_HISTORY_PREFIX: &str = "StreamingHistory_music";
const PODCAST_HISTORY_PREFIX: &str = "StreamingHistory_podcast";
const PLAYLIST_PREFIX: &str = "Playlist";

/// What a preparation run consumed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PreparationSummary {
    pub users: usize,
    pub files_read: usize,
    pub files_skipped: usize,
}

fn read_json(path: &Path) -> Result<Value, StoreError> {
    let raw = fs::read_to_string(path).map_err(|source| StoreError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&raw).map_err(|source| StoreError::Parse {
        context: path.display().to_string(),
        source,
    })
}

fn write_json(path: &Path, value: &impl serde::Serialize) -> Result<(), StoreError> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|source| StoreError::Write {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    let json = serde_json::to_string_pretty(value).map_err(|source| StoreError::Parse {
        context: path.display().to_string(),
        source,
    })?;
    fs::write(path, json).map_err(|source| StoreError::Write {
        path: path.to_path_buf(),
        source,
    })
}

/// Reads `{ user_folder: [file, ...] }`.
pub fn load_folder_index(path: &Path) -> Result<BTreeMap<String, Vec<String>>, StoreError> {
    let raw = fs::read_to_string(path).map_err(|source| StoreError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&raw).map_err(|source| StoreError::Parse {
        context: path.display().to_string(),
        source,
    })
}

fn extend_array(target: &mut Map<String, Value>, key: &str, items: Vec<Value>) {
    if let Some(Value::Array(existing)) = target.get_mut(key) {
        existing.extend(items);
    }
}

/// Builds one user entry from the files listed for that user's folder.
fn prepare_user(
    data_dir: &Path,
    user_folder: &str,
    files: &[String],
    summary: &mut PreparationSummary,
) -> Value {
    let mut history = Map::new();
    history.insert("music".to_string(), Value::Array(Vec::new()));
    history.insert("podcast".to_string(), Value::Array(Vec::new()));
    let mut user = Map::new();
    user.insert("user".to_string(), Value::String(user_folder.to_string()));
    user.insert("playlists".to_string(), Value::Array(Vec::new()));

    let folder = data_dir.join(user_folder);
    for file in files {
        let path = folder.join(file);
        let value = match read_json(&path) {
            Ok(value) => value,
            Err(err) => {
                warn!("Preparation: skipping {}: {err}", path.display());
                summary.files_skipped += 1;
                continue;
            }
        };

        let accepted = if file.starts_with(MUSIC_HISTORY_PREFIX)
            || file.starts_with(PODCAST_HISTORY_PREFIX)
        {
            let key = if file.starts_with(MUSIC_HISTORY_PREFIX) {
                "music"
            } else {
                "podcast"
            };
            match value {
                Value::Array(items) => {
                    extend_array(&mut history, key, items);
                    true
                }
                _ => false,
            }
        } else if file.starts_with(PLAYLIST_PREFIX) {
            match value {
                Value::Object(mut object) => match object.remove("playlists") {
                    Some(Value::Array(playlists)) => {
                        extend_array(&mut user, "playlists", playlists);
                        true
                    }
                    _ => false,
                },
                _ => false,
            }
        } else {
            let stem = Path::new(file)
                .file_stem()
                .and_then(|stem| stem.to_str())
                .unwrap_or(file.as_str())
                .to_string();
            user.insert(stem, value);
            true
        };

        if accepted {
            debug!("Preparation: merged {} for {user_folder}", path.display());
            summary.files_read += 1;
        } else {
            warn!(
                "Preparation: {} does not have the expected shape, skipping",
                path.display()
            );
            summary.files_skipped += 1;
        }
    }

    user.insert("streamingHistory".to_string(), Value::Object(history));
    Value::Object(user)
}

/// Combined event-log document (a JSON array of user entries) for every
/// folder listed in `index_path`. Folders are processed in name order.
pub fn prepare_combined_log(
    data_dir: &Path,
    index_path: &Path,
) -> Result<(Value, PreparationSummary), StoreError> {
    let folders = load_folder_index(index_path)?;
    let mut summary = PreparationSummary::default();
    let users: Vec<Value> = folders
        .iter()
        .map(|(folder, files)| prepare_user(data_dir, folder, files, &mut summary))
        .collect();
    summary.users = users.len();
    if users.is_empty() {
        return Err(StoreError::EmptyInput);
    }
    info!(
        "Prepared {} users from {} files ({} skipped)",
        summary.users, summary.files_read, summary.files_skipped
    );
    Ok((Value::Array(users), summary))
}

pub fn write_combined_log(path: &Path, document: &Value) -> Result<(), StoreError> {
    write_json(path, document)?;
    info!("Combined event log saved to {}", path.display());
    Ok(())
}

/// Combines every `artistGenres_<user>.json` in `genre_dir` into
/// `{ user: { artist: [genre] } }` at `output`. Returns the merged users.
pub fn merge_genre_artifacts(genre_dir: &Path, output: &Path) -> Result<Vec<String>, StoreError> {
    let entries = fs::read_dir(genre_dir).map_err(|source| StoreError::Read {
        path: genre_dir.to_path_buf(),
        source,
    })?;
    let mut artifacts: Vec<(String, PathBuf)> = entries
        .filter_map(Result::ok)
        .filter_map(|entry| {
            let file_name = entry.file_name().into_string().ok()?;
            let user = user_from_artifact_file_name(&file_name)?;
            Some((user, entry.path()))
        })
        .collect();
    artifacts.sort();

    let mut merged: BTreeMap<String, GenreIndex> = BTreeMap::new();
    for (user, path) in artifacts {
        match GenreIndex::load(&path) {
            Ok(index) => {
                debug!("Merged genre data for {user} ({} artists)", index.len());
                merged.insert(user, index);
            }
            Err(err) => warn!("Skipping genre artifact {}: {err}", path.display()),
        }
    }

    write_json(output, &merged)?;
    info!(
        "Merged genre data for {} users into {}",
        merged.len(),
        output.display()
    );
    Ok(merged.into_keys().collect())
}
