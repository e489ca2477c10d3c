//! Read-only, in-memory view of exported listening history.
//!
//! Each user entry is decoded field by field from `serde_json::Value` so a
//! single malformed record is skipped (and counted) instead of failing the
//! whole document.

use std::collections::HashSet;
use std::fs;
use std::path::Path;

use log::{debug, warn};
use serde_json::Value;

use crate::error::StoreError;

pub const UNTITLED_PLAYLIST: &str = "Untitled Playlist";

/// Which history a playback event came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    Music,
    Podcast,
}

/// One playback session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamingEvent {
    pub artist_name: String,
    pub track_name: String,
    /// Local `date time` string, no timezone.
    pub end_time: String,
    pub ms_played: u64,
    pub kind: StreamKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaylistItem {
    pub track_ref: Option<String>,
    pub added_date: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Playlist {
    pub name: Option<String>,
    pub items: Vec<PlaylistItem>,
}

impl Playlist {
    pub fn display_name(&self) -> &str {
        self.name
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .unwrap_or(UNTITLED_PLAYLIST)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchQueryEvent {
    pub search_query: String,
    pub timestamp: Option<String>,
}

/// Saved-library entry. Distinct from [`StreamingEvent`] even though it also
/// carries an artist and a time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LibraryTrack {
    pub artist: String,
    pub end_time: Option<String>,
}

/// Number of records dropped while decoding, per source.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct SkippedRecords {
    pub streaming: usize,
    pub playlists: usize,
    pub playlist_items: usize,
    pub search_queries: usize,
    pub library_tracks: usize,
}

impl SkippedRecords {
    pub fn total(&self) -> usize {
        self.streaming
            + self.playlists
            + self.playlist_items
            + self.search_queries
            + self.library_tracks
    }
}

/// Everything exported for one user.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserRecord {
    pub user: String,
    pub playlists: Vec<Playlist>,
    pub music: Vec<StreamingEvent>,
    pub podcast: Vec<StreamingEvent>,
    pub search_queries: Vec<SearchQueryEvent>,
    pub library_tracks: Vec<LibraryTrack>,
    pub skipped: SkippedRecords,
}

impl UserRecord {
    /// Distinct music artist names, in first-played order.
    pub fn music_artists(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        self.music
            .iter()
            .map(|event| event.artist_name.trim())
            .filter(|name| !name.is_empty())
            .filter(|name| seen.insert(name.to_string()))
            .map(ToOwned::to_owned)
            .collect()
    }
}

/// All users of one event-log document.
#[derive(Debug, Clone, Default)]
pub struct EventStore {
    users: Vec<UserRecord>,
}

impl EventStore {
    pub fn load_from_path(path: &Path) -> Result<Self, StoreError> {
        let raw = fs::read_to_string(path).map_err(|source| StoreError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&raw, &path.display().to_string())
    }

    /// Parses a document that is either an array of user entries or a single entry.
    pub fn from_json_str(raw: &str, context: &str) -> Result<Self, StoreError> {
        let document: Value = serde_json::from_str(raw).map_err(|source| StoreError::Parse {
            context: context.to_string(),
            source,
        })?;
        Self::from_value(&document)
    }

    pub fn from_value(document: &Value) -> Result<Self, StoreError> {
        let entries: Vec<&Value> = match document {
            Value::Array(items) => items.iter().collect(),
            item @ Value::Object(_) => vec![item],
            _ => Vec::new(),
        };
        let users: Vec<UserRecord> = entries
            .into_iter()
            .enumerate()
            .filter_map(|(position, entry)| {
                let record = parse_user(entry);
                if record.is_none() {
                    warn!("Skipping user entry {position}: missing 'user' identifier");
                }
                record
            })
            .collect();
        if users.is_empty() {
            return Err(StoreError::EmptyInput);
        }
        Ok(Self { users })
    }

    pub fn users(&self) -> &[UserRecord] {
        &self.users
    }

    pub fn find_user(&self, user: &str) -> Option<&UserRecord> {
        self.users.iter().find(|record| record.user == user)
    }
}

fn array_at<'a>(value: &'a Value, path: &[&str]) -> &'a [Value] {
    let mut current = value;
    for key in path {
        match current.get(key) {
            Some(next) => current = next,
            None => return &[],
        }
    }
    current.as_array().map(Vec::as_slice).unwrap_or(&[])
}

fn non_empty_str<'a>(value: &'a Value, key: &str) -> Option<&'a str> {
    value
        .get(key)
        .and_then(Value::as_str)
        .filter(|text| !text.trim().is_empty())
}

fn first_str<'a>(value: &'a Value, keys: &[&str]) -> Option<&'a str> {
    keys.iter().find_map(|key| non_empty_str(value, key))
}

fn non_negative_ms(value: Option<&Value>) -> Option<u64> {
    let value = value?;
    if let Some(ms) = value.as_u64() {
        return Some(ms);
    }
    value
        .as_f64()
        .filter(|ms| ms.is_finite() && *ms >= 0.0)
        .map(|ms| ms.round() as u64)
}

fn parse_user(entry: &Value) -> Option<UserRecord> {
    let user = non_empty_str(entry, "user")?.to_string();
    let mut skipped = SkippedRecords::default();

    let mut music = Vec::new();
    for raw in array_at(entry, &["streamingHistory", "music"]) {
        match parse_streaming_event(raw, StreamKind::Music) {
            Some(event) => music.push(event),
            None => skipped.streaming += 1,
        }
    }
    let mut podcast = Vec::new();
    for raw in array_at(entry, &["streamingHistory", "podcast"]) {
        match parse_streaming_event(raw, StreamKind::Podcast) {
            Some(event) => podcast.push(event),
            None => skipped.streaming += 1,
        }
    }

    let mut playlists = Vec::new();
    for raw in array_at(entry, &["playlists"]) {
        if !raw.is_object() {
            skipped.playlists += 1;
            continue;
        }
        let (playlist, dropped_items) = parse_playlist(raw);
        skipped.playlist_items += dropped_items;
        playlists.push(playlist);
    }

    let mut search_queries = Vec::new();
    for raw in array_at(entry, &["SearchQueries"]) {
        match raw.get("searchQuery").and_then(Value::as_str) {
            Some(query) => search_queries.push(SearchQueryEvent {
                search_query: query.to_string(),
                timestamp: first_str(raw, &["searchTime", "timestamp"]).map(ToOwned::to_owned),
            }),
            None => skipped.search_queries += 1,
        }
    }

    let mut library_tracks = Vec::new();
    for raw in array_at(entry, &["YourLibrary", "tracks"]) {
        match non_empty_str(raw, "artist") {
            Some(artist) => library_tracks.push(LibraryTrack {
                artist: artist.to_string(),
                end_time: non_empty_str(raw, "endTime").map(ToOwned::to_owned),
            }),
            None => skipped.library_tracks += 1,
        }
    }

    if skipped.total() > 0 {
        debug!("User {user}: skipped malformed records {skipped:?}");
    }

    Some(UserRecord {
        user,
        playlists,
        music,
        podcast,
        search_queries,
        library_tracks,
        skipped,
    })
}

fn parse_streaming_event(raw: &Value, kind: StreamKind) -> Option<StreamingEvent> {
    let (artist_keys, track_keys): (&[&str], &[&str]) = match kind {
        StreamKind::Music => (&["artistName"], &["trackName"]),
        StreamKind::Podcast => (&["podcastName", "artistName"], &["episodeName", "trackName"]),
    };
    Some(StreamingEvent {
        artist_name: first_str(raw, artist_keys)?.to_string(),
        track_name: first_str(raw, track_keys)?.to_string(),
        end_time: non_empty_str(raw, "endTime")?.to_string(),
        ms_played: non_negative_ms(raw.get("msPlayed"))?,
        kind,
    })
}

fn parse_playlist(raw: &Value) -> (Playlist, usize) {
    let name = raw
        .get("name")
        .and_then(Value::as_str)
        .map(ToOwned::to_owned);
    let mut dropped = 0usize;
    let items = array_at(raw, &["items"])
        .iter()
        .filter_map(|item| {
            if !item.is_object() {
                dropped += 1;
                return None;
            }
            let track_ref = item
                .get("track")
                .and_then(|track| first_str(track, &["trackName", "name"]))
                .or_else(|| {
                    item.get("episode")
                        .and_then(|episode| first_str(episode, &["episodeName", "name"]))
                })
                .or_else(|| first_str(item, &["trackRef", "trackName"]))
                .map(ToOwned::to_owned);
            Some(PlaylistItem {
                track_ref,
                added_date: first_str(item, &["addedDate"]).map(ToOwned::to_owned),
            })
        })
        .collect();
    (Playlist { name, items }, dropped)
}
