//! Per-user dashboard report: every view in one serialisable document.

use std::fs;
use std::path::{Path, PathBuf};

use log::info;

use crate::aggregation::{
    self, AggregateBucket, ComparisonRow, CooccurrenceGraph, TimeOfDayDistribution,
};
use crate::config::AggregationConfig;
use crate::error::StoreError;
use crate::event_store::{SkippedRecords, UserRecord};
use crate::genre_index::{self, GenreIndex, GenreLookup};
use crate::time_bucketer::PeriodFilter;

const REPORT_PREFIX: &str = "dashboard_";

/// Genre view plus how much of the user's music the index covers.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct GenreSummary {
    pub distribution: Vec<AggregateBucket>,
    pub artists_with_genres: usize,
    pub artists_without_genres: usize,
    pub artists_not_looked_up: usize,
}

impl GenreSummary {
    pub fn build(user: &UserRecord, index: &GenreIndex, top_n: usize) -> Self {
        let mut summary = Self {
            distribution: aggregation::genre_distribution(index, top_n),
            artists_with_genres: 0,
            artists_without_genres: 0,
            artists_not_looked_up: 0,
        };
        for artist in user.music_artists() {
            match index.lookup(&artist) {
                GenreLookup::Known(_) => summary.artists_with_genres += 1,
                GenreLookup::NoGenresKnown => summary.artists_without_genres += 1,
                GenreLookup::NotLookedUp => summary.artists_not_looked_up += 1,
            }
        }
        summary
    }
}

/// All views for one user and one selected period.
///
/// Period-dependent views are `playlists`, `time_of_day`, and `top_artists`;
/// the ranked keys of `playlists` and `top_artists` always come from the whole
/// log so a selection only changes their counts.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct DashboardReport {
    pub user: String,
    pub period: String,
    pub playlists: Vec<AggregateBucket>,
    pub time_of_day: TimeOfDayDistribution,
    pub monthly_hours: Vec<AggregateBucket>,
    pub top_artists: Vec<AggregateBucket>,
    pub genres: Option<GenreSummary>,
    pub search_terms: Vec<AggregateBucket>,
    pub music_vs_podcast: Vec<ComparisonRow>,
    pub listening_graph: CooccurrenceGraph,
    pub skipped_records: SkippedRecords,
}

impl DashboardReport {
    pub fn build(
        user: &UserRecord,
        genre_index: Option<&GenreIndex>,
        config: &AggregationConfig,
        filter: &PeriodFilter,
    ) -> Self {
        let playlist_ranking = aggregation::playlist_ranking(&user.playlists, config.top_playlists);
        let artist_ranking =
            aggregation::top_artists(&user.library_tracks, &PeriodFilter::Year, config.top_artists);
        let (playlists, top_artists) = if filter.is_restricting() {
            (
                aggregation::playlist_counts_for(&playlist_ranking, &user.playlists, filter),
                aggregation::artist_counts_for(&artist_ranking, &user.library_tracks, filter),
            )
        } else {
            (playlist_ranking, artist_ranking)
        };

        Self {
            user: user.user.clone(),
            period: filter.to_string(),
            playlists,
            time_of_day: aggregation::time_of_day_distribution(
                &user.music,
                &config.time_bands,
                filter,
            ),
            monthly_hours: aggregation::monthly_totals(&user.music, &PeriodFilter::Year),
            top_artists,
            genres: genre_index.map(|index| GenreSummary::build(user, index, config.top_genres)),
            search_terms: aggregation::top_search_terms(
                &user.search_queries,
                config.min_search_term_chars,
                config.top_search_terms,
            ),
            music_vs_podcast: aggregation::music_podcast_comparison(&user.music, &user.podcast),
            listening_graph: aggregation::cooccurrence_graph(&user.music, config.graph_keying),
            skipped_records: user.skipped,
        }
    }
}

/// `dashboard_<user>.json`, or `dashboard_<user>_<period>.json` for a restricted period.
pub fn report_file_name(user: &str, filter: &PeriodFilter) -> String {
    let user = genre_index::file_name_component(user);
    if filter.is_restricting() {
        format!("{REPORT_PREFIX}{user}_{filter}.json")
    } else {
        format!("{REPORT_PREFIX}{user}.json")
    }
}

pub fn write_report(
    report: &DashboardReport,
    dir: &Path,
    filter: &PeriodFilter,
) -> Result<PathBuf, StoreError> {
    fs::create_dir_all(dir).map_err(|source| StoreError::Write {
        path: dir.to_path_buf(),
        source,
    })?;
    let path = dir.join(report_file_name(&report.user, filter));
    let json = serde_json::to_string_pretty(report).map_err(|source| StoreError::Parse {
        context: format!("dashboard report for {}", report.user),
        source,
    })?;
    fs::write(&path, json).map_err(|source| StoreError::Write {
        path: path.clone(),
        source,
    })?;
    info!("Wrote dashboard for {} to {}", report.user, path.display());
    Ok(path)
}
