//! Derived dashboard views over one user's immutable records.
//!
//! Every function here is pure: it borrows its input, allocates a fresh
//! result, and never fails. Malformed records are skipped; empty input yields
//! an empty or zero-valued view.

use std::collections::HashMap;

use log::warn;

use crate::event_store::{LibraryTrack, Playlist, SearchQueryEvent, StreamingEvent};
use crate::genre_index::GenreIndex;
use crate::time_bucketer::{self, PeriodFilter, TimeBand};

const MS_PER_SECOND: f64 = 1_000.0;
const MS_PER_HOUR: f64 = 3_600_000.0;

/// `{label, value}` pair shared by ranking and time-series views.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct AggregateBucket {
    pub label: String,
    pub value: f64,
}

impl AggregateBucket {
    pub fn new(label: impl Into<String>, value: f64) -> Self {
        Self {
            label: label.into(),
            value,
        }
    }
}

/// Counter that remembers the order in which keys were first seen.
#[derive(Debug, Default)]
struct OrderedTally {
    positions: HashMap<String, usize>,
    entries: Vec<(String, u64)>,
}

impl OrderedTally {
    fn add(&mut self, key: &str, amount: u64) {
        match self.positions.get(key) {
            Some(&position) => self.entries[position].1 += amount,
            None => {
                self.positions.insert(key.to_string(), self.entries.len());
                self.entries.push((key.to_string(), amount));
            }
        }
    }

    fn get(&self, key: &str) -> u64 {
        self.positions
            .get(key)
            .map(|&position| self.entries[position].1)
            .unwrap_or(0)
    }

    /// Descending by total; `sort_by` is stable so ties keep first-seen order.
    fn into_top_n(self, n: usize) -> Vec<AggregateBucket> {
        let mut entries = self.entries;
        entries.sort_by(|left, right| right.1.cmp(&left.1));
        entries.truncate(n);
        entries
            .into_iter()
            .map(|(label, count)| AggregateBucket::new(label, count as f64))
            .collect()
    }

    fn into_buckets(self, scale: impl Fn(u64) -> f64) -> Vec<AggregateBucket> {
        self.entries
            .into_iter()
            .map(|(label, total)| AggregateBucket::new(label, scale(total)))
            .collect()
    }
}

/// Keeps the key set and order of `reference`, replacing every value with
/// the count from `tally` (0 when the key never occurs there).
fn recount_fixed(reference: &[AggregateBucket], tally: &OrderedTally) -> Vec<AggregateBucket> {
    reference
        .iter()
        .map(|bucket| AggregateBucket::new(bucket.label.clone(), tally.get(&bucket.label) as f64))
        .collect()
}

/// Playlists ranked by item count. Playlists sharing a display name are merged.
pub fn playlist_ranking(playlists: &[Playlist], n: usize) -> Vec<AggregateBucket> {
    let mut tally = OrderedTally::default();
    for playlist in playlists {
        tally.add(playlist.display_name(), playlist.items.len() as u64);
    }
    tally.into_top_n(n)
}

/// Re-counts a fixed playlist ranking against items added within `filter`.
pub fn playlist_counts_for(
    reference: &[AggregateBucket],
    playlists: &[Playlist],
    filter: &PeriodFilter,
) -> Vec<AggregateBucket> {
    let mut tally = OrderedTally::default();
    for playlist in playlists {
        let added = playlist
            .items
            .iter()
            .filter(|item| filter.matches(item.added_date.as_deref()))
            .count();
        tally.add(playlist.display_name(), added as u64);
    }
    recount_fixed(reference, &tally)
}

fn library_tally(library: &[LibraryTrack], filter: &PeriodFilter) -> OrderedTally {
    let mut tally = OrderedTally::default();
    for track in library
        .iter()
        .filter(|track| filter.matches(track.end_time.as_deref()))
    {
        tally.add(&track.artist, 1);
    }
    tally
}

/// Artists ranked by saved-library track count within `filter`.
pub fn top_artists(
    library: &[LibraryTrack],
    filter: &PeriodFilter,
    n: usize,
) -> Vec<AggregateBucket> {
    library_tally(library, filter).into_top_n(n)
}

/// Re-counts a fixed artist ranking for `filter` without changing its order.
pub fn artist_counts_for(
    reference: &[AggregateBucket],
    library: &[LibraryTrack],
    filter: &PeriodFilter,
) -> Vec<AggregateBucket> {
    recount_fixed(reference, &library_tally(library, filter))
}

/// Trimmed, lowercased search term, or `None` when shorter than `min_chars`.
pub fn normalize_search_term(raw: &str, min_chars: usize) -> Option<String> {
    let term = raw.trim().to_lowercase();
    (term.chars().count() >= min_chars).then_some(term)
}

pub fn top_search_terms(
    queries: &[SearchQueryEvent],
    min_chars: usize,
    n: usize,
) -> Vec<AggregateBucket> {
    let mut tally = OrderedTally::default();
    for query in queries {
        if let Some(term) = normalize_search_term(&query.search_query, min_chars) {
            tally.add(&term, 1);
        }
    }
    tally.into_top_n(n)
}

/// Average listening time for one band.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct BandAverage {
    pub label: String,
    pub average_seconds: f64,
    pub event_count: usize,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct TimeOfDayDistribution {
    pub bands: Vec<BandAverage>,
    /// Events whose timestamp had no parseable hour.
    pub skipped_timestamps: usize,
}

impl TimeOfDayDistribution {
    pub fn counted_events(&self) -> usize {
        self.bands.iter().map(|band| band.event_count).sum()
    }
}

/// Average `ms_played` (in seconds) per band for events inside `filter`.
pub fn time_of_day_distribution(
    events: &[StreamingEvent],
    bands: &[TimeBand],
    filter: &PeriodFilter,
) -> TimeOfDayDistribution {
    let mut totals = vec![(0u64, 0usize); bands.len()];
    let mut skipped = 0usize;
    for event in events
        .iter()
        .filter(|event| filter.matches(Some(&event.end_time)))
    {
        let Ok(hour) = time_bucketer::hour_of(&event.end_time) else {
            skipped += 1;
            continue;
        };
        if let Some(index) = time_bucketer::band_index_for(bands, hour) {
            totals[index].0 += event.ms_played;
            totals[index].1 += 1;
        }
    }
    if skipped > 0 {
        warn!("Time-of-day view skipped {skipped} events with malformed timestamps");
    }

    let bands = bands
        .iter()
        .zip(totals)
        .map(|(band, (total_ms, count))| BandAverage {
            label: band.label.clone(),
            average_seconds: if count == 0 {
                0.0
            } else {
                total_ms as f64 / count as f64 / MS_PER_SECOND
            },
            event_count: count,
        })
        .collect();
    TimeOfDayDistribution {
        bands,
        skipped_timestamps: skipped,
    }
}

fn monthly_ms(
    events: &[StreamingEvent],
    filter: &PeriodFilter,
    include_event: impl Fn(&StreamingEvent) -> bool,
) -> OrderedTally {
    let mut tally = OrderedTally::default();
    let mut skipped = 0usize;
    for event in events
        .iter()
        .filter(|event| include_event(event) && filter.matches(Some(&event.end_time)))
    {
        match time_bucketer::year_month(&event.end_time) {
            Ok(month) => tally.add(&month, event.ms_played),
            Err(_) => skipped += 1,
        }
    }
    if skipped > 0 {
        warn!("Monthly view skipped {skipped} events with malformed timestamps");
    }
    tally
}

/// Hours played per `YYYY-MM`, in the order months first appear in the log.
pub fn monthly_totals(events: &[StreamingEvent], filter: &PeriodFilter) -> Vec<AggregateBucket> {
    monthly_ms(events, filter, |_| true).into_buckets(|ms| ms as f64 / MS_PER_HOUR)
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct ComparisonRow {
    pub month: String,
    pub music_hours: f64,
    pub podcast_hours: f64,
}

/// Music vs podcast hours per month, chronological.
///
/// Zero-length plays are left out of this view so a month consisting only
/// of skips does not appear.
pub fn music_podcast_comparison(
    music: &[StreamingEvent],
    podcast: &[StreamingEvent],
) -> Vec<ComparisonRow> {
    let played = |event: &StreamingEvent| event.ms_played > 0;
    let music_tally = monthly_ms(music, &PeriodFilter::Year, played);
    let podcast_tally = monthly_ms(podcast, &PeriodFilter::Year, played);

    let mut months: Vec<&str> = music_tally
        .entries
        .iter()
        .chain(podcast_tally.entries.iter())
        .map(|(month, _)| month.as_str())
        .collect();
    months.sort_unstable();
    months.dedup();

    months
        .into_iter()
        .map(|month| ComparisonRow {
            month: month.to_string(),
            music_hours: music_tally.get(month) as f64 / MS_PER_HOUR,
            podcast_hours: podcast_tally.get(month) as f64 / MS_PER_HOUR,
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Artist,
    Track,
}

/// How graph node identities are derived from names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKeying {
    /// Artists and tracks share one namespace; an artist and a track with
    /// the same name become one node (kind of the first occurrence).
    #[default]
    SharedNamespace,
    /// Nodes are keyed by `(kind, name)`; ids become `artist:<name>` / `track:<name>`.
    ByKind,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct GraphNode {
    pub id: String,
    pub name: String,
    pub kind: NodeKind,
    /// Number of edges touching this node.
    pub weight: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct GraphEdge {
    pub source: String,
    pub target: String,
    pub weight: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct CooccurrenceGraph {
    pub nodes: Vec<GraphNode>,
    pub edges: Vec<GraphEdge>,
}

fn node_id(keying: NodeKeying, kind: NodeKind, name: &str) -> String {
    match (keying, kind) {
        (NodeKeying::SharedNamespace, _) => name.to_string(),
        (NodeKeying::ByKind, NodeKind::Artist) => format!("artist:{name}"),
        (NodeKeying::ByKind, NodeKind::Track) => format!("track:{name}"),
    }
}

/// Bipartite artist/track graph with one parallel edge per playback event.
pub fn cooccurrence_graph(events: &[StreamingEvent], keying: NodeKeying) -> CooccurrenceGraph {
    let mut graph = CooccurrenceGraph::default();
    let mut positions: HashMap<String, usize> = HashMap::new();

    let mut touch = |graph: &mut CooccurrenceGraph, kind: NodeKind, name: &str| -> String {
        let id = node_id(keying, kind, name);
        let position = *positions.entry(id.clone()).or_insert_with(|| {
            graph.nodes.push(GraphNode {
                id: id.clone(),
                name: name.to_string(),
                kind,
                weight: 0,
            });
            graph.nodes.len() - 1
        });
        graph.nodes[position].weight += 1;
        id
    };

    for event in events {
        let source = touch(&mut graph, NodeKind::Artist, &event.artist_name);
        let target = touch(&mut graph, NodeKind::Track, &event.track_name);
        graph.edges.push(GraphEdge {
            source,
            target,
            weight: 1,
        });
    }
    graph
}

/// Genres ranked by the number of artists carrying them.
pub fn genre_distribution(index: &GenreIndex, n: usize) -> Vec<AggregateBucket> {
    let mut tally = OrderedTally::default();
    for (_, genres) in index.iter() {
        for genre in genres {
            tally.add(genre, 1);
        }
    }
    tally.into_top_n(n)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_store::{PlaylistItem, StreamKind};
    use crate::time_bucketer::default_time_bands;

    impl CooccurrenceGraph {
        fn node(&self, id: &str) -> Option<&GraphNode> {
            self.nodes.iter().find(|node| node.id == id)
        }

        fn total_weight(&self) -> u64 {
            self.nodes.iter().map(|node| node.weight).sum()
        }
    }

    fn music(artist: &str, track: &str, end_time: &str, ms_played: u64) -> StreamingEvent {
        StreamingEvent {
            artist_name: artist.to_string(),
            track_name: track.to_string(),
            end_time: end_time.to_string(),
            ms_played,
            kind: StreamKind::Music,
        }
    }

    fn podcast(show: &str, end_time: &str, ms_played: u64) -> StreamingEvent {
        StreamingEvent {
            kind: StreamKind::Podcast,
            ..music(show, "episode", end_time, ms_played)
        }
    }

    fn playlist(name: Option<&str>, added: &[Option<&str>]) -> Playlist {
        Playlist {
            name: name.map(ToOwned::to_owned),
            items: added
                .iter()
                .map(|date| PlaylistItem {
                    track_ref: Some("t".to_string()),
                    added_date: date.map(ToOwned::to_owned),
                })
                .collect(),
        }
    }

    fn library(artist: &str, end_time: &str) -> LibraryTrack {
        LibraryTrack {
            artist: artist.to_string(),
            end_time: Some(end_time.to_string()),
        }
    }

    fn labels(buckets: &[AggregateBucket]) -> Vec<&str> {
        buckets.iter().map(|bucket| bucket.label.as_str()).collect()
    }

    #[test]
    fn test_single_event_example_fills_one_band_and_one_month() {
        let events = vec![music("A", "x", "2024-01-15 14:30", 120_000)];

        let monthly = monthly_totals(&events, &PeriodFilter::Year);
        assert_eq!(labels(&monthly), vec!["2024-01"]);
        assert!((monthly[0].value - 120_000.0 / 3_600_000.0).abs() < 1e-12);
        assert!((monthly[0].value - 0.0333).abs() < 1e-4);

        let distribution =
            time_of_day_distribution(&events, &default_time_bands(), &PeriodFilter::Year);
        for band in &distribution.bands {
            if band.label == "12 PM - 6 PM" {
                assert_eq!(band.average_seconds, 120.0);
                assert_eq!(band.event_count, 1);
            } else {
                assert_eq!(band.average_seconds, 0.0);
                assert_eq!(band.event_count, 0);
            }
        }
    }

    #[test]
    fn test_playlist_example_orders_by_item_count() {
        let playlists = vec![
            playlist(Some("A"), &[None, None]),
            playlist(Some("B"), &[]),
        ];
        let ranking = playlist_ranking(&playlists, 20);
        assert_eq!(
            ranking,
            vec![AggregateBucket::new("A", 2.0), AggregateBucket::new("B", 0.0)]
        );
    }

    #[test]
    fn test_ranking_ties_keep_first_seen_order_and_truncate() {
        let queries: Vec<SearchQueryEvent> = ["zeta", "alpha", "Zeta ", "beta", "alpha", "mid"]
            .iter()
            .map(|query| SearchQueryEvent {
                search_query: query.to_string(),
                timestamp: None,
            })
            .collect();
        let first = top_search_terms(&queries, 3, 3);
        assert_eq!(labels(&first), vec!["zeta", "alpha", "beta"]);
        let second = top_search_terms(&queries, 3, 3);
        assert_eq!(first, second, "ranking should be idempotent");
    }

    #[test]
    fn test_search_terms_are_normalized_and_short_terms_dropped() {
        let queries: Vec<SearchQueryEvent> = ["  ABBA ", "ab", "  ", "abba", "été"]
            .iter()
            .map(|query| SearchQueryEvent {
                search_query: query.to_string(),
                timestamp: None,
            })
            .collect();
        let ranking = top_search_terms(&queries, 3, 15);
        assert_eq!(
            ranking,
            vec![
                AggregateBucket::new("abba", 2.0),
                AggregateBucket::new("été", 1.0)
            ]
        );
        assert!(top_search_terms(&[], 3, 15).is_empty());
    }

    #[test]
    fn test_fixed_playlist_ranking_never_reorders_or_drops_keys() {
        let playlists = vec![
            playlist(Some("Big"), &[Some("2024-01-02"), Some("2024-01-05"), Some("2024-02-01")]),
            playlist(Some("Small"), &[Some("2024-02-03")]),
            playlist(None, &[]),
        ];
        let reference = playlist_ranking(&playlists, 20);
        assert_eq!(labels(&reference), vec!["Big", "Small", "Untitled Playlist"]);

        let february = playlist_counts_for(&reference, &playlists, &PeriodFilter::Month("Feb"));
        assert_eq!(labels(&february), labels(&reference));
        assert_eq!(
            february.iter().map(|b| b.value).collect::<Vec<_>>(),
            vec![1.0, 1.0, 0.0]
        );

        let march = playlist_counts_for(&reference, &playlists, &PeriodFilter::Month("Mar"));
        assert_eq!(labels(&march), labels(&reference));
        assert!(march.iter().all(|bucket| bucket.value == 0.0));
    }

    #[test]
    fn test_top_artists_filter_and_fixed_recount() {
        let tracks = vec![
            library("A", "2024-01-01 10:00"),
            library("B", "2024-02-01 10:00"),
            library("B", "2024-02-02 10:00"),
            library("C", "2024-01-03 10:00"),
            LibraryTrack {
                artist: "D".to_string(),
                end_time: None,
            },
        ];
        let all_time = top_artists(&tracks, &PeriodFilter::Year, 8);
        assert_eq!(labels(&all_time), vec!["B", "A", "C", "D"]);

        let january = top_artists(&tracks, &PeriodFilter::Month("Jan"), 8);
        assert_eq!(labels(&january), vec!["A", "C"]);

        let fixed = artist_counts_for(&all_time, &tracks, &PeriodFilter::Month("Jan"));
        assert_eq!(labels(&fixed), vec!["B", "A", "C", "D"]);
        assert_eq!(
            fixed.iter().map(|b| b.value).collect::<Vec<_>>(),
            vec![0.0, 1.0, 1.0, 0.0]
        );
    }

    #[test]
    fn test_band_counts_sum_to_parsable_events() {
        let events = vec![
            music("A", "x", "2024-01-15 01:00", 1_000),
            music("A", "x", "2024-01-15 07:00", 3_000),
            music("A", "x", "2024-01-15 07:30", 5_000),
            music("A", "x", "2024-01-15 23:59", 0),
            music("A", "x", "broken", 9_000),
        ];
        let distribution =
            time_of_day_distribution(&events, &default_time_bands(), &PeriodFilter::Year);
        assert_eq!(distribution.counted_events(), 4);
        assert_eq!(distribution.skipped_timestamps, 1);
        assert_eq!(distribution.bands[1].average_seconds, 4.0);
        assert_eq!(distribution.bands[4].average_seconds, 0.0);
        assert_eq!(distribution.bands[4].event_count, 1);
    }

    #[test]
    fn test_hours_outside_custom_bands_are_excluded() {
        let bands = vec![TimeBand::new(9, 12, "morning")];
        let events = vec![
            music("A", "x", "2024-01-15 10:00", 10_000),
            music("A", "x", "2024-01-15 20:00", 50_000),
        ];
        let distribution = time_of_day_distribution(&events, &bands, &PeriodFilter::Year);
        assert_eq!(distribution.counted_events(), 1);
        assert_eq!(distribution.bands[0].average_seconds, 10.0);
    }

    #[test]
    fn test_empty_input_produces_zero_views() {
        let distribution =
            time_of_day_distribution(&[], &default_time_bands(), &PeriodFilter::Year);
        assert_eq!(distribution.bands.len(), 5);
        assert!(distribution
            .bands
            .iter()
            .all(|band| band.average_seconds == 0.0 && band.event_count == 0));
        assert!(monthly_totals(&[], &PeriodFilter::Year).is_empty());
        assert!(music_podcast_comparison(&[], &[]).is_empty());
        assert!(cooccurrence_graph(&[], NodeKeying::SharedNamespace)
            .nodes
            .is_empty());
        assert!(playlist_ranking(&[], 20).is_empty());
        assert!(genre_distribution(&GenreIndex::new(), 10).is_empty());
    }

    #[test]
    fn test_monthly_totals_keep_first_seen_order() {
        let events = vec![
            music("A", "x", "2024-03-01 10:00", 3_600_000),
            music("A", "x", "2024-01-01 10:00", 1_800_000),
            music("A", "x", "2024-03-02 10:00", 0),
            music("A", "x", "2024-03-03 10:00", 3_600_000),
        ];
        let monthly = monthly_totals(&events, &PeriodFilter::Year);
        assert_eq!(
            monthly,
            vec![
                AggregateBucket::new("2024-03", 2.0),
                AggregateBucket::new("2024-01", 0.5)
            ]
        );

        let filtered = monthly_totals(&events, &PeriodFilter::YearMonth("2024-01".to_string()));
        assert_eq!(filtered, vec![AggregateBucket::new("2024-01", 0.5)]);
    }

    #[test]
    fn test_comparison_unions_months_chronologically() {
        let music_events = vec![
            music("A", "x", "2024-03-01 10:00", 3_600_000),
            music("A", "x", "2024-01-01 10:00", 1_800_000),
            music("A", "x", "2024-05-01 10:00", 0),
        ];
        let podcast_events = vec![
            podcast("Show", "2024-02-01 10:00", 7_200_000),
            podcast("Show", "2024-03-05 10:00", 900_000),
        ];
        let rows = music_podcast_comparison(&music_events, &podcast_events);
        let months: Vec<&str> = rows.iter().map(|row| row.month.as_str()).collect();
        assert_eq!(months, vec!["2024-01", "2024-02", "2024-03"]);
        assert_eq!(rows[0].podcast_hours, 0.0);
        assert_eq!(rows[1].music_hours, 0.0);
        assert_eq!(rows[1].podcast_hours, 2.0);
        assert_eq!(rows[2].music_hours, 1.0);
        assert_eq!(rows[2].podcast_hours, 0.25);
    }

    #[test]
    fn test_graph_counts_parallel_edges_in_both_endpoints() {
        let mut events: Vec<StreamingEvent> = (0..5)
            .map(|_| music("Artist", "Song", "2024-01-01 10:00", 1))
            .collect();
        events.push(music("Artist", "Other", "2024-01-01 10:00", 1));
        events.push(music("Second", "Song", "2024-01-01 10:00", 1));

        let graph = cooccurrence_graph(&events, NodeKeying::SharedNamespace);
        assert_eq!(graph.edges.len(), events.len());
        assert_eq!(graph.total_weight(), 2 * events.len() as u64);
        assert_eq!(graph.nodes.len(), 4);
        assert_eq!(graph.node("Artist").expect("artist node").weight, 6);
        assert_eq!(graph.node("Song").expect("track node").weight, 6);
        assert_eq!(graph.node("Second").expect("artist node").weight, 1);
        assert!(graph.edges.iter().all(|edge| edge.weight == 1));
    }

    #[test]
    fn test_graph_shared_namespace_merges_same_names() {
        let events = vec![
            music("Echo", "Intro", "2024-01-01 10:00", 1),
            music("Band", "Echo", "2024-01-01 10:00", 1),
        ];
        let shared = cooccurrence_graph(&events, NodeKeying::SharedNamespace);
        assert_eq!(shared.nodes.len(), 3);
        let echo = shared.node("Echo").expect("merged node");
        assert_eq!(echo.kind, NodeKind::Artist);
        assert_eq!(echo.weight, 2);

        let by_kind = cooccurrence_graph(&events, NodeKeying::ByKind);
        assert_eq!(by_kind.nodes.len(), 4);
        assert_eq!(by_kind.node("artist:Echo").expect("artist").weight, 1);
        assert_eq!(by_kind.node("track:Echo").expect("track").weight, 1);
        assert_eq!(by_kind.edges[1].target, "track:Echo");
        assert_eq!(by_kind.total_weight(), 4);
    }

    #[test]
    fn test_genre_distribution_counts_artists_not_plays() {
        let mut index = GenreIndex::new();
        index.record("A", vec!["rock".to_string(), "indie".to_string()]);
        index.record("B", vec!["indie".to_string()]);
        index.record("C", Vec::new());
        index.record("D", vec!["jazz".to_string(), "rock".to_string()]);

        let genres = genre_distribution(&index, 10);
        assert_eq!(
            genres,
            vec![
                AggregateBucket::new("rock", 2.0),
                AggregateBucket::new("indie", 2.0),
                AggregateBucket::new("jazz", 1.0),
            ]
        );
        assert_eq!(genre_distribution(&index, 1).len(), 1);
    }
}
