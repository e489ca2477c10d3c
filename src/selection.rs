//! Period selection and the views linked to it.
//!
//! Selecting a month on the monthly chart publishes a
//! [`SelectionMessage::PeriodSelected`] on the bus. [`LinkedViewsReactor`]
//! recomputes the dependent views for that period and republishes them as
//! [`ViewMessage::LinkedViewsUpdated`].

use std::collections::HashMap;
use std::thread;

use log::{debug, error, trace, warn};
use tokio::sync::broadcast::{error::RecvError, Receiver, Sender};

use crate::aggregation::{self, AggregateBucket, TimeOfDayDistribution};
use crate::error::InvalidFilter;
use crate::event_store::UserRecord;
use crate::protocol::{LinkedViewsUpdate, Message, SelectionMessage, ViewMessage};
use crate::time_bucketer::{PeriodFilter, TimeBand};

/// Currently selected period of one dashboard.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SelectionState {
    filter: PeriodFilter,
}

impl SelectionState {
    pub fn current(&self) -> &PeriodFilter {
        &self.filter
    }

    /// Returns `true` when the selection changed.
    pub fn select(&mut self, filter: PeriodFilter) -> bool {
        if self.filter == filter {
            return false;
        }
        self.filter = filter;
        true
    }

    pub fn clear(&mut self) -> bool {
        self.select(PeriodFilter::Year)
    }
}

/// Owns one user's selection and announces every change on the bus.
pub struct SelectionPublisher {
    user: String,
    state: SelectionState,
    bus_producer: Sender<Message>,
}

impl SelectionPublisher {
    pub fn new(user: impl Into<String>, bus_producer: Sender<Message>) -> Self {
        Self {
            user: user.into(),
            state: SelectionState::default(),
            bus_producer,
        }
    }

    pub fn state(&self) -> &SelectionState {
        &self.state
    }

    /// Selects `filter`; publishes only when the selection actually changed.
    pub fn select(&mut self, filter: PeriodFilter) -> bool {
        if !self.state.select(filter) {
            return false;
        }
        self.announce();
        true
    }

    fn announce(&self) {
        let filter = self.state.current();
        let message = if filter.is_restricting() {
            SelectionMessage::PeriodSelected {
                user: self.user.clone(),
                filter: filter.clone(),
            }
        } else {
            SelectionMessage::Cleared {
                user: self.user.clone(),
            }
        };
        if self.bus_producer.send(Message::Selection(message)).is_err() {
            debug!("Selection for {} changed with no subscribers", self.user);
        }
    }

    /// Parses a chart label such as `Jan`, `2024-01`, or `year` and selects it.
    pub fn select_label(&mut self, label: &str) -> Result<bool, InvalidFilter> {
        Ok(self.select(label.parse()?))
    }

    /// Resets to the whole log; publishes `Cleared` when something was selected.
    pub fn clear(&mut self) -> bool {
        if !self.state.clear() {
            return false;
        }
        self.announce();
        true
    }
}

/// Views that follow the selected period.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct LinkedViews {
    pub period: String,
    pub time_of_day: TimeOfDayDistribution,
    /// Top artists re-ranked within the period.
    pub top_artists: Vec<AggregateBucket>,
    /// The whole-log artist ranking, re-counted for the period.
    pub fixed_artist_counts: Vec<AggregateBucket>,
}

impl LinkedViews {
    pub fn compute(
        user: &UserRecord,
        filter: &PeriodFilter,
        fixed_artists: &[AggregateBucket],
        bands: &[TimeBand],
        top_artists_n: usize,
    ) -> Self {
        Self {
            period: filter.to_string(),
            time_of_day: aggregation::time_of_day_distribution(&user.music, bands, filter),
            top_artists: aggregation::top_artists(&user.library_tracks, filter, top_artists_n),
            fixed_artist_counts: aggregation::artist_counts_for(
                fixed_artists,
                &user.library_tracks,
                filter,
            ),
        }
    }
}

struct LinkedUser {
    record: UserRecord,
    fixed_artists: Vec<AggregateBucket>,
}

/// Bus consumer that recomputes linked views whenever a selection changes.
pub struct LinkedViewsReactor {
    users: HashMap<String, LinkedUser>,
    bands: Vec<TimeBand>,
    top_artists_n: usize,
    bus_consumer: Receiver<Message>,
    bus_producer: Sender<Message>,
}

impl LinkedViewsReactor {
    pub fn new(
        users: impl IntoIterator<Item = UserRecord>,
        bands: Vec<TimeBand>,
        top_artists_n: usize,
        bus_consumer: Receiver<Message>,
        bus_producer: Sender<Message>,
    ) -> Self {
        let users = users
            .into_iter()
            .map(|record| {
                let fixed_artists = aggregation::top_artists(
                    &record.library_tracks,
                    &PeriodFilter::Year,
                    top_artists_n,
                );
                (
                    record.user.clone(),
                    LinkedUser {
                        record,
                        fixed_artists,
                    },
                )
            })
            .collect();
        Self {
            users,
            bands,
            top_artists_n,
            bus_consumer,
            bus_producer,
        }
    }

    fn publish_views(&self, user: &str, filter: &PeriodFilter) {
        let message = match self.users.get(user) {
            Some(linked) => {
                let views = LinkedViews::compute(
                    &linked.record,
                    filter,
                    &linked.fixed_artists,
                    &self.bands,
                    self.top_artists_n,
                );
                debug!(
                    "LinkedViewsReactor: recomputed views for {} ({}), {} events counted",
                    user,
                    filter,
                    views.time_of_day.counted_events()
                );
                ViewMessage::LinkedViewsUpdated(LinkedViewsUpdate {
                    user: user.to_string(),
                    views,
                })
            }
            None => {
                warn!("LinkedViewsReactor: selection for unknown user {user}");
                ViewMessage::UnknownUser(user.to_string())
            }
        };
        if self.bus_producer.send(Message::Views(message)).is_err() {
            debug!("LinkedViewsReactor: views for {user} recomputed with no subscribers");
        }
    }

    fn handle_bus_message(&mut self, message: Message) {
        match message {
            Message::Selection(SelectionMessage::PeriodSelected { user, filter }) => {
                self.publish_views(&user, &filter);
            }
            Message::Selection(SelectionMessage::Cleared { user }) => {
                self.publish_views(&user, &PeriodFilter::Year);
            }
            Message::Views(_) => trace!("LinkedViewsReactor: ignoring view message"),
        }
    }

    /// Processes bus messages until every sender is dropped.
    pub fn run(&mut self) {
        loop {
            match self.bus_consumer.blocking_recv() {
                Ok(message) => self.handle_bus_message(message),
                Err(RecvError::Lagged(skipped)) => {
                    warn!("LinkedViewsReactor lagged on bus, skipped {skipped} message(s)");
                }
                Err(RecvError::Closed) => {
                    error!("LinkedViewsReactor: bus closed");
                    break;
                }
            }
        }
    }
}

/// Runs the reactor on its own thread.
pub fn spawn_linked_views_reactor(mut reactor: LinkedViewsReactor) -> thread::JoinHandle<()> {
    thread::spawn(move || reactor.run())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_store::{LibraryTrack, StreamKind, StreamingEvent};
    use crate::time_bucketer::default_time_bands;
    use std::time::{Duration, Instant};
    use tokio::sync::broadcast::{self, error::TryRecvError};

    fn music(end_time: &str, ms_played: u64) -> StreamingEvent {
        StreamingEvent {
            artist_name: "Band".to_string(),
            track_name: "Song".to_string(),
            end_time: end_time.to_string(),
            ms_played,
            kind: StreamKind::Music,
        }
    }

    fn library(artist: &str, end_time: &str) -> LibraryTrack {
        LibraryTrack {
            artist: artist.to_string(),
            end_time: Some(end_time.to_string()),
        }
    }

    fn sample_user() -> UserRecord {
        UserRecord {
            user: "alice".to_string(),
            music: vec![
                music("2024-01-15 14:30", 120_000),
                music("2024-02-01 07:00", 60_000),
                music("2024-02-03 20:00", 30_000),
            ],
            library_tracks: vec![
                library("A", "2024-01-02 10:00"),
                library("A", "2024-01-03 10:00"),
                library("A", "2024-02-03 10:00"),
                library("B", "2024-02-04 10:00"),
                library("B", "2024-02-05 10:00"),
                library("C", "2024-01-06 10:00"),
            ],
            ..UserRecord::default()
        }
    }

    fn wait_for_message<F>(receiver: &mut Receiver<Message>, timeout: Duration, mut predicate: F) -> Message
    where
        F: FnMut(&Message) -> bool,
    {
        let start = Instant::now();
        loop {
            if start.elapsed() > timeout {
                panic!("timed out waiting for expected message");
            }
            match receiver.try_recv() {
                Ok(message) => {
                    if predicate(&message) {
                        return message;
                    }
                }
                Err(TryRecvError::Empty) => thread::sleep(Duration::from_millis(5)),
                Err(TryRecvError::Lagged(_)) => continue,
                Err(TryRecvError::Closed) => panic!("bus closed while waiting for message"),
            }
        }
    }

    #[test]
    fn test_selection_state_reports_changes_only() {
        let mut state = SelectionState::default();
        assert_eq!(state.current(), &PeriodFilter::Year);
        assert!(state.select(PeriodFilter::Month("Jan")));
        assert!(!state.select(PeriodFilter::Month("Jan")));
        assert!(state.clear());
        assert!(!state.clear());
    }

    #[test]
    fn test_publisher_sends_selection_once_per_change() {
        let (bus_sender, mut receiver) = broadcast::channel(16);
        let mut publisher = SelectionPublisher::new("alice", bus_sender);

        assert!(publisher
            .select_label("2024-02")
            .expect("label should parse"));
        assert!(!publisher
            .select_label("2024-02")
            .expect("label should parse"));
        assert!(publisher.select_label("nope").is_err());

        match receiver.try_recv() {
            Ok(Message::Selection(SelectionMessage::PeriodSelected { user, filter })) => {
                assert_eq!(user, "alice");
                assert_eq!(filter, PeriodFilter::YearMonth("2024-02".to_string()));
            }
            other => panic!("unexpected bus state: {other:?}"),
        }
        assert!(matches!(receiver.try_recv(), Err(TryRecvError::Empty)));

        assert!(publisher.clear());
        assert!(matches!(
            receiver.try_recv(),
            Ok(Message::Selection(SelectionMessage::Cleared { .. }))
        ));
    }

    #[test]
    fn test_publisher_tracks_state_without_subscribers() {
        let (bus_sender, receiver) = broadcast::channel(4);
        drop(receiver);
        let mut publisher = SelectionPublisher::new("alice", bus_sender);

        assert!(!publisher.clear(), "whole log is selected initially");
        assert!(publisher.select(PeriodFilter::Month("Mar")));
        assert_eq!(publisher.state().current(), &PeriodFilter::Month("Mar"));
        assert!(publisher.clear());
        assert_eq!(publisher.state().current(), &PeriodFilter::Year);
    }

    #[test]
    fn test_reactor_publish_without_subscribers_is_quiet() {
        let (_selection_sender, selection_receiver) = broadcast::channel(4);
        let (views_sender, _) = broadcast::channel(4);
        let reactor = LinkedViewsReactor::new(
            vec![sample_user()],
            default_time_bands(),
            8,
            selection_receiver,
            views_sender,
        );
        reactor.publish_views("alice", &PeriodFilter::Month("Jan"));
        reactor.publish_views("mallory", &PeriodFilter::Year);
    }

    #[test]
    fn test_linked_views_keep_fixed_artist_keys() {
        let user = sample_user();
        let fixed = aggregation::top_artists(&user.library_tracks, &PeriodFilter::Year, 8);
        let labels: Vec<&str> = fixed.iter().map(|bucket| bucket.label.as_str()).collect();
        assert_eq!(labels, vec!["A", "B", "C"]);

        let views = LinkedViews::compute(
            &user,
            &PeriodFilter::Month("Feb"),
            &fixed,
            &default_time_bands(),
            8,
        );
        assert_eq!(views.period, "Feb");
        assert_eq!(
            views.fixed_artist_counts,
            vec![
                AggregateBucket::new("A", 1.0),
                AggregateBucket::new("B", 2.0),
                AggregateBucket::new("C", 0.0),
            ]
        );
        assert_eq!(
            views.top_artists,
            vec![AggregateBucket::new("B", 2.0), AggregateBucket::new("A", 1.0)]
        );
        assert_eq!(views.time_of_day.counted_events(), 2);
    }

    #[test]
    fn test_reactor_republishes_views_for_selected_period() {
        let (bus_sender, _) = broadcast::channel(64);
        let reactor = LinkedViewsReactor::new(
            vec![sample_user()],
            default_time_bands(),
            8,
            bus_sender.subscribe(),
            bus_sender.clone(),
        );
        let mut receiver = bus_sender.subscribe();
        let _handle = spawn_linked_views_reactor(reactor);

        bus_sender
            .send(Message::Selection(SelectionMessage::PeriodSelected {
                user: "alice".to_string(),
                filter: PeriodFilter::Month("Jan"),
            }))
            .expect("failed to send message to bus");

        let message = wait_for_message(&mut receiver, Duration::from_secs(1), |message| {
            matches!(message, Message::Views(ViewMessage::LinkedViewsUpdated(_)))
        });
        let Message::Views(ViewMessage::LinkedViewsUpdated(update)) = message else {
            panic!("expected LinkedViewsUpdated message");
        };
        assert_eq!(update.user, "alice");
        assert_eq!(update.views.period, "Jan");
        let afternoon = &update.views.time_of_day.bands[3];
        assert_eq!(afternoon.event_count, 1);
        assert!((afternoon.average_seconds - 120.0).abs() < 1e-9);

        bus_sender
            .send(Message::Selection(SelectionMessage::Cleared {
                user: "mallory".to_string(),
            }))
            .expect("failed to send message to bus");
        let message = wait_for_message(&mut receiver, Duration::from_secs(1), |message| {
            matches!(message, Message::Views(ViewMessage::UnknownUser(_)))
        });
        assert!(matches!(
            message,
            Message::Views(ViewMessage::UnknownUser(user)) if user == "mallory"
        ));
    }
}
