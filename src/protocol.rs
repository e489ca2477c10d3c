//! Event-bus protocol shared by the selection publisher and view reactors.
//!
//! Aggregation code never sees these types; only the selection layer
//! translates between bus messages and pure view computations.

use crate::selection::LinkedViews;
use crate::time_bucketer::PeriodFilter;

/// Top-level envelope for all bus traffic.
#[derive(Debug, Clone)]
pub enum Message {
    Selection(SelectionMessage),
    Views(ViewMessage),
}

/// Period selection commands, typically driven by the monthly chart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectionMessage {
    /// A period was selected for one user's dashboard.
    PeriodSelected { user: String, filter: PeriodFilter },
    /// Selection reset to the whole log.
    Cleared { user: String },
}

/// Recomputed view notifications.
#[derive(Debug, Clone)]
pub enum ViewMessage {
    LinkedViewsUpdated(LinkedViewsUpdate),
    /// A selection referenced a user the reactor does not know.
    UnknownUser(String),
}

/// Payload of [`ViewMessage::LinkedViewsUpdated`].
#[derive(Debug, Clone)]
pub struct LinkedViewsUpdate {
    pub user: String,
    pub views: LinkedViews,
}
