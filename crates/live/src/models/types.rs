//! Core domain types for the live data layer.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use geo::Point;
use serde::Serialize;

use crate::identifiers::*;

// ============================================================================
// Enums
// ============================================================================

/// Ordinal severity of a traffic event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// Map a worst-case impact score to a severity level.
    pub fn from_score(score: u8) -> Self {
        match score {
            s if s >= 4 => Self::Critical,
            3 => Self::High,
            2 => Self::Medium,
            _ => Self::Low,
        }
    }
}

/// Which upstream feed(s) produced a traffic event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventSource {
    Deviations,
    Messages,
    Merged,
}

// ============================================================================
// Data Structures
// ============================================================================

/// A live train position record.
///
/// The stable identity comes from the operational train number, falling back
/// to the advertised one. A record without a coordinate is never admitted to
/// the cache, so `position` is not optional here.
#[derive(Clone, Debug, PartialEq)]
pub struct Train {
    pub id: TrainIdentifier,
    pub label: Arc<str>,
    pub advertised_ident: Option<Arc<str>>,
    pub operational_ident: Option<Arc<str>>,
    pub position: Point,
    pub speed: Option<f64>,
    pub bearing: Option<f64>,
    /// Freshness timestamp; drives staleness eviction and incremental cutoffs.
    pub updated_at: DateTime<Utc>,
    pub journey_date: Option<NaiveDate>,
}

/// A normalized traffic event, merged from both upstream feeds.
#[derive(Clone, Debug, PartialEq)]
pub struct TrafficEvent {
    pub id: EventIdentifier,
    pub title: Arc<str>,
    pub description: Option<Arc<str>>,
    pub severity: Severity,
    /// Swedish impact tier text, derived from the worst observed score.
    pub impact_label: Option<Arc<str>>,
    /// Derived "from → to" segment label, not authoritative.
    pub segment: Option<Arc<str>>,
    pub starts_at: Option<DateTime<Utc>>,
    pub ends_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub source: EventSource,
}

/// Resolved origin/destination labels for a train.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RouteInfo {
    pub from: Option<Arc<str>>,
    pub to: Option<Arc<str>>,
    /// Terminal once set; a lookup miss still resolves (with both labels None).
    pub resolved: bool,
}

// ============================================================================
// Snapshots
// ============================================================================

/// Pointer equality over record lists: an unchanged record is the same `Arc`,
/// so snapshot comparison never walks record contents.
fn same_records<T>(a: &[Arc<T>], b: &[Arc<T>]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| Arc::ptr_eq(x, y))
}

/// Immutable view of the position store.
#[derive(Clone, Debug, Default)]
pub struct PositionsSnapshot {
    /// Trains in stable insertion order.
    pub trains: Vec<Arc<Train>>,
    pub loading: bool,
    pub error: Option<Arc<str>>,
    /// Freshest observed record timestamp across the cache.
    pub last_updated: Option<DateTime<Utc>>,
}

impl PartialEq for PositionsSnapshot {
    fn eq(&self, other: &Self) -> bool {
        same_records(&self.trains, &other.trains)
            && self.loading == other.loading
            && self.error == other.error
            && self.last_updated == other.last_updated
    }
}

/// Immutable view of the event store.
#[derive(Clone, Debug, Default)]
pub struct EventsSnapshot {
    /// Events sorted by severity descending, then update time descending.
    pub events: Vec<Arc<TrafficEvent>>,
    pub loading: bool,
    pub error: Option<Arc<str>>,
    pub last_updated: Option<DateTime<Utc>>,
}

impl PartialEq for EventsSnapshot {
    fn eq(&self, other: &Self) -> bool {
        same_records(&self.events, &other.events)
            && self.loading == other.loading
            && self.error == other.error
            && self.last_updated == other.last_updated
    }
}

/// Immutable view of the route registry.
#[derive(Clone, Debug)]
pub struct RouteSnapshot {
    /// Bumped once per applied change batch.
    pub version: u64,
    pub routes: Arc<HashMap<TrainIdentifier, RouteInfo>>,
}

impl Default for RouteSnapshot {
    fn default() -> Self {
        Self {
            version: 0,
            routes: Arc::new(HashMap::new()),
        }
    }
}

impl PartialEq for RouteSnapshot {
    fn eq(&self, other: &Self) -> bool {
        self.version == other.version && Arc::ptr_eq(&self.routes, &other.routes)
    }
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum LiveError {
    /// The request was cancelled by a newer poll or by store shutdown.
    /// Never surfaced to consumers and never mutates state.
    #[error("request was cancelled")]
    Cancelled,

    #[error("fetch failed: {0}")]
    Fetch(String),

    #[error("malformed payload: {0}")]
    Payload(String),
}

impl LiveError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

pub type Result<T> = std::result::Result<T, LiveError>;
