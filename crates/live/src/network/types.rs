//! Raw payload shapes produced by the transport collaborators.
//!
//! These mirror the upstream wire formats closely enough that the transport
//! layer can deserialize straight into them. Everything here is normalized
//! into the domain types before it reaches a snapshot.

use std::collections::HashMap;

use chrono::{DateTime, NaiveDate, Utc};
use serde::Deserialize;

/// One entry of the moving-train feed.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct RawTrainPosition {
    pub advertised_ident: Option<String>,
    pub operational_ident: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    /// km/h, when the source reports it.
    pub speed: Option<f64>,
    /// Degrees clockwise from north.
    pub bearing: Option<f64>,
    pub modified_at: Option<DateTime<Utc>>,
    pub journey_date: Option<NaiveDate>,
}

/// A stretch of line affected by a deviation or message.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct RawRouteSection {
    pub impact_score: Option<u8>,
    pub from_signature: Option<String>,
    pub to_signature: Option<String>,
    pub at_signature: Option<String>,
}

/// One entry of the structured deviation feed (feed A).
///
/// Timestamps stay as strings here; the merge layer parses them and treats
/// unparseable values as absent.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct RawDeviation {
    pub id: String,
    pub header: Option<String>,
    pub message: Option<String>,
    /// Primary road-impact score, 1..=4 and up.
    pub impact_score: Option<u8>,
    #[serde(default)]
    pub sections: Vec<RawRouteSection>,
    pub start_time: Option<String>,
    pub end_time: Option<String>,
    pub modified_time: Option<String>,
}

/// One entry of the reason-coded train message feed (feed B).
///
/// Sometimes references the same underlying event id as feed A.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct RawTrainMessage {
    pub id: String,
    pub header: Option<String>,
    pub message: Option<String>,
    pub reason_code: Option<String>,
    #[serde(default)]
    pub sections: Vec<RawRouteSection>,
    pub start_time: Option<String>,
    pub modified_time: Option<String>,
}

/// Station signature → display name.
pub type StationDirectory = HashMap<String, String>;

/// Limits applied to one route announcement request.
#[derive(Clone, Copy, Debug)]
pub struct AnnouncementQuery {
    pub per_batch_limit: usize,
    pub window_minutes: u32,
}

/// One route announcement record.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct RawRouteAnnouncement {
    pub advertised_ident: Option<String>,
    pub operational_ident: Option<String>,
    /// Ordered origin candidates; the first is the true origin.
    #[serde(default)]
    pub from_locations: Vec<String>,
    /// Ordered destination candidates; the last is the true terminus.
    #[serde(default)]
    pub to_locations: Vec<String>,
}
