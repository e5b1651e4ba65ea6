//! Pluggable collaborator contracts.
//!
//! The transport layer implements these to feed the stores; the stores never
//! see anything beyond the raw shapes in [`super::types`]. Cancellation is
//! advisory: an implementation should abort the underlying call when the
//! token fires, and callers re-check the token on completion regardless.

use std::future::Future;
use std::pin::Pin;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::models::types::Result;
use crate::network::types::{
    AnnouncementQuery, RawDeviation, RawRouteAnnouncement, RawTrainMessage, RawTrainPosition,
    StationDirectory,
};

/// Source of live train positions.
pub trait PositionFeed: Send + Sync {
    /// Fetch positions; `modified_since = None` requests the complete
    /// current set, otherwise only entries modified after the cutoff.
    fn fetch_positions(
        &self,
        cancel: CancellationToken,
        modified_since: Option<DateTime<Utc>>,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<RawTrainPosition>>> + Send + '_>>;
}

/// Source of the two traffic event feeds and the station lookup table.
pub trait EventFeed: Send + Sync {
    fn fetch_deviations(
        &self,
        cancel: CancellationToken,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<RawDeviation>>> + Send + '_>>;

    fn fetch_train_messages(
        &self,
        cancel: CancellationToken,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<RawTrainMessage>>> + Send + '_>>;

    /// Station signature → display name mapping.
    fn fetch_station_directory(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<StationDirectory>> + Send + '_>>;
}

/// Source of route announcements for identifier batches.
pub trait AnnouncementFeed: Send + Sync {
    /// Resolve a batch of train identifier filters into announcement records.
    fn fetch_route_announcements<'a>(
        &'a self,
        idents: &'a [String],
        query: AnnouncementQuery,
        cancel: CancellationToken,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<RawRouteAnnouncement>>> + Send + 'a>>;
}
