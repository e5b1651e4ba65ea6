//! Network and IO abstractions.

pub mod traits;
pub mod types;

pub use traits::{AnnouncementFeed, EventFeed, PositionFeed};
pub use types::{
    AnnouncementQuery, RawDeviation, RawRouteAnnouncement, RawRouteSection, RawTrainMessage,
    RawTrainPosition, StationDirectory,
};
