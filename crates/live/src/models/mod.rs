//! Domain models, snapshots, and error types.

pub mod types;

// Re-exports for convenience
pub use types::{
    EventSource, EventsSnapshot, LiveError, PositionsSnapshot, Result, RouteInfo, RouteSnapshot,
    Severity, TrafficEvent, Train,
};
