//! # tagkoll-live
//!
//! Live data synchronization layer for the Tågkoll client.
//!
//! ## Features
//!
//! - **Observable stores**: immutable snapshots, change listeners, and
//!   notifications only for genuine changes
//! - **Position sync**: incremental polling with full-refresh fallback,
//!   stable record identity, and staleness eviction
//! - **Event aggregation**: two upstream feeds folded into one severity-scored
//!   taxonomy
//! - **Route resolution**: batched, coalesced origin/destination lookups
//! - **Pluggable networking**: implement the [`network`] traits to feed the
//!   stores
//!
//! ## Example
//!
//! ```
//! use tagkoll_live::prelude::*;
//!
//! let prefs = PreferenceStore::new();
//! let id = TrainIdentifier::new("547");
//!
//! let sub = prefs.subscribe(|| { /* re-render */ });
//! prefs.toggle_favorite(&id);
//! assert!(prefs.snapshot().favorites.contains(&id));
//! drop(sub);
//! ```
//!
//! The polling stores ([`PositionStore`], [`EventStore`], [`RouteRegistry`])
//! follow the same contract but run background work on the tokio runtime:
//! the first subscriber starts it, the last unsubscribe halts it.

pub mod config;
pub mod events;
pub mod identifiers;
pub mod models;
pub mod network;
pub mod positions;
pub mod prefs;
pub mod routes;
pub mod store;

// Re-exports for convenience
pub mod prelude {
    pub use crate::config::LiveConfig;
    pub use crate::events::EventStore;
    pub use crate::identifiers::*;
    pub use crate::models::types::*;
    pub use crate::network::traits::*;
    pub use crate::network::types::*;
    pub use crate::positions::PositionStore;
    pub use crate::prefs::{PreferenceStore, PrefsSnapshot};
    pub use crate::routes::RouteRegistry;
    pub use crate::store::{ObservableStore, Subscription};
}

pub use prelude::*;
