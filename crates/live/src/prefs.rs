//! In-memory presentation preferences.
//!
//! The simplest consumer of the observable core: no background activity,
//! just synchronous mutations with the same subscribe/snapshot contract as
//! the polling stores. Persisted preference storage lives outside this
//! crate.

use std::collections::HashSet;
use std::sync::Arc;

use crate::identifiers::TrainIdentifier;
use crate::store::observable::{ObservableStore, Subscription};

#[derive(Clone, Debug)]
pub struct PrefsSnapshot {
    pub favorites: Arc<HashSet<TrainIdentifier>>,
    pub show_only_favorites: bool,
}

impl Default for PrefsSnapshot {
    fn default() -> Self {
        Self {
            favorites: Arc::new(HashSet::new()),
            show_only_favorites: false,
        }
    }
}

impl PartialEq for PrefsSnapshot {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.favorites, &other.favorites)
            && self.show_only_favorites == other.show_only_favorites
    }
}

#[derive(Default)]
pub struct PreferenceStore {
    observable: ObservableStore<PrefsSnapshot>,
}

impl PreferenceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, listener: impl Fn() + Send + Sync + 'static) -> Subscription {
        self.observable.subscribe(listener)
    }

    pub fn snapshot(&self) -> PrefsSnapshot {
        self.observable.snapshot()
    }

    pub fn is_favorite(&self, id: &TrainIdentifier) -> bool {
        self.observable.snapshot().favorites.contains(id)
    }

    pub fn toggle_favorite(&self, id: &TrainIdentifier) {
        self.observable.mutate(|s| {
            let mut favorites = (*s.favorites).clone();
            if !favorites.remove(id) {
                favorites.insert(id.clone());
            }
            s.favorites = Arc::new(favorites);
        });
    }

    pub fn set_show_only_favorites(&self, enabled: bool) {
        self.observable.mutate(|s| s.show_only_favorites = enabled);
    }
}
