//! Live train position synchronization.
//!
//! Polls the position feed on a fixed cadence, merges entries into a
//! stable-ordered cache, prunes stale records, and publishes snapshots.
//! A full refresh replaces the cache from the complete upstream listing;
//! incremental polls only apply entries modified since the freshest
//! observed timestamp, backed off by a small margin.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, TimeDelta, Utc};
use geo::Point;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::LiveConfig;
use crate::identifiers::TrainIdentifier;
use crate::models::types::{PositionsSnapshot, Train};
use crate::network::traits::PositionFeed;
use crate::network::types::RawTrainPosition;
use crate::store::observable::{Lifecycle, ObservableStore, Subscription};

/// User-facing message when a position poll fails.
const FETCH_ERROR_MESSAGE: &str = "Kunde inte uppdatera tågpositionerna";

pub struct PositionStore {
    inner: Arc<Inner>,
}

struct Inner {
    feed: Arc<dyn PositionFeed>,
    config: LiveConfig,
    observable: ObservableStore<PositionsSnapshot>,
    cache: Mutex<Cache>,
    control: Mutex<Control>,
}

#[derive(Default)]
struct Cache {
    by_id: HashMap<TrainIdentifier, Arc<Train>>,
    /// Stable insertion order; a full refresh rebuilds it from the response.
    order: Vec<TrainIdentifier>,
    /// Freshest record timestamp, the next incremental baseline.
    newest: Option<DateTime<Utc>>,
    had_full: bool,
    last_full_at: Option<Instant>,
}

struct Control {
    root: CancellationToken,
    task: Option<JoinHandle<()>>,
    in_flight: Option<CancellationToken>,
}

impl Default for Control {
    fn default() -> Self {
        Self {
            root: CancellationToken::new(),
            task: None,
            in_flight: None,
        }
    }
}

impl PositionStore {
    pub fn new(feed: Arc<dyn PositionFeed>) -> Self {
        Self::with_config(feed, LiveConfig::default())
    }

    pub fn with_config(feed: Arc<dyn PositionFeed>, config: LiveConfig) -> Self {
        let inner = Arc::new(Inner {
            feed,
            config,
            observable: ObservableStore::new(PositionsSnapshot::default()),
            cache: Mutex::new(Cache::default()),
            control: Mutex::new(Control::default()),
        });

        let start = Arc::downgrade(&inner);
        let stop = Arc::downgrade(&inner);
        inner.observable.set_lifecycle(Lifecycle {
            on_first_subscriber: Box::new(move || {
                if let Some(inner) = start.upgrade() {
                    Inner::start_polling(&inner);
                }
            }),
            on_zero_subscribers: Box::new(move || {
                if let Some(inner) = stop.upgrade() {
                    inner.stop_polling();
                }
            }),
        });

        Self { inner }
    }

    /// Register a change listener. The first subscriber starts background
    /// polling, so this must be called within a tokio runtime.
    pub fn subscribe(&self, listener: impl Fn() + Send + Sync + 'static) -> Subscription {
        self.inner.observable.subscribe(listener)
    }

    pub fn snapshot(&self) -> PositionsSnapshot {
        self.inner.observable.snapshot()
    }

    pub fn get_by_id(&self, id: &TrainIdentifier) -> Option<Arc<Train>> {
        self.inner.cache.lock().by_id.get(id).cloned()
    }

    /// Poll now, outside the regular cadence. `force_full` replaces the
    /// whole cache from the complete upstream listing.
    pub async fn refetch(&self, force_full: bool) {
        Inner::poll(&self.inner, force_full).await;
    }
}

impl Drop for PositionStore {
    fn drop(&mut self) {
        self.inner.stop_polling();
    }
}

impl Inner {
    fn start_polling(inner: &Arc<Self>) {
        let mut control = inner.control.lock();
        if control.task.is_some() {
            return;
        }
        control.root = CancellationToken::new();
        let root = control.root.clone();
        let weak = Arc::downgrade(inner);
        let period = inner.config.position_poll_interval;
        control.task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = root.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let Some(inner) = weak.upgrade() else { break };
                Inner::poll(&inner, false).await;
            }
        }));
    }

    fn stop_polling(&self) {
        let mut control = self.control.lock();
        control.root.cancel();
        if let Some(token) = control.in_flight.take() {
            token.cancel();
        }
        control.task = None;
    }

    /// One unit of work: fetch, normalize, merge, prune, publish. Starting a
    /// poll cancels any still-pending one; a cancelled poll commits nothing.
    async fn poll(inner: &Arc<Self>, force_full: bool) {
        let (token, cutoff, full, first_load) = {
            let mut control = inner.control.lock();
            if control.root.is_cancelled() {
                control.root = CancellationToken::new();
            }
            if let Some(previous) = control.in_flight.take() {
                previous.cancel();
            }
            let token = control.root.child_token();
            control.in_flight = Some(token.clone());

            let cache = inner.cache.lock();
            let full_elapsed = cache
                .last_full_at
                .is_none_or(|at| at.elapsed() >= inner.config.full_refresh_interval);
            let full = force_full || !cache.had_full || full_elapsed;
            let margin = TimeDelta::from_std(inner.config.incremental_margin)
                .unwrap_or_else(|_| TimeDelta::zero());
            let cutoff = if full {
                None
            } else {
                cache.newest.map(|newest| newest - margin)
            };
            (token, cutoff, full, !cache.had_full)
        };

        if first_load || force_full {
            inner.observable.mutate(|s| s.loading = true);
        }

        debug!(full, ?cutoff, "polling train positions");
        let fetched = inner.feed.fetch_positions(token.clone(), cutoff).await;
        if token.is_cancelled() {
            debug!("position poll cancelled, dropping result");
            return;
        }

        match fetched {
            Err(error) if error.is_cancelled() => {}
            Err(error) => {
                warn!(%error, "position poll failed, keeping cached data");
                inner.observable.mutate(|s| {
                    s.loading = false;
                    s.error = Some(Arc::from(FETCH_ERROR_MESSAGE));
                });
            }
            Ok(raw) => {
                let now = Utc::now();
                let (trains, newest) = {
                    let mut cache = inner.cache.lock();
                    if full {
                        cache.replace_all(raw, now);
                        cache.had_full = true;
                        cache.last_full_at = Some(Instant::now());
                    } else {
                        cache.merge_incremental(raw, now);
                    }
                    let stale = TimeDelta::from_std(inner.config.stale_after)
                        .unwrap_or_else(|_| TimeDelta::zero());
                    cache.prune(now - stale);
                    cache.newest = cache.by_id.values().map(|t| t.updated_at).max();
                    (cache.ordered_trains(), cache.newest)
                };
                inner.observable.mutate(|s| {
                    s.trains = trains;
                    s.loading = false;
                    s.error = None;
                    s.last_updated = newest;
                });
            }
        }
    }
}

impl Cache {
    /// Replace the entire cache, rebuilding insertion order from the
    /// response. Unchanged records keep their existing allocation.
    fn replace_all(&mut self, raw: Vec<RawTrainPosition>, observed_at: DateTime<Utc>) {
        let previous = std::mem::take(&mut self.by_id);
        self.order.clear();
        for entry in raw {
            let Some(train) = normalize(entry, observed_at) else {
                continue;
            };
            if self.by_id.contains_key(&train.id) {
                continue;
            }
            let id = train.id.clone();
            let record = match previous.get(&id) {
                Some(existing) if **existing == train => existing.clone(),
                _ => Arc::new(train),
            };
            self.order.push(id.clone());
            self.by_id.insert(id, record);
        }
    }

    /// Upsert changed entries only. A record identical in every observable
    /// field stays the same `Arc`; new records append to the order list.
    fn merge_incremental(&mut self, raw: Vec<RawTrainPosition>, observed_at: DateTime<Utc>) {
        for entry in raw {
            let Some(train) = normalize(entry, observed_at) else {
                continue;
            };
            match self.by_id.get(&train.id) {
                Some(existing) if **existing == train => {}
                Some(_) => {
                    self.by_id.insert(train.id.clone(), Arc::new(train));
                }
                None => {
                    let id = train.id.clone();
                    self.order.push(id.clone());
                    self.by_id.insert(id, Arc::new(train));
                }
            }
        }
    }

    /// Evict every record whose freshness timestamp fell behind `cutoff`.
    fn prune(&mut self, cutoff: DateTime<Utc>) {
        let stale: Vec<TrainIdentifier> = self
            .by_id
            .iter()
            .filter(|(_, train)| train.updated_at < cutoff)
            .map(|(id, _)| id.clone())
            .collect();
        if stale.is_empty() {
            return;
        }
        for id in &stale {
            self.by_id.remove(id);
        }
        self.order.retain(|id| self.by_id.contains_key(id));
    }

    fn ordered_trains(&self) -> Vec<Arc<Train>> {
        self.order
            .iter()
            .filter_map(|id| self.by_id.get(id))
            .cloned()
            .collect()
    }
}

/// Build a domain record from a raw feed entry. Entries without both
/// coordinates, or without any usable external identifier, are discarded.
fn normalize(raw: RawTrainPosition, observed_at: DateTime<Utc>) -> Option<Train> {
    let (Some(latitude), Some(longitude)) = (raw.latitude, raw.longitude) else {
        return None;
    };
    let advertised: Option<Arc<str>> = raw
        .advertised_ident
        .filter(|s| !s.is_empty())
        .map(Arc::from);
    let operational: Option<Arc<str>> = raw
        .operational_ident
        .filter(|s| !s.is_empty())
        .map(Arc::from);
    let identity = operational.clone().or_else(|| advertised.clone())?;

    Some(Train {
        id: TrainIdentifier::new(&identity),
        label: advertised.clone().unwrap_or(identity),
        advertised_ident: advertised,
        operational_ident: operational,
        position: Point::new(longitude, latitude),
        speed: raw.speed,
        bearing: raw.bearing,
        updated_at: raw.modified_at.unwrap_or(observed_at),
        journey_date: raw.journey_date,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::types::{LiveError, Result};
    use std::collections::VecDeque;
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Scripted feed: pops one queued response per poll and records every
    /// cutoff it was asked for.
    #[derive(Default)]
    struct ScriptedFeed {
        responses: Mutex<VecDeque<Result<Vec<RawTrainPosition>>>>,
        cutoffs: Mutex<Vec<Option<DateTime<Utc>>>>,
    }

    impl ScriptedFeed {
        fn push(&self, response: Result<Vec<RawTrainPosition>>) {
            self.responses.lock().push_back(response);
        }
    }

    impl PositionFeed for ScriptedFeed {
        fn fetch_positions(
            &self,
            _cancel: CancellationToken,
            modified_since: Option<DateTime<Utc>>,
        ) -> Pin<Box<dyn Future<Output = Result<Vec<RawTrainPosition>>> + Send + '_>> {
            self.cutoffs.lock().push(modified_since);
            let response = self
                .responses
                .lock()
                .pop_front()
                .unwrap_or_else(|| Ok(Vec::new()));
            Box::pin(async move { response })
        }
    }

    /// Feed that waits until its token is cancelled, then still returns data.
    struct StallingFeed {
        stalled: Vec<RawTrainPosition>,
    }

    impl PositionFeed for StallingFeed {
        fn fetch_positions(
            &self,
            cancel: CancellationToken,
            _modified_since: Option<DateTime<Utc>>,
        ) -> Pin<Box<dyn Future<Output = Result<Vec<RawTrainPosition>>> + Send + '_>> {
            let stalled = self.stalled.clone();
            Box::pin(async move {
                cancel.cancelled().await;
                Ok(stalled)
            })
        }
    }

    fn raw(ident: &str, at: DateTime<Utc>) -> RawTrainPosition {
        RawTrainPosition {
            advertised_ident: Some(ident.to_string()),
            latitude: Some(59.33),
            longitude: Some(18.06),
            modified_at: Some(at),
            ..Default::default()
        }
    }

    fn idents(snapshot: &PositionsSnapshot) -> Vec<&str> {
        snapshot.trains.iter().map(|t| t.id.as_str()).collect()
    }

    fn notification_counter(store: &PositionStore) -> (Arc<AtomicUsize>, Subscription) {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = count.clone();
        let sub = store.subscribe(move || {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        (count, sub)
    }

    #[tokio::test]
    async fn test_full_refresh_replaces_cache() {
        let feed = Arc::new(ScriptedFeed::default());
        let now = Utc::now();
        feed.push(Ok(vec![raw("a", now), raw("b", now)]));
        feed.push(Ok(vec![raw("b", now), raw("c", now)]));

        let store = PositionStore::new(feed.clone());
        store.refetch(true).await;
        assert_eq!(idents(&store.snapshot()), vec!["a", "b"]);

        store.refetch(true).await;
        let snapshot = store.snapshot();
        assert_eq!(idents(&snapshot), vec!["b", "c"]);
        assert!(store.get_by_id(&TrainIdentifier::new("a")).is_none());
    }

    #[tokio::test]
    async fn test_incremental_merge_is_idempotent() {
        let feed = Arc::new(ScriptedFeed::default());
        let now = Utc::now();
        feed.push(Ok(vec![raw("a", now)]));
        feed.push(Ok(vec![raw("a", now)]));

        let store = PositionStore::new(feed.clone());
        store.refetch(false).await;
        let before = store.snapshot();

        // Same normalized entry again: same Arc, and a snapshot that compares
        // equal, which is exactly the no-notification condition.
        store.refetch(false).await;
        let after = store.snapshot();
        assert!(Arc::ptr_eq(&before.trains[0], &after.trains[0]));
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn test_incremental_appends_new_ids_after_known() {
        let feed = Arc::new(ScriptedFeed::default());
        let now = Utc::now();
        feed.push(Ok(vec![raw("a", now), raw("b", now)]));
        // The brand-new id comes first in the raw feed, but must append.
        feed.push(Ok(vec![raw("c", now), raw("a", now + TimeDelta::seconds(1))]));

        let store = PositionStore::new(feed.clone());
        store.refetch(false).await;
        store.refetch(false).await;

        assert_eq!(idents(&store.snapshot()), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_prunes_stale_records() {
        let feed = Arc::new(ScriptedFeed::default());
        let now = Utc::now();
        feed.push(Ok(vec![
            raw("fresh", now - TimeDelta::minutes(1)),
            raw("stale", now - TimeDelta::minutes(11)),
        ]));

        let store = PositionStore::new(feed.clone());
        store.refetch(false).await;

        assert_eq!(idents(&store.snapshot()), vec!["fresh"]);
    }

    #[tokio::test]
    async fn test_discards_unusable_entries() {
        let feed = Arc::new(ScriptedFeed::default());
        let now = Utc::now();
        let mut no_coordinate = raw("a", now);
        no_coordinate.latitude = None;
        no_coordinate.longitude = None;
        let no_ident = RawTrainPosition {
            latitude: Some(59.0),
            longitude: Some(18.0),
            modified_at: Some(now),
            ..Default::default()
        };
        feed.push(Ok(vec![no_coordinate, no_ident, raw("b", now)]));

        let store = PositionStore::new(feed.clone());
        store.refetch(false).await;

        assert_eq!(idents(&store.snapshot()), vec!["b"]);
    }

    #[tokio::test]
    async fn test_incremental_cutoff_backs_off_by_margin() {
        let feed = Arc::new(ScriptedFeed::default());
        let newest = Utc::now() - TimeDelta::minutes(2);
        feed.push(Ok(vec![raw("a", newest)]));
        feed.push(Ok(vec![]));

        let store = PositionStore::new(feed.clone());
        store.refetch(false).await;
        store.refetch(false).await;

        let cutoffs = feed.cutoffs.lock();
        assert_eq!(cutoffs[0], None); // first-ever fetch is always full
        assert_eq!(cutoffs[1], Some(newest - TimeDelta::seconds(5)));
    }

    #[tokio::test]
    async fn test_stable_identity_prefers_operational_number() {
        let feed = Arc::new(ScriptedFeed::default());
        let mut entry = raw("547", Utc::now());
        entry.operational_ident = Some("110547".to_string());
        feed.push(Ok(vec![entry]));

        let store = PositionStore::new(feed.clone());
        store.refetch(false).await;

        let train = store.get_by_id(&TrainIdentifier::new("110547")).unwrap();
        assert_eq!(&*train.label, "547");
    }

    #[tokio::test]
    async fn test_failure_keeps_cache_and_sets_error() {
        let feed = Arc::new(ScriptedFeed::default());
        let now = Utc::now();
        feed.push(Ok(vec![raw("a", now)]));
        feed.push(Err(LiveError::Fetch("connection reset".into())));
        feed.push(Ok(vec![raw("a", now + TimeDelta::seconds(30))]));

        let store = PositionStore::new(feed.clone());
        store.refetch(false).await;

        store.refetch(false).await;
        let failed = store.snapshot();
        assert_eq!(idents(&failed), vec!["a"]); // stale data over no data
        assert!(failed.error.is_some());

        store.refetch(false).await;
        assert_eq!(store.snapshot().error, None);
    }

    #[tokio::test]
    async fn test_cancelled_poll_commits_nothing() {
        let now = Utc::now();
        let feed = Arc::new(StallingFeed {
            stalled: vec![raw("late-response", now)],
        });
        let store = Arc::new(PositionStore::new(feed));

        let manual = {
            let store = store.clone();
            tokio::spawn(async move { store.refetch(false).await })
        };
        tokio::task::yield_now().await; // manual poll is now awaiting the feed

        // Subscribing starts the background poller, whose first poll cancels
        // the stalled manual one before issuing its own request.
        let (count, sub) = notification_counter(&store);
        manual.await.unwrap();

        // The manual poll resolved with data, but only after cancellation:
        // zero state changes, zero notifications.
        let snapshot = store.snapshot();
        assert!(snapshot.trains.is_empty());
        assert_eq!(snapshot.error, None);
        assert_eq!(snapshot.last_updated, None);
        assert_eq!(count.load(Ordering::SeqCst), 0);
        drop(sub);
    }

    #[tokio::test]
    async fn test_superseding_poll_wins() {
        let now = Utc::now();
        // First response stalls until cancelled, second comes from a script.
        struct TwoPhaseFeed {
            calls: AtomicUsize,
            late: Vec<RawTrainPosition>,
            fresh: Vec<RawTrainPosition>,
        }
        impl PositionFeed for TwoPhaseFeed {
            fn fetch_positions(
                &self,
                cancel: CancellationToken,
                _modified_since: Option<DateTime<Utc>>,
            ) -> Pin<Box<dyn Future<Output = Result<Vec<RawTrainPosition>>> + Send + '_>> {
                let call = self.calls.fetch_add(1, Ordering::SeqCst);
                let late = self.late.clone();
                let fresh = self.fresh.clone();
                Box::pin(async move {
                    if call == 0 {
                        cancel.cancelled().await;
                        Ok(late)
                    } else {
                        Ok(fresh)
                    }
                })
            }
        }

        let feed = Arc::new(TwoPhaseFeed {
            calls: AtomicUsize::new(0),
            late: vec![raw("late", now)],
            fresh: vec![raw("fresh", now)],
        });
        let store = Arc::new(PositionStore::new(feed));

        let stalled = {
            let store = store.clone();
            tokio::spawn(async move { store.refetch(false).await })
        };
        tokio::task::yield_now().await;

        // Starting this poll cancels the stalled one before issuing.
        store.refetch(false).await;
        stalled.await.unwrap();

        assert_eq!(idents(&store.snapshot()), vec!["fresh"]);
    }

    #[tokio::test]
    async fn test_first_subscriber_starts_polling() {
        let feed = Arc::new(ScriptedFeed::default());
        feed.push(Ok(vec![raw("a", Utc::now())]));
        let store = PositionStore::new(feed.clone());

        let _sub = store.subscribe(|| {});
        for _ in 0..50 {
            if !store.snapshot().trains.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(idents(&store.snapshot()), vec!["a"]);

        // Routine background polls never flip `loading`.
        assert!(!store.snapshot().loading);
    }

    #[tokio::test]
    async fn test_loading_only_on_first_load_and_forced_refresh() {
        let feed = Arc::new(ScriptedFeed::default());
        let now = Utc::now();
        feed.push(Ok(vec![raw("a", now)])); // 1: manual full, before subscribing
        feed.push(Ok(vec![raw("a", now)])); // 2: background first tick, unchanged
        feed.push(Ok(vec![raw("a", now)])); // 3: routine refetch, unchanged
        feed.push(Ok(vec![raw("a", now + TimeDelta::seconds(10))])); // 4: routine, changed
        feed.push(Ok(vec![raw("a", now + TimeDelta::seconds(20))])); // 5: forced, changed

        let store = PositionStore::new(feed.clone());
        store.refetch(true).await;

        let (count, _sub) = notification_counter(&store);
        // Let the background poller run its immediate first tick; unchanged
        // data on a routine poll is silent.
        tokio::task::yield_now().await;
        assert_eq!(count.load(Ordering::SeqCst), 0);

        // Routine poll with unchanged data: nothing at all.
        store.refetch(false).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);

        // Routine poll with changed data: one commit, no loading flip.
        store.refetch(false).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        // Forced refresh: loading flips on, then the commit clears it.
        store.refetch(true).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);
        assert!(!store.snapshot().loading);
    }
}
