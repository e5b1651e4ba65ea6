//! Traffic event aggregation store.
//!
//! Polls both event feeds on a fixed cadence; every poll is a full replace.
//! Event volumes are low enough that incremental sync buys nothing.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::LiveConfig;
use crate::events::merge::merge_feeds;
use crate::identifiers::EventIdentifier;
use crate::models::types::{EventsSnapshot, TrafficEvent};
use crate::network::traits::EventFeed;
use crate::network::types::StationDirectory;
use crate::store::observable::{Lifecycle, ObservableStore, Subscription};

/// User-facing message when an event poll fails.
const FETCH_ERROR_MESSAGE: &str = "Kunde inte hämta trafikhändelser";

pub struct EventStore {
    inner: Arc<Inner>,
}

struct Inner {
    feed: Arc<dyn EventFeed>,
    config: LiveConfig,
    observable: ObservableStore<EventsSnapshot>,
    /// Station lookup, fetched once and reused; a failed fetch retries on
    /// the next poll while the merge falls back to raw signatures.
    directory: Mutex<Option<Arc<StationDirectory>>>,
    control: Mutex<Control>,
}

struct Control {
    root: CancellationToken,
    task: Option<JoinHandle<()>>,
    in_flight: Option<CancellationToken>,
    loaded: bool,
}

impl Default for Control {
    fn default() -> Self {
        Self {
            root: CancellationToken::new(),
            task: None,
            in_flight: None,
            loaded: false,
        }
    }
}

impl EventStore {
    pub fn new(feed: Arc<dyn EventFeed>) -> Self {
        Self::with_config(feed, LiveConfig::default())
    }

    pub fn with_config(feed: Arc<dyn EventFeed>, config: LiveConfig) -> Self {
        let inner = Arc::new(Inner {
            feed,
            config,
            observable: ObservableStore::new(EventsSnapshot::default()),
            directory: Mutex::new(None),
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

    pub fn snapshot(&self) -> EventsSnapshot {
        self.inner.observable.snapshot()
    }

    /// Poll now, outside the regular cadence.
    pub async fn refetch(&self) {
        Inner::poll(&self.inner, true).await;
    }

    /// Cancel any in-flight poll and restore the pristine snapshot.
    pub fn reset(&self) {
        {
            let mut control = self.inner.control.lock();
            if let Some(token) = control.in_flight.take() {
                token.cancel();
            }
            control.loaded = false;
        }
        *self.inner.directory.lock() = None;
        self.inner.observable.replace(EventsSnapshot::default());
    }
}

impl Drop for EventStore {
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
        let period = inner.config.event_poll_interval;
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

    async fn poll(inner: &Arc<Self>, manual: bool) {
        let (token, first_load) = {
            let mut control = inner.control.lock();
            if control.root.is_cancelled() {
                control.root = CancellationToken::new();
            }
            if let Some(previous) = control.in_flight.take() {
                previous.cancel();
            }
            let token = control.root.child_token();
            control.in_flight = Some(token.clone());
            (token, !control.loaded)
        };

        if first_load || manual {
            inner.observable.mutate(|s| s.loading = true);
        }

        let directory = Self::station_directory(inner, &token).await;
        if token.is_cancelled() {
            return;
        }

        debug!("polling traffic events");
        let (deviations, messages) = tokio::join!(
            inner.feed.fetch_deviations(token.clone()),
            inner.feed.fetch_train_messages(token.clone()),
        );
        if token.is_cancelled() {
            debug!("event poll cancelled, dropping result");
            return;
        }

        let outcome = deviations.and_then(|d| messages.map(|m| (d, m)));
        match outcome {
            Err(error) if error.is_cancelled() => {}
            Err(error) => {
                warn!(%error, "event poll failed, keeping cached events");
                inner.observable.mutate(|s| {
                    s.loading = false;
                    s.error = Some(Arc::from(FETCH_ERROR_MESSAGE));
                });
            }
            Ok((deviations, messages)) => {
                let mut events = merge_feeds(&deviations, &messages, &directory);
                sort_events(&mut events);
                let events = Self::reuse_unchanged(&inner.observable.snapshot().events, events);
                inner.control.lock().loaded = true;
                inner.observable.mutate(|s| {
                    if !same_events(&s.events, &events) {
                        s.events = events;
                        s.last_updated = Some(Utc::now());
                    }
                    s.loading = false;
                    s.error = None;
                });
            }
        }
    }

    async fn station_directory(
        inner: &Arc<Self>,
        token: &CancellationToken,
    ) -> Arc<StationDirectory> {
        if let Some(directory) = inner.directory.lock().clone() {
            return directory;
        }
        match inner.feed.fetch_station_directory().await {
            Ok(directory) => {
                let directory = Arc::new(directory);
                if !token.is_cancelled() {
                    *inner.directory.lock() = Some(directory.clone());
                }
                directory
            }
            Err(error) => {
                debug!(%error, "station directory unavailable, using raw signatures");
                Arc::new(StationDirectory::new())
            }
        }
    }

    /// Keep the previous allocation for every event that came back
    /// value-identical, so unchanged polls stay referentially stable.
    fn reuse_unchanged(
        previous: &[Arc<TrafficEvent>],
        merged: Vec<TrafficEvent>,
    ) -> Vec<Arc<TrafficEvent>> {
        let by_id: HashMap<&EventIdentifier, &Arc<TrafficEvent>> =
            previous.iter().map(|e| (&e.id, e)).collect();
        merged
            .into_iter()
            .map(|event| match by_id.get(&event.id) {
                Some(existing) if ***existing == event => (*existing).clone(),
                _ => Arc::new(event),
            })
            .collect()
    }
}

fn same_events(a: &[Arc<TrafficEvent>], b: &[Arc<TrafficEvent>]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| Arc::ptr_eq(x, y))
}

/// Severity descending, ties broken by update timestamp descending.
/// Missing or unparseable timestamps sort as epoch zero.
fn sort_events(events: &mut [TrafficEvent]) {
    events.sort_by(|a, b| {
        b.severity.cmp(&a.severity).then_with(|| {
            let a_key = a.updated_at.map(|t| t.timestamp_millis()).unwrap_or(0);
            let b_key = b.updated_at.map(|t| t.timestamp_millis()).unwrap_or(0);
            b_key.cmp(&a_key)
        })
    });
}
