//! Route resolution registry.
//!
//! Trains surface from the position feed without origin/destination labels;
//! this registry batches the missing lookups, resolves them through the
//! announcement feed, and indexes the results so identifiers appearing in
//! later polls reuse earlier resolutions. Resolution is terminal per train:
//! a lookup miss resolves to empty labels rather than retrying forever.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::LiveConfig;
use crate::identifiers::TrainIdentifier;
use crate::models::types::{RouteInfo, RouteSnapshot, Train};
use crate::network::traits::AnnouncementFeed;
use crate::network::types::{AnnouncementQuery, RawRouteAnnouncement};
use crate::store::observable::{Lifecycle, ObservableStore, Subscription};

pub struct RouteRegistry {
    inner: Arc<Inner>,
}

struct Inner {
    feed: Arc<dyn AnnouncementFeed>,
    config: LiveConfig,
    observable: ObservableStore<RouteSnapshot>,
    state: Mutex<State>,
    control: Mutex<Control>,
}

#[derive(Default)]
struct State {
    routes: HashMap<TrainIdentifier, RouteInfo>,
    version: u64,
    /// Ids captured for lookup but not yet resolved.
    queued: HashSet<TrainIdentifier>,
    pending: VecDeque<Lookup>,
    /// Global reverse index over every train ever seen, both identifier
    /// kinds. Latest sighting wins.
    by_advertised: HashMap<Arc<str>, TrainIdentifier>,
    by_operational: HashMap<Arc<str>, TrainIdentifier>,
}

struct Control {
    root: CancellationToken,
    draining: bool,
}

impl Default for Control {
    fn default() -> Self {
        Self {
            root: CancellationToken::new(),
            draining: false,
        }
    }
}

#[derive(Clone)]
struct Lookup {
    id: TrainIdentifier,
    advertised: Option<Arc<str>>,
    operational: Option<Arc<str>>,
}

impl RouteRegistry {
    pub fn new(feed: Arc<dyn AnnouncementFeed>) -> Self {
        Self::with_config(feed, LiveConfig::default())
    }

    pub fn with_config(feed: Arc<dyn AnnouncementFeed>, config: LiveConfig) -> Self {
        let inner = Arc::new(Inner {
            feed,
            config,
            observable: ObservableStore::new(RouteSnapshot::default()),
            state: Mutex::new(State::default()),
            control: Mutex::new(Control::default()),
        });

        let stop = Arc::downgrade(&inner);
        inner.observable.set_lifecycle(Lifecycle {
            // Resolution is demand-driven via ensure_routes_for; nothing to
            // start eagerly.
            on_first_subscriber: Box::new(|| {}),
            on_zero_subscribers: Box::new(move || {
                if let Some(inner) = stop.upgrade() {
                    inner.control.lock().root.cancel();
                }
            }),
        });

        Self { inner }
    }

    pub fn subscribe(&self, listener: impl Fn() + Send + Sync + 'static) -> Subscription {
        self.inner.observable.subscribe(listener)
    }

    pub fn snapshot(&self) -> RouteSnapshot {
        self.inner.observable.snapshot()
    }

    pub fn get_route(&self, id: &TrainIdentifier) -> Option<RouteInfo> {
        self.inner.state.lock().routes.get(id).cloned()
    }

    /// Queue route lookups for every train that has none yet. Fire and
    /// forget: resolution happens in serialized background batches. Must be
    /// called within a tokio runtime.
    pub fn ensure_routes_for(&self, trains: &[Arc<Train>]) {
        let (changed, enqueued) = {
            let mut state = self.inner.state.lock();
            let mut changed = false;
            let mut enqueued = false;
            for train in trains {
                if let Some(advertised) = &train.advertised_ident {
                    state
                        .by_advertised
                        .insert(advertised.clone(), train.id.clone());
                }
                if let Some(operational) = &train.operational_ident {
                    state
                        .by_operational
                        .insert(operational.clone(), train.id.clone());
                }

                if state.routes.contains_key(&train.id) || state.queued.contains(&train.id) {
                    continue;
                }
                if train.advertised_ident.is_none() && train.operational_ident.is_none() {
                    // Nothing to look it up by; resolve empty immediately.
                    state.routes.insert(
                        train.id.clone(),
                        RouteInfo {
                            from: None,
                            to: None,
                            resolved: true,
                        },
                    );
                    changed = true;
                } else {
                    state.queued.insert(train.id.clone());
                    state.pending.push_back(Lookup {
                        id: train.id.clone(),
                        advertised: train.advertised_ident.clone(),
                        operational: train.operational_ident.clone(),
                    });
                    enqueued = true;
                }
            }
            if changed {
                state.version += 1;
            }
            (changed, enqueued)
        };

        if changed {
            Inner::publish(&self.inner);
        }
        if enqueued {
            Inner::spawn_drain(&self.inner);
        }
    }
}

impl Drop for RouteRegistry {
    fn drop(&mut self) {
        self.inner.control.lock().root.cancel();
    }
}

impl Inner {
    fn publish(inner: &Arc<Self>) {
        let snapshot = {
            let state = inner.state.lock();
            RouteSnapshot {
                version: state.version,
                routes: Arc::new(state.routes.clone()),
            }
        };
        inner.observable.replace(snapshot);
    }

    /// Become the single batch consumer if nobody is draining yet.
    fn spawn_drain(inner: &Arc<Self>) {
        {
            let mut control = inner.control.lock();
            if control.draining {
                return;
            }
            if control.root.is_cancelled() {
                control.root = CancellationToken::new();
            }
            control.draining = true;
        }
        let weak = Arc::downgrade(inner);
        tokio::spawn(async move {
            loop {
                let Some(inner) = weak.upgrade() else { return };
                if !Inner::drain_next_batch(&inner).await {
                    return;
                }
            }
        });
    }

    /// Drain one batch. Returns whether the consumer loop should continue.
    async fn drain_next_batch(inner: &Arc<Self>) -> bool {
        let token = inner.control.lock().root.child_token();
        let batch = {
            let mut state = inner.state.lock();
            take_batch(&mut state, inner.config.route_batch_size)
        };

        if batch.is_empty() {
            let mut control = inner.control.lock();
            control.draining = false;
            drop(control);
            // An enqueue may have raced the empty check; reclaim the
            // consumer role if so, otherwise we are done.
            let pending = !inner.state.lock().pending.is_empty();
            if pending {
                let mut control = inner.control.lock();
                if control.draining {
                    return false;
                }
                control.draining = true;
                return true;
            }
            return false;
        }

        let idents: Vec<String> = batch
            .iter()
            .filter_map(|l| l.advertised.as_deref().or(l.operational.as_deref()))
            .map(str::to_owned)
            .collect();
        let query = AnnouncementQuery {
            per_batch_limit: inner.config.route_request_limit,
            window_minutes: inner.config.route_window_minutes,
        };
        debug!(batch = batch.len(), "resolving route announcements");
        let outcome = inner
            .feed
            .fetch_route_announcements(&idents, query, token.clone())
            .await;

        let cancelled =
            token.is_cancelled() || matches!(&outcome, Err(error) if error.is_cancelled());
        if cancelled {
            // Applied nothing; the ids stay queued for a future attempt.
            debug!("route batch cancelled, requeueing");
            {
                let mut state = inner.state.lock();
                for lookup in batch.into_iter().rev() {
                    state.pending.push_front(lookup);
                }
            }
            inner.control.lock().draining = false;
            return false;
        }

        let changed = match outcome {
            Ok(announcements) => Self::apply_batch(inner, &batch, &announcements),
            Err(error) => {
                // Terminal: an unresolvable batch resolves empty rather than
                // retrying indefinitely.
                warn!(%error, "route batch failed, resolving batch ids empty");
                Self::apply_batch(inner, &batch, &[])
            }
        };
        if changed {
            Self::publish(inner);
        }
        true
    }

    /// Match announcements to ids (exact key within this batch first, then
    /// the global reverse index) and terminally resolve every batch id,
    /// matched or not.
    fn apply_batch(
        inner: &Arc<Self>,
        batch: &[Lookup],
        announcements: &[RawRouteAnnouncement],
    ) -> bool {
        let mut state = inner.state.lock();
        let batch_by_advertised: HashMap<&str, &TrainIdentifier> = batch
            .iter()
            .filter_map(|l| l.advertised.as_deref().map(|a| (a, &l.id)))
            .collect();
        let batch_by_operational: HashMap<&str, &TrainIdentifier> = batch
            .iter()
            .filter_map(|l| l.operational.as_deref().map(|o| (o, &l.id)))
            .collect();

        let mut changed = false;
        for announcement in announcements {
            let target: Option<TrainIdentifier> = announcement
                .advertised_ident
                .as_deref()
                .and_then(|a| batch_by_advertised.get(a).copied())
                .or_else(|| {
                    announcement
                        .operational_ident
                        .as_deref()
                        .and_then(|o| batch_by_operational.get(o).copied())
                })
                .cloned()
                .or_else(|| {
                    announcement
                        .advertised_ident
                        .as_deref()
                        .and_then(|a| state.by_advertised.get(a).cloned())
                })
                .or_else(|| {
                    announcement
                        .operational_ident
                        .as_deref()
                        .and_then(|o| state.by_operational.get(o).cloned())
                });
            let Some(id) = target else { continue };
            if state.routes.get(&id).is_some_and(|r| r.resolved) {
                continue; // resolution is once-only
            }
            state.routes.insert(id.clone(), route_of(announcement));
            state.queued.remove(&id);
            changed = true;
        }

        for lookup in batch {
            if !state.routes.get(&lookup.id).is_some_and(|r| r.resolved) {
                state.routes.insert(
                    lookup.id.clone(),
                    RouteInfo {
                        from: None,
                        to: None,
                        resolved: true,
                    },
                );
                changed = true;
            }
            state.queued.remove(&lookup.id);
        }

        if changed {
            state.version += 1;
        }
        changed
    }
}

/// Pull up to `cap` lookups, skipping any id that resolved in the meantime
/// (e.g. through a global-index match in an earlier batch).
fn take_batch(state: &mut State, cap: usize) -> Vec<Lookup> {
    let mut batch = Vec::new();
    while batch.len() < cap {
        let Some(lookup) = state.pending.pop_front() else {
            break;
        };
        if state.routes.get(&lookup.id).is_some_and(|r| r.resolved) {
            state.queued.remove(&lookup.id);
            continue;
        }
        batch.push(lookup);
    }
    batch
}

fn route_of(announcement: &RawRouteAnnouncement) -> RouteInfo {
    RouteInfo {
        from: announcement
            .from_locations
            .first()
            .filter(|s| !s.is_empty())
            .map(|s| Arc::from(s.as_str())),
        to: announcement
            .to_locations
            .last()
            .filter(|s| !s.is_empty())
            .map(|s| Arc::from(s.as_str())),
        resolved: true,
    }
}
