//! UI-facing job runner.
//!
//! Each user intent runs as a job. At most one job per operation kind is in
//! flight; asking again while one runs is a no-op. When the host suspends
//! for good (not a transient pause) every job is cancelled and remembered,
//! and `on_resume` starts each remembered request once more.
//!
//! Jobs never surface errors directly: results land in `watch` channels as
//! `UiState`, one-shot conditions go out as `UiEvent`s.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::alerts::NotificationDedup;
use crate::cache::blocking;
use crate::error::{ErrorKind, WeatherError, WeatherResult};
use crate::refresh::{RefreshFailure, Refresher};
use crate::types::{CacheEntry, LocationKey};
use crate::ui::{LocationWeather, UiEvent, UiState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    LoadLocation,
    LoadAll,
    AddLocation,
    RefreshLocation,
    RefreshAll,
}

/// A job request, kept so it can be replayed after a suspend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    LoadLocation(LocationKey),
    LoadAll,
    AddLocation(LocationKey),
    RefreshLocation(LocationKey),
    RefreshAll,
}

impl Request {
    pub fn kind(&self) -> OperationKind {
        match self {
            Self::LoadLocation(_) => OperationKind::LoadLocation,
            Self::LoadAll => OperationKind::LoadAll,
            Self::AddLocation(_) => OperationKind::AddLocation,
            Self::RefreshLocation(_) => OperationKind::RefreshLocation,
            Self::RefreshAll => OperationKind::RefreshAll,
        }
    }
}

struct Job {
    id: u64,
    token: CancellationToken,
    request: Request,
}

#[derive(Default)]
struct JobSlots {
    next_id: u64,
    running: HashMap<OperationKind, Job>,
    replays: HashMap<OperationKind, Request>,
}

impl JobSlots {
    fn refreshing(&self) -> bool {
        self.running.contains_key(&OperationKind::RefreshLocation)
            || self.running.contains_key(&OperationKind::RefreshAll)
    }
}

struct Inner {
    refresher: Refresher,
    /// Alert state dropped along with a removed location.
    alerts: Option<Arc<NotificationDedup>>,
    jobs: Mutex<JobSlots>,
    /// Serializes add, remove and list publication.
    membership: tokio::sync::Mutex<()>,
    /// Adds cancelled after their write landed, announced on replay.
    settled_adds: Mutex<HashSet<LocationKey>>,
    list: watch::Sender<UiState<Vec<LocationWeather>>>,
    detail: watch::Sender<UiState<LocationWeather>>,
    refreshing: watch::Sender<bool>,
    events: mpsc::UnboundedSender<UiEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<UiEvent>>>,
}

#[derive(Clone)]
pub struct RefreshCoordinator {
    inner: Arc<Inner>,
}

impl RefreshCoordinator {
    pub fn new(refresher: Refresher) -> Self {
        Self::build(refresher, None)
    }

    /// Like `new`, but removing a location also unsubscribes it from alerts.
    pub fn with_alerts(refresher: Refresher, alerts: Arc<NotificationDedup>) -> Self {
        Self::build(refresher, Some(alerts))
    }

    fn build(refresher: Refresher, alerts: Option<Arc<NotificationDedup>>) -> Self {
        let (list, _) = watch::channel(UiState::Loading);
        let (detail, _) = watch::channel(UiState::Loading);
        let (refreshing, _) = watch::channel(false);
        let (events, events_rx) = mpsc::unbounded_channel();

        Self {
            inner: Arc::new(Inner {
                refresher,
                alerts,
                jobs: Mutex::new(JobSlots::default()),
                membership: tokio::sync::Mutex::new(()),
                settled_adds: Mutex::new(HashSet::new()),
                list,
                detail,
                refreshing,
                events,
                events_rx: Mutex::new(Some(events_rx)),
            }),
        }
    }

    pub fn refresher(&self) -> &Refresher {
        &self.inner.refresher
    }

    pub fn subscribe_list(&self) -> watch::Receiver<UiState<Vec<LocationWeather>>> {
        self.inner.list.subscribe()
    }

    pub fn subscribe_detail(&self) -> watch::Receiver<UiState<LocationWeather>> {
        self.inner.detail.subscribe()
    }

    pub fn subscribe_refreshing(&self) -> watch::Receiver<bool> {
        self.inner.refreshing.subscribe()
    }

    /// The event stream. Only the first caller gets it.
    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<UiEvent>> {
        self.inner.events_rx.lock().take()
    }

    pub async fn ensure_fresh(&self, key: &LocationKey) -> Result<CacheEntry, RefreshFailure> {
        self.inner.refresher.ensure_fresh(key).await
    }

    // Intents. Each returns `false` when a job of the same kind is running.

    pub fn load_location(&self, key: LocationKey) -> bool {
        self.start(Request::LoadLocation(key))
    }

    pub fn load_all(&self) -> bool {
        self.start(Request::LoadAll)
    }

    pub fn add_location(&self, key: LocationKey) -> bool {
        self.start(Request::AddLocation(key))
    }

    pub fn refresh_location(&self, key: LocationKey) -> bool {
        self.start(Request::RefreshLocation(key))
    }

    pub fn refresh_all(&self) -> bool {
        self.start(Request::RefreshAll)
    }

    pub fn is_running(&self, kind: OperationKind) -> bool {
        self.inner.jobs.lock().running.contains_key(&kind)
    }

    pub fn pending_replays(&self) -> Vec<OperationKind> {
        self.inner.jobs.lock().replays.keys().copied().collect()
    }

    /// Evict `key` and its alert state, then republish the list without it.
    pub async fn remove_location(&self, key: &LocationKey) -> WeatherResult<()> {
        let _membership = self.inner.membership.lock().await;
        self.inner.settled_adds.lock().remove(key);

        if let Err(e) = self.inner.forget(key).await {
            tracing::error!("Failed to remove {}: {}", key, e);
            self.inner.emit(UiEvent::StorageFailed);
            return Err(e);
        }
        tracing::info!("Location removed: {}", key);

        self.inner.publish_list().await;
        Ok(())
    }

    /// Host is going away. A transient pause keeps jobs running; otherwise
    /// every job is cancelled and its request kept for `on_resume`.
    pub fn on_suspend(&self, transient: bool) {
        if transient {
            tracing::debug!("Transient suspend, jobs keep running");
            return;
        }

        let mut slots = self.inner.jobs.lock();
        let jobs: Vec<Job> = slots.running.drain().map(|(_, job)| job).collect();
        for job in jobs {
            tracing::debug!("Cancelling {:?} job {} for replay", job.request.kind(), job.id);
            job.token.cancel();
            slots.replays.insert(job.request.kind(), job.request);
        }
        self.inner.refreshing.send_replace(slots.refreshing());
    }

    /// Re-run every request cancelled by the last suspend, once.
    pub fn on_resume(&self) {
        let replays: Vec<Request> = {
            let mut slots = self.inner.jobs.lock();
            slots.replays.drain().map(|(_, request)| request).collect()
        };
        if !replays.is_empty() {
            tracing::info!("Replaying {} cancelled operations", replays.len());
        }
        for request in replays {
            self.start(request);
        }
    }

    fn start(&self, request: Request) -> bool {
        let kind = request.kind();
        let (id, token) = {
            let mut slots = self.inner.jobs.lock();
            if slots.running.contains_key(&kind) {
                tracing::debug!("{:?} already in flight, ignoring request", kind);
                return false;
            }
            let id = slots.next_id;
            slots.next_id += 1;
            let token = CancellationToken::new();
            slots.running.insert(
                kind,
                Job {
                    id,
                    token: token.clone(),
                    request: request.clone(),
                },
            );
            self.inner.refreshing.send_replace(slots.refreshing());
            (id, token)
        };

        let inner = self.inner.clone();
        tokio::spawn(async move {
            inner.run(request, &token).await;
            inner.finish(kind, id);
        });
        true
    }
}

impl Inner {
    fn emit(&self, event: UiEvent) {
        // No receiver just means nobody is listening.
        let _ = self.events.send(event);
    }

    async fn forget(&self, key: &LocationKey) -> WeatherResult<()> {
        self.refresher.cache().remove(key).await?;
        if let Some(dedup) = self.alerts.clone() {
            let k = key.clone();
            blocking(move || dedup.forget(&k)).await?;
        }
        Ok(())
    }

    fn finish(&self, kind: OperationKind, id: u64) {
        let mut slots = self.jobs.lock();
        // A suspend may already have released the slot for a replay.
        if slots.running.get(&kind).is_some_and(|job| job.id == id) {
            slots.running.remove(&kind);
        }
        self.refreshing.send_replace(slots.refreshing());
    }

    fn weather(&self, entry: CacheEntry) -> LocationWeather {
        LocationWeather::from_entry(
            entry,
            self.refresher.ttl(),
            self.refresher.clock().now(),
        )
    }

    async fn publish_list(&self) {
        let entries = self.refresher.cache().entries().await;
        let list = entries.into_iter().map(|e| self.weather(e)).collect();
        self.list.send_replace(UiState::Success(list));
    }

    fn report(&self, key: &LocationKey, error: &WeatherError) {
        match error {
            WeatherError::Network(_) => self.emit(UiEvent::Offline),
            WeatherError::Storage(_) => self.emit(UiEvent::StorageFailed),
            WeatherError::NotFound(_) | WeatherError::NotTracked(_) => {
                self.emit(UiEvent::RefreshFailed {
                    key: key.clone(),
                    kind: ErrorKind::NotFound,
                })
            }
            WeatherError::Cancelled => {}
        }
    }

    async fn run(&self, request: Request, token: &CancellationToken) {
        tracing::debug!("Starting {:?}", request);
        match request {
            Request::LoadLocation(key) => self.run_location(key, token, true).await,
            Request::RefreshLocation(key) => self.run_location(key, token, false).await,
            Request::LoadAll => self.run_fleet(token, true).await,
            Request::RefreshAll => self.run_fleet(token, false).await,
            Request::AddLocation(key) => self.run_add(key, token).await,
        }
    }

    async fn run_location(&self, key: LocationKey, token: &CancellationToken, initial: bool) {
        if initial {
            if let Err(e) = self.refresher.cache().initialize().await {
                if !token.is_cancelled() {
                    self.detail.send_replace(UiState::Error(e.kind()));
                }
                return;
            }
        }

        let result = self.refresher.ensure_fresh_cancellable(&key, token).await;
        if token.is_cancelled() {
            tracing::debug!("Load of {} cancelled, nothing published", key);
            return;
        }

        match result {
            Ok(entry) => {
                self.detail.send_replace(UiState::Success(self.weather(entry)));
            }
            Err(failure) => {
                self.report(&key, &failure.error);
                match failure.usable_cache() {
                    Some(entry) => {
                        let weather = self.weather(entry.clone());
                        self.detail.send_replace(UiState::Success(weather));
                    }
                    // A failed swipe-refresh never replaces shown data.
                    None if initial => {
                        self.detail.send_replace(UiState::Error(failure.error.kind()));
                    }
                    None => {}
                }
            }
        }
    }

    async fn run_fleet(&self, token: &CancellationToken, initial: bool) {
        let failures = match self.refresher.refresh_fleet(token).await {
            Ok(failures) => failures,
            Err(e) => {
                tracing::error!("Could not load tracked locations: {}", e);
                if token.is_cancelled() {
                    return;
                }
                if initial {
                    self.list.send_replace(UiState::Error(e.kind()));
                } else {
                    self.emit(UiEvent::StorageFailed);
                }
                return;
            }
        };

        let _membership = self.membership.lock().await;
        if token.is_cancelled() {
            tracing::debug!("Fleet refresh cancelled, nothing published");
            return;
        }

        let mut offline = false;
        for (key, failure) in &failures {
            match failure.error {
                WeatherError::Network(_) => offline = true,
                _ => self.report(key, &failure.error),
            }
        }
        if offline {
            self.emit(UiEvent::Offline);
        }

        let entries = self.refresher.cache().entries().await;
        let nothing_to_show = entries.iter().all(CacheEntry::is_empty);
        match failures.first() {
            Some((_, failure)) if initial && nothing_to_show => {
                self.list.send_replace(UiState::Error(failure.error.kind()));
            }
            _ => {
                let list = entries.into_iter().map(|e| self.weather(e)).collect();
                self.list.send_replace(UiState::Success(list));
            }
        }
    }

    async fn run_add(&self, key: LocationKey, token: &CancellationToken) {
        let _membership = self.membership.lock().await;
        if token.is_cancelled() {
            return;
        }

        let cache = self.refresher.cache();
        if let Err(e) = cache.initialize().await {
            self.report(&key, &e);
            return;
        }
        if cache.contains(&key).await {
            let settled = self.settled_adds.lock().remove(&key);
            if settled {
                self.announce_added(key).await;
                return;
            }
            tracing::info!("{} is already tracked", key);
            self.emit(UiEvent::DuplicateLocation(key));
            return;
        }

        // Both halves must resolve before the location is tracked.
        let remote = self.refresher.remote();
        let (current, forecast) =
            tokio::join!(remote.fetch_current(&key), remote.fetch_forecast(&key));

        let (current, forecast) = match (current, forecast) {
            (Ok(current), Ok(forecast)) => (current, forecast),
            (Err(e), _) | (_, Err(e)) => {
                tracing::warn!("Could not add {}: {}", key, e);
                if !token.is_cancelled() {
                    match e {
                        WeatherError::NotFound(_) => self.emit(UiEvent::LocationNotFound(key)),
                        other => self.report(&key, &other),
                    }
                }
                return;
            }
        };

        // Results that arrived are kept even when the job was cancelled.
        if let Err(e) = cache.put(key.clone(), current, forecast).await {
            tracing::error!("Failed to store {}: {}", key, e);
            if !token.is_cancelled() {
                self.report(&key, &e);
            }
            return;
        }

        if token.is_cancelled() {
            tracing::debug!("Add of {} cancelled after write, announcing on replay", key);
            self.settled_adds.lock().insert(key);
            return;
        }
        self.announce_added(key).await;
    }

    async fn announce_added(&self, key: LocationKey) {
        tracing::info!("Location added: {}", key);
        self.publish_list().await;
        self.emit(UiEvent::LocationAdded(key));
    }
}
