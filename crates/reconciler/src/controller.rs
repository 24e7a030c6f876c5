//! Application controller - reconciliation loop and command surface
//!
//! Registered applications are reconciled by a bounded pool of workers. Work
//! arrives from three places: a periodic resync of every application, change
//! events published by the destination observers, and explicit commands.
//! A per-application lock is held from the start of a reconciliation pass
//! until the sync operation it started has ended, so one application never
//! runs two operations at once while different applications proceed in
//! parallel.

use crate::application::{
    Application, ApplicationStatus, ConditionKind, Decision, DecisionInput, ResourceStatus,
    RevisionMark, decide, self_heal_deferred_until,
};
use crate::destination::Destination;
use crate::diff::{self, DiffOptions, DiffSummary};
use crate::error::{ApplyError, ControllerError, Result};
use crate::events::{ChannelSink, Event, EventKind, EventSink, LogSink};
use crate::executor::{SyncOrchestrator, SyncSettings};
use crate::health;
use crate::manifest::{self, ManifestSet};
use crate::observer::{ChangeEvent, Freshness, Observer, ObserverConfig, ResourceSelector};
use crate::operation::{HistoryEntry, OperationPhase, SyncOperation, SyncTrigger};
use crate::planner::{PlanOptions, SyncPlan, select_targets};
use crate::registry::ResourceRegistry;
use crate::resource::{ManagedResource, desired_resources};
use crate::retry::{RetryError, with_retry};
use crate::source::ManifestSource;
use crate::types::{DiffAction, SyncStatus};
use chrono::Utc;
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{OwnedMutexGuard, OwnedSemaphorePermit, Semaphore, broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

const EVENT_BUFFER: usize = 256;

/// How often a manual sync re-checks a lock held by a comparison pass
const LOCK_RETRY: Duration = Duration::from_millis(100);

/// Controller-wide tuning
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControllerConfig {
    /// Reconciliation passes running at once
    pub concurrency: usize,
    /// Sync operations executing at once
    pub operation_processors: usize,
    /// How often every application is reconciled regardless of events
    pub resync_interval: Duration,
    /// Finished operations kept per application
    pub history_limit: usize,
    /// Minimum spacing between two self-heal syncs of one application
    pub self_heal_cooldown: Duration,
    pub max_inflight_per_destination: usize,
    pub observer: ObserverConfig,
    pub sync: SyncSettings,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            concurrency: 8,
            operation_processors: 4,
            resync_interval: Duration::from_secs(180),
            history_limit: 10,
            self_heal_cooldown: Duration::from_secs(5),
            max_inflight_per_destination: 8,
            observer: ObserverConfig::default(),
            sync: SyncSettings::default(),
        }
    }
}

/// Parameters of a manual sync
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncRequest {
    /// Revision to sync; the application's target revision when None
    pub revision: Option<String>,
    pub prune: bool,
    pub dry_run: bool,
    /// Restrict to these targets (`Kind`, `Kind/name` or `Kind/namespace/name`)
    pub resources: Vec<String>,
}

/// Desired against live for one application
#[derive(Debug, Clone)]
pub struct DiffReport {
    pub revision: String,
    pub digest: String,
    pub freshness: Freshness,
    pub sync: SyncStatus,
    pub resources: Vec<ManagedResource>,
}

impl DiffReport {
    pub fn summary(&self) -> DiffSummary {
        DiffSummary::from_resources(&self.resources)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Clone)]
struct DestinationHandle {
    destination: Arc<dyn Destination>,
    observer: Observer,
    /// Bounds concurrent apply calls against this destination
    inflight: Arc<Semaphore>,
}

struct ActiveOperation {
    cancel: CancellationToken,
    progress: watch::Receiver<SyncOperation>,
}

struct AppEntry {
    spec: Mutex<Application>,
    status: Mutex<ApplicationStatus>,
    /// Held for a whole reconciliation pass, including the operation it starts
    lock: Arc<tokio::sync::Mutex<()>>,
    active: Mutex<Option<ActiveOperation>>,
    /// Cancelled when the application is removed or the controller stops
    removed: CancellationToken,
    /// Bumped every time an operation ends
    finished: watch::Sender<u64>,
    /// A pass was turned away while the lock was held
    pending: AtomicBool,
    /// Start of the last self-heal, on the monotonic clock
    self_heal_at: Mutex<Option<Instant>>,
    /// Instant a cooldown wake is already scheduled for
    wake_at: Mutex<Option<Instant>>,
}

impl AppEntry {
    fn new(app: Application, history_limit: usize, shutdown: &CancellationToken) -> Self {
        let mut status = ApplicationStatus::default();
        status.history.set_limit(history_limit);
        Self {
            spec: Mutex::new(app),
            status: Mutex::new(status),
            lock: Arc::new(tokio::sync::Mutex::new(())),
            active: Mutex::new(None),
            removed: shutdown.child_token(),
            finished: watch::channel(0).0,
            pending: AtomicBool::new(false),
            self_heal_at: Mutex::new(None),
            wake_at: Mutex::new(None),
        }
    }

    fn spec(&self) -> Application {
        lock(&self.spec).clone()
    }

    fn operation_active(&self) -> bool {
        lock(&self.active).is_some()
    }
}

/// Exclusive hold on an application for a pass and the operation it starts
///
/// Dropping the lease queues the application again if a pass was turned
/// away while it was held.
struct Lease {
    guard: Option<OwnedMutexGuard<()>>,
    entry: Arc<AppEntry>,
    controller: Controller,
    name: String,
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.guard.take();
        if self.entry.pending.swap(false, Ordering::SeqCst) && !self.entry.removed.is_cancelled() {
            self.controller.enqueue(&self.name);
        }
    }
}

/// Rendered desired state compared against the live cache
struct Comparison {
    set: ManifestSet,
    resources: Vec<ManagedResource>,
    freshness: Freshness,
    sync: SyncStatus,
}

/// How an operation should run
struct Launch {
    trigger: SyncTrigger,
    plan: PlanOptions,
    dry_run: bool,
}

struct Shared {
    config: ControllerConfig,
    registry: Arc<ResourceRegistry>,
    source: Arc<dyn ManifestSource>,
    sink: Arc<dyn EventSink>,
    events: ChannelSink,
    destinations: Mutex<BTreeMap<String, DestinationHandle>>,
    apps: Mutex<BTreeMap<String, Arc<AppEntry>>>,
    queue: mpsc::UnboundedSender<String>,
    queue_rx: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
    /// Applications waiting in the queue, so each is queued at most once
    queued: Mutex<HashSet<String>>,
    workers: Arc<Semaphore>,
    operations: Arc<Semaphore>,
    shutdown: CancellationToken,
    started: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Handle to a running (or not yet started) controller
///
/// Cheap to clone; every clone drives the same set of applications.
#[derive(Clone)]
pub struct Controller {
    shared: Arc<Shared>,
}

impl Controller {
    pub fn new(
        registry: ResourceRegistry,
        source: Arc<dyn ManifestSource>,
        config: ControllerConfig,
    ) -> Self {
        let events = ChannelSink::new(EVENT_BUFFER);
        let (queue, queue_rx) = mpsc::unbounded_channel();
        let shared = Shared {
            registry: Arc::new(registry),
            source,
            sink: Arc::new((LogSink, events.clone())),
            events,
            destinations: Mutex::new(BTreeMap::new()),
            apps: Mutex::new(BTreeMap::new()),
            queue,
            queue_rx: Mutex::new(Some(queue_rx)),
            queued: Mutex::new(HashSet::new()),
            workers: Arc::new(Semaphore::new(config.concurrency.max(1))),
            operations: Arc::new(Semaphore::new(config.operation_processors.max(1))),
            shutdown: CancellationToken::new(),
            started: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
            config,
        };
        Self {
            shared: Arc::new(shared),
        }
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.shared.config
    }

    pub fn registry(&self) -> &ResourceRegistry {
        &self.shared.registry
    }

    /// Make a destination available to applications
    ///
    /// A destination name can only be added once.
    pub fn add_destination(&self, destination: Arc<dyn Destination>) {
        let name = destination.name().to_string();
        let handle = DestinationHandle {
            observer: Observer::new(destination.clone(), self.shared.config.observer),
            inflight: Arc::new(Semaphore::new(
                self.shared.config.max_inflight_per_destination.max(1),
            )),
            destination,
        };

        {
            let mut destinations = lock(&self.shared.destinations);
            if destinations.contains_key(&name) {
                log::warn!("Destination {name} is already registered, ignoring");
                return;
            }
            destinations.insert(name.clone(), handle.clone());
        }
        if self.shared.started.load(Ordering::SeqCst) {
            self.spawn_observer(&name, &handle);
        }
    }

    pub fn register(&self, app: Application) -> Result<()> {
        self.destination_for(&app)?;
        let name = app.name.clone();
        {
            let mut apps = lock(&self.shared.apps);
            if apps.contains_key(&name) {
                return Err(ControllerError::DuplicateApplication(name));
            }
            let entry = AppEntry::new(app, self.shared.config.history_limit, &self.shared.shutdown);
            apps.insert(name.clone(), Arc::new(entry));
        }
        log::info!("Registered application {name}");
        self.enqueue(&name);
        Ok(())
    }

    /// Replace an application's descriptor; takes effect on the next pass
    pub fn update_application(&self, app: Application) -> Result<()> {
        self.destination_for(&app)?;
        let entry = self.entry(&app.name)?;
        let name = app.name.clone();
        *lock(&entry.spec) = app;
        self.enqueue(&name);
        Ok(())
    }

    /// Seed status from a previous run, before [`Controller::start`]
    ///
    /// An operation that was still active when the status was saved can no
    /// longer be running; it is closed as an error and moved to history.
    pub fn restore_status(&self, name: &str, mut status: ApplicationStatus) -> Result<()> {
        let entry = self.entry(name)?;
        if let Some(op) = status.operation.as_mut()
            && op.phase.is_active()
        {
            op.finish(OperationPhase::Error, "interrupted by controller restart");
            status.history.push(HistoryEntry::from(&*op));
        }
        status.history.set_limit(self.shared.config.history_limit);
        *lock(&entry.status) = status;
        Ok(())
    }

    /// Relist every destination into its cache
    ///
    /// Lets one-shot commands work without the observer loops running.
    pub async fn refresh_destinations(&self) -> Result<()> {
        let observers: Vec<Observer> = lock(&self.shared.destinations)
            .values()
            .map(|h| h.observer.clone())
            .collect();
        for observer in observers {
            observer.refresh().await?;
        }
        Ok(())
    }

    /// Spawn the observers, the worker pool and the resync ticker
    ///
    /// Must be called from within a tokio runtime. Calling it twice is a no-op.
    pub fn start(&self) {
        if self.shared.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let Some(queue) = lock(&self.shared.queue_rx).take() else {
            return;
        };

        let destinations: Vec<(String, DestinationHandle)> = lock(&self.shared.destinations)
            .iter()
            .map(|(name, handle)| (name.clone(), handle.clone()))
            .collect();
        for (name, handle) in &destinations {
            self.spawn_observer(name, handle);
        }

        self.track(tokio::spawn(self.clone().dispatch(queue)));
        self.track(tokio::spawn(self.clone().resync_loop()));
        log::info!(
            "Controller started: {} destinations, {} workers",
            destinations.len(),
            self.shared.config.concurrency
        );
    }

    /// Abort running operations and wait for every background task
    pub async fn shutdown(&self) {
        self.shared.shutdown.cancel();
        let tasks: Vec<JoinHandle<()>> = lock(&self.shared.tasks).drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await
                && e.is_panic()
            {
                log::error!("Controller task panicked: {e}");
            }
        }
        log::info!("Controller stopped");
    }

    pub fn applications(&self) -> Vec<String> {
        lock(&self.shared.apps).keys().cloned().collect()
    }

    pub fn application(&self, name: &str) -> Result<Application> {
        Ok(self.entry(name)?.spec())
    }

    /// Current status, with live progress of a running operation
    pub fn status(&self, name: &str) -> Result<ApplicationStatus> {
        let entry = self.entry(name)?;
        let mut status = lock(&entry.status).clone();
        if let Some(active) = lock(&entry.active).as_ref() {
            status.operation = Some(active.progress.borrow().clone());
        }
        Ok(status)
    }

    /// Finished operations, newest first
    pub fn history(&self, name: &str) -> Result<Vec<HistoryEntry>> {
        let entry = self.entry(name)?;
        let status = lock(&entry.status);
        Ok(status.history.entries().cloned().collect())
    }

    /// Structured status events from every application
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.shared.events.subscribe()
    }

    /// One reconciliation pass
    ///
    /// Renders the target revision, compares it with the live cache, records
    /// the result in status and starts a sync if the policy calls for one.
    /// A pass that finds the application busy returns
    /// [`Decision::AlreadySyncing`]; another pass runs once it is free.
    /// Drift held back by the self-heal cooldown is looked at again when
    /// the cooldown ends.
    pub async fn reconcile(&self, name: &str) -> Result<Decision> {
        let entry = self.entry(name)?;
        let Ok(guard) = entry.lock.clone().try_lock_owned() else {
            entry.pending.store(true, Ordering::SeqCst);
            // The holder may have let go before the flag was set
            if entry.lock.try_lock().is_ok() && entry.pending.swap(false, Ordering::SeqCst) {
                self.enqueue(name);
            }
            return Ok(Decision::AlreadySyncing);
        };
        let lease = self.lease(name, &entry, guard);
        let app = entry.spec();
        let comparison = self.compare(&entry, &app, None).await?;
        self.record_comparison(&entry, &app, &comparison);

        let last_self_heal = *lock(&entry.self_heal_at);
        let (decision, deferred) = {
            let status = lock(&entry.status);
            let input = DecisionInput {
                policy: &app.policy,
                status: &status,
                revision: &comparison.set.revision,
                digest: &comparison.set.digest,
                sync: comparison.sync,
                actionable_drift: actionable_drift(&comparison.resources, app.policy.prune()),
                operation_active: status.operation_active(),
                manual_requested: false,
                now: Instant::now(),
                last_self_heal,
                self_heal_cooldown: self.shared.config.self_heal_cooldown,
            };
            (decide(&input), self_heal_deferred_until(&input))
        };
        log::debug!("{name}: {:?} -> {decision:?}", comparison.sync);
        if let Some(at) = deferred {
            log::debug!("{name}: self-heal deferred by cooldown");
            self.enqueue_at(name, &entry, at);
        }

        if let Decision::StartSync { trigger, .. } = &decision {
            let launch = Launch {
                trigger: *trigger,
                plan: PlanOptions {
                    prune: app.policy.prune(),
                    only: None,
                    force_apply: comparison.freshness != Freshness::Fresh,
                },
                dry_run: false,
            };
            self.start_operation(&entry, lease, &app, &comparison, launch)?;
        }
        Ok(decision)
    }

    /// Start a manual sync
    pub async fn sync(&self, name: &str, request: SyncRequest) -> Result<Decision> {
        self.start_manual(name, request, SyncTrigger::Manual).await
    }

    /// Re-sync a revision that previously synced successfully
    pub async fn rollback(&self, name: &str, revision: &str) -> Result<Decision> {
        let entry = self.entry(name)?;
        if entry.spec().policy.is_automated() {
            return Err(ControllerError::RollbackWithAutomatedSync(name.to_string()));
        }
        let known = lock(&entry.status).history.succeeded(revision).is_some();
        if !known {
            return Err(ControllerError::RevisionNotInHistory {
                app: name.to_string(),
                revision: revision.to_string(),
            });
        }
        let request = SyncRequest {
            revision: Some(revision.to_string()),
            ..SyncRequest::default()
        };
        self.start_manual(name, request, SyncTrigger::Rollback).await
    }

    /// Compare the target revision with live state, without syncing
    pub async fn diff(&self, name: &str) -> Result<DiffReport> {
        let entry = self.entry(name)?;
        let app = entry.spec();
        let comparison = self.compare(&entry, &app, None).await?;
        self.record_comparison(&entry, &app, &comparison);
        Ok(DiffReport {
            revision: comparison.set.revision,
            digest: comparison.set.digest,
            freshness: comparison.freshness,
            sync: comparison.sync,
            resources: comparison.resources,
        })
    }

    /// Request termination of the running operation
    ///
    /// Returns false if nothing was running.
    pub fn abort(&self, name: &str) -> Result<bool> {
        let entry = self.entry(name)?;
        let active = lock(&entry.active);
        match active.as_ref() {
            Some(op) => {
                log::info!("Aborting operation on {name}");
                op.cancel.cancel();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Wait until no operation is active, returning the latest one
    pub async fn wait_for_operation(&self, name: &str) -> Result<Option<SyncOperation>> {
        let entry = self.entry(name)?;
        let mut finished = entry.finished.subscribe();
        while entry.operation_active() {
            if finished.changed().await.is_err() {
                break;
            }
        }
        let operation = lock(&entry.status).operation.clone();
        Ok(operation)
    }

    /// Unregister an application
    ///
    /// A running operation is aborted first. With `cascade`, every live
    /// object carrying the application's tracking label is deleted, highest
    /// wave first. Returns the number of deleted objects.
    pub async fn remove_application(&self, name: &str, cascade: bool) -> Result<usize> {
        let entry = lock(&self.shared.apps)
            .remove(name)
            .ok_or_else(|| ControllerError::UnknownApplication(name.to_string()))?;
        entry.removed.cancel();
        let _guard = entry.lock.clone().lock_owned().await;

        let app = entry.spec();
        let deleted = if cascade {
            let handle = self.destination_for(&app)?;
            self.delete_owned(&app, &handle).await?
        } else {
            0
        };
        self.emit(
            name,
            EventKind::ApplicationRemoved,
            format!("removed ({deleted} resources deleted)"),
        );
        Ok(deleted)
    }

    fn entry(&self, name: &str) -> Result<Arc<AppEntry>> {
        lock(&self.shared.apps)
            .get(name)
            .cloned()
            .ok_or_else(|| ControllerError::UnknownApplication(name.to_string()))
    }

    fn destination_for(&self, app: &Application) -> Result<DestinationHandle> {
        lock(&self.shared.destinations)
            .get(&app.destination.name)
            .cloned()
            .ok_or_else(|| ControllerError::UnknownDestination {
                app: app.name.clone(),
                destination: app.destination.name.clone(),
            })
    }

    fn emit(&self, app: &str, kind: EventKind, message: impl Into<String>) {
        self.shared.sink.emit(&Event::new(app, kind, message));
    }

    fn track(&self, task: JoinHandle<()>) {
        let mut tasks = lock(&self.shared.tasks);
        tasks.retain(|t| !t.is_finished());
        tasks.push(task);
    }

    fn enqueue(&self, name: &str) {
        if lock(&self.shared.queued).insert(name.to_string()) {
            // Only fails once the dispatcher is gone, at shutdown
            let _ = self.shared.queue.send(name.to_string());
        }
    }

    /// Queue `name` at `at`, unless a wake for that instant already exists
    fn enqueue_at(&self, name: &str, entry: &AppEntry, at: Instant) {
        {
            let mut wake_at = lock(&entry.wake_at);
            if *wake_at == Some(at) {
                return;
            }
            *wake_at = Some(at);
        }
        let controller = self.clone();
        let name = name.to_string();
        let removed = entry.removed.clone();
        self.track(tokio::spawn(async move {
            tokio::select! {
                () = removed.cancelled() => {}
                () = tokio::time::sleep_until(at) => controller.enqueue(&name),
            }
        }));
    }

    fn lease(&self, name: &str, entry: &Arc<AppEntry>, guard: OwnedMutexGuard<()>) -> Lease {
        Lease {
            guard: Some(guard),
            entry: entry.clone(),
            controller: self.clone(),
            name: name.to_string(),
        }
    }

    /// Names of the applications deployed to `destination`
    fn apps_on(&self, destination: &str) -> Vec<(String, Arc<AppEntry>)> {
        lock(&self.shared.apps)
            .iter()
            .filter(|(_, entry)| lock(&entry.spec).destination.name == destination)
            .map(|(name, entry)| (name.clone(), entry.clone()))
            .collect()
    }

    fn spawn_observer(&self, name: &str, handle: &DestinationHandle) {
        // Subscribe before the observer runs so its first list is not missed
        let changes = handle.observer.cache().subscribe();
        self.track(handle.observer.clone().spawn(self.shared.shutdown.child_token()));
        self.track(tokio::spawn(
            self.clone().route_changes(name.to_string(), changes),
        ));
    }

    async fn dispatch(self, mut queue: mpsc::UnboundedReceiver<String>) {
        loop {
            let name = tokio::select! {
                () = self.shared.shutdown.cancelled() => break,
                name = queue.recv() => match name {
                    Some(name) => name,
                    None => break,
                },
            };
            let permit = tokio::select! {
                () = self.shared.shutdown.cancelled() => break,
                permit = self.shared.workers.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };
            lock(&self.shared.queued).remove(&name);

            let controller = self.clone();
            tokio::spawn(async move {
                let _permit = permit;
                match controller.reconcile(&name).await {
                    Ok(decision) => log::trace!("Reconciled {name}: {decision:?}"),
                    Err(ControllerError::UnknownApplication(_)) => {}
                    Err(e) => log::warn!("Reconciling {name} failed: {e}"),
                }
            });
        }
        log::debug!("Dispatcher stopped");
    }

    async fn resync_loop(self) {
        let mut ticker = tokio::time::interval(self.shared.config.resync_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = self.shared.shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    for name in self.applications() {
                        self.enqueue(&name);
                    }
                }
            }
        }
    }

    /// Wake the applications affected by live-state changes
    async fn route_changes(self, destination: String, mut changes: broadcast::Receiver<ChangeEvent>) {
        loop {
            let event = tokio::select! {
                () = self.shared.shutdown.cancelled() => break,
                event = changes.recv() => event,
            };
            match event {
                Ok(ChangeEvent::Resource {
                    instance: Some(app),
                    ..
                }) => {
                    if self.apps_on(&destination).iter().any(|(name, _)| *name == app) {
                        self.enqueue(&app);
                    }
                }
                // Unlabelled objects only matter to apps that declare them
                Ok(ChangeEvent::Resource {
                    key, instance: None, ..
                }) => {
                    for (name, entry) in self.apps_on(&destination) {
                        let declared = lock(&entry.status).resources.iter().any(|r| r.key == key);
                        if declared {
                            self.enqueue(&name);
                        }
                    }
                }
                Ok(ChangeEvent::Invalidated { .. }) | Err(broadcast::error::RecvError::Lagged(_)) => {
                    for (name, _) in self.apps_on(&destination) {
                        self.enqueue(&name);
                    }
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    async fn render(
        &self,
        app: &Application,
        revision: Option<&str>,
    ) -> Result<(ManifestSet, Vec<ManagedResource>)> {
        let set = self.shared.source.resolve(app, revision).await?;
        let desired = desired_resources(
            &set,
            app.destination.namespace.as_deref(),
            &self.shared.registry,
        )?;
        Ok((set, desired))
    }

    async fn compare(
        &self,
        entry: &AppEntry,
        app: &Application,
        revision: Option<&str>,
    ) -> Result<Comparison> {
        let handle = self.destination_for(app)?;
        let (set, desired) = match self.render(app, revision).await {
            Ok(rendered) => rendered,
            Err(e) => {
                if revision.is_none() {
                    self.record_render_failure(entry, app, &e);
                }
                return Err(e);
            }
        };

        let selector = ResourceSelector::for_app(&app.name, desired.iter().map(|r| r.key.clone()));
        let view = handle
            .observer
            .cache()
            .current_state(&selector, &self.shared.registry);
        let mut resources = diff::diff(
            desired,
            view.resources,
            DiffOptions {
                app: &app.name,
                ignore: &app.ignore_differences,
            },
        );
        if view.freshness != Freshness::Fresh {
            diff::mark_unknown(&mut resources);
        }
        let snapshot = handle.observer.cache().snapshot();
        let neighbours: Vec<&Value> = snapshot.resources.values().map(|v| &**v).collect();
        health::assess_all(&self.shared.registry, &mut resources, &neighbours);

        Ok(Comparison {
            sync: diff::sync_status(&resources),
            set,
            resources,
            freshness: view.freshness,
        })
    }

    fn record_render_failure(&self, entry: &AppEntry, app: &Application, error: &ControllerError) {
        {
            let mut status = lock(&entry.status);
            status.sync = SyncStatus::Unknown;
            status.set_condition(ConditionKind::RenderError, error.to_string());
            status.reconciled_at = Some(Utc::now());
        }
        self.emit(&app.name, EventKind::RenderFailed, error.to_string());
    }

    fn record_comparison(&self, entry: &AppEntry, app: &Application, comparison: &Comparison) {
        let health = health::aggregate(&comparison.resources);
        let (previous_sync, previous_health, drifted) = {
            let mut status = lock(&entry.status);
            let previous = (status.sync, status.health);
            status.sync = comparison.sync;
            status.health = health;
            status.observed = Some(RevisionMark::new(
                &comparison.set.revision,
                &comparison.set.digest,
            ));
            status.resources = comparison.resources.iter().map(ResourceStatus::from).collect();
            status.reconciled_at = Some(Utc::now());
            status.clear_condition(ConditionKind::RenderError);
            if comparison.freshness == Freshness::Fresh {
                status.clear_condition(ConditionKind::ComparisonUnknown);
            } else {
                status.set_condition(
                    ConditionKind::ComparisonUnknown,
                    format!(
                        "live state of {} is {:?}",
                        app.destination.name, comparison.freshness
                    ),
                );
            }
            let drifted: Vec<String> = status
                .drifted()
                .filter(|r| r.foreign)
                .map(|r| r.key.to_string())
                .collect();
            (previous.0, previous.1, drifted)
        };

        if previous_sync != comparison.sync {
            self.emit(
                &app.name,
                EventKind::SyncStatusChanged,
                format!("{previous_sync} -> {}", comparison.sync),
            );
            if comparison.sync == SyncStatus::OutOfSync && !drifted.is_empty() {
                self.emit(
                    &app.name,
                    EventKind::DriftDetected,
                    format!("changed outside the controller: {}", drifted.join(", ")),
                );
            }
        }
        if previous_health != health {
            self.emit(
                &app.name,
                EventKind::HealthStatusChanged,
                format!("{previous_health} -> {health}"),
            );
        }
    }

    async fn start_manual(&self, name: &str, request: SyncRequest, trigger: SyncTrigger) -> Result<Decision> {
        let entry = self.entry(name)?;
        let guard = loop {
            if entry.operation_active() {
                return Ok(Decision::AlreadySyncing);
            }
            match entry.lock.clone().try_lock_owned() {
                Ok(guard) => break guard,
                // A comparison pass holds the lock; it ends soon or starts an operation
                Err(_) => tokio::time::sleep(LOCK_RETRY).await,
            }
        };
        let lease = self.lease(name, &entry, guard);

        let app = entry.spec();
        let handle = self.destination_for(&app)?;
        if handle.observer.cache().freshness() != Freshness::Fresh
            && let Err(e) = handle.observer.refresh().await
        {
            log::warn!("Refreshing {} before sync failed: {e}", app.destination.name);
        }

        let comparison = self
            .compare(&entry, &app, request.revision.as_deref())
            .await?;
        if request.revision.is_none() {
            self.record_comparison(&entry, &app, &comparison);
        }

        let only = (!request.resources.is_empty())
            .then(|| select_targets(&comparison.resources, &request.resources));
        let launch = Launch {
            trigger,
            plan: PlanOptions {
                prune: request.prune,
                only,
                force_apply: comparison.freshness != Freshness::Fresh,
            },
            dry_run: request.dry_run,
        };
        self.start_operation(&entry, lease, &app, &comparison, launch)?;
        Ok(Decision::StartSync {
            revision: comparison.set.revision,
            trigger,
        })
    }

    /// Plan and spawn an operation; the operation task owns the lease
    fn start_operation(
        &self,
        entry: &Arc<AppEntry>,
        lease: Lease,
        app: &Application,
        comparison: &Comparison,
        launch: Launch,
    ) -> Result<()> {
        let handle = self.destination_for(app)?;
        let plan = SyncPlan::build(&comparison.resources, &self.shared.registry, &launch.plan);
        let selective = launch.plan.only.is_some();

        let op = {
            let mut status = lock(&entry.status);
            let mut op = SyncOperation::new(
                status.next_operation_id(),
                &app.name,
                &comparison.set.revision,
                &comparison.set.digest,
                launch.trigger,
            );
            op.dry_run = launch.dry_run;
            op.prune = launch.plan.prune;
            match launch.trigger {
                SyncTrigger::Automated => {
                    status.last_automated = Some(RevisionMark::new(
                        &comparison.set.revision,
                        &comparison.set.digest,
                    ));
                }
                SyncTrigger::SelfHeal => {
                    status.last_self_heal_at = Some(Utc::now());
                    *lock(&entry.self_heal_at) = Some(Instant::now());
                }
                SyncTrigger::Manual | SyncTrigger::Rollback => {}
            }
            status.operation = Some(op.clone());
            op
        };
        log::info!(
            "Starting {} sync #{} of {} at {}",
            launch.trigger,
            op.id,
            app.name,
            op.revision
        );

        let cancel = entry.removed.child_token();
        let (progress, progress_rx) = watch::channel(op.clone());
        *lock(&entry.active) = Some(ActiveOperation {
            cancel: cancel.clone(),
            progress: progress_rx,
        });

        let orchestrator = SyncOrchestrator::new(
            handle.destination.clone(),
            self.shared.registry.clone(),
            handle.inflight.clone(),
            self.shared.sink.clone(),
            self.shared.config.sync,
        );
        let retry = app.policy.retry;
        let controller = self.clone();
        let entry = entry.clone();

        self.track(tokio::spawn(async move {
            let _lease = lease;
            let finished = match controller.acquire_processor(&cancel).await {
                Some(_permit) => orchestrator.run(&plan, op, retry, &cancel, &progress).await,
                None => {
                    let mut op = op;
                    op.finish(OperationPhase::Error, "operation aborted");
                    op
                }
            };
            controller
                .complete(&entry, &handle.observer, finished, selective)
                .await;
        }));
        Ok(())
    }

    async fn acquire_processor(&self, cancel: &CancellationToken) -> Option<OwnedSemaphorePermit> {
        tokio::select! {
            biased;
            () = cancel.cancelled() => None,
            permit = self.shared.operations.clone().acquire_owned() => permit.ok(),
        }
    }

    /// Record a finished operation and refresh status against the new live state
    async fn complete(&self, entry: &AppEntry, observer: &Observer, op: SyncOperation, selective: bool) {
        if !op.dry_run
            && let Err(e) = observer.refresh().await
        {
            log::warn!("Refreshing {} after sync failed: {e}", observer.destination_name());
        }

        let (id, phase) = (op.id, op.phase);
        {
            let mut status = lock(&entry.status);
            if op.phase == OperationPhase::Succeeded && !op.dry_run && !selective {
                status.last_synced = Some(RevisionMark::new(&op.revision, &op.digest));
            }
            if !op.dry_run {
                status.history.push(HistoryEntry::from(&op));
            }
            status.operation = Some(op);
        }
        *lock(&entry.active) = None;

        let app = entry.spec();
        if !entry.removed.is_cancelled() {
            match self.compare(entry, &app, None).await {
                Ok(comparison) => self.record_comparison(entry, &app, &comparison),
                Err(e) => log::debug!("Post-sync comparison of {} failed: {e}", app.name),
            }
        }
        self.emit(
            &app.name,
            EventKind::OperationRecorded,
            format!("#{id} {phase} recorded"),
        );
        entry.finished.send_modify(|n| *n += 1);
    }

    async fn delete_owned(&self, app: &Application, handle: &DestinationHandle) -> Result<usize> {
        let registry = &self.shared.registry;
        let mut owned: Vec<ManagedResource> = handle
            .destination
            .list()
            .await?
            .into_iter()
            .filter(|object| manifest::instance(object) == Some(app.name.as_str()))
            .filter_map(|object| ManagedResource::from_live(object, registry))
            .collect();
        let weight = |r: &ManagedResource| registry.describe(&r.key.group_kind()).prune_weight;
        owned.sort_by(|a, b| {
            b.wave
                .cmp(&a.wave)
                .then_with(|| weight(b).cmp(&weight(a)))
                .then_with(|| b.key.cmp(&a.key))
        });

        let cancel = self.shared.shutdown.child_token();
        for resource in &owned {
            let key = &resource.key;
            with_retry(
                &app.policy.retry,
                &cancel,
                |attempt, error, delay| {
                    log::warn!("Deleting {key} failed (attempt {attempt}): {error}, retrying in {delay:?}");
                },
                || {
                    let destination = handle.destination.clone();
                    let key = key.clone();
                    async move {
                        match destination.delete(&key).await {
                            Err(e) if e.is_not_found() => Ok(()),
                            other => other,
                        }
                    }
                },
            )
            .await
            .map_err(|e| match e {
                RetryError::Failed { error, .. } => ControllerError::Destination(error),
                RetryError::Cancelled { .. } => ControllerError::Destination(ApplyError::Unavailable {
                    message: "controller is shutting down".to_string(),
                }),
            })?;
            log::info!("Deleted {key} of {}", app.name);
        }

        if let Err(e) = handle.observer.refresh().await {
            log::warn!("Refreshing {} after cascade delete failed: {e}", handle.destination.name());
        }
        Ok(owned.len())
    }
}

/// Whether a sync would change anything on the destination
fn actionable_drift(resources: &[ManagedResource], prune: bool) -> bool {
    resources
        .iter()
        .filter(|r| !r.is_hook() && r.diff.is_out_of_sync())
        .any(|r| match r.diff.action {
            DiffAction::Create | DiffAction::Update => true,
            DiffAction::Prune => prune && r.live.as_ref().is_some_and(|l| !manifest::prune_disabled(l)),
            DiffAction::None => false,
        })
}
