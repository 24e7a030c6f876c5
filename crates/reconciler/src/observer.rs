//! Live state observer
//!
//! One observer per destination keeps a versioned, copy-on-write cache of
//! every live object. Readers take an `Arc` snapshot without locking; the
//! observer loop swaps in a new snapshot on every change. The loop prefers
//! a watch and falls back to polling when the destination cannot stream
//! or the stream breaks; a periodic full resync heals missed events.

use crate::destination::{Destination, WatchEvent};
use crate::error::ApplyError;
use crate::manifest;
use crate::registry::ResourceRegistry;
use crate::resource::ManagedResource;
use crate::types::ResourceKey;
use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObserverConfig {
    /// Full relist cadence, also how often a broken watch is retried
    pub resync_interval: Duration,
    /// Polling cadence when no watch is available
    pub poll_interval: Duration,
    /// Polled data older than this is reported Stale
    pub staleness_bound: Duration,
    /// Capacity of the change event channel
    pub event_buffer: usize,
}

impl Default for ObserverConfig {
    fn default() -> Self {
        Self {
            resync_interval: Duration::from_secs(300),
            poll_interval: Duration::from_secs(3),
            staleness_bound: Duration::from_secs(10),
            event_buffer: 1024,
        }
    }
}

/// How far cached data can be trusted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Freshness {
    Fresh,
    /// Older than the staleness bound
    Stale,
    /// Never listed, or the watch broke and no relist has succeeded since
    Unknown,
}

/// An immutable view of one destination
#[derive(Debug, Clone, Default)]
pub struct LiveSnapshot {
    /// Bumped on every change
    pub version: u64,
    pub resources: BTreeMap<ResourceKey, Arc<Value>>,
    /// Last time the content was confirmed against the destination
    pub refreshed_at: Option<Instant>,
    pub watching: bool,
    pub unknown: bool,
}

impl LiveSnapshot {
    pub fn freshness(&self, now: Instant, staleness_bound: Duration) -> Freshness {
        match self.refreshed_at {
            None => Freshness::Unknown,
            Some(_) if self.unknown => Freshness::Unknown,
            Some(_) if self.watching => Freshness::Fresh,
            Some(at) if now.duration_since(at) > staleness_bound => Freshness::Stale,
            Some(_) => Freshness::Fresh,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Added,
    Modified,
    Deleted,
}

/// Published for every cache change
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeEvent {
    Resource {
        kind: ChangeKind,
        key: ResourceKey,
        /// Owning application, from the tracking label
        instance: Option<String>,
        version: u64,
    },
    /// The cache as a whole became untrustworthy, or recovered
    Invalidated { version: u64 },
}

/// Which live objects an application cares about
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceSelector {
    /// Objects carrying this tracking label
    pub instance: Option<String>,
    /// Objects with these identities, labelled or not
    pub keys: BTreeSet<ResourceKey>,
}

impl ResourceSelector {
    pub fn for_app(app: &str, keys: impl IntoIterator<Item = ResourceKey>) -> Self {
        Self {
            instance: Some(app.to_string()),
            keys: keys.into_iter().collect(),
        }
    }

    pub fn matches(&self, key: &ResourceKey, object: &Value) -> bool {
        self.keys.contains(key)
            || self
                .instance
                .as_deref()
                .is_some_and(|app| manifest::instance(object) == Some(app))
    }
}

/// Selected live objects plus how far they can be trusted
#[derive(Debug, Clone)]
pub struct LiveView {
    pub resources: Vec<ManagedResource>,
    pub freshness: Freshness,
    pub version: u64,
}

/// Shared handle to a destination's cache
#[derive(Debug, Clone)]
pub struct LiveCache {
    snapshot: Arc<ArcSwap<LiveSnapshot>>,
    changes: broadcast::Sender<ChangeEvent>,
    /// Serializes writers; readers never take it
    write: Arc<Mutex<()>>,
    staleness_bound: Duration,
}

impl LiveCache {
    pub fn new(event_buffer: usize, staleness_bound: Duration) -> Self {
        let (changes, _rx) = broadcast::channel(event_buffer.max(1));
        Self {
            snapshot: Arc::new(ArcSwap::from_pointee(LiveSnapshot::default())),
            changes,
            write: Arc::new(Mutex::new(())),
            staleness_bound,
        }
    }

    pub fn snapshot(&self) -> Arc<LiveSnapshot> {
        self.snapshot.load_full()
    }

    pub fn freshness(&self) -> Freshness {
        self.snapshot().freshness(Instant::now(), self.staleness_bound)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.changes.subscribe()
    }

    /// Live objects matching `selector`
    pub fn current_state(&self, selector: &ResourceSelector, registry: &ResourceRegistry) -> LiveView {
        let snapshot = self.snapshot();
        let resources = snapshot
            .resources
            .iter()
            .filter(|(key, object)| selector.matches(key, object))
            .filter_map(|(_, object)| ManagedResource::from_live(object.as_ref().clone(), registry))
            .collect();
        LiveView {
            resources,
            freshness: snapshot.freshness(Instant::now(), self.staleness_bound),
            version: snapshot.version,
        }
    }

    fn update(&self, change: impl FnOnce(&mut LiveSnapshot) -> Vec<ChangeEvent>) {
        let _guard = self.write.lock().unwrap_or_else(PoisonError::into_inner);
        let mut next = LiveSnapshot::clone(&self.snapshot.load());
        let events = change(&mut next);
        self.snapshot.store(Arc::new(next));
        for event in events {
            // No subscribers is fine
            let _ = self.changes.send(event);
        }
    }

    /// Replace the whole content after a successful list
    pub(crate) fn replace(&self, objects: Vec<Value>) {
        self.update(|snapshot| {
            let mut fresh = BTreeMap::new();
            for object in objects {
                if let Some(key) = manifest::live_key(&object) {
                    fresh.insert(key, Arc::new(object));
                }
            }

            let mut events = Vec::new();
            let was_unknown = snapshot.unknown || snapshot.refreshed_at.is_none();
            let version = snapshot.version + 1;
            for (key, object) in &fresh {
                let kind = match snapshot.resources.get(key) {
                    None => ChangeKind::Added,
                    Some(old) if old != object => ChangeKind::Modified,
                    Some(_) => continue,
                };
                events.push(resource_event(kind, key, object, version));
            }
            for (key, old) in &snapshot.resources {
                if !fresh.contains_key(key) {
                    events.push(resource_event(ChangeKind::Deleted, key, old, version));
                }
            }
            if was_unknown {
                events.push(ChangeEvent::Invalidated { version });
            }

            if !events.is_empty() {
                snapshot.version = version;
            }
            snapshot.resources = fresh;
            snapshot.refreshed_at = Some(Instant::now());
            snapshot.unknown = false;
            events
        });
    }

    /// Fold one watch event into the cache
    pub(crate) fn apply_event(&self, event: WatchEvent) {
        self.update(|snapshot| {
            let Some(key) = manifest::live_key(event.object()) else {
                return Vec::new();
            };
            let version = snapshot.version + 1;
            let change = match event {
                WatchEvent::Applied(object) => {
                    let object = Arc::new(object);
                    let kind = match snapshot.resources.insert(key.clone(), object.clone()) {
                        None => ChangeKind::Added,
                        Some(old) if old == object => return Vec::new(),
                        Some(_) => ChangeKind::Modified,
                    };
                    resource_event(kind, &key, &object, version)
                }
                WatchEvent::Deleted(object) => {
                    if snapshot.resources.remove(&key).is_none() {
                        return Vec::new();
                    }
                    resource_event(ChangeKind::Deleted, &key, &object, version)
                }
            };
            snapshot.version = version;
            snapshot.refreshed_at = Some(Instant::now());
            vec![change]
        });
    }

    pub(crate) fn set_watching(&self, watching: bool) {
        self.update(|snapshot| {
            snapshot.watching = watching;
            Vec::new()
        });
    }

    /// Flag the content as untrustworthy until the next successful list
    pub(crate) fn mark_unknown(&self) {
        self.update(|snapshot| {
            snapshot.watching = false;
            if snapshot.unknown {
                return Vec::new();
            }
            snapshot.unknown = true;
            snapshot.version += 1;
            vec![ChangeEvent::Invalidated {
                version: snapshot.version,
            }]
        });
    }
}

fn resource_event(kind: ChangeKind, key: &ResourceKey, object: &Value, version: u64) -> ChangeEvent {
    ChangeEvent::Resource {
        kind,
        key: key.clone(),
        instance: manifest::instance(object).map(str::to_string),
        version,
    }
}

/// Keeps one destination's [`LiveCache`] current
#[derive(Clone)]
pub struct Observer {
    destination: Arc<dyn Destination>,
    cache: LiveCache,
    config: ObserverConfig,
}

impl Observer {
    pub fn new(destination: Arc<dyn Destination>, config: ObserverConfig) -> Self {
        Self {
            cache: LiveCache::new(config.event_buffer, config.staleness_bound),
            destination,
            config,
        }
    }

    pub fn cache(&self) -> LiveCache {
        self.cache.clone()
    }

    pub fn destination_name(&self) -> &str {
        self.destination.name()
    }

    /// Full list from the destination into the cache
    pub async fn refresh(&self) -> Result<u64, ApplyError> {
        let objects = self.destination.list().await?;
        log::debug!(
            "Listed {} objects on {}",
            objects.len(),
            self.destination.name()
        );
        self.cache.replace(objects);
        Ok(self.cache.snapshot().version)
    }

    /// Run the observer loop until `cancel` fires
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(cancel).await })
    }

    async fn run(self, cancel: CancellationToken) {
        let name = self.destination.name().to_string();
        log::debug!("Observer for {name} started");

        while !cancel.is_cancelled() {
            if let Err(e) = self.refresh().await {
                log::warn!("Listing {name} failed: {e}");
                self.cache.mark_unknown();
                if !sleep_or_cancel(self.config.poll_interval, &cancel).await {
                    break;
                }
                continue;
            }

            match self.destination.watch().await {
                Ok(events) => {
                    self.cache.set_watching(true);
                    if !self.follow(events, &cancel).await {
                        break;
                    }
                    log::warn!("Watch on {name} disconnected, polling until it can be re-established");
                    self.cache.mark_unknown();
                    let deadline = Instant::now() + self.config.resync_interval;
                    if !self.poll(Some(deadline), &cancel).await {
                        break;
                    }
                }
                Err(ApplyError::WatchUnsupported { .. }) => {
                    log::debug!("{name} cannot be watched, polling every {:?}", self.config.poll_interval);
                    if !self.poll(None, &cancel).await {
                        break;
                    }
                }
                Err(e) => {
                    log::warn!("Watching {name} failed: {e}");
                    let deadline = Instant::now() + self.config.resync_interval;
                    if !self.poll(Some(deadline), &cancel).await {
                        break;
                    }
                }
            }
        }

        self.cache.set_watching(false);
        log::debug!("Observer for {name} stopped");
    }

    /// Consume watch events until the stream ends
    ///
    /// Returns false when cancelled.
    async fn follow(&self, mut events: mpsc::Receiver<WatchEvent>, cancel: &CancellationToken) -> bool {
        let mut resync = tokio::time::interval_at(
            Instant::now() + self.config.resync_interval,
            self.config.resync_interval,
        );
        resync.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = cancel.cancelled() => return false,
                event = events.recv() => match event {
                    Some(event) => self.cache.apply_event(event),
                    None => return true,
                },
                _ = resync.tick() => {
                    if let Err(e) = self.refresh().await {
                        log::warn!("Resync of {} failed: {e}", self.destination.name());
                        return true;
                    }
                }
            }
        }
    }

    /// Poll with full lists until `deadline` (forever when None)
    ///
    /// Returns false when cancelled.
    async fn poll(&self, deadline: Option<Instant>, cancel: &CancellationToken) -> bool {
        loop {
            if !sleep_or_cancel(self.config.poll_interval, cancel).await {
                return false;
            }
            if let Err(e) = self.refresh().await {
                log::warn!("Polling {} failed: {e}", self.destination.name());
                self.cache.mark_unknown();
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return true;
            }
        }
    }
}

/// Returns false if cancelled before the sleep finished
async fn sleep_or_cancel(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        () = cancel.cancelled() => false,
        () = tokio::time::sleep(duration) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::destination::{CallKind, FailureMode, MemoryDestination};
    use serde_json::json;

    fn config_map(name: &str, app: Option<&str>) -> Value {
        let mut object = json!({"apiVersion": "v1", "kind": "ConfigMap",
            "metadata": {"name": name, "namespace": "default"}});
        if let Some(app) = app {
            manifest::set_label(&mut object, manifest::INSTANCE_LABEL, app);
        }
        object
    }

    fn key(name: &str) -> ResourceKey {
        ResourceKey::new("", "ConfigMap", Some("default"), name)
    }

    fn config() -> ObserverConfig {
        ObserverConfig {
            resync_interval: Duration::from_secs(60),
            poll_interval: Duration::from_secs(2),
            staleness_bound: Duration::from_secs(5),
            event_buffer: 64,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_emits_changes() {
        let dest = Arc::new(MemoryDestination::new("mem"));
        dest.insert(config_map("a", Some("web")));
        let observer = Observer::new(dest.clone(), config());
        let cache = observer.cache();
        let mut changes = cache.subscribe();

        assert_eq!(cache.freshness(), Freshness::Unknown);
        observer.refresh().await.unwrap();
        assert_eq!(cache.freshness(), Freshness::Fresh);

        assert!(matches!(
            changes.recv().await.unwrap(),
            ChangeEvent::Resource { kind: ChangeKind::Added, instance: Some(ref app), .. } if app == "web"
        ));
        assert!(matches!(changes.recv().await.unwrap(), ChangeEvent::Invalidated { .. }));

        dest.remove(&key("a"));
        observer.refresh().await.unwrap();
        assert!(matches!(
            changes.recv().await.unwrap(),
            ChangeEvent::Resource { kind: ChangeKind::Deleted, .. }
        ));

        // Polled data ages out
        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(cache.freshness(), Freshness::Stale);
    }

    #[tokio::test(start_paused = true)]
    async fn test_selector() {
        let dest = Arc::new(MemoryDestination::new("mem"));
        dest.insert(config_map("owned", Some("web")));
        dest.insert(config_map("other", Some("api")));
        dest.insert(config_map("adopt", None));
        let observer = Observer::new(dest, config());
        observer.refresh().await.unwrap();

        let view = observer.cache().current_state(
            &ResourceSelector::for_app("web", [key("adopt")]),
            &ResourceRegistry::builtin(),
        );
        let names: Vec<_> = view.resources.iter().map(|r| r.key.name.as_str()).collect();
        assert_eq!(names, vec!["adopt", "owned"]);
        assert_eq!(view.freshness, Freshness::Fresh);
    }

    #[tokio::test(start_paused = true)]
    async fn test_watch_loop_and_disconnect_fallback() {
        let dest = Arc::new(MemoryDestination::new("mem"));
        let observer = Observer::new(dest.clone(), config());
        let cache = observer.cache();
        let cancel = CancellationToken::new();
        let handle = observer.spawn(cancel.clone());

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(cache.snapshot().watching);
        assert_eq!(dest.watcher_count(), 1);

        dest.insert(config_map("a", Some("web")));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(cache.snapshot().resources.contains_key(&key("a")));

        // Break the watch and make the next list fail: state must read Unknown
        dest.inject_failure(
            CallKind::List,
            None,
            ApplyError::Unavailable { message: "down".into() },
            FailureMode::Times(1),
        );
        dest.disconnect_watchers();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(cache.freshness(), Freshness::Unknown);

        // Polling picks up changes made while the watch is gone
        dest.insert(config_map("b", Some("web")));
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(cache.freshness(), Freshness::Fresh);
        assert!(cache.snapshot().resources.contains_key(&key("b")));

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_polling_when_watch_unsupported() {
        let dest = Arc::new(MemoryDestination::new("mem").without_watch());
        let observer = Observer::new(dest.clone(), config());
        let cache = observer.cache();
        let cancel = CancellationToken::new();
        let handle = observer.spawn(cancel.clone());

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!cache.snapshot().watching);

        dest.insert(config_map("late", None));
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(cache.snapshot().resources.contains_key(&key("late")));

        cancel.cancel();
        handle.await.unwrap();
    }
}
