//! In-memory destination with watch support and fault injection

use super::{Destination, WatchEvent, admit, settle_status};
use crate::error::ApplyError;
use crate::manifest;
use crate::types::ResourceKey;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tokio::time::Instant;

const WATCH_BUFFER: usize = 256;

/// Destination call kinds, for fault injection and the call log
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    Get,
    List,
    Watch,
    Apply,
    Delete,
}

/// How long an injected failure stays armed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureMode {
    Times(u32),
    Always,
}

#[derive(Debug)]
struct InjectedFailure {
    call: CallKind,
    /// None matches every key
    key: Option<ResourceKey>,
    error: ApplyError,
    mode: FailureMode,
}

/// One call made against the destination
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCall {
    pub call: CallKind,
    pub key: Option<ResourceKey>,
    pub at: Instant,
    pub succeeded: bool,
}

#[derive(Debug, Default)]
struct State {
    objects: BTreeMap<ResourceKey, Value>,
    revision: u64,
    watchers: Vec<mpsc::Sender<WatchEvent>>,
    failures: Vec<InjectedFailure>,
    calls: Vec<RecordedCall>,
    watch_supported: bool,
}

impl State {
    fn next_revision(&mut self) -> u64 {
        self.revision += 1;
        self.revision
    }

    /// Deliver an event; full or closed watchers are dropped so they relist
    fn notify(&mut self, event: &WatchEvent) {
        self.watchers.retain(|tx| tx.try_send(event.clone()).is_ok());
    }

    fn take_failure(&mut self, call: CallKind, key: Option<&ResourceKey>) -> Option<ApplyError> {
        let index = self.failures.iter().position(|f| {
            f.call == call && (f.key.is_none() || f.key.as_ref() == key)
        })?;
        let error = self.failures[index].error.clone();
        match self.failures[index].mode {
            FailureMode::Always => {}
            FailureMode::Times(n) if n <= 1 => {
                self.failures.remove(index);
            }
            FailureMode::Times(n) => self.failures[index].mode = FailureMode::Times(n - 1),
        }
        Some(error)
    }

    fn record(&mut self, call: CallKind, key: Option<&ResourceKey>, succeeded: bool) {
        self.calls.push(RecordedCall {
            call,
            key: key.cloned(),
            at: Instant::now(),
            succeeded,
        });
    }

    /// Record the call and fail it if a failure is armed
    fn check(&mut self, call: CallKind, key: Option<&ResourceKey>) -> Result<(), ApplyError> {
        let failure = self.take_failure(call, key);
        self.record(call, key, failure.is_none());
        failure.map_or(Ok(()), Err)
    }
}

/// Destination held entirely in memory
///
/// Besides the [`Destination`] calls it offers hooks to play the role of
/// other actors: workload controllers updating status, users editing
/// objects by hand, flaky networks.
#[derive(Debug)]
pub struct MemoryDestination {
    name: String,
    settle: bool,
    state: Mutex<State>,
}

impl MemoryDestination {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            settle: false,
            state: Mutex::new(State {
                watch_supported: true,
                ..State::default()
            }),
        }
    }

    /// Bring workloads to ready as soon as they are applied
    pub fn with_settle(mut self, settle: bool) -> Self {
        self.settle = settle;
        self
    }

    /// Refuse watches, forcing observers to poll
    pub fn without_watch(self) -> Self {
        self.lock().watch_supported = false;
        self
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make calls of one kind fail, optionally only for one key
    pub fn inject_failure(
        &self,
        call: CallKind,
        key: Option<ResourceKey>,
        error: ApplyError,
        mode: FailureMode,
    ) {
        self.lock().failures.push(InjectedFailure {
            call,
            key,
            error,
            mode,
        });
    }

    pub fn clear_failures(&self) {
        self.lock().failures.clear();
    }

    /// Store an object directly, as if created by another actor
    pub fn insert(&self, object: Value) -> Option<ResourceKey> {
        let key = manifest::live_key(&object)?;
        let mut state = self.lock();
        let revision = state.next_revision();
        let existing = state.objects.get(&key).cloned();
        let mut stored = admit(existing.as_ref(), &object, revision);
        if let Some(status) = object.get("status")
            && let Some(map) = stored.as_object_mut()
        {
            map.insert("status".to_string(), status.clone());
        }
        state.objects.insert(key.clone(), stored.clone());
        state.notify(&WatchEvent::Applied(stored));
        Some(key)
    }

    /// Edit a stored object in place, as an external actor would
    ///
    /// Returns false if the object does not exist.
    pub fn mutate(&self, key: &ResourceKey, edit: impl FnOnce(&mut Value)) -> bool {
        let mut state = self.lock();
        let revision = state.next_revision();
        let Some(object) = state.objects.get_mut(key) else {
            return false;
        };
        edit(object);
        if let Some(metadata) = object.get_mut("metadata").and_then(Value::as_object_mut) {
            metadata.insert(
                "resourceVersion".to_string(),
                Value::String(revision.to_string()),
            );
        }
        let event = WatchEvent::Applied(object.clone());
        state.notify(&event);
        true
    }

    /// Replace the status subtree of an object
    pub fn set_status(&self, key: &ResourceKey, status: Value) -> bool {
        self.mutate(key, |object| {
            if let Some(map) = object.as_object_mut() {
                map.insert("status".to_string(), status);
            }
        })
    }

    /// Delete an object out of band
    pub fn remove(&self, key: &ResourceKey) -> Option<Value> {
        let mut state = self.lock();
        let removed = state.objects.remove(key)?;
        state.notify(&WatchEvent::Deleted(removed.clone()));
        Some(removed)
    }

    pub fn object(&self, key: &ResourceKey) -> Option<Value> {
        self.lock().objects.get(key).cloned()
    }

    pub fn keys(&self) -> Vec<ResourceKey> {
        self.lock().objects.keys().cloned().collect()
    }

    /// Every call made so far, oldest first
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.lock().calls.clone()
    }

    /// Keys of calls of one kind, in call order
    pub fn calls_of(&self, call: CallKind) -> Vec<ResourceKey> {
        self.lock()
            .calls
            .iter()
            .filter(|c| c.call == call)
            .filter_map(|c| c.key.clone())
            .collect()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    /// Close every open watch channel
    pub fn disconnect_watchers(&self) {
        self.lock().watchers.clear();
    }

    pub fn watcher_count(&self) -> usize {
        self.lock().watchers.iter().filter(|w| !w.is_closed()).count()
    }
}

#[async_trait]
impl Destination for MemoryDestination {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get(&self, key: &ResourceKey) -> Result<Option<Value>, ApplyError> {
        let mut state = self.lock();
        state.check(CallKind::Get, Some(key))?;
        Ok(state.objects.get(key).cloned())
    }

    async fn list(&self) -> Result<Vec<Value>, ApplyError> {
        let mut state = self.lock();
        state.check(CallKind::List, None)?;
        Ok(state.objects.values().cloned().collect())
    }

    async fn watch(&self) -> Result<mpsc::Receiver<WatchEvent>, ApplyError> {
        let mut state = self.lock();
        if !state.watch_supported {
            return Err(ApplyError::WatchUnsupported {
                destination: self.name.clone(),
            });
        }
        state.check(CallKind::Watch, None)?;
        let (tx, rx) = mpsc::channel(WATCH_BUFFER);
        state.watchers.push(tx);
        Ok(rx)
    }

    async fn apply(&self, manifest: &Value) -> Result<Value, ApplyError> {
        let key = manifest::live_key(manifest).ok_or_else(|| ApplyError::Invalid {
            key: "<unnamed>".to_string(),
            message: "manifest has no kind or name".to_string(),
        })?;
        let mut state = self.lock();
        state.check(CallKind::Apply, Some(&key))?;

        let revision = state.next_revision();
        let mut stored = admit(state.objects.get(&key), manifest, revision);
        if self.settle {
            settle_status(&mut stored);
        }
        state.objects.insert(key, stored.clone());
        state.notify(&WatchEvent::Applied(stored.clone()));
        Ok(stored)
    }

    async fn delete(&self, key: &ResourceKey) -> Result<(), ApplyError> {
        let mut state = self.lock();
        state.check(CallKind::Delete, Some(key))?;
        let removed = state
            .objects
            .remove(key)
            .ok_or_else(|| ApplyError::NotFound {
                key: key.to_string(),
            })?;
        state.notify(&WatchEvent::Deleted(removed));
        Ok(())
    }
}
