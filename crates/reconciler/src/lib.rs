//! # Reconciler
//!
//! Continuous reconciliation of declared resources against a destination.
//!
//! An [`Application`] binds a source of rendered manifests at a target
//! revision to a destination. The [`Controller`] keeps comparing the two,
//! reports sync and health status, and converges the destination through
//! ordered, observable sync operations.
//!
//! ## Core Concepts
//!
//! - **Registry**: per-kind capability table (health rule, default wave, tier)
//! - **Observer**: keeps a versioned copy-on-write cache of live state
//! - **Diff**: structural three-way comparison of desired against live
//! - **Planner**: orders out-of-sync resources into waves, tiers and hook phases
//! - **Orchestrator**: executes a plan with retries, health gates and timeouts
//! - **Controller**: worker pool, per-application locking and the reconcile decision
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use reconciler::{
//!     Application, Controller, ControllerConfig, DirectorySource,
//!     MemoryDestination, ResourceRegistry, SyncRequest,
//! };
//!
//! let controller = Controller::new(
//!     ResourceRegistry::builtin(),
//!     Arc::new(DirectorySource::new()),
//!     ControllerConfig::default(),
//! );
//! controller.add_destination(Arc::new(MemoryDestination::new("local")));
//! controller.register(
//!     Application::new("guestbook", "./manifests", "v1", "local").with_namespace("web"),
//! )?;
//! controller.start();
//!
//! controller.sync("guestbook", SyncRequest::default()).await?;
//! let op = controller.wait_for_operation("guestbook").await?;
//! ```
//!
//! ## Extension Points
//!
//! - [`Destination`]: the target system; every mutation goes through it
//! - [`ManifestSource`]: where rendered manifests come from
//! - [`EventSink`]: receives structured status events
//! - [`KindDescriptor`]: teaches the registry about a new kind

pub mod application;
pub mod controller;
pub mod destination;
pub mod diff;
pub mod error;
pub mod events;
pub mod executor;
pub mod health;
pub mod manifest;
pub mod observer;
pub mod operation;
pub mod planner;
pub mod registry;
pub mod resource;
pub mod retry;
pub mod source;
pub mod types;

// Re-export main types at crate root
pub use application::{
    Application, ApplicationStatus, Condition, ConditionKind, Decision, ResourceStatus,
    SyncPolicy,
};
pub use controller::{Controller, ControllerConfig, DiffReport, SyncRequest};
pub use destination::{Destination, DirectoryDestination, MemoryDestination, WatchEvent};
pub use diff::{DiffSummary, IgnoreRule};
pub use error::{ApplyError, ControllerError, ErrorCategory, RenderError};
pub use events::{ChannelSink, Event, EventKind, EventSink, LogSink};
pub use executor::SyncSettings;
pub use manifest::ManifestSet;
pub use observer::{Freshness, ObserverConfig};
pub use operation::{HistoryEntry, OperationPhase, ResultStatus, SyncOperation, SyncTrigger};
pub use registry::{KindDescriptor, KindTier, ResourceRegistry};
pub use resource::ManagedResource;
pub use retry::RetryPolicy;
pub use source::{DirectorySource, ManifestSource, StaticSource};
pub use types::{
    DiffAction, DiffStatus, GroupKind, HealthAssessment, HealthStatus, HookRole, ResourceKey,
    SyncStatus,
};
