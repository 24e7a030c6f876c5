//! Sync orchestrator - executes a plan against a destination
//!
//! Waves run strictly in order. Inside a wave: PreSync hooks, then each
//! kind tier applied concurrently (bounded by the destination's in-flight
//! limit), then Sync hooks, then the health gate. Prunes follow the last
//! wave, PostSync hooks follow the prunes. Every wait selects on the
//! operation's stop token so an abort or deadline unblocks promptly.

use crate::destination::Destination;
use crate::error::ApplyError;
use crate::events::{Event, EventKind, EventSink};
use crate::health;
use crate::manifest;
use crate::operation::{OperationPhase, ResultStatus, SyncOperation, TaskAction};
use crate::planner::{SyncPlan, SyncTask, WavePlan};
use crate::registry::ResourceRegistry;
use crate::retry::{RetryError, RetryPolicy, with_retry};
use crate::types::{HealthAssessment, HealthStatus, HookRole};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Timeouts and polling cadence for sync operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncSettings {
    /// Ceiling for a wave's gated resources to turn Healthy
    pub wave_timeout: Duration,
    /// Ceiling for one hook to complete
    pub hook_timeout: Duration,
    /// Ceiling for the whole operation
    pub operation_timeout: Duration,
    pub health_poll_interval: Duration,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            wave_timeout: Duration::from_secs(300),
            hook_timeout: Duration::from_secs(300),
            operation_timeout: Duration::from_secs(3600),
            health_poll_interval: Duration::from_secs(2),
        }
    }
}

/// Why execution stopped early
#[derive(Debug, Clone, PartialEq, Eq)]
enum Halt {
    /// A resource, hook or health gate failed
    Failed(String),
    /// Abort or operation deadline
    Stopped,
}

type Step = Result<(), Halt>;

/// Everything an operation needs to talk to its destination
#[derive(Clone)]
pub struct SyncOrchestrator {
    destination: Arc<dyn Destination>,
    registry: Arc<ResourceRegistry>,
    inflight: Arc<Semaphore>,
    sink: Arc<dyn EventSink>,
    settings: SyncSettings,
}

impl SyncOrchestrator {
    pub fn new(
        destination: Arc<dyn Destination>,
        registry: Arc<ResourceRegistry>,
        inflight: Arc<Semaphore>,
        sink: Arc<dyn EventSink>,
        settings: SyncSettings,
    ) -> Self {
        Self {
            destination,
            registry,
            inflight,
            sink,
            settings,
        }
    }

    /// Execute `plan` to a terminal phase
    ///
    /// Progress is published on `progress` after every state change. The
    /// returned operation is always terminal.
    pub async fn run(
        &self,
        plan: &SyncPlan,
        op: SyncOperation,
        retry: RetryPolicy,
        abort: &CancellationToken,
        progress: &watch::Sender<SyncOperation>,
    ) -> SyncOperation {
        let stop = abort.child_token();
        let deadline = Instant::now() + self.settings.operation_timeout;
        let timer = {
            let stop = stop.clone();
            tokio::spawn(async move {
                tokio::select! {
                    () = tokio::time::sleep_until(deadline) => stop.cancel(),
                    () = stop.cancelled() => {}
                }
            })
        };

        let mut run = Run {
            orchestrator: self,
            op,
            retry,
            stop: stop.clone(),
            progress,
        };
        run.seed(plan);

        if run.op.dry_run {
            run.finish_dry_run();
            stop.cancel();
            return run.op;
        }

        run.op.phase = OperationPhase::Running;
        run.publish();
        run.emit(
            EventKind::OperationStarted,
            format!(
                "{} sync of {} started ({} tasks)",
                run.op.trigger,
                run.op.revision,
                plan.task_count()
            ),
        );

        let outcome = run.execute(plan).await;
        timer.abort();

        match outcome {
            Ok(()) => {
                let applied = run
                    .op
                    .results
                    .iter()
                    .filter(|r| {
                        matches!(
                            r.status,
                            ResultStatus::Applied | ResultStatus::Healthy | ResultStatus::Pruned
                        )
                    })
                    .count();
                run.op.finish(
                    OperationPhase::Succeeded,
                    format!("successfully synced {applied} resources"),
                );
            }
            Err(Halt::Failed(reason)) => {
                run.run_sync_fail_hooks(plan).await;
                run.op.finish(OperationPhase::Failed, reason);
            }
            Err(Halt::Stopped) if abort.is_cancelled() => {
                run.op.finish(OperationPhase::Error, "operation aborted");
            }
            Err(Halt::Stopped) => {
                run.op.finish(OperationPhase::Failed, "operation timeout");
            }
        }
        stop.cancel();

        run.publish();
        let message = run.op.message.clone().unwrap_or_default();
        run.emit(
            EventKind::OperationFinished,
            format!("{}: {message}", run.op.phase),
        );
        log::info!(
            "Operation {} for {} finished {}: {message}",
            run.op.id,
            run.op.app,
            run.op.phase
        );
        run.op
    }
}

/// State of one executing operation
struct Run<'a> {
    orchestrator: &'a SyncOrchestrator,
    op: SyncOperation,
    retry: RetryPolicy,
    /// Fires on abort or when the operation deadline passes
    stop: CancellationToken,
    progress: &'a watch::Sender<SyncOperation>,
}

impl Run<'_> {
    fn publish(&self) {
        self.progress.send_replace(self.op.clone());
    }

    fn emit(&self, kind: EventKind, message: impl Into<String>) {
        self.orchestrator
            .sink
            .emit(&Event::new(self.op.app.clone(), kind, message));
    }

    fn set_result(&mut self, task: &SyncTask, status: ResultStatus, message: Option<String>) {
        let result = self
            .op
            .result_mut(&task.key, task.hook, task.action, task.wave);
        result.status = status;
        result.message = message;
    }

    /// Pre-populate results so the full plan is visible from the start
    fn seed(&mut self, plan: &SyncPlan) {
        let tasks = plan
            .waves
            .iter()
            .flat_map(|w| w.pre_sync.iter().chain(w.apply_tasks()).chain(&w.sync_hooks))
            .chain(&plan.prune)
            .chain(&plan.post_sync);
        for task in tasks {
            self.op
                .result_mut(&task.key, task.hook, task.action, task.wave);
        }
        for skipped in &plan.skipped_prunes {
            let result = self
                .op
                .result_mut(&skipped.key, None, TaskAction::Prune, skipped.wave);
            result.status = ResultStatus::PruneSkipped;
            result.message = Some(skipped.reason.clone());
        }
    }

    fn finish_dry_run(&mut self) {
        for result in &mut self.op.results {
            if result.status == ResultStatus::Pending {
                result.status = ResultStatus::Skipped;
                result.message = Some("dry run".to_string());
            }
        }
        let planned = self
            .op
            .results
            .iter()
            .filter(|r| r.status == ResultStatus::Skipped)
            .count();
        self.op
            .finish(OperationPhase::Succeeded, format!("dry run: {planned} tasks planned"));
        self.publish();
    }

    fn set_terminating(&mut self) {
        if self.op.phase != OperationPhase::Terminating {
            self.op.phase = OperationPhase::Terminating;
            self.publish();
            self.emit(EventKind::OperationTerminating, "waiting for in-flight calls");
        }
    }

    fn check_stop(&mut self) -> Step {
        if self.stop.is_cancelled() {
            self.set_terminating();
            return Err(Halt::Stopped);
        }
        Ok(())
    }

    async fn execute(&mut self, plan: &SyncPlan) -> Step {
        for wave in &plan.waves {
            self.check_stop()?;
            self.op.current_wave = Some(wave.wave);
            self.publish();
            self.emit(EventKind::WaveStarted, format!("wave {}", wave.wave));
            log::debug!("{}: starting wave {}", self.op.app, wave.wave);

            for hook in &wave.pre_sync {
                self.run_hook(hook, HookRole::PreSync).await?;
            }
            for tier in &wave.tiers {
                self.apply_tier(tier, wave.wave).await?;
            }
            for hook in &wave.sync_hooks {
                self.run_hook(hook, HookRole::Sync).await?;
            }
            self.health_gate(wave).await?;
        }

        for task in &plan.prune {
            self.check_stop()?;
            self.prune(task).await?;
        }

        for hook in &plan.post_sync {
            self.run_hook(hook, HookRole::PostSync).await?;
        }
        Ok(())
    }

    /// Apply one kind tier concurrently and wait for every call to finish
    async fn apply_tier(&mut self, tier: &[SyncTask], wave: i32) -> Step {
        let mut calls = JoinSet::new();
        for (index, task) in tier.iter().enumerate() {
            if self.stop.is_cancelled() {
                break;
            }
            let manifest = manifest::prepare_for_apply(&task.manifest, &self.op.app);
            let call = self.apply_call();
            let label = task.key.to_string();
            calls.spawn(async move { (index, call.run(manifest, label).await) });
        }

        let mut failed = 0;
        loop {
            tokio::select! {
                biased;
                joined = calls.join_next() => {
                    let Some(joined) = joined else { break };
                    match joined {
                        Ok((index, outcome)) => {
                            if !self.record_apply(&tier[index], outcome) {
                                failed += 1;
                            }
                        }
                        Err(e) => {
                            log::error!("{}: apply task panicked: {e}", self.op.app);
                            failed += 1;
                        }
                    }
                    self.publish();
                }
                () = self.stop.cancelled(), if self.op.phase != OperationPhase::Terminating => {
                    self.set_terminating();
                }
            }
        }

        self.check_stop()?;
        if failed > 0 {
            return Err(Halt::Failed(format!(
                "{failed} resource(s) failed to apply in wave {wave}"
            )));
        }
        Ok(())
    }

    /// Record an apply outcome, returning false on failure
    fn record_apply(&mut self, task: &SyncTask, outcome: Result<(Value, u32), RetryError>) -> bool {
        match outcome {
            Ok((_, attempts)) => {
                self.op.retry_count += attempts.saturating_sub(1);
                let result = self
                    .op
                    .result_mut(&task.key, task.hook, task.action, task.wave);
                result.status = ResultStatus::Applied;
                result.attempts = attempts;
                result.message = task.gated.then(|| "waiting for healthy".to_string());
                self.emit(EventKind::ResourceApplied, format!("applied {}", task.key));
                true
            }
            Err(RetryError::Cancelled { attempts }) => {
                self.op.retry_count += attempts.saturating_sub(1);
                let result = self
                    .op
                    .result_mut(&task.key, task.hook, task.action, task.wave);
                result.status = ResultStatus::Skipped;
                result.attempts = attempts;
                result.message = Some("operation stopped".to_string());
                true
            }
            Err(RetryError::Failed { error, attempts }) => {
                self.op.retry_count += attempts.saturating_sub(1);
                let message = describe_failure(&error, attempts);
                let result = self
                    .op
                    .result_mut(&task.key, task.hook, task.action, task.wave);
                result.status = ResultStatus::Failed;
                result.attempts = attempts;
                result.message = Some(message.clone());
                self.emit(EventKind::ResourceFailed, format!("{}: {message}", task.key));
                false
            }
        }
    }

    fn apply_call(&self) -> ApplyCall {
        ApplyCall {
            destination: self.orchestrator.destination.clone(),
            inflight: self.orchestrator.inflight.clone(),
            sink: self.orchestrator.sink.clone(),
            app: self.op.app.clone(),
            policy: self.retry,
            stop: self.stop.clone(),
        }
    }

    async fn assess_live(&self, task: &SyncTask, live: &Value) -> HealthAssessment {
        let kind = task.key.group_kind();
        let registry = &self.orchestrator.registry;
        if registry.describe(&kind).children.is_none() {
            return health::assess_live(registry, &kind, live);
        }
        match self.orchestrator.destination.list().await {
            Ok(objects) => {
                let neighbours: Vec<&Value> = objects.iter().collect();
                health::assess_live_with(registry, &kind, live, &neighbours)
            }
            Err(e) => {
                log::debug!("listing neighbours of {} failed: {e}", task.key);
                health::assess_live(registry, &kind, live)
            }
        }
    }

    /// Poll one resource until it is Healthy, Degraded or out of time
    ///
    /// Returns the last assessment; Stopped if the operation was stopped.
    async fn await_health(&mut self, task: &SyncTask, deadline: Instant) -> Result<HealthAssessment, Halt> {
        let interval = self.orchestrator.settings.health_poll_interval;
        loop {
            let assessment = match self.orchestrator.destination.get(&task.key).await {
                Ok(Some(live)) => self.assess_live(task, &live).await,
                Ok(None) => HealthAssessment::with_message(HealthStatus::Missing, "not found"),
                Err(e) => HealthAssessment::with_message(HealthStatus::Unknown, e.to_string()),
            };
            let now = Instant::now();
            if matches!(assessment.status, HealthStatus::Healthy | HealthStatus::Degraded)
                || now >= deadline
            {
                return Ok(assessment);
            }

            let pause = interval.min(deadline.saturating_duration_since(now));
            tokio::select! {
                biased;
                () = self.stop.cancelled() => {
                    self.set_terminating();
                    return Err(Halt::Stopped);
                }
                () = tokio::time::sleep(pause) => {}
            }
        }
    }

    /// Block until every gated resource applied in this wave is Healthy
    async fn health_gate(&mut self, wave: &WavePlan) -> Step {
        let gated: Vec<&SyncTask> = wave
            .apply_tasks()
            .filter(|t| t.gated)
            .filter(|t| {
                self.op
                    .results
                    .iter()
                    .any(|r| r.key == t.key && r.hook.is_none() && r.status == ResultStatus::Applied)
            })
            .collect();
        if gated.is_empty() {
            return Ok(());
        }

        let deadline = Instant::now() + self.orchestrator.settings.wave_timeout;
        let mut failures = Vec::new();
        // Sequential polling is fine: the deadline is shared, so the slowest
        // resource bounds the whole gate.
        for task in gated {
            let assessment = self.await_health(task, deadline).await?;
            let (status, message) = match assessment.status {
                HealthStatus::Healthy => (ResultStatus::Healthy, None),
                HealthStatus::Degraded => (
                    ResultStatus::Failed,
                    Some(format!("degraded: {}", assessment.describe())),
                ),
                _ => (
                    ResultStatus::Failed,
                    Some(format!("health timeout: {}", assessment.describe())),
                ),
            };
            if status == ResultStatus::Failed {
                failures.push(task.key.to_string());
                self.emit(
                    EventKind::ResourceFailed,
                    format!("{}: {}", task.key, message.as_deref().unwrap_or_default()),
                );
                self.set_result(task, status, message);
                // A degraded resource fails the wave without waiting for the rest
                if assessment.status == HealthStatus::Degraded {
                    break;
                }
            } else {
                self.set_result(task, status, message);
            }
            self.publish();
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(Halt::Failed(format!(
                "wave {} not healthy: {}",
                wave.wave,
                failures.join(", ")
            )))
        }
    }

    /// Delete, recreate and wait for one hook
    async fn run_hook(&mut self, task: &SyncTask, role: HookRole) -> Step {
        self.check_stop()?;
        match self.hook_attempt(task).await {
            Ok(()) => {
                self.set_result(task, ResultStatus::Completed, None);
                self.publish();
                self.emit(EventKind::HookCompleted, format!("{role} hook {} completed", task.key));
                Ok(())
            }
            Err(Halt::Failed(message)) => {
                self.set_result(task, ResultStatus::Failed, Some(message.clone()));
                self.publish();
                self.emit(EventKind::ResourceFailed, format!("{role} hook {}: {message}", task.key));
                Err(Halt::Failed(format!("{role} hook {} failed: {message}", task.key)))
            }
            Err(Halt::Stopped) => Err(Halt::Stopped),
        }
    }

    async fn hook_attempt(&mut self, task: &SyncTask) -> Step {
        // A hook always runs fresh
        match self.orchestrator.destination.delete(&task.key).await {
            Ok(()) => log::debug!("{}: deleted previous run of hook {}", self.op.app, task.key),
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(Halt::Failed(e.to_string())),
        }

        let manifest = manifest::prepare_for_apply(&task.manifest, &self.op.app);
        match self.apply_call().run(manifest, task.key.to_string()).await {
            Ok((_, attempts)) => {
                self.op.retry_count += attempts.saturating_sub(1);
                self.op
                    .result_mut(&task.key, task.hook, task.action, task.wave)
                    .attempts = attempts;
            }
            Err(RetryError::Cancelled { .. }) => {
                self.set_terminating();
                return Err(Halt::Stopped);
            }
            Err(RetryError::Failed { error, attempts }) => {
                return Err(Halt::Failed(describe_failure(&error, attempts)));
            }
        }

        let deadline = Instant::now() + self.orchestrator.settings.hook_timeout;
        let assessment = self.await_health(task, deadline).await?;
        match assessment.status {
            HealthStatus::Healthy => Ok(()),
            HealthStatus::Degraded => Err(Halt::Failed(assessment.describe())),
            _ => Err(Halt::Failed(format!("hook timeout: {}", assessment.describe()))),
        }
    }

    async fn prune(&mut self, task: &SyncTask) -> Step {
        let destination = self.orchestrator.destination.clone();
        let key = task.key.clone();
        let app = self.op.app.clone();
        let outcome = with_retry(
            &self.retry,
            &self.stop,
            |attempt, error, delay| {
                log::warn!("{app}: pruning {key} failed (attempt {attempt}): {error}, retrying in {delay:?}");
            },
            || {
                let destination = destination.clone();
                let key = key.clone();
                async move {
                    match destination.delete(&key).await {
                        Err(e) if e.is_not_found() => Ok(()),
                        other => other,
                    }
                }
            },
        )
        .await;

        let step = match outcome {
            Ok(((), attempts)) => {
                self.op.retry_count += attempts.saturating_sub(1);
                self.set_result(task, ResultStatus::Pruned, None);
                self.emit(EventKind::ResourcePruned, format!("pruned {}", task.key));
                Ok(())
            }
            Err(RetryError::Cancelled { .. }) => {
                self.set_terminating();
                Err(Halt::Stopped)
            }
            Err(RetryError::Failed { error, attempts }) => {
                let message = describe_failure(&error, attempts);
                self.set_result(task, ResultStatus::Failed, Some(message.clone()));
                self.emit(EventKind::ResourceFailed, format!("{}: {message}", task.key));
                Err(Halt::Failed(format!("failed to prune {}", task.key)))
            }
        };
        self.publish();
        step
    }

    /// Best effort: failures here are reported but do not change the outcome
    async fn run_sync_fail_hooks(&mut self, plan: &SyncPlan) {
        for hook in &plan.sync_fail {
            if self.stop.is_cancelled() {
                return;
            }
            self.op
                .result_mut(&hook.key, hook.hook, hook.action, hook.wave);
            if let Err(Halt::Failed(message)) = self.run_hook(hook, HookRole::SyncFail).await {
                log::warn!("{}: {message}", self.op.app);
            }
        }
    }
}

/// A retried, permit-bounded apply that owns everything it needs,
/// so it can run on its own task
struct ApplyCall {
    destination: Arc<dyn Destination>,
    inflight: Arc<Semaphore>,
    sink: Arc<dyn EventSink>,
    app: String,
    policy: RetryPolicy,
    stop: CancellationToken,
}

impl ApplyCall {
    async fn run(self, manifest: Value, label: String) -> Result<(Value, u32), RetryError> {
        let Self {
            destination,
            inflight,
            sink,
            app,
            policy,
            stop,
        } = self;
        let manifest = Arc::new(manifest);

        with_retry(
            &policy,
            &stop,
            |attempt, error, delay| {
                log::warn!(
                    "{app}: applying {label} failed (attempt {attempt}): {error}, retrying in {delay:?}"
                );
                sink.emit(&Event::new(
                    app.clone(),
                    EventKind::RetryScheduled,
                    format!("{label}: {error}, retry in {}s", delay.as_secs()),
                ));
            },
            || {
                let destination = destination.clone();
                let inflight = inflight.clone();
                let manifest = manifest.clone();
                let stop = stop.clone();
                async move {
                    // Queued calls never start once the operation is stopped
                    let _permit = tokio::select! {
                        biased;
                        () = stop.cancelled() => return Err(ApplyError::Cancelled),
                        permit = inflight.acquire_owned() => permit.map_err(|_| {
                            ApplyError::Unavailable {
                                message: "destination is shutting down".to_string(),
                            }
                        })?,
                    };
                    if stop.is_cancelled() {
                        return Err(ApplyError::Cancelled);
                    }
                    destination.apply(&manifest).await
                }
            },
        )
        .await
    }
}

fn describe_failure(error: &ApplyError, attempts: u32) -> String {
    if attempts > 1 {
        format!(
            "{error} ({} error, gave up after {attempts} attempts)",
            error.category().label()
        )
    } else {
        format!("{error} ({} error)", error.category().label())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::destination::{CallKind, FailureMode, MemoryDestination};
    use crate::diff::{DiffOptions, diff};
    use crate::events::LogSink;
    use crate::manifest::ManifestSet;
    use crate::operation::SyncTrigger;
    use crate::planner::PlanOptions;
    use crate::resource::desired_resources;
    use crate::types::ResourceKey;
    use serde_json::json;

    fn namespace() -> Value {
        json!({"apiVersion": "v1", "kind": "Namespace", "metadata": {"name": "web"}})
    }

    fn deployment() -> Value {
        json!({"apiVersion": "apps/v1", "kind": "Deployment",
            "metadata": {"name": "frontend", "namespace": "web"}, "spec": {"replicas": 3}})
    }

    fn deployment_key() -> ResourceKey {
        ResourceKey::new("apps", "Deployment", Some("web"), "frontend")
    }

    fn config_map(name: &str) -> Value {
        json!({"apiVersion": "v1", "kind": "ConfigMap",
            "metadata": {"name": name, "namespace": "web"}, "data": {"k": "v"}})
    }

    /// Every apply takes `delay` before it reaches the wrapped destination
    struct SlowDestination {
        inner: Arc<MemoryDestination>,
        delay: Duration,
    }

    #[async_trait::async_trait]
    impl Destination for SlowDestination {
        fn name(&self) -> &str {
            self.inner.name()
        }

        async fn get(&self, key: &ResourceKey) -> Result<Option<Value>, ApplyError> {
            self.inner.get(key).await
        }

        async fn list(&self) -> Result<Vec<Value>, ApplyError> {
            self.inner.list().await
        }

        async fn watch(&self) -> Result<tokio::sync::mpsc::Receiver<crate::destination::WatchEvent>, ApplyError> {
            self.inner.watch().await
        }

        async fn apply(&self, manifest: &Value) -> Result<Value, ApplyError> {
            tokio::time::sleep(self.delay).await;
            self.inner.apply(manifest).await
        }

        async fn delete(&self, key: &ResourceKey) -> Result<(), ApplyError> {
            self.inner.delete(key).await
        }
    }

    struct Harness {
        dest: Arc<MemoryDestination>,
        orchestrator: SyncOrchestrator,
    }

    impl Harness {
        fn new(dest: MemoryDestination) -> Self {
            let dest = Arc::new(dest);
            Self::build(dest.clone(), dest, 4)
        }

        /// Applies take `delay` and at most `inflight` run at once
        fn slow(dest: MemoryDestination, delay: Duration, inflight: usize) -> Self {
            let dest = Arc::new(dest);
            let slow = Arc::new(SlowDestination {
                inner: dest.clone(),
                delay,
            });
            Self::build(dest, slow, inflight)
        }

        fn build(dest: Arc<MemoryDestination>, target: Arc<dyn Destination>, inflight: usize) -> Self {
            let orchestrator = SyncOrchestrator::new(
                target,
                Arc::new(ResourceRegistry::builtin()),
                Arc::new(Semaphore::new(inflight)),
                Arc::new(LogSink),
                SyncSettings {
                    wave_timeout: Duration::from_secs(300),
                    hook_timeout: Duration::from_secs(60),
                    operation_timeout: Duration::from_secs(3600),
                    health_poll_interval: Duration::from_secs(1),
                },
            );
            Self { dest, orchestrator }
        }

        async fn plan(&self, manifests: Vec<Value>, prune: bool) -> SyncPlan {
            let registry = ResourceRegistry::builtin();
            let desired = desired_resources(&ManifestSet::new("r1", manifests), Some("web"), &registry).unwrap();
            let live = self
                .dest
                .list()
                .await
                .unwrap()
                .into_iter()
                .filter_map(|v| crate::resource::ManagedResource::from_live(v, &registry))
                .collect();
            let resources = diff(desired, live, DiffOptions { app: "web", ignore: &[] });
            SyncPlan::build(
                &resources,
                &registry,
                &PlanOptions {
                    prune,
                    ..PlanOptions::default()
                },
            )
        }

        async fn run(&self, plan: &SyncPlan, retry: RetryPolicy, abort: &CancellationToken) -> SyncOperation {
            let op = SyncOperation::new(1, "web", "r1", "digest", SyncTrigger::Manual);
            let (tx, _rx) = watch::channel(op.clone());
            self.orchestrator.run(plan, op, retry, abort, &tx).await
        }
    }

    fn result<'a>(op: &'a SyncOperation, name: &str) -> &'a crate::operation::ResourceResult {
        op.results
            .iter()
            .find(|r| r.key.name == name)
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_health_timeout_fails_wave() {
        let harness = Harness::new(MemoryDestination::new("mem"));
        let plan = harness.plan(vec![namespace(), deployment()], false).await;

        // A workload controller that only ever brings one replica up
        let dest = harness.dest.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_millis(500)).await;
                dest.set_status(&deployment_key(), json!({"replicas": 3, "readyReplicas": 1}));
            }
        });

        let started = Instant::now();
        let op = harness.run(&plan, RetryPolicy::default(), &CancellationToken::new()).await;

        assert_eq!(op.phase, OperationPhase::Failed);
        assert_eq!(op.current_wave, Some(1));
        assert_eq!(result(&op, "web").status, ResultStatus::Applied);
        let frontend = result(&op, "frontend");
        assert_eq!(frontend.status, ResultStatus::Failed);
        assert_eq!(frontend.message.as_deref(), Some("health timeout: 1/3 ready"));
        assert!(started.elapsed() >= Duration::from_secs(300));
    }

    #[tokio::test(start_paused = true)]
    async fn test_crash_looping_pods_fail_wave_fast() {
        let harness = Harness::new(MemoryDestination::new("mem"));
        let mut frontend = deployment();
        frontend["spec"]["selector"] = json!({"matchLabels": {"app": "frontend"}});
        let plan = harness.plan(vec![namespace(), frontend], false).await;

        // The rollout never becomes ready because its pods keep crashing
        let dest = harness.dest.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            dest.set_status(&deployment_key(), json!({"replicas": 3, "readyReplicas": 0}));
            dest.insert(json!({
                "apiVersion": "v1",
                "kind": "Pod",
                "metadata": {"name": "frontend-6f7c8-qk2lp", "namespace": "web", "labels": {"app": "frontend"}},
                "status": {
                    "phase": "Running",
                    "containerStatuses": [{"name": "app", "state": {"waiting": {"reason": "CrashLoopBackOff"}}}]
                }
            }));
        });

        let started = Instant::now();
        let op = harness.run(&plan, RetryPolicy::default(), &CancellationToken::new()).await;

        assert_eq!(op.phase, OperationPhase::Failed);
        let frontend = result(&op, "frontend");
        assert_eq!(frontend.status, ResultStatus::Failed);
        assert_eq!(
            frontend.message.as_deref(),
            Some("degraded: pod frontend-6f7c8-qk2lp: app: CrashLoopBackOff")
        );
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wave_ordering() {
        let harness = Harness::new(MemoryDestination::new("mem").with_settle(true));
        let mut early = config_map("early");
        manifest::set_annotation(&mut early, manifest::WAVE_ANNOTATION, "-1");
        let plan = harness
            .plan(vec![deployment(), namespace(), config_map("cfg"), early], false)
            .await;

        let op = harness.run(&plan, RetryPolicy::default(), &CancellationToken::new()).await;
        assert_eq!(op.phase, OperationPhase::Succeeded);
        assert_eq!(result(&op, "frontend").status, ResultStatus::Healthy);

        let applied: Vec<String> = harness
            .dest
            .calls_of(CallKind::Apply)
            .into_iter()
            .map(|k| k.name)
            .collect();
        assert_eq!(applied, vec!["early", "web", "cfg", "frontend"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_bound() {
        let harness = Harness::new(MemoryDestination::new("mem"));
        harness.dest.inject_failure(
            CallKind::Apply,
            None,
            ApplyError::RateLimited { message: "slow down".into() },
            FailureMode::Always,
        );
        let plan = harness.plan(vec![config_map("cfg")], false).await;
        let policy = RetryPolicy::new(3, Duration::from_secs(1), 2.0, Duration::from_secs(10));

        let op = harness.run(&plan, policy, &CancellationToken::new()).await;
        assert_eq!(op.phase, OperationPhase::Failed);
        assert_eq!(harness.dest.calls_of(CallKind::Apply).len(), 4);
        assert_eq!(result(&op, "cfg").attempts, 4);
        assert_eq!(op.retry_count, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_error_not_retried() {
        let harness = Harness::new(MemoryDestination::new("mem"));
        harness.dest.inject_failure(
            CallKind::Apply,
            None,
            ApplyError::Invalid {
                key: "v1/ConfigMap/web/cfg".into(),
                message: "unknown field".into(),
            },
            FailureMode::Always,
        );
        let plan = harness.plan(vec![config_map("cfg"), deployment()], false).await;

        let op = harness.run(&plan, RetryPolicy::default(), &CancellationToken::new()).await;
        assert_eq!(op.phase, OperationPhase::Failed);
        assert_eq!(harness.dest.calls_of(CallKind::Apply).len(), 1);
        assert!(result(&op, "cfg").message.as_deref().unwrap().contains("unknown field"));
        // Later tiers and waves never start
        assert_eq!(result(&op, "frontend").status, ResultStatus::Skipped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_prune_enabled_and_disabled() {
        let harness = Harness::new(MemoryDestination::new("mem"));
        harness.dest.insert(manifest::prepare_for_apply(&config_map("a"), "web"));
        harness.dest.insert(manifest::prepare_for_apply(&config_map("b"), "web"));

        let plan = harness.plan(vec![config_map("a")], false).await;
        let op = harness.run(&plan, RetryPolicy::default(), &CancellationToken::new()).await;
        assert_eq!(op.phase, OperationPhase::Succeeded);
        assert_eq!(result(&op, "b").status, ResultStatus::PruneSkipped);
        assert_eq!(harness.dest.keys().len(), 2);

        let plan = harness.plan(vec![config_map("a")], true).await;
        let op = harness.run(&plan, RetryPolicy::default(), &CancellationToken::new()).await;
        assert_eq!(op.phase, OperationPhase::Succeeded);
        assert_eq!(result(&op, "b").status, ResultStatus::Pruned);
        assert_eq!(harness.dest.keys().len(), 1);
        assert!(harness.dest.calls_of(CallKind::Apply).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pre_sync_failure_blocks_wave() {
        let harness = Harness::new(MemoryDestination::new("mem"));
        let mut migrate = json!({"apiVersion": "batch/v1", "kind": "Job",
            "metadata": {"name": "migrate", "namespace": "web"}});
        manifest::set_annotation(&mut migrate, manifest::HOOK_ANNOTATION, "PreSync");
        manifest::set_annotation(&mut migrate, manifest::WAVE_ANNOTATION, "0");
        let plan = harness.plan(vec![migrate, config_map("cfg")], false).await;

        let dest = harness.dest.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
            dest.set_status(
                &ResourceKey::new("batch", "Job", Some("web"), "migrate"),
                failed_job_status(),
            );
        });

        let op = harness.run(&plan, RetryPolicy::default(), &CancellationToken::new()).await;
        assert_eq!(op.phase, OperationPhase::Failed);
        assert!(op.message.as_deref().unwrap().contains("PreSync hook"));
        assert_eq!(result(&op, "cfg").status, ResultStatus::Skipped);
        assert_eq!(harness.dest.object(&ResourceKey::new("", "ConfigMap", Some("web"), "cfg")), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_post_sync_and_hook_recreation() {
        let harness = Harness::new(MemoryDestination::new("mem").with_settle(true));
        let mut smoke = json!({"apiVersion": "batch/v1", "kind": "Job",
            "metadata": {"name": "smoke", "namespace": "web"}});
        manifest::set_annotation(&mut smoke, manifest::HOOK_ANNOTATION, "PostSync");
        let smoke_key = ResourceKey::new("batch", "Job", Some("web"), "smoke");
        harness.dest.insert(smoke.clone());

        let plan = harness.plan(vec![smoke, config_map("cfg")], false).await;
        let op = harness.run(&plan, RetryPolicy::default(), &CancellationToken::new()).await;

        assert_eq!(op.phase, OperationPhase::Succeeded);
        assert_eq!(result(&op, "smoke").status, ResultStatus::Completed);
        assert_eq!(harness.dest.calls_of(CallKind::Delete), vec![smoke_key.clone()]);
        let applied = harness.dest.calls_of(CallKind::Apply);
        assert_eq!(applied.last(), Some(&smoke_key));
    }

    fn failed_job_status() -> Value {
        json!({"failed": 7, "conditions": [{"type": "Failed", "status": "True", "reason": "BackoffLimitExceeded"}]})
    }

    #[tokio::test(start_paused = true)]
    async fn test_post_sync_failure_fails_operation() {
        let harness = Harness::new(MemoryDestination::new("mem"));
        let mut smoke = json!({"apiVersion": "batch/v1", "kind": "Job",
            "metadata": {"name": "smoke", "namespace": "web"}});
        manifest::set_annotation(&mut smoke, manifest::HOOK_ANNOTATION, "PostSync");
        let plan = harness.plan(vec![smoke, config_map("cfg")], false).await;

        let dest = harness.dest.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
            dest.set_status(
                &ResourceKey::new("batch", "Job", Some("web"), "smoke"),
                failed_job_status(),
            );
        });

        let op = harness.run(&plan, RetryPolicy::default(), &CancellationToken::new()).await;
        assert_eq!(op.phase, OperationPhase::Failed);
        assert!(op.message.as_deref().unwrap().contains("PostSync hook"));
        assert_eq!(result(&op, "cfg").status, ResultStatus::Applied);
        let smoke = result(&op, "smoke");
        assert_eq!(smoke.status, ResultStatus::Failed);
        assert_eq!(smoke.message.as_deref(), Some("BackoffLimitExceeded"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sync_fail_hooks_run_after_failure() {
        let harness = Harness::new(MemoryDestination::new("mem").with_settle(true));
        let mut notify = json!({"apiVersion": "batch/v1", "kind": "Job",
            "metadata": {"name": "notify", "namespace": "web"}});
        manifest::set_annotation(&mut notify, manifest::HOOK_ANNOTATION, "SyncFail");
        let plan = harness.plan(vec![notify, config_map("cfg")], false).await;
        assert_eq!(plan.sync_fail.len(), 1);

        harness.dest.inject_failure(
            CallKind::Apply,
            Some(ResourceKey::new("", "ConfigMap", Some("web"), "cfg")),
            ApplyError::Forbidden {
                key: "v1/ConfigMap/web/cfg".into(),
                message: "denied".into(),
            },
            FailureMode::Always,
        );

        let op = harness.run(&plan, RetryPolicy::default(), &CancellationToken::new()).await;
        assert_eq!(op.phase, OperationPhase::Failed);
        assert!(op.message.as_deref().unwrap().contains("failed to apply"));
        assert_eq!(result(&op, "cfg").status, ResultStatus::Failed);
        assert_eq!(result(&op, "notify").status, ResultStatus::Completed);

        let notify_key = ResourceKey::new("batch", "Job", Some("web"), "notify");
        assert!(harness.dest.object(&notify_key).is_some());
        assert_eq!(harness.dest.calls_of(CallKind::Apply).last(), Some(&notify_key));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sync_fail_hooks_skipped_on_success() {
        let harness = Harness::new(MemoryDestination::new("mem").with_settle(true));
        let mut notify = json!({"apiVersion": "batch/v1", "kind": "Job",
            "metadata": {"name": "notify", "namespace": "web"}});
        manifest::set_annotation(&mut notify, manifest::HOOK_ANNOTATION, "SyncFail");
        let plan = harness.plan(vec![notify, config_map("cfg")], false).await;

        let op = harness.run(&plan, RetryPolicy::default(), &CancellationToken::new()).await;
        assert_eq!(op.phase, OperationPhase::Succeeded);
        assert!(op.results.iter().all(|r| r.key.name != "notify"));
        assert!(harness
            .dest
            .object(&ResourceKey::new("batch", "Job", Some("web"), "notify"))
            .is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_ends_in_error() {
        let harness = Harness::new(MemoryDestination::new("mem"));
        let plan = harness.plan(vec![namespace(), deployment(), config_map("cfg")], false).await;
        let abort = CancellationToken::new();
        let trigger = abort.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(10)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let op = harness.run(&plan, RetryPolicy::default(), &abort).await;
        assert_eq!(op.phase, OperationPhase::Error);
        assert_eq!(op.message.as_deref(), Some("operation aborted"));
        assert!(started.elapsed() < Duration::from_secs(20));
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_stops_queued_applies() {
        let harness = Harness::slow(MemoryDestination::new("mem"), Duration::from_secs(10), 1);
        let configs = (0..4).map(|i| config_map(&format!("cm{i}"))).collect();
        let plan = harness.plan(configs, false).await;
        let abort = CancellationToken::new();
        let trigger = abort.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let op = harness.run(&plan, RetryPolicy::default(), &abort).await;
        assert_eq!(op.phase, OperationPhase::Error);
        // The call in flight finishes, the queued ones are never issued
        assert_eq!(harness.dest.calls_of(CallKind::Apply).len(), 1);
        assert!(started.elapsed() < Duration::from_secs(15));

        let statuses: Vec<ResultStatus> = op.results.iter().map(|r| r.status).collect();
        assert_eq!(statuses.iter().filter(|s| **s == ResultStatus::Applied).count(), 1);
        assert_eq!(statuses.iter().filter(|s| **s == ResultStatus::Skipped).count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_operation_timeout_fails() {
        let mut harness = Harness::new(MemoryDestination::new("mem"));
        harness.orchestrator.settings.operation_timeout = Duration::from_secs(30);
        let plan = harness.plan(vec![deployment()], false).await;

        let op = harness.run(&plan, RetryPolicy::default(), &CancellationToken::new()).await;
        assert_eq!(op.phase, OperationPhase::Failed);
        assert_eq!(op.message.as_deref(), Some("operation timeout"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dry_run_makes_no_calls() {
        let harness = Harness::new(MemoryDestination::new("mem"));
        let plan = harness.plan(vec![namespace(), config_map("cfg")], false).await;
        harness.dest.clear_calls();

        let mut op = SyncOperation::new(1, "web", "r1", "digest", SyncTrigger::Manual);
        op.dry_run = true;
        let (tx, _rx) = watch::channel(op.clone());
        let op = harness
            .orchestrator
            .run(&plan, op, RetryPolicy::default(), &CancellationToken::new(), &tx)
            .await;

        assert_eq!(op.phase, OperationPhase::Succeeded);
        assert!(op.results.iter().all(|r| r.status == ResultStatus::Skipped));
        assert!(harness.dest.calls().is_empty());
    }
}
