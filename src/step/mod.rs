//! Step execution
//!
//! A step moves through `Created → Cleaning → Applying → Polling` and ends
//! `Succeeded` or `Failed`:
//!
//! 1. **Cleaning** deletes the step's delete references and waits until they
//!    are gone.
//! 2. **Applying** runs the step's commands, then creates or updates every
//!    apply document. Newly created objects are registered for rollback.
//! 3. **Polling** sweeps all assertions once per interval until a sweep comes
//!    back clean or the deadline passes. Every sweep evaluates every
//!    assertion, so the last sweep's failures are a complete picture.
//!
//! Setup failures (connecting, discovery, commands, applying) end the step
//! at once. Assertion mismatches only end it when time runs out. Diagnostic
//! collectors run after a failed polling phase.

mod assert;
mod rollback;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::apply::{create_or_update, ApplyError};
use crate::cancel::{CancelError, RunContext};
use crate::client::{Cluster, ClientError, ClusterConnector, RetryingClient, SharedClient};
use crate::diagnostics::{collect, Diagnostics};
use crate::manifest::{DeleteRef, TestAssertSpec};
use crate::matcher::SubsetError;
use crate::predicate::{check as check_expressions, NoPredicates, PredicateError, PredicateEvaluator};
use crate::registry::Discovery;
use crate::resource::{ObjectKey, ResourceDocument};
use crate::runner::{run_command, BackgroundProcesses, Command, CommandEnv, RunnerError};
use crate::wait::{wait_gone, WaitError};

pub use assert::{check_absent, check_present};
pub use rollback::Rollback;

/// Interval between polling sweeps
pub const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Interval between checks while waiting for deleted objects to disappear
pub const DELETE_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Timeout used when neither the step nor the run sets one
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// One failure recorded by a step
#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error("failed to connect to cluster: {0}")]
    Connect(ClientError),

    #[error("{resource}: {source}")]
    Client {
        resource: String,
        source: ClientError,
    },

    #[error("failed to resolve scope of {resource}: {source}")]
    Discovery {
        resource: String,
        source: ClientError,
    },

    #[error("failed to apply {resource}: {source}")]
    Apply {
        resource: String,
        source: ApplyError,
    },

    #[error(transparent)]
    Command(#[from] RunnerError),

    #[error("resource {resource} not found")]
    NotFound { resource: String },

    #[error("resource {resource}: {source}")]
    Mismatch {
        resource: String,
        source: SubsetError,
        expected: String,
        observed: String,
    },

    #[error("resource {resource} matched error assertion{}", others_suffix(.others))]
    UnexpectedMatch { resource: String, others: usize },

    #[error(transparent)]
    Expression(#[from] PredicateError),

    #[error("cleanup did not finish: {0}")]
    Cleanup(WaitError),

    #[error("{0}")]
    Timeout(CancelError),
}

fn others_suffix(others: &usize) -> String {
    if *others == 0 {
        String::new()
    } else {
        format!(" (and {others} other resources)")
    }
}

impl StepError {
    /// Whether this failure means the step ran out of time
    pub fn is_deadline_exceeded(&self) -> bool {
        match self {
            StepError::Timeout(CancelError::DeadlineExceeded) => true,
            StepError::Connect(source)
            | StepError::Client { source, .. }
            | StepError::Discovery { source, .. } => source.is_deadline_exceeded(),
            StepError::Apply { source, .. } => matches!(source, ApplyError::Timeout),
            StepError::Command(RunnerError::Context(CancelError::DeadlineExceeded)) => true,
            _ => false,
        }
    }

    /// Expected/observed YAML for structural mismatches
    pub fn diff(&self) -> Option<(&str, &str)> {
        match self {
            StepError::Mismatch {
                expected, observed, ..
            } => Some((expected.as_str(), observed.as_str())),
            _ => None,
        }
    }
}

/// Phases of a step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StepPhase {
    Created,
    Cleaning,
    Applying,
    Polling,
    Succeeded,
    Failed,
}

impl std::fmt::Display for StepPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            StepPhase::Created => "created",
            StepPhase::Cleaning => "cleaning",
            StepPhase::Applying => "applying",
            StepPhase::Polling => "polling",
            StepPhase::Succeeded => "succeeded",
            StepPhase::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// One ordered unit of a test case
#[derive(Debug, Clone, Default)]
pub struct Step {
    pub index: i64,
    pub name: String,
    pub apply: Vec<ResourceDocument>,
    pub asserts: Vec<ResourceDocument>,
    pub errors: Vec<ResourceDocument>,
    pub delete: Vec<DeleteRef>,
    pub commands: Vec<Command>,
    pub timeout: Option<Duration>,
    /// Alternate cluster; `None` is the case's primary cluster
    pub kubeconfig: Option<String>,
    pub lazy_connect: bool,
    pub unit_test: bool,
    pub assert_block: Option<TestAssertSpec>,
}

impl Step {
    #[must_use]
    pub fn new(index: i64, name: impl Into<String>) -> Self {
        Self {
            index,
            name: name.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn apply(mut self, doc: ResourceDocument) -> Self {
        self.apply.push(doc);
        self
    }

    #[must_use]
    pub fn assert(mut self, doc: ResourceDocument) -> Self {
        self.asserts.push(doc);
        self
    }

    #[must_use]
    pub fn error(mut self, doc: ResourceDocument) -> Self {
        self.errors.push(doc);
        self
    }

    #[must_use]
    pub fn delete(mut self, reference: DeleteRef) -> Self {
        self.delete.push(reference);
        self
    }

    #[must_use]
    pub fn command(mut self, command: Command) -> Self {
        self.commands.push(command);
        self
    }

    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn kubeconfig(mut self, path: impl Into<String>) -> Self {
        self.kubeconfig = Some(path.into());
        self
    }

    #[must_use]
    pub fn lazy(mut self) -> Self {
        self.lazy_connect = true;
        self
    }

    #[must_use]
    pub fn assert_block(mut self, block: TestAssertSpec) -> Self {
        self.assert_block = Some(block);
        self
    }

    /// Kubeconfig path used to reach this step's cluster, empty for the default
    pub fn cluster_ref(&self) -> &str {
        self.kubeconfig.as_deref().unwrap_or_default()
    }

    /// Timeout for cleaning and applying
    pub fn effective_timeout(&self, default: Duration) -> Duration {
        self.timeout.unwrap_or(default)
    }

    /// Timeout for polling: the assertion block's, then the step's, then `default`
    pub fn polling_timeout(&self, default: Duration) -> Duration {
        self.assert_block
            .as_ref()
            .and_then(|block| block.timeout)
            .map(Duration::from_secs)
            .unwrap_or_else(|| self.effective_timeout(default))
    }
}

/// What a step needs from its case
#[derive(Clone)]
pub struct StepEnv {
    pub namespace: String,
    pub default_timeout: Duration,
    pub suppress_rollback: bool,
    pub connector: Arc<dyn ClusterConnector>,
    pub predicates: Arc<dyn PredicateEvaluator>,
    pub background: BackgroundProcesses,
    pub work_dir: Option<PathBuf>,
    pub poll_interval: Duration,
}

impl StepEnv {
    pub fn new(namespace: impl Into<String>, connector: Arc<dyn ClusterConnector>) -> Self {
        Self {
            namespace: namespace.into(),
            default_timeout: DEFAULT_TIMEOUT,
            suppress_rollback: false,
            connector,
            predicates: Arc::new(NoPredicates),
            background: BackgroundProcesses::new(),
            work_dir: None,
            poll_interval: POLL_INTERVAL,
        }
    }
}

/// Result of running one step
#[derive(Debug)]
pub struct StepOutcome {
    pub index: i64,
    pub name: String,
    pub phase: StepPhase,
    /// Phase the step was in when it failed
    pub failed_in: Option<StepPhase>,
    pub failures: Vec<StepError>,
    pub diagnostics: Option<Diagnostics>,
    pub elapsed: Duration,
}

impl StepOutcome {
    pub fn passed(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Runs one step to completion
pub struct StepEngine {
    step: Step,
    env: StepEnv,
    phase: StepPhase,
}

impl StepEngine {
    #[must_use]
    pub fn new(step: Step, env: StepEnv) -> Self {
        Self {
            step,
            env,
            phase: StepPhase::Created,
        }
    }

    pub fn phase(&self) -> StepPhase {
        self.phase
    }

    /// Run the step, registering created objects in `rollback`
    #[instrument(skip_all, fields(step = %self.step.name, namespace = %self.env.namespace))]
    pub async fn run(mut self, ctx: &RunContext, rollback: &mut Rollback) -> StepOutcome {
        let start = Instant::now();
        info!(index = self.step.index, "Step starting");

        let (failures, diagnostics) = match self.execute(ctx, rollback).await {
            Ok(()) => (Vec::new(), None),
            Err((failures, diagnostics)) => (failures, diagnostics),
        };

        let failed_in = (!failures.is_empty()).then_some(self.phase);
        let phase = if failures.is_empty() {
            StepPhase::Succeeded
        } else {
            StepPhase::Failed
        };

        match failed_in {
            None => info!(elapsed = ?start.elapsed(), "Step passed"),
            Some(p) => warn!(
                phase = %p,
                failures = failures.len(),
                elapsed = ?start.elapsed(),
                "Step failed"
            ),
        }

        StepOutcome {
            index: self.step.index,
            name: self.step.name,
            phase,
            failed_in,
            failures,
            diagnostics,
            elapsed: start.elapsed(),
        }
    }

    async fn execute(
        &mut self,
        ctx: &RunContext,
        rollback: &mut Rollback,
    ) -> Result<(), (Vec<StepError>, Option<Diagnostics>)> {
        if let Some(cause) = ctx.err() {
            return Err((vec![StepError::Timeout(cause)], None));
        }

        let cluster = self
            .env
            .connector
            .connect(self.step.cluster_ref(), self.step.lazy_connect)
            .await
            .map_err(|e| (vec![StepError::Connect(e)], None))?;

        let step_timeout = self.step.effective_timeout(self.env.default_timeout);

        self.phase = StepPhase::Cleaning;
        let clean_ctx = ctx.with_timeout(step_timeout);
        self.clean(&clean_ctx, &cluster)
            .await
            .map_err(|e| (e, None))?;

        self.phase = StepPhase::Applying;
        let apply_ctx = ctx.with_timeout(step_timeout);
        self.apply(&apply_ctx, &cluster, rollback)
            .await
            .map_err(|e| (e, None))?;

        self.phase = StepPhase::Polling;
        let poll_ctx = ctx.with_timeout(self.step.polling_timeout(self.env.default_timeout));
        let failures = self.poll(&poll_ctx, &cluster).await;
        if failures.is_empty() {
            return Ok(());
        }

        let diagnostics = self.collect_diagnostics(ctx, &cluster, step_timeout).await;
        Err((failures, diagnostics))
    }

    fn bound(&self, ctx: &RunContext, cluster: &Cluster) -> SharedClient {
        Arc::new(RetryingClient::new(cluster.client.clone(), ctx.clone()))
    }

    fn command_env(&self, cluster: &Cluster) -> CommandEnv {
        CommandEnv {
            namespace: self.env.namespace.clone(),
            kubeconfig: cluster.kubeconfig.clone(),
            work_dir: self.env.work_dir.clone(),
        }
    }

    /// Copy of `doc` placed in the step namespace when its type is namespaced
    async fn place(
        &self,
        discovery: &dyn Discovery,
        doc: &ResourceDocument,
    ) -> Result<ResourceDocument, StepError> {
        if self.step.unit_test || doc.namespace().is_some() {
            return Ok(doc.clone());
        }
        let namespaced = discovery
            .is_namespaced(&doc.type_id())
            .await
            .map_err(|source| StepError::Discovery {
                resource: doc.id(),
                source,
            })?;
        if namespaced {
            Ok(doc.with_namespace(&self.env.namespace))
        } else {
            Ok(doc.clone())
        }
    }

    async fn delete_namespace_for(
        &self,
        discovery: &dyn Discovery,
        reference: &DeleteRef,
    ) -> Result<Option<String>, StepError> {
        if let Some(ns) = &reference.namespace {
            return Ok(Some(ns.clone()));
        }
        let type_id = reference.type_id();
        let namespaced = discovery
            .is_namespaced(&type_id)
            .await
            .map_err(|source| StepError::Discovery {
                resource: type_id.to_string(),
                source,
            })?;
        Ok(namespaced.then(|| self.env.namespace.clone()))
    }

    async fn clean(&self, ctx: &RunContext, cluster: &Cluster) -> Result<(), Vec<StepError>> {
        if self.step.delete.is_empty() {
            return Ok(());
        }
        let client = self.bound(ctx, cluster);
        let mut targets: Vec<ObjectKey> = Vec::new();

        for reference in &self.step.delete {
            let namespace = self
                .delete_namespace_for(cluster.discovery.as_ref(), reference)
                .await
                .map_err(|e| vec![e])?;
            let type_id = reference.type_id();

            let keys = match &reference.name {
                Some(name) => vec![ObjectKey::new(type_id, namespace.as_deref(), name)],
                None => client
                    .list(&type_id, namespace.as_deref(), &reference.selector())
                    .await
                    .map_err(|source| {
                        vec![StepError::Client {
                            resource: format!("{} {}", type_id.kind, reference.selector()),
                            source,
                        }]
                    })?
                    .iter()
                    .filter_map(ResourceDocument::key)
                    .collect(),
            };

            for key in keys {
                match client.delete(&key).await {
                    Ok(()) => debug!(resource = %key, "Deleted before step"),
                    Err(err) if err.is_not_found() => {}
                    Err(source) => {
                        return Err(vec![StepError::Client {
                            resource: key.to_string(),
                            source,
                        }])
                    }
                }
                targets.push(key);
            }
        }

        wait_gone(ctx, &client, &targets, DELETE_POLL_INTERVAL)
            .await
            .map_err(|e| vec![StepError::Cleanup(e)])
    }

    async fn apply(
        &self,
        ctx: &RunContext,
        cluster: &Cluster,
        rollback: &mut Rollback,
    ) -> Result<(), Vec<StepError>> {
        let env = self.command_env(cluster);
        for command in &self.step.commands {
            run_command(ctx, command, &env, &self.env.background)
                .await
                .map_err(|e| vec![StepError::Command(e)])?;
        }

        let client = self.bound(ctx, cluster);
        let mut errors = Vec::new();
        for doc in &self.step.apply {
            let placed = match self.place(cluster.discovery.as_ref(), doc).await {
                Ok(placed) => placed,
                Err(e) => {
                    errors.push(e);
                    continue;
                }
            };

            match create_or_update(ctx, &client, &placed, true).await {
                Ok(updated) => {
                    if !updated && !self.env.suppress_rollback {
                        if let Some(key) = placed.key() {
                            rollback.register(cluster.client.clone(), key);
                        }
                    }
                }
                Err(source) => errors.push(StepError::Apply {
                    resource: placed.id(),
                    source,
                }),
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    async fn poll(&self, ctx: &RunContext, cluster: &Cluster) -> Vec<StepError> {
        let client = self.bound(ctx, cluster);
        let mut sweeps = 0u32;
        let mut last: Vec<StepError> = Vec::new();

        loop {
            sweeps += 1;
            let failures = self.sweep(ctx, &client, cluster).await;
            if failures.is_empty() {
                debug!(sweeps = sweeps, "Assertions satisfied");
                return failures;
            }
            if failures.iter().any(StepError::is_deadline_exceeded) {
                debug!(sweeps = sweeps, "Deadline exceeded during sweep");
                // the previous complete sweep says more than a bare timeout
                return if last.is_empty() { failures } else { last };
            }
            debug!(sweeps = sweeps, failures = failures.len(), "Assertions not yet satisfied");
            last = failures;

            if ctx.sleep(self.env.poll_interval).await.is_err() {
                return last;
            }
        }
    }

    /// Evaluate every assertion once
    async fn sweep(
        &self,
        ctx: &RunContext,
        client: &SharedClient,
        cluster: &Cluster,
    ) -> Vec<StepError> {
        let mut failures = Vec::new();

        for doc in &self.step.asserts {
            match self.place(cluster.discovery.as_ref(), doc).await {
                Ok(expected) => failures.extend(check_present(client, &expected).await),
                Err(e) => failures.push(e),
            }
        }

        if let Some(block) = &self.step.assert_block {
            let env = self.command_env(cluster);
            for command in &block.commands {
                if let Err(e) = run_command(ctx, command, &env, &self.env.background).await {
                    failures.push(StepError::Command(e));
                }
            }

            if !block.expressions.is_empty() {
                match self.bindings(client, cluster, block).await {
                    Ok(bindings) => failures.extend(
                        check_expressions(self.env.predicates.as_ref(), &bindings, &block.expressions)
                            .into_iter()
                            .map(StepError::Expression),
                    ),
                    Err(e) => failures.push(e),
                }
            }
        }

        for doc in &self.step.errors {
            match self.place(cluster.discovery.as_ref(), doc).await {
                Ok(forbidden) => failures.extend(check_absent(client, &forbidden).await),
                Err(e) => failures.push(e),
            }
        }

        failures
    }

    async fn bindings(
        &self,
        client: &SharedClient,
        cluster: &Cluster,
        block: &TestAssertSpec,
    ) -> Result<BTreeMap<String, serde_json::Value>, StepError> {
        let mut bindings = BTreeMap::new();
        for reference in &block.expressions.resource_refs {
            let type_id = reference.type_id();
            let namespace = match &reference.namespace {
                Some(ns) => Some(ns.clone()),
                None => {
                    let namespaced = cluster
                        .discovery
                        .is_namespaced(&type_id)
                        .await
                        .map_err(|source| StepError::Discovery {
                            resource: type_id.to_string(),
                            source,
                        })?;
                    namespaced.then(|| self.env.namespace.clone())
                }
            };
            let key = ObjectKey::new(type_id, namespace.as_deref(), &reference.name);
            let doc = client.get(&key).await.map_err(|e| {
                StepError::Expression(PredicateError::Binding {
                    name: reference.binding.clone(),
                    reason: e.to_string(),
                })
            })?;
            bindings.insert(reference.binding.clone(), doc.into_value());
        }
        Ok(bindings)
    }

    async fn collect_diagnostics(
        &self,
        ctx: &RunContext,
        cluster: &Cluster,
        timeout: Duration,
    ) -> Option<Diagnostics> {
        let collectors = self
            .step
            .assert_block
            .as_ref()
            .map(|block| block.collectors.as_slice())
            .unwrap_or_default();
        if collectors.is_empty() {
            return None;
        }

        let collect_ctx = ctx.with_timeout(timeout);
        let client = self.bound(&collect_ctx, cluster);
        let diagnostics = collect(
            &collect_ctx,
            collectors,
            &self.step.name,
            &client,
            &self.command_env(cluster),
        )
        .await;
        Some(diagnostics)
    }
}
