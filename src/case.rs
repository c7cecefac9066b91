//! Test case lifecycle
//!
//! A case owns a namespace and runs its steps in index order against it:
//!
//! 1. Resolve the namespace: the given one, or a fresh generated
//!    `koe-<adjective>-<noun>-<suffix>`. A generated name that already exists
//!    is never adopted; another one is drawn instead.
//! 2. Connect the primary cluster and every other cluster named by a
//!    non-lazy step, creating the namespace on each where missing.
//! 3. Run steps one by one. The first failing step stops the case and every
//!    later step is skipped.
//! 4. Roll back created objects, then delete the namespaces the case created
//!    and wait for them to disappear.
//!
//! Step 4 is best-effort: failures are logged and never change the outcome.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::Namespace;
use kube::api::ObjectMeta;
use rand::seq::SliceRandom;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::cancel::RunContext;
use crate::client::{Cluster, ClientError, ClusterConnector, RetryingClient, SharedClient};
use crate::predicate::{NoPredicates, PredicateEvaluator};
use crate::resource::{ObjectKey, ResourceDocument, TypeId};
use crate::runner::BackgroundProcesses;
use crate::step::{
    Rollback, Step, StepEngine, StepEnv, StepOutcome, DEFAULT_TIMEOUT, POLL_INTERVAL,
};
use crate::wait::wait_gone;

/// Label put on every namespace a case creates
pub const TEST_LABEL: &str = "koe.dev/test";

const ADJECTIVES: &[&str] = &[
    "amber", "brave", "calm", "crisp", "eager", "fuzzy", "gentle", "glad", "hazy", "jolly",
    "keen", "lucky", "mellow", "nimble", "proud", "quick", "quiet", "rapid", "shy", "sunny",
    "swift", "tidy", "vivid", "witty",
];

const NOUNS: &[&str] = &[
    "badger", "beacon", "canyon", "cedar", "comet", "falcon", "fjord", "glacier", "harbor",
    "heron", "island", "lagoon", "lynx", "maple", "meadow", "otter", "pebble", "pine", "raven",
    "river", "sparrow", "summit", "tundra", "walrus",
];

const SUFFIX_CHARS: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
const SUFFIX_LEN: usize = 5;

/// Generated names drawn before giving up on finding a free one
const NAMESPACE_ATTEMPTS: usize = 5;

/// Case setup failures
#[derive(Debug, thiserror::Error)]
pub enum CaseError {
    #[error("failed to connect to cluster {kubeconfig}: {source}")]
    Connect {
        kubeconfig: String,
        source: ClientError,
    },

    #[error("failed to create namespace {namespace}: {source}")]
    Namespace {
        namespace: String,
        source: ClientError,
    },

    #[error("generated namespace {namespace} already exists on cluster {kubeconfig}")]
    NamespaceTaken {
        namespace: String,
        kubeconfig: String,
    },
}

/// A named, ordered list of steps
#[derive(Debug, Clone, Default)]
pub struct Case {
    pub name: String,
    /// Directory the case was loaded from; commands run here
    pub dir: Option<PathBuf>,
    pub steps: Vec<Step>,
}

impl Case {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn step(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    #[must_use]
    pub fn dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dir = Some(dir.into());
        self
    }
}

/// Settings shared by every case of a run
#[derive(Clone)]
pub struct CaseOptions {
    /// Fixed namespace; generated per case when `None`
    pub namespace: Option<String>,
    pub skip_delete: bool,
    pub suppress_rollback: bool,
    pub default_timeout: Duration,
    pub poll_interval: Duration,
    pub predicates: Arc<dyn PredicateEvaluator>,
    pub background: BackgroundProcesses,
}

impl Default for CaseOptions {
    fn default() -> Self {
        Self {
            namespace: None,
            skip_delete: false,
            suppress_rollback: false,
            default_timeout: DEFAULT_TIMEOUT,
            poll_interval: POLL_INTERVAL,
            predicates: Arc::new(NoPredicates),
            background: BackgroundProcesses::new(),
        }
    }
}

/// Result of running one case
#[derive(Debug)]
pub struct CaseOutcome {
    pub name: String,
    pub namespace: String,
    pub setup_error: Option<CaseError>,
    pub steps: Vec<StepOutcome>,
    /// Names of steps never started because an earlier one failed
    pub skipped: Vec<String>,
    pub elapsed: Duration,
}

impl CaseOutcome {
    pub fn passed(&self) -> bool {
        self.setup_error.is_none() && self.steps.iter().all(StepOutcome::passed)
    }

    /// The step that ended the case, if any
    pub fn failed_step(&self) -> Option<&StepOutcome> {
        self.steps.iter().find(|s| !s.passed())
    }
}

/// Generate a namespace name such as `koe-quiet-otter-x7k2p`
pub fn generate_namespace() -> String {
    let mut rng = rand::thread_rng();
    let adjective = ADJECTIVES.choose(&mut rng).copied().unwrap_or("quiet");
    let noun = NOUNS.choose(&mut rng).copied().unwrap_or("otter");
    let suffix: String = (0..SUFFIX_LEN)
        .filter_map(|_| SUFFIX_CHARS.choose(&mut rng).map(|&b| char::from(b)))
        .collect();
    format!("koe-{adjective}-{noun}-{suffix}")
}

type Namer = Arc<dyn Fn() -> String + Send + Sync>;

/// Namespace owned by a case on one cluster
struct OwnedNamespace {
    cluster: Cluster,
    created: bool,
}

/// Runs cases against the clusters a connector hands out
pub struct CaseOrchestrator {
    connector: Arc<dyn ClusterConnector>,
    options: CaseOptions,
    namer: Namer,
}

impl CaseOrchestrator {
    #[must_use]
    pub fn new(connector: Arc<dyn ClusterConnector>) -> Self {
        Self {
            connector,
            options: CaseOptions::default(),
            namer: Arc::new(generate_namespace),
        }
    }

    #[must_use]
    pub fn options(mut self, options: CaseOptions) -> Self {
        self.options = options;
        self
    }

    #[must_use]
    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.options.namespace = Some(namespace.into());
        self
    }

    #[must_use]
    pub fn skip_delete(mut self, skip: bool) -> Self {
        self.options.skip_delete = skip;
        self
    }

    #[must_use]
    pub fn default_timeout(mut self, timeout: Duration) -> Self {
        self.options.default_timeout = timeout;
        self
    }

    /// Run `case` to completion
    #[instrument(skip_all, fields(case = %case.name))]
    pub async fn run(&self, ctx: &RunContext, mut case: Case) -> CaseOutcome {
        let start = Instant::now();
        case.steps.sort_by_key(|s| s.index);
        let mut owned: Vec<OwnedNamespace> = Vec::new();
        let mut rollback = Rollback::new();

        let mut namespace = self
            .options
            .namespace
            .clone()
            .unwrap_or_else(|| (self.namer)());
        let prepared = self.prepare(ctx, &case, &mut namespace, &mut owned).await;
        info!(namespace = %namespace, steps = case.steps.len(), "Case starting");

        let mut outcome = CaseOutcome {
            name: case.name.clone(),
            namespace: namespace.clone(),
            setup_error: None,
            steps: Vec::new(),
            skipped: Vec::new(),
            elapsed: Duration::ZERO,
        };

        match prepared {
            Ok(()) => {
                self.run_steps(ctx, &case, &namespace, &mut owned, &mut rollback, &mut outcome)
                    .await;
            }
            Err(err) => {
                warn!(error = %err, "Case setup failed");
                outcome.skipped = case.steps.iter().map(|s| s.name.clone()).collect();
                outcome.setup_error = Some(err);
            }
        }

        self.teardown(&namespace, owned, &mut rollback).await;

        outcome.elapsed = start.elapsed();
        if outcome.passed() {
            info!(elapsed = ?outcome.elapsed, "Case passed");
        } else {
            warn!(elapsed = ?outcome.elapsed, skipped = outcome.skipped.len(), "Case failed");
        }
        outcome
    }

    fn generated(&self) -> bool {
        self.options.namespace.is_none()
    }

    /// Connect the primary and every eagerly connected cluster
    ///
    /// A generated `namespace` found already present on the primary cluster
    /// is replaced by a newly drawn name.
    async fn prepare(
        &self,
        ctx: &RunContext,
        case: &Case,
        namespace: &mut String,
        owned: &mut Vec<OwnedNamespace>,
    ) -> Result<(), CaseError> {
        let mut attempt = 1;
        loop {
            match self.acquire(ctx, "", false, namespace, owned).await {
                Err(CaseError::NamespaceTaken { .. })
                    if self.generated() && attempt < NAMESPACE_ATTEMPTS =>
                {
                    let next = (self.namer)();
                    debug!(taken = %namespace, next = %next, "Generated namespace exists, drawing another");
                    *namespace = next;
                    attempt += 1;
                }
                result => break result?,
            }
        }

        let mut refs: Vec<&str> = Vec::new();
        for step in case.steps.iter().filter(|s| !s.lazy_connect) {
            let r = step.cluster_ref();
            if !r.is_empty() && !refs.contains(&r) {
                refs.push(r);
            }
        }

        for kubeconfig in refs {
            self.acquire(ctx, kubeconfig, false, namespace, owned).await?;
        }
        Ok(())
    }

    async fn acquire(
        &self,
        ctx: &RunContext,
        kubeconfig: &str,
        force_new: bool,
        namespace: &str,
        owned: &mut Vec<OwnedNamespace>,
    ) -> Result<(), CaseError> {
        let cluster = self
            .connector
            .connect(kubeconfig, force_new)
            .await
            .map_err(|source| CaseError::Connect {
                kubeconfig: display(kubeconfig).to_string(),
                source,
            })?;

        if owned.iter().any(|o| o.cluster.kubeconfig == cluster.kubeconfig) {
            return Ok(());
        }

        let setup_ctx = ctx.with_timeout(self.options.default_timeout);
        let client: SharedClient = Arc::new(RetryingClient::new(
            cluster.client.clone(),
            setup_ctx,
        ));
        let created = if self.generated() {
            // a generated name must be new; an existing one belongs to someone else
            match create_namespace(&client, namespace).await {
                Ok(()) => true,
                Err(err) if err.is_already_exists() => {
                    return Err(CaseError::NamespaceTaken {
                        namespace: namespace.to_string(),
                        kubeconfig: display(kubeconfig).to_string(),
                    })
                }
                Err(source) => {
                    return Err(CaseError::Namespace {
                        namespace: namespace.to_string(),
                        source,
                    })
                }
            }
        } else {
            ensure_namespace(&client, namespace)
                .await
                .map_err(|source| CaseError::Namespace {
                    namespace: namespace.to_string(),
                    source,
                })?
        };
        owned.push(OwnedNamespace { cluster, created });
        Ok(())
    }

    async fn run_steps(
        &self,
        ctx: &RunContext,
        case: &Case,
        namespace: &str,
        owned: &mut Vec<OwnedNamespace>,
        rollback: &mut Rollback,
        outcome: &mut CaseOutcome,
    ) {
        let mut env = StepEnv::new(namespace, self.connector.clone());
        env.default_timeout = self.options.default_timeout;
        env.suppress_rollback = self.options.suppress_rollback;
        env.predicates = self.options.predicates.clone();
        env.background = self.options.background.clone();
        env.work_dir = case.dir.clone();
        env.poll_interval = self.options.poll_interval;

        let mut steps = case.steps.iter();
        while let Some(step) = steps.next() {
            let mut step = step.clone();
            if step.lazy_connect {
                // connect just in time and reuse that client for the step
                match self
                    .acquire(ctx, step.cluster_ref(), true, namespace, owned)
                    .await
                {
                    Ok(()) => {}
                    Err(err @ CaseError::NamespaceTaken { .. }) => {
                        warn!(step = %step.name, error = %err, "Lazy cluster already has the case namespace");
                        outcome.skipped = std::iter::once(step.name.clone())
                            .chain(steps.by_ref().map(|s| s.name.clone()))
                            .collect();
                        outcome.setup_error = Some(err);
                        break;
                    }
                    Err(err) => {
                        warn!(step = %step.name, error = %err, "Lazy cluster setup failed");
                    }
                }
                step.lazy_connect = false;
            }

            let result = StepEngine::new(step, env.clone()).run(ctx, rollback).await;
            let failed = !result.passed();
            outcome.steps.push(result);
            if failed {
                outcome.skipped = steps.by_ref().map(|s| s.name.clone()).collect();
                break;
            }
        }
    }

    async fn teardown(&self, namespace: &str, owned: Vec<OwnedNamespace>, rollback: &mut Rollback) {
        // independent of the run context so cleanup still happens after Ctrl-C
        let ctx = RunContext::new().with_timeout(self.options.default_timeout);

        if !rollback.is_empty() {
            let deleted = rollback.run(&ctx).await;
            debug!(deleted = deleted, "Rollback finished");
        }

        if self.options.skip_delete {
            info!(namespace = %namespace, "Keeping namespace");
            return;
        }

        for entry in owned.into_iter().filter(|o| o.created) {
            let client: SharedClient =
                Arc::new(RetryingClient::new(entry.cluster.client.clone(), ctx.clone()));
            let key = namespace_key(namespace);
            match client.delete(&key).await {
                Ok(()) => {}
                Err(err) if err.is_not_found() => continue,
                Err(err) => {
                    warn!(namespace = %namespace, kubeconfig = %display(&entry.cluster.kubeconfig), error = %err, "Failed to delete namespace");
                    continue;
                }
            }
            match wait_gone(&ctx, &client, &[key], POLL_INTERVAL).await {
                Ok(()) => info!(namespace = %namespace, kubeconfig = %display(&entry.cluster.kubeconfig), "Deleted test namespace"),
                Err(err) => warn!(namespace = %namespace, "Namespace deletion did not finish:\n{err}"),
            }
        }
    }
}

fn namespace_key(namespace: &str) -> ObjectKey {
    ObjectKey::new(TypeId::namespace(), None, namespace)
}

/// Create `namespace` unless it exists; `true` when this call created it
pub async fn ensure_namespace(client: &SharedClient, namespace: &str) -> Result<bool, ClientError> {
    match client.get(&namespace_key(namespace)).await {
        Ok(_) => {
            debug!(namespace = %namespace, "Using existing namespace");
            return Ok(false);
        }
        Err(err) if err.is_not_found() => {}
        Err(err) => return Err(err),
    }

    match create_namespace(client, namespace).await {
        Ok(()) => Ok(true),
        Err(err) if err.is_already_exists() => Ok(false),
        Err(err) => Err(err),
    }
}

/// Create `namespace` with the test label; fails with `AlreadyExists` if present
pub async fn create_namespace(client: &SharedClient, namespace: &str) -> Result<(), ClientError> {
    let ns = Namespace {
        metadata: ObjectMeta {
            name: Some(namespace.to_string()),
            labels: Some(
                [(TEST_LABEL.to_string(), "true".to_string())]
                    .into_iter()
                    .collect(),
            ),
            ..Default::default()
        },
        ..Default::default()
    };
    let value = serde_json::to_value(&ns)
        .map_err(|e| ClientError::MalformedResponse(e.to_string()))?;
    let mut doc = ResourceDocument::from_value(value)
        .map_err(|e| ClientError::Invalid(e.to_string()))?;
    doc.ensure_type(&TypeId::namespace());

    client.create(&doc).await?;
    info!(namespace = %namespace, "Created test namespace");
    Ok(())
}

fn display(kubeconfig: &str) -> &str {
    if kubeconfig.is_empty() {
        "<default>"
    } else {
        kubeconfig
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{MemoryClient, MemoryConnector, Op};
    use crate::registry::TypeRegistry;
    use serde_json::{json, Value};
    use std::collections::{HashSet, VecDeque};

    fn connector() -> Arc<MemoryConnector> {
        let registry = TypeRegistry::builder()
            .with_builtin()
            .namespaced("example.com", "Widget")
            .build_shared();
        Arc::new(MemoryConnector::new(registry))
    }

    fn doc(value: Value) -> ResourceDocument {
        ResourceDocument::from_value(value).unwrap()
    }

    fn widget(name: &str) -> ResourceDocument {
        doc(json!({
            "apiVersion": "example.com/v1",
            "kind": "Widget",
            "metadata": { "name": name },
            "spec": { "replicas": 1 }
        }))
    }

    fn namespaces(memory: &MemoryClient) -> Vec<String> {
        memory
            .objects()
            .iter()
            .filter(|d| d.type_id().same_kind(&TypeId::namespace()))
            .filter_map(|d| d.name().map(String::from))
            .collect()
    }

    /// Names handed out in order, repeating the last one
    fn scripted(names: &[&str]) -> Namer {
        let queue = std::sync::Mutex::new(
            names.iter().map(|n| n.to_string()).collect::<VecDeque<_>>(),
        );
        Arc::new(move || {
            let mut queue = queue.lock().unwrap();
            if queue.len() > 1 {
                queue.pop_front().unwrap()
            } else {
                queue.front().cloned().unwrap()
            }
        })
    }

    fn foreign_namespace(memory: &MemoryClient, name: &str) {
        memory
            .put(ResourceDocument::new(&TypeId::namespace(), name))
            .unwrap();
    }

    #[test]
    fn test_generated_namespace_shape() {
        let ns = generate_namespace();
        let parts: Vec<&str> = ns.split('-').collect();
        assert_eq!(parts.len(), 4);
        assert_eq!(parts[0], "koe");
        assert!(ADJECTIVES.contains(&parts[1]));
        assert!(NOUNS.contains(&parts[2]));
        assert_eq!(parts[3].len(), SUFFIX_LEN);
        assert!(parts[3]
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit()));
        assert!(ns.len() <= 63);
    }

    #[test]
    fn test_generated_namespaces_do_not_repeat() {
        let names: HashSet<String> = (0..2000).map(|_| generate_namespace()).collect();
        assert_eq!(names.len(), 2000);
    }

    #[tokio::test]
    async fn test_generated_name_never_adopts_foreign_namespace() {
        let connector = connector();
        let memory = connector.cluster("");
        foreign_namespace(&memory, "koe-quiet-otter-aaaaa");
        let case = Case::new("fresh").step(Step::new(0, "apply").apply(widget("w1")));

        let mut orchestrator = CaseOrchestrator::new(connector.clone());
        orchestrator.namer = scripted(&["koe-quiet-otter-aaaaa", "koe-quiet-otter-bbbbb"]);
        let outcome = orchestrator.run(&RunContext::new(), case).await;

        assert!(outcome.passed(), "{outcome:?}");
        assert_eq!(outcome.namespace, "koe-quiet-otter-bbbbb");
        assert_eq!(namespaces(&memory), vec!["koe-quiet-otter-aaaaa".to_string()]);
        assert_eq!(memory.objects().len(), 1, "only the foreign namespace is left");
    }

    #[tokio::test]
    async fn test_generated_names_exhausted_fails_setup() {
        let connector = connector();
        let memory = connector.cluster("");
        foreign_namespace(&memory, "koe-quiet-otter-aaaaa");
        let case = Case::new("crowded").step(Step::new(0, "apply").apply(widget("w1")));

        let mut orchestrator = CaseOrchestrator::new(connector.clone());
        orchestrator.namer = scripted(&["koe-quiet-otter-aaaaa"]);
        let outcome = orchestrator.run(&RunContext::new(), case).await;

        assert!(matches!(
            outcome.setup_error,
            Some(CaseError::NamespaceTaken { ref namespace, .. }) if namespace == "koe-quiet-otter-aaaaa"
        ));
        assert!(outcome.steps.is_empty());
        assert_eq!(outcome.skipped, vec!["apply".to_string()]);
        assert_eq!(memory.calls(Op::Create), NAMESPACE_ATTEMPTS);
        assert_eq!(
            namespaces(&memory),
            vec!["koe-quiet-otter-aaaaa".to_string()],
            "foreign namespace left alone"
        );
    }

    #[tokio::test]
    async fn test_concurrent_cases_get_their_own_namespaces() {
        let connector = connector();
        let memory = connector.cluster("");
        let orchestrator = Arc::new(CaseOrchestrator::new(connector.clone()));

        let mut handles = Vec::new();
        for i in 0..8 {
            let orchestrator = orchestrator.clone();
            let case = Case::new(format!("case-{i}"))
                .step(Step::new(0, "apply").apply(widget("w1")));
            handles.push(tokio::spawn(async move {
                orchestrator.run(&RunContext::new(), case).await
            }));
        }

        let mut seen = HashSet::new();
        for handle in handles {
            let outcome = handle.await.unwrap();
            assert!(outcome.passed(), "{outcome:?}");
            assert!(seen.insert(outcome.namespace));
        }
        assert!(memory.objects().is_empty());
    }

    #[tokio::test]
    async fn test_ensure_namespace_labels_and_reports_creation() {
        let memory = Arc::new(MemoryClient::with_builtin_types());
        let client: SharedClient = memory.clone();

        assert!(ensure_namespace(&client, "ns-1").await.unwrap());
        assert!(!ensure_namespace(&client, "ns-1").await.unwrap());

        let stored = client.get(&namespace_key("ns-1")).await.unwrap();
        assert_eq!(stored.labels().get(TEST_LABEL).map(String::as_str), Some("true"));
    }

    #[tokio::test]
    async fn test_passing_case_cleans_up_namespace() {
        let connector = connector();
        let memory = connector.cluster("");
        let case = Case::new("install").step(Step::new(0, "apply").apply(widget("w1")));

        let outcome = CaseOrchestrator::new(connector.clone())
            .run(&RunContext::new(), case)
            .await;

        assert!(outcome.passed(), "{outcome:?}");
        assert!(outcome.namespace.starts_with("koe-"));
        assert_eq!(outcome.steps.len(), 1);
        assert!(memory.objects().is_empty(), "namespace and widget removed");
    }

    #[tokio::test]
    async fn test_existing_namespace_is_kept() {
        let connector = connector();
        let memory = connector.cluster("");
        memory
            .put(ResourceDocument::new(&TypeId::namespace(), "shared"))
            .unwrap();
        let case = Case::new("reuse").step(Step::new(0, "apply").apply(widget("w1")));

        let outcome = CaseOrchestrator::new(connector.clone())
            .namespace("shared")
            .run(&RunContext::new(), case)
            .await;

        assert!(outcome.passed());
        assert_eq!(namespaces(&memory), vec!["shared".to_string()]);
        assert_eq!(memory.objects().len(), 1, "created widget rolled back");
    }

    #[tokio::test]
    async fn test_skip_delete_keeps_created_namespace() {
        let connector = connector();
        let memory = connector.cluster("");
        let case = Case::new("keep").step(Step::new(0, "noop"));

        CaseOrchestrator::new(connector.clone())
            .namespace("kept")
            .skip_delete(true)
            .run(&RunContext::new(), case)
            .await;

        assert_eq!(namespaces(&memory), vec!["kept".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_steps_run_in_order_and_stop_at_first_failure() {
        let connector = connector();
        let memory = connector.cluster("");
        let case = Case::new("ordered")
            .step(Step::new(2, "third").apply(widget("w3")))
            .step(
                Step::new(1, "second")
                    .assert(widget("missing"))
                    .timeout(Duration::from_secs(1)),
            )
            .step(Step::new(0, "first").apply(widget("w1")))
            .step(Step::new(3, "fourth"));

        let outcome = CaseOrchestrator::new(connector.clone())
            .namespace("ns-1")
            .run(&RunContext::new(), case)
            .await;

        assert!(!outcome.passed());
        let ran: Vec<&str> = outcome.steps.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(ran, vec!["first", "second"]);
        assert_eq!(outcome.skipped, vec!["third".to_string(), "fourth".to_string()]);
        assert_eq!(outcome.failed_step().map(|s| s.name.as_str()), Some("second"));
        assert_eq!(memory.calls(Op::Create), 2, "namespace and w1 only");
        assert!(memory.objects().is_empty());
    }

    #[tokio::test]
    async fn test_secondary_cluster_gets_namespace_eagerly() {
        let connector = connector();
        let remote = connector.cluster("/tmp/remote.yaml");
        let case = Case::new("multi")
            .step(Step::new(0, "local"))
            .step(Step::new(1, "remote").kubeconfig("/tmp/remote.yaml"));

        let outcome = CaseOrchestrator::new(connector.clone())
            .namespace("ns-1")
            .skip_delete(true)
            .run(&RunContext::new(), case)
            .await;

        assert!(outcome.passed());
        assert_eq!(namespaces(&remote), vec!["ns-1".to_string()]);
    }

    #[tokio::test]
    async fn test_unreachable_cluster_fails_setup_and_skips_steps() {
        let connector = connector();
        connector.unreachable("/tmp/remote.yaml");
        let memory = connector.cluster("");
        let case = Case::new("multi")
            .step(Step::new(0, "local").apply(widget("w1")))
            .step(Step::new(1, "remote").kubeconfig("/tmp/remote.yaml"));

        let outcome = CaseOrchestrator::new(connector.clone())
            .namespace("ns-1")
            .run(&RunContext::new(), case)
            .await;

        assert!(matches!(outcome.setup_error, Some(CaseError::Connect { .. })));
        assert!(outcome.steps.is_empty());
        assert_eq!(outcome.skipped.len(), 2);
        assert!(memory.objects().is_empty(), "primary namespace torn down");
    }

    #[tokio::test]
    async fn test_lazy_cluster_connected_when_step_runs() {
        let connector = connector();
        connector.unreachable("/tmp/lazy.yaml");
        let case = Case::new("lazy")
            .step(Step::new(0, "local"))
            .step(Step::new(1, "later").kubeconfig("/tmp/lazy.yaml").lazy());

        let outcome = CaseOrchestrator::new(connector.clone())
            .namespace("ns-1")
            .run(&RunContext::new(), case)
            .await;

        assert!(outcome.setup_error.is_none(), "lazy cluster not touched during setup");
        assert_eq!(outcome.steps.len(), 2);
        assert!(outcome.steps[0].passed());
        assert!(!outcome.steps[1].passed());
    }
}
