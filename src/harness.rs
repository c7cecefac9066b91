//! Suite runner
//!
//! Discovers cases, runs suite setup commands, then runs cases concurrently
//! on a bounded pool. Background processes started anywhere in the run are
//! killed once every case has finished.

use std::sync::Arc;

use tokio::sync::Semaphore;
use tracing::{error, info, instrument, warn};

use crate::cancel::RunContext;
use crate::case::{CaseOptions, CaseOrchestrator};
use crate::client::ClusterConnector;
use crate::config::{ConfigError, HarnessConfig};
use crate::discover::{discover_cases, DiscoverError};
use crate::predicate::{NoPredicates, PredicateEvaluator};
use crate::report::{CaseReport, ReportError, ReportSink, SuiteReport};
use crate::runner::{run_command, BackgroundProcesses, CommandEnv, RunnerError};

/// Errors that stop a run before or after its cases
#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Discover(#[from] DiscoverError),

    #[error("no test case named '{0}'")]
    TestNotFound(String),

    #[error("suite setup failed: {0}")]
    Setup(RunnerError),

    #[error(transparent)]
    Report(#[from] ReportError),
}

/// Runs every case of a suite
pub struct Harness {
    config: HarnessConfig,
    connector: Arc<dyn ClusterConnector>,
    predicates: Arc<dyn PredicateEvaluator>,
    sink: Option<Arc<dyn ReportSink>>,
}

impl Harness {
    pub fn new(config: HarnessConfig, connector: Arc<dyn ClusterConnector>) -> Self {
        Self {
            config,
            connector,
            predicates: Arc::new(NoPredicates),
            sink: None,
        }
    }

    /// Evaluate assertion expressions with `evaluator`
    pub fn predicates(mut self, evaluator: Arc<dyn PredicateEvaluator>) -> Self {
        self.predicates = evaluator;
        self
    }

    /// Send case and suite results to `sink`
    pub fn sink(mut self, sink: Arc<dyn ReportSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Run the suite
    ///
    /// Case failures are part of the returned report, not errors.
    #[instrument(skip_all)]
    pub async fn run(&self, ctx: &RunContext) -> Result<SuiteReport, HarnessError> {
        self.config.validate()?;

        let mut cases = discover_cases(&self.config.test_dirs)?;
        if let Some(only) = &self.config.test {
            cases.retain(|c| &c.name == only);
            if cases.is_empty() {
                return Err(HarnessError::TestNotFound(only.clone()));
            }
        }
        info!(cases = cases.len(), dirs = self.config.test_dirs.len(), "Discovered test cases");

        let background = BackgroundProcesses::new();
        let mut suite = SuiteReport::new();

        if let Err(err) = self.setup(ctx, &background).await {
            background.kill_all().await;
            return Err(err);
        }

        // cases sharing one fixed namespace must not overlap
        let parallel = if self.config.namespace.is_some() {
            1
        } else {
            self.config.parallel
        };
        let orchestrator = Arc::new(
            CaseOrchestrator::new(self.connector.clone()).options(CaseOptions {
                namespace: self.config.namespace.clone(),
                skip_delete: self.config.skip_delete,
                suppress_rollback: self.config.rollback_suppressed(),
                default_timeout: self.config.timeout,
                predicates: self.predicates.clone(),
                background: background.clone(),
                ..CaseOptions::default()
            }),
        );

        let pool = Arc::new(Semaphore::new(parallel));
        let mut handles = Vec::with_capacity(cases.len());
        for case in cases {
            let name = case.name.clone();
            let sem = pool.clone();
            let orchestrator = orchestrator.clone();
            let ctx = ctx.child();
            handles.push((
                name,
                tokio::spawn(async move {
                    let _permit = sem.acquire().await.ok();
                    orchestrator.run(&ctx, case).await
                }),
            ));
        }

        for (name, handle) in handles {
            let report = match handle.await {
                Ok(outcome) => CaseReport::from(&outcome),
                Err(err) => {
                    error!(case = %name, error = %err, "Case task did not complete");
                    CaseReport {
                        name,
                        namespace: String::new(),
                        status: crate::report::Status::Failed,
                        elapsed_secs: 0.0,
                        setup_error: Some(err.to_string()),
                        steps: Vec::new(),
                    }
                }
            };
            if let Some(sink) = &self.sink {
                sink.case_finished(&report).await;
            }
            suite.add(report);
        }

        if !background.is_empty() {
            info!(count = background.len(), "Stopping background processes");
            background.kill_all().await;
        }

        suite.finish();
        if suite.failed > 0 {
            warn!(passed = suite.passed, failed = suite.failed, "Suite failed");
        } else {
            info!(passed = suite.passed, "Suite passed");
        }

        if let Some(sink) = &self.sink {
            sink.suite_finished(&suite).await?;
        }
        Ok(suite)
    }

    async fn setup(
        &self,
        ctx: &RunContext,
        background: &BackgroundProcesses,
    ) -> Result<(), HarnessError> {
        if self.config.commands.is_empty() {
            return Ok(());
        }
        let env = CommandEnv {
            namespace: self.config.namespace.clone().unwrap_or_default(),
            kubeconfig: self.config.kubeconfig.clone().unwrap_or_default(),
            work_dir: self.config.work_dir.clone(),
        };
        let setup_ctx = ctx.with_timeout(self.config.timeout);
        for command in &self.config.commands {
            run_command(&setup_ctx, command, &env, background)
                .await
                .map_err(HarnessError::Setup)?;
        }
        Ok(())
    }
}
