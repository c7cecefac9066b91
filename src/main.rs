//! Koe CLI
//!
//! Runs declarative test suites against a Kubernetes cluster.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context as _, Result};
use clap::{Args, Parser, Subcommand};
use tracing::{info, warn};

use koe::config::HarnessConfig;
use koe::telemetry::init_logging;
use koe::{Harness, JsonReportSink, KubeConnector, RunContext, TypeRegistry};

/// Koe - declarative Kubernetes test harness
#[derive(Parser, Debug)]
#[command(name = "koe")]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run test cases
    Test(TestArgs),
}

#[derive(Args, Debug)]
struct TestArgs {
    /// Directories containing test cases
    dirs: Vec<PathBuf>,

    /// TestSuite file
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,

    /// Maximum number of cases run at once
    #[arg(long)]
    parallel: Option<usize>,

    /// Default step timeout in seconds
    #[arg(long)]
    timeout: Option<u64>,

    /// Run every case in this namespace instead of a generated one
    #[arg(long)]
    namespace: Option<String>,

    /// Keep namespaces and created resources after the run
    #[arg(long)]
    skip_delete: bool,

    /// Kubeconfig for the default cluster
    #[arg(long, env = "KOE_KUBECONFIG")]
    kubeconfig: Option<String>,

    /// Write a JSON report to this path
    #[arg(long)]
    report: Option<PathBuf>,

    /// Only run the case with this name
    #[arg(long)]
    test: Option<String>,
}

impl TestArgs {
    fn into_config(self) -> Result<HarnessConfig> {
        let mut config = match &self.config {
            Some(path) => HarnessConfig::from_suite_file(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => HarnessConfig::new(),
        };

        config.test_dirs.extend(self.dirs);
        if let Some(parallel) = self.parallel {
            config = config.parallel(parallel);
        }
        if let Some(secs) = self.timeout {
            config = config.timeout(Duration::from_secs(secs));
        }
        if let Some(namespace) = self.namespace {
            config = config.namespace(namespace);
        }
        if self.skip_delete {
            config = config.skip_delete(true);
        }
        if let Some(kubeconfig) = self.kubeconfig {
            config = config.kubeconfig(kubeconfig);
        }
        if let Some(report) = self.report {
            config = config.report(report);
        }
        if let Some(test) = self.test {
            config = config.only(test);
        }
        Ok(config)
    }
}

async fn run_tests(args: TestArgs) -> Result<()> {
    let config = args.into_config()?;
    config.validate()?;

    let mut connector = KubeConnector::new(Arc::new(TypeRegistry::builtin()));
    if let Some(kubeconfig) = &config.kubeconfig {
        connector = connector.default_kubeconfig(kubeconfig.clone());
    }

    let mut harness = Harness::new(config.clone(), Arc::new(connector));
    if let Some(path) = &config.report {
        harness = harness.sink(Arc::new(JsonReportSink::new(path)));
    }

    let ctx = RunContext::new();
    let signal_ctx = ctx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, shutting down");
            signal_ctx.begin_shutdown();
        }
    });

    let suite = harness.run(&ctx).await?;
    println!("{suite}");

    if suite.failed > 0 {
        bail!("{} of {} test cases failed", suite.failed, suite.cases.len());
    }
    info!(run_id = %suite.run_id, "All test cases passed");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    let cli = Cli::parse();
    match cli.command {
        Commands::Test(args) => run_tests(args).await,
    }
}
