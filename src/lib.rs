//! Koe - declarative test harness for Kubernetes controllers
//!
//! A test case is a directory of numbered step files. Each step applies
//! resources, then polls the cluster until its assertions hold or its
//! timeout runs out. Cases get their own namespace, which is removed once
//! they finish.
//!
//! # Example (Rust)
//!
//! ```no_run
//! use std::sync::Arc;
//! use koe::{CaseOrchestrator, KubeConnector, RunContext, Step, TypeRegistry};
//! use koe::case::Case;
//! use koe::resource::ResourceDocument;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let connector = Arc::new(KubeConnector::new(Arc::new(TypeRegistry::builtin())));
//!     let config_map = ResourceDocument::from_value(serde_json::json!({
//!         "apiVersion": "v1",
//!         "kind": "ConfigMap",
//!         "metadata": { "name": "settings" },
//!         "data": { "mode": "fast" }
//!     }))?;
//!
//!     let case = Case::new("settings").step(
//!         Step::new(0, "install")
//!             .apply(config_map.clone())
//!             .assert(config_map),
//!     );
//!     let outcome = CaseOrchestrator::new(connector)
//!         .run(&RunContext::new(), case)
//!         .await;
//!     assert!(outcome.passed());
//!     Ok(())
//! }
//! ```
//!
//! # CLI Usage
//!
//! ```bash
//! # Run every case under tests/e2e, four at a time
//! koe test tests/e2e --parallel 4
//!
//! # Run one case and keep its namespace for inspection
//! koe test tests/e2e --test scale-up --skip-delete
//! ```

pub mod apply;
pub mod cancel;
pub mod case;
pub mod client;
pub mod config;
pub mod diagnostics;
pub mod discover;
pub mod harness;
pub mod manifest;
pub mod matcher;
pub mod predicate;
pub mod registry;
pub mod report;
pub mod resource;
pub mod retry;
pub mod runner;
pub mod step;
pub mod telemetry;
pub mod wait;

// Re-export commonly used types
pub use apply::{create_or_update, ApplyError};
pub use cancel::{CancelError, RunContext};
pub use case::{Case, CaseError, CaseOrchestrator, CaseOutcome};
pub use client::{
    ClientError, Cluster, ClusterConnector, KubeClient, KubeConnector, MemoryClient,
    MemoryConnector, ResourceClient, RetryingClient, SharedClient,
};
pub use config::{ConfigError, HarnessConfig};
pub use harness::{Harness, HarnessError};
pub use matcher::{is_subset, SubsetError};
pub use registry::{Discovery, TypeRegistry};
pub use report::{JsonReportSink, ReportSink, SuiteReport};
pub use resource::{LabelSelector, ObjectKey, ResourceDocument, TypeId};
pub use retry::{retry, RetryError};
pub use step::{Step, StepEngine, StepError, StepOutcome};
