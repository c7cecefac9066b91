//! Run reports
//!
//! Case and step outcomes are flattened into serializable reports and handed
//! to a [`ReportSink`]. [`JsonReportSink`] writes the suite as one JSON file.

use std::fmt;
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

use crate::case::CaseOutcome;
use crate::step::{StepError, StepOutcome, StepPhase};

/// Errors writing reports
#[derive(Debug, thiserror::Error)]
pub enum ReportError {
    #[error("failed to serialize report: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("failed to write report {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Passed,
    Failed,
    Skipped,
}

/// One failure of a step
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailureReport {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observed: Option<String>,
}

impl From<&StepError> for FailureReport {
    fn from(err: &StepError) -> Self {
        let (expected, observed) = match err.diff() {
            Some((expected, observed)) => (Some(expected.to_string()), Some(observed.to_string())),
            None => (None, None),
        };
        Self {
            message: err.to_string(),
            expected,
            observed,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StepReport {
    pub index: Option<i64>,
    pub name: String,
    pub status: Status,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_in: Option<StepPhase>,
    pub elapsed_secs: f64,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub failures: Vec<FailureReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diagnostics: Option<String>,
}

impl From<&StepOutcome> for StepReport {
    fn from(outcome: &StepOutcome) -> Self {
        Self {
            index: Some(outcome.index),
            name: outcome.name.clone(),
            status: if outcome.passed() {
                Status::Passed
            } else {
                Status::Failed
            },
            failed_in: outcome.failed_in,
            elapsed_secs: outcome.elapsed.as_secs_f64(),
            failures: outcome.failures.iter().map(FailureReport::from).collect(),
            diagnostics: outcome
                .diagnostics
                .as_ref()
                .filter(|d| !d.is_empty())
                .map(ToString::to_string),
        }
    }
}

impl StepReport {
    fn skipped(name: &str) -> Self {
        Self {
            index: None,
            name: name.to_string(),
            status: Status::Skipped,
            failed_in: None,
            elapsed_secs: 0.0,
            failures: Vec::new(),
            diagnostics: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CaseReport {
    pub name: String,
    pub namespace: String,
    pub status: Status,
    pub elapsed_secs: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub setup_error: Option<String>,
    pub steps: Vec<StepReport>,
}

impl CaseReport {
    pub fn passed(&self) -> bool {
        self.status == Status::Passed
    }
}

impl From<&CaseOutcome> for CaseReport {
    fn from(outcome: &CaseOutcome) -> Self {
        let mut steps: Vec<StepReport> = outcome.steps.iter().map(StepReport::from).collect();
        steps.extend(outcome.skipped.iter().map(|name| StepReport::skipped(name)));
        Self {
            name: outcome.name.clone(),
            namespace: outcome.namespace.clone(),
            status: if outcome.passed() {
                Status::Passed
            } else {
                Status::Failed
            },
            elapsed_secs: outcome.elapsed.as_secs_f64(),
            setup_error: outcome.setup_error.as_ref().map(ToString::to_string),
            steps,
        }
    }
}

/// Report of a whole run
#[derive(Debug, Clone, Serialize)]
pub struct SuiteReport {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    pub passed: usize,
    pub failed: usize,
    pub cases: Vec<CaseReport>,
}

impl Default for SuiteReport {
    fn default() -> Self {
        Self::new()
    }
}

impl SuiteReport {
    pub fn new() -> Self {
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            started_at: Utc::now(),
            finished_at: None,
            passed: 0,
            failed: 0,
            cases: Vec::new(),
        }
    }

    pub fn add(&mut self, case: CaseReport) {
        if case.passed() {
            self.passed += 1;
        } else {
            self.failed += 1;
        }
        self.cases.push(case);
    }

    pub fn finish(&mut self) {
        self.cases.sort_by(|a, b| a.name.cmp(&b.name));
        self.finished_at = Some(Utc::now());
    }
}

impl fmt::Display for SuiteReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for case in self.cases.iter().filter(|c| !c.passed()) {
            writeln!(f, "--- FAIL: {} ({:.2}s)", case.name, case.elapsed_secs)?;
            if let Some(err) = &case.setup_error {
                writeln!(f, "    setup: {err}")?;
            }
            for step in &case.steps {
                match step.status {
                    Status::Failed => {
                        let phase = step.failed_in.map(|p| p.to_string()).unwrap_or_default();
                        writeln!(f, "    step {} failed while {}", step.name, phase)?;
                        for failure in &step.failures {
                            writeln!(f, "    ├─ {}", failure.message)?;
                            if let (Some(expected), Some(observed)) =
                                (&failure.expected, &failure.observed)
                            {
                                writeln!(f, "    │  expected:")?;
                                for line in expected.lines() {
                                    writeln!(f, "    │    {line}")?;
                                }
                                writeln!(f, "    │  observed:")?;
                                for line in observed.lines() {
                                    writeln!(f, "    │    {line}")?;
                                }
                            }
                        }
                        if let Some(diagnostics) = &step.diagnostics {
                            write!(f, "{diagnostics}")?;
                        }
                    }
                    Status::Skipped => writeln!(f, "    └─ step {} skipped", step.name)?,
                    Status::Passed => {}
                }
            }
        }
        write!(
            f,
            "{} passed, {} failed ({} cases)",
            self.passed,
            self.failed,
            self.cases.len()
        )
    }
}

/// Receives case and suite results
#[async_trait]
pub trait ReportSink: Send + Sync {
    async fn case_finished(&self, _case: &CaseReport) {}

    async fn suite_finished(&self, suite: &SuiteReport) -> Result<(), ReportError>;
}

/// Writes the suite report as pretty JSON
pub struct JsonReportSink {
    path: PathBuf,
}

impl JsonReportSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl ReportSink for JsonReportSink {
    async fn suite_finished(&self, suite: &SuiteReport) -> Result<(), ReportError> {
        let body = serde_json::to_vec_pretty(suite)?;
        tokio::fs::write(&self.path, body)
            .await
            .map_err(|source| ReportError::Write {
                path: self.path.clone(),
                source,
            })?;
        info!(path = %self.path.display(), cases = suite.cases.len(), "Wrote report");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancelError;
    use std::time::Duration;

    fn failed_case() -> CaseOutcome {
        CaseOutcome {
            name: "scale-up".to_string(),
            namespace: "koe-quiet-otter".to_string(),
            setup_error: None,
            steps: vec![
                StepOutcome {
                    index: 0,
                    name: "install".to_string(),
                    phase: StepPhase::Succeeded,
                    failed_in: None,
                    failures: Vec::new(),
                    diagnostics: None,
                    elapsed: Duration::from_millis(1500),
                },
                StepOutcome {
                    index: 1,
                    name: "ready".to_string(),
                    phase: StepPhase::Failed,
                    failed_in: Some(StepPhase::Polling),
                    failures: vec![StepError::NotFound {
                        resource: "Widget koe-quiet-otter/w1".to_string(),
                    }],
                    diagnostics: None,
                    elapsed: Duration::from_secs(30),
                },
            ],
            skipped: vec!["cleanup".to_string()],
            elapsed: Duration::from_secs(32),
        }
    }

    #[test]
    fn test_case_report_from_outcome() {
        let report = CaseReport::from(&failed_case());

        assert_eq!(report.status, Status::Failed);
        let statuses: Vec<Status> = report.steps.iter().map(|s| s.status).collect();
        assert_eq!(statuses, vec![Status::Passed, Status::Failed, Status::Skipped]);
        assert_eq!(
            report.steps[1].failures[0].message,
            "resource Widget koe-quiet-otter/w1 not found"
        );
    }

    #[test]
    fn test_failure_report_without_diff() {
        let failure = FailureReport::from(&StepError::Timeout(CancelError::DeadlineExceeded));
        assert!(failure.expected.is_none());
        assert!(failure.observed.is_none());
    }

    #[test]
    fn test_suite_counts_and_summary() {
        let mut suite = SuiteReport::new();
        suite.add(CaseReport::from(&failed_case()));
        suite.finish();

        assert_eq!((suite.passed, suite.failed), (0, 1));
        let text = suite.to_string();
        assert!(text.contains("--- FAIL: scale-up"));
        assert!(text.contains("step ready failed while polling"));
        assert!(text.contains("step cleanup skipped"));
        assert!(text.ends_with("0 passed, 1 failed (1 cases)"));
    }

    #[tokio::test]
    async fn test_json_sink_writes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.json");
        let mut suite = SuiteReport::new();
        suite.add(CaseReport::from(&failed_case()));
        suite.finish();

        JsonReportSink::new(&path).suite_finished(&suite).await.unwrap();

        let written: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(written["failed"], 1);
        assert_eq!(written["cases"][0]["steps"][1]["failed_in"], "polling");
        assert_eq!(written["cases"][0]["steps"][2]["status"], "skipped");
        assert_eq!(written["run_id"].as_str().map(str::len), Some(36));
    }
}
