//! Harness configuration
//!
//! Build a [`HarnessConfig`] programmatically, or load a `TestSuite` file and
//! override it from the command line.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use koe::config::HarnessConfig;
//!
//! let config = HarnessConfig::new()
//!     .test_dir("./tests/e2e")
//!     .parallel(4)
//!     .timeout(Duration::from_secs(60))
//!     .skip_delete(true);
//! ```
//!
//! A suite file:
//!
//! ```yaml
//! apiVersion: koe.dev/v1
//! kind: TestSuite
//! testDirs:
//! - ./e2e
//! timeout: 60
//! parallel: 4
//! commands:
//! - command: kubectl apply -f ./crds
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::runner::Command;
use crate::step::DEFAULT_TIMEOUT;

/// Default number of cases run at once
pub const DEFAULT_PARALLEL: usize = 8;

/// Errors loading or validating configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// `TestSuite` document
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TestSuite {
    pub api_version: String,
    pub kind: String,
    pub test_dirs: Vec<PathBuf>,
    /// Seconds
    pub timeout: Option<u64>,
    pub parallel: Option<usize>,
    pub namespace: Option<String>,
    pub skip_delete: bool,
    pub suppress_rollback: bool,
    pub kubeconfig: Option<String>,
    pub report: Option<PathBuf>,
    pub commands: Vec<Command>,
}

/// Settings for one harness run
#[derive(Debug, Clone)]
pub struct HarnessConfig {
    /// Directories whose subdirectories are test cases
    pub test_dirs: Vec<PathBuf>,

    /// Default step timeout
    pub timeout: Duration,

    /// Maximum cases run at once
    pub parallel: usize,

    /// Run every case in this namespace instead of a generated one
    pub namespace: Option<String>,

    /// Keep namespaces and created resources after the run
    pub skip_delete: bool,

    /// Do not delete objects created by steps
    pub suppress_rollback: bool,

    /// Kubeconfig for the default cluster
    pub kubeconfig: Option<String>,

    /// Write a JSON report here
    pub report: Option<PathBuf>,

    /// Only run the case with this name
    pub test: Option<String>,

    /// Commands run once before any case
    pub commands: Vec<Command>,

    /// Directory suite commands run in
    pub work_dir: Option<PathBuf>,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            test_dirs: Vec::new(),
            timeout: DEFAULT_TIMEOUT,
            parallel: DEFAULT_PARALLEL,
            namespace: None,
            skip_delete: false,
            suppress_rollback: false,
            kubeconfig: None,
            report: None,
            test: None,
            commands: Vec::new(),
            work_dir: None,
        }
    }
}

impl HarnessConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a `TestSuite` file
    ///
    /// Relative test directories and report paths resolve against the
    /// file's directory.
    pub fn from_suite_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let suite: TestSuite = serde_yaml::from_str(&text).map_err(|source| ConfigError::Yaml {
            path: path.to_path_buf(),
            source,
        })?;
        if !suite.kind.is_empty() && suite.kind != "TestSuite" {
            return Err(ConfigError::Invalid(format!(
                "{} is a {}, expected TestSuite",
                path.display(),
                suite.kind
            )));
        }

        let base = path.parent().unwrap_or_else(|| Path::new("."));
        let mut config = Self::new().suite(suite);
        config.test_dirs = config.test_dirs.iter().map(|d| base.join(d)).collect();
        config.report = config.report.map(|r| base.join(r));
        config.work_dir = Some(base.to_path_buf());
        Ok(config)
    }

    /// Apply every setting a suite document carries
    pub fn suite(mut self, suite: TestSuite) -> Self {
        self.test_dirs.extend(suite.test_dirs);
        if let Some(secs) = suite.timeout {
            self.timeout = Duration::from_secs(secs);
        }
        if let Some(parallel) = suite.parallel {
            self.parallel = parallel;
        }
        self.namespace = suite.namespace.or(self.namespace);
        self.skip_delete |= suite.skip_delete;
        self.suppress_rollback |= suite.suppress_rollback;
        self.kubeconfig = suite.kubeconfig.or(self.kubeconfig);
        self.report = suite.report.or(self.report);
        self.commands.extend(suite.commands);
        self
    }

    /// Add a test directory
    pub fn test_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.test_dirs.push(dir.into());
        self
    }

    /// Set the default step timeout
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the number of cases run at once
    pub fn parallel(mut self, parallel: usize) -> Self {
        self.parallel = parallel;
        self
    }

    /// Use a fixed namespace
    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    /// Keep namespaces and created resources
    pub fn skip_delete(mut self, skip: bool) -> Self {
        self.skip_delete = skip;
        self
    }

    pub fn suppress_rollback(mut self, suppress: bool) -> Self {
        self.suppress_rollback = suppress;
        self
    }

    /// Set the kubeconfig for the default cluster
    pub fn kubeconfig(mut self, path: impl Into<String>) -> Self {
        self.kubeconfig = Some(path.into());
        self
    }

    /// Write a JSON report
    pub fn report(mut self, path: impl Into<PathBuf>) -> Self {
        self.report = Some(path.into());
        self
    }

    /// Run only the named case
    pub fn only(mut self, name: impl Into<String>) -> Self {
        self.test = Some(name.into());
        self
    }

    /// Add a suite setup command
    pub fn command(mut self, command: Command) -> Self {
        self.commands.push(command);
        self
    }

    /// Whether step-created objects are left behind
    pub fn rollback_suppressed(&self) -> bool {
        self.suppress_rollback || self.skip_delete
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.test_dirs.is_empty() {
            return Err(ConfigError::Invalid("no test directories".to_string()));
        }
        if self.parallel == 0 {
            return Err(ConfigError::Invalid("parallel must be at least 1".to_string()));
        }
        if self.timeout.is_zero() {
            return Err(ConfigError::Invalid("timeout must be positive".to_string()));
        }
        if let Some(ns) = &self.namespace {
            let valid = !ns.is_empty()
                && ns.len() <= 63
                && ns
                    .chars()
                    .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
                && !ns.starts_with('-')
                && !ns.ends_with('-');
            if !valid {
                return Err(ConfigError::Invalid(format!("invalid namespace name '{ns}'")));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = HarnessConfig::new();
        assert_eq!(config.timeout, Duration::from_secs(30));
        assert_eq!(config.parallel, 8);
        assert!(!config.skip_delete);
        assert!(config.namespace.is_none());
    }

    #[test]
    fn test_builder() {
        let config = HarnessConfig::new()
            .test_dir("./e2e")
            .parallel(2)
            .timeout(Duration::from_secs(90))
            .namespace("fixed")
            .kubeconfig("/tmp/kc")
            .only("scale-up");

        assert_eq!(config.test_dirs, vec![PathBuf::from("./e2e")]);
        assert_eq!(config.parallel, 2);
        assert_eq!(config.timeout, Duration::from_secs(90));
        assert_eq!(config.namespace.as_deref(), Some("fixed"));
        assert_eq!(config.test.as_deref(), Some("scale-up"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_skip_delete_implies_no_rollback() {
        assert!(!HarnessConfig::new().rollback_suppressed());
        assert!(HarnessConfig::new().skip_delete(true).rollback_suppressed());
        assert!(HarnessConfig::new().suppress_rollback(true).rollback_suppressed());
    }

    #[test]
    fn test_validate_rejects_bad_settings() {
        assert!(HarnessConfig::new().validate().is_err());
        assert!(HarnessConfig::new().test_dir("e2e").parallel(0).validate().is_err());
        assert!(HarnessConfig::new()
            .test_dir("e2e")
            .namespace("Not_Valid")
            .validate()
            .is_err());
    }

    #[test]
    fn test_suite_file_resolves_relative_paths() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("koe-test.yaml");
        std::fs::write(
            &path,
            "apiVersion: koe.dev/v1\nkind: TestSuite\ntestDirs:\n- e2e\ntimeout: 45\nparallel: 2\nskipDelete: true\nreport: out/report.json\ncommands:\n- command: echo setup\n",
        )
        .unwrap();

        let config = HarnessConfig::from_suite_file(&path).unwrap();
        assert_eq!(config.test_dirs, vec![dir.path().join("e2e")]);
        assert_eq!(config.timeout, Duration::from_secs(45));
        assert_eq!(config.parallel, 2);
        assert!(config.skip_delete);
        assert_eq!(config.report, Some(dir.path().join("out/report.json")));
        assert_eq!(config.commands.len(), 1);
        assert_eq!(config.work_dir.as_deref(), Some(dir.path()));
    }

    #[test]
    fn test_suite_file_wrong_kind() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("step.yaml");
        std::fs::write(&path, "apiVersion: koe.dev/v1\nkind: TestStep\n").unwrap();
        assert!(matches!(
            HarnessConfig::from_suite_file(&path),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_missing_suite_file() {
        let err = HarnessConfig::from_suite_file(Path::new("/nonexistent/koe.yaml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
