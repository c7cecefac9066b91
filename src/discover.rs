//! Test case discovery
//!
//! Every subdirectory of a test directory is a case. Step files inside it
//! are named `<NN>-<name>.yaml` and grouped by `NN`:
//!
//! ```text
//! tests/e2e/scale-up/
//! ├─ 00-install.yaml        apply documents, optional TestStep
//! ├─ 00-assert.yaml         documents that must match, optional TestAssert
//! ├─ 01-scale.yaml
//! ├─ 01-assert.yaml
//! └─ 01-errors.yaml         documents that must never match
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::debug;

use crate::case::Case;
use crate::manifest::{load_step_file, ManifestError, StepFile};
use crate::step::Step;

/// Errors discovering test cases
#[derive(Debug, thiserror::Error)]
pub enum DiscoverError {
    #[error("failed to read directory {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error("step {index} of {case} declares more than one {kind}")]
    Duplicate {
        case: String,
        index: i64,
        kind: &'static str,
    },
}

/// Role of a step file, from its name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileRole {
    Apply,
    Assert,
    Errors,
}

/// Parse `NN-name.yaml` into index, name and role
///
/// Returns `None` for files that are not step files.
pub fn parse_step_file_name(file_name: &str) -> Option<(i64, String, FileRole)> {
    let stem = file_name
        .strip_suffix(".yaml")
        .or_else(|| file_name.strip_suffix(".yml"))?;
    let (digits, name) = stem.split_once('-')?;
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) || name.is_empty() {
        return None;
    }
    let index = digits.parse().ok()?;

    let role = if name.starts_with("assert") {
        FileRole::Assert
    } else if name.starts_with("errors") {
        FileRole::Errors
    } else {
        FileRole::Apply
    };
    Some((index, name.to_string(), role))
}

/// Discover every case under the given test directories, sorted by name
pub fn discover_cases(dirs: &[PathBuf]) -> Result<Vec<Case>, DiscoverError> {
    let mut cases = Vec::new();
    for dir in dirs {
        for entry in read_dir_sorted(dir)? {
            if !entry.is_dir() {
                continue;
            }
            if let Some(case) = load_case(&entry)? {
                cases.push(case);
            }
        }
    }
    cases.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(cases)
}

/// Load one case directory; `None` when it holds no step files
pub fn load_case(dir: &Path) -> Result<Option<Case>, DiscoverError> {
    let case_name = dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| dir.display().to_string());

    let mut steps: BTreeMap<i64, Step> = BTreeMap::new();
    for path in read_dir_sorted(dir)? {
        if !path.is_file() {
            continue;
        }
        let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let Some((index, name, role)) = parse_step_file_name(file_name) else {
            debug!(path = %path.display(), "Ignoring non-step file");
            continue;
        };

        let file = load_step_file(&path)?;
        let step = steps.entry(index).or_insert_with(|| Step::new(index, name.clone()));
        merge(step, &case_name, role, &name, file)?;
    }

    if steps.is_empty() {
        debug!(dir = %dir.display(), "No step files, not a case");
        return Ok(None);
    }

    debug!(case = %case_name, steps = steps.len(), "Discovered case");
    Ok(Some(Case {
        name: case_name,
        dir: Some(dir.to_path_buf()),
        steps: steps.into_values().collect(),
    }))
}

fn merge(
    step: &mut Step,
    case: &str,
    role: FileRole,
    name: &str,
    file: StepFile,
) -> Result<(), DiscoverError> {
    match role {
        FileRole::Apply => {
            // the step takes its name from its apply file when it has one
            if step.apply.is_empty() && step.commands.is_empty() {
                step.name = name.to_string();
            }
            step.apply.extend(file.resources);
        }
        FileRole::Assert => step.asserts.extend(file.resources),
        FileRole::Errors => step.errors.extend(file.resources),
    }

    if let Some(spec) = file.step {
        if !step.delete.is_empty() || !step.commands.is_empty() || step.timeout.is_some() {
            return Err(DiscoverError::Duplicate {
                case: case.to_string(),
                index: step.index,
                kind: "TestStep",
            });
        }
        step.delete = spec.delete;
        step.commands = spec.commands;
        step.timeout = spec.timeout.map(Duration::from_secs);
        step.kubeconfig = spec.kubeconfig.filter(|k| !k.is_empty());
        step.lazy_connect = spec.lazy_connect;
        step.unit_test = spec.unit_test;
    }

    if let Some(spec) = file.assert {
        if step.assert_block.is_some() {
            return Err(DiscoverError::Duplicate {
                case: case.to_string(),
                index: step.index,
                kind: "TestAssert",
            });
        }
        step.assert_block = Some(spec);
    }
    Ok(())
}

fn read_dir_sorted(dir: &Path) -> Result<Vec<PathBuf>, DiscoverError> {
    let io_err = |source| DiscoverError::Io {
        path: dir.to_path_buf(),
        source,
    };
    let mut paths = std::fs::read_dir(dir)
        .map_err(io_err)?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<Result<Vec<_>, _>>()
        .map_err(io_err)?;
    paths.sort();
    Ok(paths)
}
