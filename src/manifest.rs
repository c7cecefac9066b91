//! Manifest loading
//!
//! Step files are multi-document YAML. Ordinary documents are resources to
//! apply, assert or reject. Documents in the `koe.dev` group configure the
//! step itself:
//!
//! ```yaml
//! apiVersion: koe.dev/v1
//! kind: TestStep
//! timeout: 60
//! delete:
//! - apiVersion: v1
//!   kind: Pod
//!   labels:
//!     app: web
//! commands:
//! - command: kubectl apply -f extra.yaml
//!   namespaced: true
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::warn;

use crate::diagnostics::Collector;
use crate::predicate::Expressions;
use crate::resource::{LabelSelector, ResourceDocument, TypeId};
use crate::runner::Command;

/// API group of harness configuration documents
pub const HARNESS_GROUP: &str = "koe.dev";

/// Errors loading manifests
#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
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

    #[error("invalid {kind} in {path}: {reason}")]
    Invalid {
        path: PathBuf,
        kind: String,
        reason: String,
    },

    #[error("{path} declares more than one {kind}")]
    Duplicate { path: PathBuf, kind: String },
}

/// Pre-step delete reference
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeleteRef {
    pub api_version: String,
    pub kind: String,
    pub name: Option<String>,
    pub namespace: Option<String>,
    pub labels: BTreeMap<String, String>,
}

impl DeleteRef {
    pub fn type_id(&self) -> TypeId {
        TypeId::from_api_version(&self.api_version, &self.kind)
    }

    pub fn selector(&self) -> LabelSelector {
        LabelSelector::from_labels(&self.labels)
    }
}

/// `TestStep` document
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TestStepSpec {
    pub delete: Vec<DeleteRef>,
    pub commands: Vec<Command>,
    /// Seconds
    pub timeout: Option<u64>,
    pub kubeconfig: Option<String>,
    /// Connect to `kubeconfig` only when the step runs
    pub lazy_connect: bool,
    /// Run without a namespace: no injection into documents
    pub unit_test: bool,
}

/// `TestAssert` document
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TestAssertSpec {
    /// Seconds; overrides the step timeout for polling
    pub timeout: Option<u64>,
    pub commands: Vec<Command>,
    pub collectors: Vec<Collector>,
    #[serde(flatten)]
    pub expressions: Expressions,
}

/// Documents of one file, harness configuration split out
#[derive(Debug, Clone, Default)]
pub struct StepFile {
    pub resources: Vec<ResourceDocument>,
    pub step: Option<TestStepSpec>,
    pub assert: Option<TestAssertSpec>,
}

/// Read every resource document in a YAML file
pub fn load_resources(path: &Path) -> Result<Vec<ResourceDocument>, ManifestError> {
    let text = std::fs::read_to_string(path).map_err(|source| ManifestError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    load_resources_from_str(&text, path)
}

/// Decode multi-document YAML; `source` is used in messages only
///
/// Empty documents are skipped. Documents without `apiVersion`/`kind` are
/// logged and dropped.
pub fn load_resources_from_str(
    text: &str,
    source: &Path,
) -> Result<Vec<ResourceDocument>, ManifestError> {
    let mut docs = Vec::new();
    for (i, document) in serde_yaml::Deserializer::from_str(text).enumerate() {
        let value = serde_yaml::Value::deserialize(document).map_err(|e| ManifestError::Yaml {
            path: source.to_path_buf(),
            source: e,
        })?;
        if value.is_null() {
            continue;
        }

        let json = serde_json::to_value(&value).map_err(|e| ManifestError::Invalid {
            path: source.to_path_buf(),
            kind: "document".to_string(),
            reason: format!("document {i}: {e}"),
        })?;
        let doc = ResourceDocument::from_value(json).map_err(|e| ManifestError::Invalid {
            path: source.to_path_buf(),
            kind: "document".to_string(),
            reason: format!("document {i}: {e}"),
        })?;

        if doc.type_id().is_empty() {
            warn!(path = %source.display(), document = i, "Skipping document without apiVersion/kind");
            continue;
        }
        docs.push(doc);
    }
    Ok(docs)
}

/// Load a step file and split harness configuration from resources
pub fn load_step_file(path: &Path) -> Result<StepFile, ManifestError> {
    split_harness_objects(load_resources(path)?, path)
}

pub fn split_harness_objects(
    docs: Vec<ResourceDocument>,
    path: &Path,
) -> Result<StepFile, ManifestError> {
    let mut file = StepFile::default();

    for doc in docs {
        let type_id = doc.type_id();
        if type_id.group != HARNESS_GROUP {
            file.resources.push(doc);
            continue;
        }
        match type_id.kind.as_str() {
            "TestStep" => {
                if file.step.is_some() {
                    return Err(ManifestError::Duplicate {
                        path: path.to_path_buf(),
                        kind: type_id.kind,
                    });
                }
                file.step = Some(decode(doc, path)?);
            }
            "TestAssert" => {
                if file.assert.is_some() {
                    return Err(ManifestError::Duplicate {
                        path: path.to_path_buf(),
                        kind: type_id.kind,
                    });
                }
                file.assert = Some(decode(doc, path)?);
            }
            _ => {
                return Err(ManifestError::Invalid {
                    path: path.to_path_buf(),
                    kind: type_id.kind,
                    reason: format!("unknown {HARNESS_GROUP} kind"),
                })
            }
        }
    }

    Ok(file)
}

fn decode<T: DeserializeOwned>(doc: ResourceDocument, path: &Path) -> Result<T, ManifestError> {
    let kind = doc.type_id().kind;
    serde_json::from_value(doc.into_value()).map_err(|e| ManifestError::Invalid {
        path: path.to_path_buf(),
        kind,
        reason: e.to_string(),
    })
}
