//! Resource assertions: expected documents that must, or must never, match

use tracing::debug;

use super::StepError;
use crate::client::{ClientError, SharedClient};
use crate::matcher::is_subset;
use crate::resource::{LabelSelector, ResourceDocument};

/// Candidates an expectation is compared against
///
/// Named expectations fetch by identity; unnamed ones list by the labels
/// they carry.
async fn candidates(
    client: &SharedClient,
    expected: &ResourceDocument,
) -> Result<Vec<ResourceDocument>, ClientError> {
    match expected.key() {
        Some(key) => match client.get(&key).await {
            Ok(doc) => Ok(vec![doc]),
            Err(err) if err.is_not_found() => Ok(Vec::new()),
            Err(err) => Err(err),
        },
        None => {
            let selector = LabelSelector::from_labels(&expected.labels());
            client
                .list(&expected.type_id(), expected.namespace(), &selector)
                .await
        }
    }
}

/// Errors for an expectation that must match; empty when any candidate does
pub async fn check_present(client: &SharedClient, expected: &ResourceDocument) -> Vec<StepError> {
    let found = match candidates(client, expected).await {
        Ok(found) => found,
        Err(err) => {
            return vec![StepError::Client {
                resource: expected.id(),
                source: err,
            }]
        }
    };

    if found.is_empty() {
        return vec![StepError::NotFound {
            resource: expected.id(),
        }];
    }

    let want = expected.to_value();
    let mut errors = Vec::new();
    for actual in &found {
        let have = actual.to_value();
        match is_subset(&want, &have) {
            Ok(()) => return Vec::new(),
            Err(mismatch) => errors.push(StepError::Mismatch {
                resource: actual.id(),
                expected: render(expected),
                observed: render(actual),
                source: mismatch,
            }),
        }
    }
    debug!(resource = %expected.id(), candidates = found.len(), "Assertion not yet satisfied");
    errors
}

/// Errors for an expectation that must never match
pub async fn check_absent(client: &SharedClient, expected: &ResourceDocument) -> Vec<StepError> {
    let found = match candidates(client, expected).await {
        Ok(found) => found,
        Err(err) => {
            return vec![StepError::Client {
                resource: expected.id(),
                source: err,
            }]
        }
    };

    let want = expected.to_value();
    let matched: Vec<&ResourceDocument> = found
        .iter()
        .filter(|actual| is_subset(&want, &actual.to_value()).is_ok())
        .collect();

    match matched.first() {
        Some(first) => vec![StepError::UnexpectedMatch {
            resource: first.id(),
            others: matched.len() - 1,
        }],
        None => Vec::new(),
    }
}

/// YAML rendering of a document for failure reports
pub(crate) fn render(doc: &ResourceDocument) -> String {
    serde_yaml::to_string(doc.as_map()).unwrap_or_else(|_| doc.to_value().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{MemoryClient, Op};
    use serde_json::{json, Value};
    use std::sync::Arc;

    fn doc(value: Value) -> ResourceDocument {
        ResourceDocument::from_value(value).unwrap()
    }

    fn registry_client() -> (Arc<MemoryClient>, SharedClient) {
        let registry = crate::registry::TypeRegistry::builder()
            .with_builtin()
            .namespaced("example.com", "Widget")
            .build_shared();
        let memory = Arc::new(MemoryClient::new(registry));
        let client: SharedClient = memory.clone();
        (memory, client)
    }

    fn widget(name: &str, team: &str, ready: bool) -> ResourceDocument {
        doc(json!({
            "apiVersion": "example.com/v1",
            "kind": "Widget",
            "metadata": { "name": name, "namespace": "ns-1", "labels": { "team": team } },
            "status": { "ready": ready }
        }))
    }

    #[tokio::test]
    async fn test_named_mismatch_cites_path() {
        let (_, client) = registry_client();
        client.create(&widget("w1", "a", false)).await.unwrap();

        let expected = doc(json!({
            "apiVersion": "example.com/v1",
            "kind": "Widget",
            "metadata": { "name": "w1", "namespace": "ns-1" },
            "status": { "ready": true }
        }));
        let errors = check_present(&client, &expected).await;

        assert_eq!(errors.len(), 1);
        match &errors[0] {
            StepError::Mismatch { source, observed, .. } => {
                assert_eq!(source.path(), "status.ready");
                assert!(observed.contains("ready: false"));
            }
            other => panic!("expected mismatch, got {other}"),
        }
    }

    #[tokio::test]
    async fn test_any_listed_candidate_satisfies() {
        let (_, client) = registry_client();
        client.create(&widget("w1", "a", false)).await.unwrap();
        client.create(&widget("w2", "a", true)).await.unwrap();

        let expected = doc(json!({
            "apiVersion": "example.com/v1",
            "kind": "Widget",
            "metadata": { "namespace": "ns-1", "labels": { "team": "a" } },
            "status": { "ready": true }
        }));
        assert!(check_present(&client, &expected).await.is_empty());
    }

    #[tokio::test]
    async fn test_missing_resource_is_not_found() {
        let (_, client) = registry_client();
        let errors = check_present(&client, &widget("ghost", "a", true)).await;
        assert!(matches!(errors.as_slice(), [StepError::NotFound { .. }]));
    }

    #[tokio::test]
    async fn test_error_assertion_reports_first_and_count() {
        let (_, client) = registry_client();
        client.create(&widget("w1", "a", true)).await.unwrap();
        client.create(&widget("w2", "a", true)).await.unwrap();
        client.create(&widget("w3", "b", true)).await.unwrap();

        let forbidden = doc(json!({
            "apiVersion": "example.com/v1",
            "kind": "Widget",
            "metadata": { "namespace": "ns-1", "labels": { "team": "a" } }
        }));
        let errors = check_absent(&client, &forbidden).await;

        assert_eq!(errors.len(), 1);
        assert_eq!(
            errors[0].to_string(),
            "resource Widget ns-1/w1 matched error assertion (and 1 other resources)"
        );
    }

    #[tokio::test]
    async fn test_error_assertion_passes_when_absent_or_different() {
        let (_, client) = registry_client();
        client.create(&widget("w1", "a", false)).await.unwrap();

        let forbidden = doc(json!({
            "apiVersion": "example.com/v1",
            "kind": "Widget",
            "metadata": { "name": "w1", "namespace": "ns-1" },
            "status": { "ready": true }
        }));
        assert!(check_absent(&client, &forbidden).await.is_empty());
        assert!(check_absent(&client, &widget("ghost", "a", true)).await.is_empty());
    }

    #[tokio::test]
    async fn test_client_error_surfaces() {
        let (memory, client) = registry_client();
        memory.inject(Op::Get, ClientError::Api("boom".into()));
        let errors = check_present(&client, &widget("w1", "a", true)).await;
        assert!(matches!(errors.as_slice(), [StepError::Client { .. }]));
    }
}
