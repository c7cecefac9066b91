//! End-to-end tests of cases against the in-memory cluster

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use koe::client::{MemoryConnector, Op};
use koe::discover::load_case;
use koe::{
    create_or_update, is_subset, retry, CaseOrchestrator, ClientError, MemoryClient,
    ResourceDocument, RetryError, RunContext, SharedClient, TypeRegistry,
};

fn registry() -> Arc<TypeRegistry> {
    TypeRegistry::builder()
        .with_builtin()
        .namespaced("example.com", "Widget")
        .build_shared()
}

fn write(dir: &Path, name: &str, body: &str) {
    fs::write(dir.join(name), body).unwrap();
}

#[tokio::test]
async fn test_create_or_update_twice() {
    let memory = Arc::new(MemoryClient::new(registry()));
    let client: SharedClient = memory.clone();
    let desired = ResourceDocument::from_value(json!({
        "apiVersion": "example.com/v1",
        "kind": "Widget",
        "metadata": { "name": "w1", "namespace": "ns-1" },
        "spec": { "replicas": 3 }
    }))
    .unwrap();
    let ctx = RunContext::new().with_timeout(Duration::from_secs(5));

    assert!(!create_or_update(&ctx, &client, &desired, true).await.unwrap());
    assert!(create_or_update(&ctx, &client, &desired, true).await.unwrap());

    let stored = memory.objects();
    assert_eq!(stored.len(), 1);
    assert!(is_subset(&desired.to_value(), &stored[0].to_value()).is_ok());
    assert_eq!(memory.calls(Op::Create), 1);
    assert_eq!(memory.calls(Op::Patch), 1);
}

#[tokio::test(start_paused = true)]
async fn test_retry_returns_last_tolerated_error_at_deadline() {
    let ctx = RunContext::new().with_timeout(Duration::from_secs(2));
    let start = tokio::time::Instant::now();

    let result: Result<(), RetryError<ClientError>> = retry(
        &ctx,
        || async { Err(ClientError::MalformedResponse("truncated body".into())) },
        &[ClientError::is_malformed_response],
    )
    .await;

    assert!(start.elapsed() <= Duration::from_secs(2));
    match result {
        Err(RetryError::Operation(ClientError::MalformedResponse(msg))) => {
            assert_eq!(msg, "truncated body")
        }
        other => panic!("expected last tolerated error, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn test_case_directory_end_to_end() {
    let root = tempfile::tempdir().unwrap();
    let dir = root.path().join("widgets");
    fs::create_dir(&dir).unwrap();

    write(
        &dir,
        "00-install.yaml",
        "apiVersion: example.com/v1\nkind: Widget\nmetadata:\n  name: w1\n  labels:\n    team: a\nspec:\n  replicas: 3\n",
    );
    write(
        &dir,
        "00-assert.yaml",
        "apiVersion: example.com/v1\nkind: Widget\nmetadata:\n  name: w1\nspec:\n  replicas: 3\n",
    );
    write(
        &dir,
        "01-errors.yaml",
        "apiVersion: koe.dev/v1\nkind: TestStep\ntimeout: 2\n---\napiVersion: example.com/v1\nkind: Widget\nmetadata:\n  labels:\n    team: a\n",
    );
    write(
        &dir,
        "02-never.yaml",
        "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: unused\n",
    );

    let case = load_case(&dir).unwrap().unwrap();
    let connector = Arc::new(MemoryConnector::new(registry()));
    let memory = connector.cluster("");

    let outcome = CaseOrchestrator::new(connector.clone())
        .namespace("ns-e2e")
        .run(&RunContext::new(), case)
        .await;

    assert!(!outcome.passed());
    assert_eq!(outcome.steps.len(), 2);
    assert!(outcome.steps[0].passed());

    let failed = &outcome.steps[1];
    assert_eq!(failed.failures.len(), 1);
    assert_eq!(
        failed.failures[0].to_string(),
        "resource Widget ns-e2e/w1 matched error assertion"
    );
    assert_eq!(outcome.skipped, vec!["never".to_string()]);
    assert!(memory.objects().is_empty(), "namespace torn down after failure");
}

#[tokio::test]
#[ignore] // Requires real cluster
async fn test_real_cluster_configmap_case() {
    use koe::case::Case;
    use koe::{KubeConnector, Step};

    koe::telemetry::init_logging();
    let config_map = ResourceDocument::from_value(json!({
        "apiVersion": "v1",
        "kind": "ConfigMap",
        "metadata": { "name": "koe-smoke" },
        "data": { "key": "value" }
    }))
    .unwrap();

    let case = Case::new("smoke").step(
        Step::new(0, "install")
            .apply(config_map.clone())
            .assert(config_map)
            .timeout(Duration::from_secs(30)),
    );
    let connector = Arc::new(KubeConnector::new(Arc::new(TypeRegistry::builtin())));
    let outcome = CaseOrchestrator::new(connector)
        .run(&RunContext::new(), case)
        .await;

    assert!(outcome.passed(), "{outcome:?}");
}
