//! Create-or-update with resource-version fencing
//!
//! The read → fence → patch sequence runs as a single retried attempt. When
//! the object disappears between the read and the patch, or appears between a
//! not-found read and the create, the whole sequence starts over from the
//! read. Write conflicts are retried the same way when the caller opts in.

use tracing::{debug, info, instrument};

use crate::cancel::{CancelError, RunContext};
use crate::client::{ClientError, SharedClient};
use crate::resource::{ResourceDocument, TypeId};
use crate::retry::{retry, RetryError, Tolerate};

/// Errors from [`create_or_update`]
#[derive(Debug, thiserror::Error)]
pub enum ApplyError {
    #[error("create/update timeout exceeded")]
    Timeout,

    #[error("{0} has no metadata.name")]
    MissingName(TypeId),

    #[error(transparent)]
    Client(#[from] ClientError),
}

impl From<RetryError<ClientError>> for ApplyError {
    fn from(err: RetryError<ClientError>) -> Self {
        match err {
            RetryError::Context(CancelError::DeadlineExceeded) => ApplyError::Timeout,
            RetryError::Operation(ClientError::Context(CancelError::DeadlineExceeded)) => {
                ApplyError::Timeout
            }
            other => ApplyError::Client(other.into()),
        }
    }
}

/// Create `desired`, or patch the existing object to match it
///
/// Returns `true` when an existing object was updated and `false` when it was
/// created. `desired` is never modified; fencing happens on a copy.
#[instrument(skip(ctx, client, desired), fields(resource = %desired.id()))]
pub async fn create_or_update(
    ctx: &RunContext,
    client: &SharedClient,
    desired: &ResourceDocument,
    retry_on_conflict: bool,
) -> Result<bool, ApplyError> {
    let key = desired
        .key()
        .ok_or_else(|| ApplyError::MissingName(desired.type_id()))?;

    let mut tolerate: Vec<Tolerate<ClientError>> = vec![
        ClientError::is_not_found,
        ClientError::is_already_exists,
    ];
    if retry_on_conflict {
        tolerate.push(ClientError::is_conflict);
    }

    let updated = retry(
        ctx,
        || {
            let client = client.clone();
            let key = key.clone();
            let desired = desired.clone();
            async move {
                match client.get(&key).await {
                    Ok(current) => {
                        let mut fenced = desired.clone();
                        fenced.set_resource_version(current.resource_version());
                        let patch = desired.without_resource_version().into_value();
                        client.patch(&fenced, &patch).await?;
                        Ok(true)
                    }
                    Err(err) if err.is_not_found() => {
                        client.create(&desired.without_resource_version()).await?;
                        Ok(false)
                    }
                    Err(err) => Err(err),
                }
            }
        },
        &tolerate,
    )
    .await
    .map_err(|err| match ctx.err() {
        Some(CancelError::DeadlineExceeded) => ApplyError::Timeout,
        _ => ApplyError::from(err),
    })?;

    if updated {
        debug!("Patched existing resource");
    } else {
        info!("Created resource");
    }
    Ok(updated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{MemoryClient, Op};
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;

    fn store() -> Arc<MemoryClient> {
        Arc::new(MemoryClient::with_builtin_types())
    }

    fn config_map(data: serde_json::Value) -> ResourceDocument {
        ResourceDocument::from_value(json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": { "name": "settings", "namespace": "ns-1" },
            "data": data
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_create_then_update() {
        let memory = store();
        let client: SharedClient = memory.clone();
        let ctx = RunContext::new();
        let desired = config_map(json!({"mode": "fast"}));

        assert!(!create_or_update(&ctx, &client, &desired, true).await.unwrap());
        assert!(create_or_update(&ctx, &client, &desired, true).await.unwrap());

        let observed = client.get(&desired.key().unwrap()).await.unwrap();
        assert!(crate::matcher::is_subset(&desired.to_value(), &observed.to_value()).is_ok());
        assert_eq!(memory.calls(Op::Create), 1);
        assert_eq!(memory.calls(Op::Patch), 1);
    }

    #[tokio::test]
    async fn test_desired_is_not_mutated() {
        let client: SharedClient = store();
        let ctx = RunContext::new();
        let desired = config_map(json!({"mode": "fast"}));
        let before = desired.clone();

        create_or_update(&ctx, &client, &desired, true).await.unwrap();
        create_or_update(&ctx, &client, &desired, true).await.unwrap();
        assert_eq!(desired, before);
    }

    #[tokio::test(start_paused = true)]
    async fn test_conflict_retried_when_opted_in() {
        let memory = store();
        let client: SharedClient = memory.clone();
        let ctx = RunContext::new().with_timeout(Duration::from_secs(10));
        let desired = config_map(json!({"mode": "fast"}));
        client.create(&desired).await.unwrap();

        memory.inject(Op::Patch, ClientError::Conflict("settings".into()));
        assert!(create_or_update(&ctx, &client, &desired, true).await.unwrap());
        assert_eq!(memory.calls(Op::Get), 2, "sequence restarts from the read");
    }

    #[tokio::test]
    async fn test_conflict_fatal_without_opt_in() {
        let memory = store();
        let client: SharedClient = memory.clone();
        let ctx = RunContext::new();
        let desired = config_map(json!({"mode": "fast"}));
        client.create(&desired).await.unwrap();

        memory.inject(Op::Patch, ClientError::Conflict("settings".into()));
        let err = create_or_update(&ctx, &client, &desired, false)
            .await
            .unwrap_err();
        assert!(matches!(err, ApplyError::Client(ClientError::Conflict(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_race_restarts_from_read() {
        let memory = store();
        let client: SharedClient = memory.clone();
        let ctx = RunContext::new().with_timeout(Duration::from_secs(10));

        memory.inject(Op::Create, ClientError::AlreadyExists("settings".into()));
        let updated = create_or_update(&ctx, &client, &config_map(json!({})), false)
            .await
            .unwrap();
        assert!(!updated);
        assert_eq!(memory.calls(Op::Create), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_is_timeout_error() {
        let memory = store();
        let client: SharedClient = memory.clone();
        let ctx = RunContext::new().with_timeout(Duration::from_millis(50));
        tokio::time::sleep(Duration::from_millis(100)).await;

        let err = create_or_update(&ctx, &client, &config_map(json!({})), true)
            .await
            .unwrap_err();
        assert!(matches!(err, ApplyError::Timeout));
        assert_eq!(err.to_string(), "create/update timeout exceeded");
    }

    #[tokio::test]
    async fn test_missing_name_rejected() {
        let client: SharedClient = store();
        let doc = ResourceDocument::from_value(json!({"apiVersion": "v1", "kind": "ConfigMap"}))
            .unwrap();
        let err = create_or_update(&RunContext::new(), &client, &doc, true)
            .await
            .unwrap_err();
        assert!(matches!(err, ApplyError::MissingName(_)));
    }
}
