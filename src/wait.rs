//! Await-until-gone polling with rich timeout errors
//!
//! Used after pre-step deletes and for namespace teardown: deletion on the
//! platform is asynchronous, so a delete call returning is not the same as
//! the object being gone.
//!
//! # Example
//!
//! ```ignore
//! match wait_gone(&ctx, &client, &keys, Duration::from_millis(100)).await {
//!     Err(err) => {
//!         println!("Still present: {}", err.resource);
//!         println!("Last state: {}", err.last_state);
//!         for event in &err.events {
//!             println!("  {} - {}", event.reason, event.message);
//!         }
//!     }
//!     Ok(()) => {}
//! }
//! ```

use std::fmt;
use std::time::Duration;

use k8s_openapi::api::core::v1::Event;
use tokio::time::Instant;
use tracing::debug;

use crate::cancel::RunContext;
use crate::client::SharedClient;
use crate::resource::{LabelSelector, ObjectKey, ResourceDocument, TypeId};

/// A simplified event for wait error context
#[derive(Debug, Clone)]
pub struct WaitEvent {
    /// Event reason (e.g., "Killing", "FailedDelete")
    pub reason: String,
    /// Event message
    pub message: String,
    /// Timestamp as string
    pub timestamp: Option<String>,
}

impl WaitEvent {
    /// Read an event object; `None` if it is not shaped like one
    pub fn from_document(doc: &ResourceDocument) -> Option<Self> {
        let event: Event = serde_json::from_value(doc.to_value()).ok()?;
        let timestamp = event
            .last_timestamp
            .as_ref()
            .map(|t| t.0.format("%H:%M:%S").to_string());
        Some(Self {
            reason: event.reason.unwrap_or_default(),
            message: event.message.unwrap_or_default(),
            timestamp,
        })
    }
}

/// Rich error context for wait operations
#[derive(Debug, Clone)]
pub struct WaitError {
    /// What was waited on (e.g., "Namespace koe-brave-otter")
    pub resource: String,
    /// Description of the last observed state
    pub last_state: String,
    /// How long we waited before giving up
    pub elapsed: Duration,
    /// The timeout that was configured
    pub timeout: Duration,
    /// Recent events related to the resource
    pub events: Vec<WaitEvent>,
}

impl WaitError {
    pub fn new(resource: impl Into<String>, timeout: Duration, elapsed: Duration) -> Self {
        Self {
            resource: resource.into(),
            last_state: "unknown".to_string(),
            elapsed,
            timeout,
            events: Vec::new(),
        }
    }

    pub fn with_state(mut self, state: impl Into<String>) -> Self {
        self.last_state = state.into();
        self
    }

    pub fn with_events(mut self, events: Vec<WaitEvent>) -> Self {
        self.events = events;
        self
    }
}

impl fmt::Display for WaitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f)?;
        writeln!(f, "Wait timeout for {}", self.resource)?;
        writeln!(f, "├─ Last state: {}", self.last_state)?;
        writeln!(f, "├─ Elapsed: {:?}", self.elapsed)?;
        writeln!(f, "└─ Timeout: {:?}", self.timeout)?;

        if !self.events.is_empty() {
            writeln!(f)?;
            writeln!(f, "Recent events:")?;
            for (i, event) in self.events.iter().enumerate() {
                let prefix = if i == self.events.len() - 1 {
                    "└─"
                } else {
                    "├─"
                };
                let ts = event.timestamp.as_deref().unwrap_or("??:??:??");
                writeln!(f, "{} [{}] {}: {}", prefix, ts, event.reason, event.message)?;
            }
        }

        Ok(())
    }
}

impl std::error::Error for WaitError {}

/// Poll until none of `keys` can be fetched
///
/// Bounded by `ctx`; on expiry the error lists the objects still present and
/// recent events from the namespace of the first of them.
pub async fn wait_gone(
    ctx: &RunContext,
    client: &SharedClient,
    keys: &[ObjectKey],
    interval: Duration,
) -> Result<(), WaitError> {
    let start = Instant::now();
    let mut pending: Vec<ObjectKey> = keys.to_vec();
    let mut last_state = String::from("not checked");

    loop {
        let mut still_present = Vec::new();
        for key in &pending {
            match client.get(key).await {
                Err(err) if err.is_not_found() => {}
                Ok(doc) => {
                    let deleting = doc
                        .as_map()
                        .get("metadata")
                        .and_then(|m| m.get("deletionTimestamp"))
                        .is_some();
                    last_state = if deleting {
                        format!("{key} is terminating")
                    } else {
                        format!("{key} still exists")
                    };
                    still_present.push(key.clone());
                }
                Err(err) => {
                    last_state = format!("{key}: {err}");
                    still_present.push(key.clone());
                }
            }
        }

        if still_present.is_empty() {
            debug!(count = keys.len(), elapsed = ?start.elapsed(), "All resources gone");
            return Ok(());
        }
        pending = still_present;

        if let Err(cause) = ctx.sleep(interval).await {
            let resource = pending
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", ");
            let timeout = ctx
                .deadline()
                .map(|d| d.saturating_duration_since(start))
                .unwrap_or_default();
            debug!(resource = %resource, cause = %cause, "Stopped waiting for deletion");
            let events = recent_events(client, pending.first()).await;
            return Err(WaitError::new(resource, timeout, start.elapsed())
                .with_state(last_state)
                .with_events(events));
        }
    }
}

async fn recent_events(client: &SharedClient, key: Option<&ObjectKey>) -> Vec<WaitEvent> {
    let Some(key) = key else {
        return Vec::new();
    };
    let namespace = match (&key.namespace, key.type_id.same_kind(&TypeId::namespace())) {
        (Some(ns), _) => ns.clone(),
        (None, true) => key.name.clone(),
        (None, false) => return Vec::new(),
    };
    let event_type = TypeId::new("", "v1", "Event");
    match client
        .list(&event_type, Some(&namespace), &LabelSelector::everything())
        .await
    {
        Ok(docs) => {
            let mut events: Vec<WaitEvent> =
                docs.iter().filter_map(WaitEvent::from_document).collect();
            let skip = events.len().saturating_sub(5);
            events.drain(..skip);
            events
        }
        Err(_) => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MemoryClient;
    use serde_json::json;
    use std::sync::Arc;

    #[test]
    fn test_wait_error_display() {
        let err = WaitError::new(
            "Namespace koe-brave-otter",
            Duration::from_secs(60),
            Duration::from_secs(60),
        )
        .with_state("Namespace koe-brave-otter is terminating");

        let output = err.to_string();
        assert!(output.contains("koe-brave-otter"));
        assert!(output.contains("terminating"));
        assert!(output.contains("60s"));
    }

    #[test]
    fn test_wait_error_with_events() {
        let events = vec![
            WaitEvent {
                reason: "Killing".to_string(),
                message: "Stopping container app".to_string(),
                timestamp: Some("10:42:01".to_string()),
            },
            WaitEvent {
                reason: "FailedKillPod".to_string(),
                message: "error killing pod".to_string(),
                timestamp: None,
            },
        ];

        let err = WaitError::new("Pod ns-1/app", Duration::from_secs(30), Duration::from_secs(30))
            .with_events(events);

        let output = err.to_string();
        assert!(output.contains("├─ [10:42:01] Killing"));
        assert!(output.contains("└─ [??:??:??] FailedKillPod"));
    }

    #[test]
    fn test_event_from_document() {
        let doc = ResourceDocument::from_value(json!({
            "apiVersion": "v1",
            "kind": "Event",
            "metadata": { "name": "app.1", "namespace": "ns-1" },
            "involvedObject": { "kind": "Pod", "name": "app" },
            "reason": "BackOff",
            "message": "Back-off restarting failed container",
            "lastTimestamp": "2026-01-02T10:42:30Z"
        }))
        .unwrap();

        let event = WaitEvent::from_document(&doc).unwrap();
        assert_eq!(event.reason, "BackOff");
        assert_eq!(event.timestamp.as_deref(), Some("10:42:30"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_gone_returns_once_deleted() {
        let memory = Arc::new(MemoryClient::with_builtin_types());
        let client: SharedClient = memory.clone();
        let cm = ResourceDocument::from_value(json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": { "name": "cm", "namespace": "ns-1" }
        }))
        .unwrap();
        client.create(&cm).await.unwrap();
        let key = cm.key().unwrap();

        let deleter = {
            let client = client.clone();
            let key = key.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(350)).await;
                client.delete(&key).await.unwrap();
            })
        };

        let ctx = RunContext::new().with_timeout(Duration::from_secs(5));
        wait_gone(&ctx, &client, &[key], Duration::from_millis(100))
            .await
            .unwrap();
        deleter.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_gone_times_out_with_state() {
        let client: SharedClient = Arc::new(MemoryClient::with_builtin_types());
        let ns = ResourceDocument::new(&TypeId::namespace(), "ns-stuck");
        client.create(&ns).await.unwrap();

        let ctx = RunContext::new().with_timeout(Duration::from_secs(1));
        let err = wait_gone(&ctx, &client, &[ns.key().unwrap()], Duration::from_millis(100))
            .await
            .unwrap_err();

        assert_eq!(err.resource, "Namespace ns-stuck");
        assert!(err.last_state.contains("still exists"));
        assert_eq!(err.timeout, Duration::from_secs(1));
    }
}
