use tracing::{debug, info, warn};

use crate::cancel::RunContext;
use crate::client::{ResourceClient, RetryingClient, SharedClient};
use crate::resource::ObjectKey;

/// Deferred deletes for objects a case created
///
/// Actions run newest first, once, when the case finishes; a step's own
/// outcome does not matter.
#[derive(Default)]
pub struct Rollback {
    actions: Vec<(SharedClient, ObjectKey)>,
}

impl std::fmt::Debug for Rollback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.actions.iter().map(|(_, key)| key.to_string()))
            .finish()
    }
}

impl Rollback {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, client: SharedClient, key: ObjectKey) {
        debug!(resource = %key, "Registered rollback");
        self.actions.push((client, key));
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Resources that would be deleted, in registration order
    pub fn keys(&self) -> impl Iterator<Item = &ObjectKey> {
        self.actions.iter().map(|(_, key)| key)
    }

    /// Delete every registered object; failures are logged, never returned
    pub async fn run(&mut self, ctx: &RunContext) -> usize {
        let mut deleted = 0;
        while let Some((client, key)) = self.actions.pop() {
            let client = RetryingClient::new(client, ctx.clone());
            match client.delete(&key).await {
                Ok(()) => {
                    deleted += 1;
                    info!(resource = %key, "Rolled back resource");
                }
                Err(err) if err.is_not_found() => {
                    debug!(resource = %key, "Rollback target already gone");
                }
                Err(err) => warn!(resource = %key, error = %err, "Rollback failed"),
            }
        }
        deleted
    }
}
