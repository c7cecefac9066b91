//! Failure diagnostics for step debugging
//!
//! Collectors are declared on an assertion block and run only after the
//! step's polling phase has failed. Everything here is best-effort: a
//! collector that fails is logged and skipped.

use std::collections::BTreeMap;
use std::fmt;

use k8s_openapi::api::core::v1::Event;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::cancel::RunContext;
use crate::client::SharedClient;
use crate::resource::{LabelSelector, TypeId};
use crate::runner::{run_command, BackgroundProcesses, Command, CommandEnv};

const LINE_WIDTH: usize = 80;
const HEAVY_LINE: &str = "━";
const LIGHT_LINE: &str = "─";
const DEFAULT_TAIL: u32 = 10;

/// What a collector gathers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CollectorKind {
    Pod,
    Events,
    Command,
}

/// A diagnostic collector declared in an assertion block
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Collector {
    #[serde(rename = "type")]
    pub kind: Option<CollectorKind>,
    pub pod: Option<String>,
    pub namespace: Option<String>,
    pub container: Option<String>,
    pub selector: Option<String>,
    pub tail: Option<u32>,
    pub command: Option<String>,
}

impl Collector {
    /// Kind declared explicitly, or inferred from the fields present
    pub fn resolved_kind(&self) -> Option<CollectorKind> {
        if self.kind.is_some() {
            return self.kind;
        }
        if self.command.is_some() {
            Some(CollectorKind::Command)
        } else if self.pod.is_some() || self.selector.is_some() {
            Some(CollectorKind::Pod)
        } else {
            None
        }
    }

    /// Shell command that dumps pod logs, `None` for other kinds
    pub fn log_command(&self, default_namespace: &str) -> Option<String> {
        if self.resolved_kind() != Some(CollectorKind::Pod) {
            return None;
        }
        let namespace = self.namespace.as_deref().unwrap_or(default_namespace);
        let target = match (&self.pod, &self.selector) {
            (Some(pod), _) => pod.clone(),
            (None, Some(selector)) => format!("-l {selector}"),
            (None, None) => return None,
        };
        let containers = match &self.container {
            Some(container) => format!("-c {container}"),
            None => "--all-containers".to_string(),
        };
        let tail = self.tail.unwrap_or(DEFAULT_TAIL);
        Some(format!(
            "kubectl logs --prefix {target} -n {namespace} {containers} --tail={tail}"
        ))
    }

    fn label(&self) -> String {
        match self.resolved_kind() {
            Some(CollectorKind::Pod) => match (&self.pod, &self.selector) {
                (Some(pod), _) => format!("pod {pod}"),
                (None, Some(selector)) => format!("pods {selector}"),
                (None, None) => "pod".to_string(),
            },
            Some(CollectorKind::Events) => "events".to_string(),
            Some(CollectorKind::Command) => {
                format!("command {}", self.command.as_deref().unwrap_or_default())
            }
            None => "unknown collector".to_string(),
        }
    }
}

/// Collected diagnostic information from a failed step
#[derive(Debug, Default)]
pub struct Diagnostics {
    /// Namespace the step ran in
    pub namespace: String,
    /// Step that failed
    pub step: String,
    /// Collector label -> output
    pub outputs: BTreeMap<String, String>,
    /// Namespace events
    pub events: Vec<Event>,
}

impl Diagnostics {
    pub fn new(namespace: impl Into<String>, step: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            step: step.into(),
            outputs: BTreeMap::new(),
            events: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.outputs.is_empty() && self.events.is_empty()
    }

    fn heavy_line() -> String {
        HEAVY_LINE.repeat(LINE_WIDTH)
    }

    fn section_header(title: &str) -> String {
        let title_with_spaces = format!(" {} ", title);
        let remaining = LINE_WIDTH.saturating_sub(title_with_spaces.chars().count() + 3);
        format!(
            "{}{}{}",
            LIGHT_LINE.repeat(3),
            title_with_spaces,
            LIGHT_LINE.repeat(remaining)
        )
    }
}

impl fmt::Display for Diagnostics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f)?;
        writeln!(f, "{}", Self::heavy_line())?;
        writeln!(f, "  STEP {} FAILED", self.step)?;
        writeln!(f, "{}", Self::heavy_line())?;
        writeln!(f)?;
        writeln!(f, "  Namespace: {}", self.namespace)?;

        for (label, output) in &self.outputs {
            writeln!(f)?;
            writeln!(f, "{}", Self::section_header(label))?;
            writeln!(f)?;

            if output.trim().is_empty() {
                writeln!(f, "  (no output)")?;
                continue;
            }
            let lines: Vec<&str> = output.lines().collect();
            let max_lines = 50;
            for line in lines.iter().take(max_lines) {
                writeln!(f, "  {}", line)?;
            }
            if lines.len() > max_lines {
                writeln!(f, "  ... ({} more lines)", lines.len() - max_lines)?;
            }
        }

        if !self.events.is_empty() {
            writeln!(f)?;
            writeln!(
                f,
                "{}",
                Self::section_header(&format!("Events ({})", self.events.len()))
            )?;
            writeln!(f)?;

            // Events without timestamps sort last
            let mut events: Vec<_> = self.events.iter().collect();
            use chrono::prelude::*;
            events.sort_by_key(|event| {
                event
                    .last_timestamp
                    .as_ref()
                    .map(|t| t.0)
                    .unwrap_or(DateTime::<Utc>::MAX_UTC)
            });

            for event in events {
                let timestamp = event
                    .last_timestamp
                    .as_ref()
                    .map(|t| t.0.format("%H:%M:%S").to_string())
                    .unwrap_or_else(|| "??:??:??".to_string());

                let kind = event.involved_object.kind.as_deref().unwrap_or("?");
                let name = event.involved_object.name.as_deref().unwrap_or("?");
                let reason = event.reason.as_deref().unwrap_or("Unknown");
                let message = event.message.as_deref().unwrap_or("");

                let max_msg_len = 45;
                let msg_display = if message.chars().count() > max_msg_len {
                    let cut: String = message.chars().take(max_msg_len).collect();
                    format!("{cut}...")
                } else {
                    message.to_string()
                };

                writeln!(
                    f,
                    "  • {}  {:12}  {:10}  {}",
                    timestamp,
                    format!("{}/{}", kind, name),
                    reason,
                    msg_display
                )?;
            }
        }

        writeln!(f)?;
        writeln!(f, "{}", Self::section_header("Debug"))?;
        writeln!(f)?;
        writeln!(f, "  kubectl -n {} get all", self.namespace)?;
        writeln!(f, "  kubectl -n {} get events --sort-by=.lastTimestamp", self.namespace)?;
        writeln!(f, "  kubectl -n {} describe pods", self.namespace)?;
        writeln!(f)?;
        writeln!(f, "{}", Self::heavy_line())?;

        Ok(())
    }
}

/// Run every collector, never failing
pub async fn collect(
    ctx: &RunContext,
    collectors: &[Collector],
    step: &str,
    client: &SharedClient,
    env: &CommandEnv,
) -> Diagnostics {
    let mut diagnostics = Diagnostics::new(env.namespace.clone(), step);
    let background = BackgroundProcesses::new();

    for collector in collectors {
        let label = collector.label();
        match collector.resolved_kind() {
            Some(CollectorKind::Events) => {
                let namespace = collector.namespace.as_deref().unwrap_or(&env.namespace);
                match namespace_events(client, namespace).await {
                    Ok(events) => diagnostics.events.extend(events),
                    Err(e) => warn!(collector = %label, error = %e, "Diagnostics collector failed"),
                }
            }
            Some(CollectorKind::Pod) | Some(CollectorKind::Command) => {
                let line = match collector.log_command(&env.namespace) {
                    Some(line) => line,
                    None => collector.command.clone().unwrap_or_default(),
                };
                if line.is_empty() {
                    warn!(collector = %label, "Collector has nothing to run");
                    continue;
                }
                let cmd = Command {
                    skip_log_output: true,
                    ..Command::line(line).ignore_failure()
                };
                match run_command(ctx, &cmd, env, &background).await {
                    Ok(Some(result)) => {
                        let mut output = result.stdout;
                        output.push_str(&result.stderr);
                        diagnostics.outputs.insert(label, output);
                    }
                    Ok(None) => {}
                    Err(e) => warn!(collector = %label, error = %e, "Diagnostics collector failed"),
                }
            }
            None => warn!(collector = ?collector, "Collector has no type, skipping"),
        }
    }

    debug!(step = %step, sections = diagnostics.outputs.len(), events = diagnostics.events.len(), "Collected diagnostics");
    diagnostics
}

async fn namespace_events(
    client: &SharedClient,
    namespace: &str,
) -> Result<Vec<Event>, crate::client::ClientError> {
    let docs = client
        .list(
            &TypeId::new("", "v1", "Event"),
            Some(namespace),
            &LabelSelector::everything(),
        )
        .await?;
    Ok(docs
        .into_iter()
        .filter_map(|doc| serde_json::from_value(doc.into_value()).ok())
        .collect())
}
