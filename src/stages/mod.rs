use std::fs;
use std::path::{MAIN_SEPARATOR, Path};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::approval::{ApprovalRequest, Decision};
use crate::pipeline::{Stage, StageContext, StageOutcome, StageParameters, StageRegistry};

pub mod promote;

pub const DEFAULT_APPROVAL_TIMEOUT_SECS: u64 = 3600;
pub const DEFAULT_METRICS_GLOB: &str = "metrics/*.json";

pub fn register_defaults(registry: &mut StageRegistry) {
    registry.register("shell", |params| {
        Ok(Box::new(ShellStage::from_params(params)?))
    });
    registry.register("ensure_service", |params| {
        Ok(Box::new(EnsureServiceStage::from_params(params)?))
    });
    registry.register("metrics", |params| {
        Ok(Box::new(MetricsStage::from_params(params)?))
    });
    registry.register("approval", |params| {
        Ok(Box::new(ApprovalStage::from_params(params)?))
    });
    promote::register(registry);
}

struct ShellStage {
    commands: Vec<String>,
}

impl ShellStage {
    fn from_params(mut params: StageParameters) -> Result<Self> {
        let commands = take_string_list(&mut params, "commands")?
            .ok_or_else(|| anyhow!("shell stage requires 'commands' parameter"))?;
        if commands.is_empty() {
            bail!("shell stage requires at least one command");
        }
        if let Some(blank) = commands.iter().position(|c| c.trim().is_empty()) {
            bail!("shell stage command {} is empty", blank + 1);
        }
        reject_unknown(&params, "shell")?;
        Ok(Self { commands })
    }
}

impl Stage for ShellStage {
    fn kind(&self) -> &'static str {
        "shell"
    }

    fn run(&self, ctx: &StageContext<'_>) -> Result<StageOutcome> {
        for command in &self.commands {
            info!(command = %command, "Running");
            ctx.runner.run_checked(&ctx.shell(command))?;
        }
        Ok(StageOutcome::Completed(None))
    }
}

/// Probe a service, optionally start it, and wait until the probe passes.
struct EnsureServiceStage {
    probe: String,
    start: Option<String>,
    attempts: u32,
    interval: Duration,
}

impl EnsureServiceStage {
    fn from_params(mut params: StageParameters) -> Result<Self> {
        let probe = take_string(&mut params, "probe")
            .ok_or_else(|| anyhow!("ensure_service stage requires 'probe' parameter"))?;
        let start = take_string(&mut params, "start");
        let attempts = take_u64(&mut params, "attempts")?.unwrap_or(5);
        if attempts == 0 {
            bail!("ensure_service 'attempts' must be at least 1");
        }
        let attempts = u32::try_from(attempts).context("ensure_service 'attempts' is too large")?;
        let interval = Duration::from_secs(take_u64(&mut params, "interval_secs")?.unwrap_or(2));
        reject_unknown(&params, "ensure_service")?;
        Ok(Self {
            probe,
            start,
            attempts,
            interval,
        })
    }

    fn probe(&self, ctx: &StageContext<'_>) -> Result<bool> {
        Ok(ctx.runner.run(&ctx.shell(&self.probe))?.success)
    }
}

impl Stage for EnsureServiceStage {
    fn kind(&self) -> &'static str {
        "ensure_service"
    }

    fn run(&self, ctx: &StageContext<'_>) -> Result<StageOutcome> {
        if self.probe(ctx)? {
            info!(probe = %self.probe, "Service reachable");
            return Ok(StageOutcome::Completed(Some("service already reachable".into())));
        }

        let Some(start) = &self.start else {
            bail!("Service probe '{}' failed and no start command is configured", self.probe);
        };

        warn!(start = %start, "Service unreachable; starting it");
        ctx.runner.run_checked(&ctx.shell(start))?;

        for attempt in 1..=self.attempts {
            if !self.interval.is_zero() {
                thread::sleep(self.interval);
            }
            if self.probe(ctx)? {
                info!(attempt, "Service reachable after start");
                return Ok(StageOutcome::Completed(Some(format!(
                    "service started; reachable after {attempt} probe(s)"
                ))));
            }
            debug!(attempt, "Service not reachable yet");
        }

        bail!(
            "Service still unreachable after {} probe(s) of '{}'",
            self.attempts,
            self.probe
        )
    }
}

/// Log every scalar found in metric JSON files. Read-only.
struct MetricsStage {
    pattern: String,
}

impl MetricsStage {
    fn from_params(mut params: StageParameters) -> Result<Self> {
        let pattern =
            take_string(&mut params, "path").unwrap_or_else(|| DEFAULT_METRICS_GLOB.to_string());
        glob::Pattern::new(&pattern)
            .with_context(|| format!("metrics 'path' is not a valid glob: {pattern}"))?;
        reject_unknown(&params, "metrics")?;
        Ok(Self { pattern })
    }
}

impl Stage for MetricsStage {
    fn kind(&self) -> &'static str {
        "metrics"
    }

    fn run(&self, ctx: &StageContext<'_>) -> Result<StageOutcome> {
        let pattern = if Path::new(&self.pattern).is_absolute() {
            self.pattern.clone()
        } else {
            // The directory is literal; only the declared pattern may glob.
            let base = glob::Pattern::escape(&ctx.working_dir.to_string_lossy());
            format!("{base}{MAIN_SEPARATOR}{}", self.pattern)
        };
        let mut files = Vec::new();
        for entry in glob::glob(&pattern)
            .with_context(|| format!("Invalid glob pattern: {pattern}"))?
        {
            let path = entry?;
            if path.is_file() {
                files.push(path);
            }
        }
        if files.is_empty() {
            bail!("No metrics files matched pattern: {}", self.pattern);
        }

        let mut count = 0usize;
        for path in &files {
            let content = fs::read_to_string(path)
                .with_context(|| format!("Failed to read metrics file: {}", path.display()))?;
            let value: Value = serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse metrics JSON: {}", path.display()))?;
            let mut flattened = Vec::new();
            flatten_metrics("", &value, &mut flattened);
            for (metric, value) in flattened {
                info!(file = %path.display(), metric = %metric, value = %value, "Metric");
                count += 1;
            }
        }

        Ok(StageOutcome::Completed(Some(format!(
            "{count} metric(s) from {} file(s)",
            files.len()
        ))))
    }
}

fn flatten_metrics(prefix: &str, value: &Value, out: &mut Vec<(String, String)>) {
    match value {
        Value::Object(map) => {
            for (key, nested) in map {
                let name = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{prefix}.{key}")
                };
                flatten_metrics(&name, nested, out);
            }
        }
        Value::Array(_) | Value::Null => {}
        Value::String(s) => out.push((prefix.to_string(), s.clone())),
        scalar => out.push((prefix.to_string(), scalar.to_string())),
    }
}

struct ApprovalStage {
    message: String,
    timeout: Option<Duration>,
}

impl ApprovalStage {
    fn from_params(mut params: StageParameters) -> Result<Self> {
        let message = take_string(&mut params, "message")
            .unwrap_or_else(|| "Promote model to production?".to_string());
        let timeout_secs =
            take_u64(&mut params, "timeout_secs")?.unwrap_or(DEFAULT_APPROVAL_TIMEOUT_SECS);
        reject_unknown(&params, "approval")?;
        Ok(Self {
            message,
            timeout: (timeout_secs > 0).then(|| Duration::from_secs(timeout_secs)),
        })
    }
}

impl Stage for ApprovalStage {
    fn kind(&self) -> &'static str {
        "approval"
    }

    fn run(&self, ctx: &StageContext<'_>) -> Result<StageOutcome> {
        info!(
            message = %self.message,
            timeout_secs = self.timeout.map(|t| t.as_secs()),
            "Waiting for approval"
        );
        let decision = ctx.approvals.decide(&ApprovalRequest {
            stage: ctx.stage_name.to_string(),
            message: self.message.clone(),
            timeout: self.timeout,
        })?;
        Ok(match decision.decision {
            Decision::Proceed => StageOutcome::Approved(decision.reason),
            Decision::Abort => StageOutcome::Rejected(decision.reason),
        })
    }
}

pub(crate) fn take_string(params: &mut StageParameters, key: &str) -> Option<String> {
    params.remove(key).and_then(|value| match value {
        Value::String(s) => Some(s),
        Value::Null => None,
        other => Some(other.to_string()),
    })
}

fn take_u64(params: &mut StageParameters, key: &str) -> Result<Option<u64>> {
    match params.remove(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(num)) => num
            .as_u64()
            .map(Some)
            .ok_or_else(|| anyhow!("'{key}' must be a non-negative integer")),
        Some(Value::String(s)) => s
            .trim()
            .parse()
            .map(Some)
            .with_context(|| format!("'{key}' must be a non-negative integer")),
        Some(other) => bail!("'{key}' must be a non-negative integer, got {other}"),
    }
}

fn take_string_list(params: &mut StageParameters, key: &str) -> Result<Option<Vec<String>>> {
    match params.remove(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(vec![s])),
        Some(Value::Array(items)) => items
            .into_iter()
            .map(|item| match item {
                Value::String(s) => Ok(s),
                other => Err(anyhow!("'{key}' entries must be strings, got {other}")),
            })
            .collect::<Result<Vec<_>>>()
            .map(Some),
        Some(other) => bail!("'{key}' must be a string or a list of strings, got {other}"),
    }
}

pub(crate) fn reject_unknown(params: &StageParameters, kind: &str) -> Result<()> {
    if params.is_empty() {
        return Ok(());
    }
    let mut keys: Vec<_> = params.keys().map(String::as_str).collect();
    keys.sort_unstable();
    bail!("{kind} stage does not accept parameter(s): {}", keys.join(", "))
}
