use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{error, info, instrument, warn};

use crate::approval::ApprovalChannel;
use crate::declaration::{CredentialScope, Declaration};
use crate::observability::MetricsCollector;
use crate::runner::{CommandRunner, CommandSpec};

pub type StageParameters = Map<String, Value>;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StageSpec {
    pub name: String,
    pub stage: String,
    #[serde(default = "default_required", skip_serializing_if = "is_required")]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<StageParameters>,
}

fn default_required() -> bool {
    true
}

fn is_required(required: &bool) -> bool {
    *required
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageOutcome {
    Completed(Option<String>),
    Approved(String),
    Rejected(String),
}

/// Everything a stage may touch while it runs.
pub struct StageContext<'a> {
    pub stage_name: &'a str,
    pub working_dir: &'a Path,
    pub env: BTreeMap<String, String>,
    pub env_remove: Vec<String>,
    pub runner: &'a dyn CommandRunner,
    pub approvals: &'a dyn ApprovalChannel,
}

impl StageContext<'_> {
    /// A shell command scoped to this stage's directory and environment.
    pub fn shell(&self, script: &str) -> CommandSpec {
        CommandSpec::shell(script)
            .current_dir(self.working_dir)
            .envs(&self.env)
            .env_remove(&self.env_remove)
    }

    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.working_dir.join(path)
        }
    }
}

pub trait Stage: Send + Sync {
    fn kind(&self) -> &'static str;
    fn run(&self, ctx: &StageContext<'_>) -> Result<StageOutcome>;
}

type StageConstructor = Arc<dyn Fn(StageParameters) -> Result<Box<dyn Stage>> + Send + Sync>;

pub struct StageRegistry {
    factories: HashMap<String, StageConstructor>,
}

impl Default for StageRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl StageRegistry {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    pub fn register<F>(&mut self, name: impl Into<String>, constructor: F)
    where
        F: Fn(StageParameters) -> Result<Box<dyn Stage>> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Arc::new(constructor));
    }

    pub fn create(&self, name: &str, params: StageParameters) -> Result<Box<dyn Stage>> {
        let factory = self.factories.get(name).ok_or_else(|| {
            anyhow!(
                "Unknown stage kind '{}'. Available kinds: {}",
                name,
                self.known_stages().join(", ")
            )
        })?;
        factory(params)
    }

    pub fn known_stages(&self) -> Vec<String> {
        let mut names: Vec<_> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }
}

#[derive(Debug, Clone)]
pub struct PipelineContext {
    pub working_dir: PathBuf,
    pub environment: BTreeMap<String, String>,
    pub credentials: BTreeMap<String, CredentialScope>,
    /// Every variable any scope names; unbound ones are scrubbed per stage.
    pub credential_variables: Vec<String>,
    /// Snapshot of the host environment credential values are read from.
    pub host_env: BTreeMap<String, String>,
}

pub struct PlannedStage {
    pub name: String,
    pub required: bool,
    pub credentials: Option<String>,
    pub stage: Box<dyn Stage>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StageStatus {
    Succeeded,
    /// An optional stage failed and the run carried on.
    Degraded,
    Failed,
    Approved,
    Rejected,
    Skipped,
}

#[derive(Debug, Clone, Serialize)]
pub struct StageReport {
    pub name: String,
    pub kind: String,
    pub required: bool,
    pub status: StageStatus,
    pub duration_ms: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RunOutcome {
    Succeeded,
    Failed { stage: String, error: String },
    Aborted { stage: String, reason: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineResult {
    pub pipeline: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: RunOutcome,
    pub stages: Vec<StageReport>,
}

impl PipelineResult {
    pub fn is_success(&self) -> bool {
        self.outcome == RunOutcome::Succeeded
    }

    pub fn status_of(&self, stage: &str) -> Option<StageStatus> {
        self.stages
            .iter()
            .find(|report| report.name == stage)
            .map(|report| report.status)
    }
}

pub struct PipelineExecutor {
    name: String,
    stages: Vec<PlannedStage>,
    ctx: PipelineContext,
    metrics: MetricsCollector,
}

impl PipelineExecutor {
    pub fn new(name: impl Into<String>, stages: Vec<PlannedStage>, ctx: PipelineContext) -> Self {
        Self {
            name: name.into(),
            stages,
            ctx,
            metrics: MetricsCollector::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stages(&self) -> &[PlannedStage] {
        &self.stages
    }

    pub fn metrics(&self) -> MetricsCollector {
        self.metrics.clone()
    }

    /// Run every stage in order. Stage failures never surface as `Err`; they
    /// are folded into the returned outcome.
    #[instrument(skip_all, fields(pipeline = %self.name))]
    pub fn execute(
        &self,
        runner: &dyn CommandRunner,
        approvals: &dyn ApprovalChannel,
    ) -> PipelineResult {
        self.metrics.reset();
        let started_at = Utc::now();
        let total_start = Instant::now();
        let mut outcome = RunOutcome::Succeeded;
        let mut reports = Vec::with_capacity(self.stages.len());

        for planned in &self.stages {
            let kind = planned.stage.kind().to_string();
            if outcome != RunOutcome::Succeeded {
                self.metrics.record_status(StageStatus::Skipped);
                reports.push(StageReport {
                    name: planned.name.clone(),
                    kind,
                    required: planned.required,
                    status: StageStatus::Skipped,
                    duration_ms: 0.0,
                    message: None,
                });
                continue;
            }

            let span = tracing::span!(tracing::Level::INFO, "stage", stage = planned.name.as_str());
            let _span_guard = span.enter();
            info!(kind = %kind, required = planned.required, "Stage started");

            let started = Instant::now();
            let result = {
                let _timer = self.metrics.start_stage(&planned.name);
                self.run_stage(planned, runner, approvals)
            };
            let duration_ms = started.elapsed().as_secs_f64() * 1_000.0;

            let (status, message) = match result {
                Ok(StageOutcome::Completed(note)) => {
                    info!(duration_ms, "Stage succeeded");
                    (StageStatus::Succeeded, note)
                }
                Ok(StageOutcome::Approved(reason)) => {
                    info!(reason = %reason, "Approval granted");
                    (StageStatus::Approved, Some(reason))
                }
                Ok(StageOutcome::Rejected(reason)) => {
                    warn!(reason = %reason, "Approval rejected; aborting pipeline");
                    outcome = RunOutcome::Aborted {
                        stage: planned.name.clone(),
                        reason: reason.clone(),
                    };
                    (StageStatus::Rejected, Some(reason))
                }
                Err(err) if !planned.required => {
                    let message = format!("{err:#}");
                    warn!(error = %message, "Optional stage failed; continuing");
                    (StageStatus::Degraded, Some(message))
                }
                Err(err) => {
                    let message = format!("{err:#}");
                    error!(error = %message, "Stage failed");
                    outcome = RunOutcome::Failed {
                        stage: planned.name.clone(),
                        error: message.clone(),
                    };
                    (StageStatus::Failed, Some(message))
                }
            };

            self.metrics.record_status(status);
            reports.push(StageReport {
                name: planned.name.clone(),
                kind,
                required: planned.required,
                status,
                duration_ms,
                message,
            });
        }

        self.metrics.record_total_duration(total_start.elapsed());

        PipelineResult {
            pipeline: self.name.clone(),
            started_at,
            finished_at: Utc::now(),
            outcome,
            stages: reports,
        }
    }

    fn run_stage(
        &self,
        planned: &PlannedStage,
        runner: &dyn CommandRunner,
        approvals: &dyn ApprovalChannel,
    ) -> Result<StageOutcome> {
        let mut env = self.ctx.environment.clone();
        let mut bound = Vec::new();

        if let Some(scope_name) = &planned.credentials {
            let scope = self
                .ctx
                .credentials
                .get(scope_name)
                .ok_or_else(|| anyhow!("Unknown credential scope '{scope_name}'"))?;
            for variable in &scope.env {
                let value = self
                    .ctx
                    .host_env
                    .get(variable)
                    .filter(|value| !value.is_empty())
                    .ok_or_else(|| {
                        anyhow!(
                            "Credential variable '{variable}' for scope '{scope_name}' is not set"
                        )
                    })?;
                env.insert(variable.clone(), value.clone());
                bound.push(variable.clone());
            }
        }

        let env_remove = self
            .ctx
            .credential_variables
            .iter()
            .filter(|variable| !bound.contains(variable))
            .cloned()
            .collect();

        let ctx = StageContext {
            stage_name: &planned.name,
            working_dir: &self.ctx.working_dir,
            env,
            env_remove,
            runner,
            approvals,
        };
        planned.stage.run(&ctx)
    }
}

pub fn build_pipeline(
    stage_registry: &StageRegistry,
    declaration: &Declaration,
    working_dir: PathBuf,
    host_env: BTreeMap<String, String>,
) -> Result<PipelineExecutor> {
    let mut stages = Vec::with_capacity(declaration.stages.len());
    for spec in &declaration.stages {
        let params = spec.params.clone().unwrap_or_default();
        let stage = stage_registry
            .create(&spec.stage, params)
            .map_err(|err| err.context(format!("Stage '{}'", spec.name)))?;
        stages.push(PlannedStage {
            name: spec.name.clone(),
            required: spec.required,
            credentials: spec.credentials.clone(),
            stage,
        });
    }

    let ctx = PipelineContext {
        working_dir,
        environment: declaration.environment.clone(),
        credentials: declaration.credentials.clone(),
        credential_variables: declaration.credential_variables(),
        host_env,
    };
    Ok(PipelineExecutor::new(declaration.name.clone(), stages, ctx))
}
