use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Result;
use mlops_pipeline::approval::{Decision, FixedApproval};
use mlops_pipeline::declaration::Declaration;
use mlops_pipeline::pipeline::{
    PipelineExecutor, RunOutcome, StageRegistry, StageStatus, build_pipeline,
};
use mlops_pipeline::runner::{CommandOutput, CommandRunner, CommandSpec};
use mlops_pipeline::stages;

const DECLARATION: &str = r#"
version: 1
name: test-pipeline
environment:
  AWS_REGION: us-west-2
credentials:
  aws:
    env: [AWS_SECRET_ACCESS_KEY]
stages:
  - name: Pull Data
    stage: shell
    required: false
    credentials: aws
    params:
      commands: ["dvc pull"]
  - name: Train
    stage: shell
    params:
      commands: ["dvc repro"]
  - name: Approve Promotion
    stage: approval
    params:
      timeout_secs: 0
  - name: Build Image
    stage: shell
    credentials: aws
    params:
      commands: ["docker build -t img .", "docker push img"]
  - name: Deploy
    stage: shell
    params:
      commands: ["kubectl rollout status deployment/model-server"]
"#;

struct Call {
    script: String,
    env: BTreeMap<String, String>,
    env_remove: Vec<String>,
}

#[derive(Default)]
struct ScriptedRunner {
    failing: Vec<String>,
    calls: Mutex<Vec<Call>>,
}

impl ScriptedRunner {
    fn failing(scripts: &[&str]) -> Self {
        Self {
            failing: scripts.iter().map(|s| s.to_string()).collect(),
            calls: Mutex::default(),
        }
    }

    fn scripts(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|call| call.script.clone())
            .collect()
    }
}

impl CommandRunner for ScriptedRunner {
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        let script = spec.display();
        self.calls.lock().unwrap().push(Call {
            script: script.clone(),
            env: spec.env.clone(),
            env_remove: spec.env_remove.clone(),
        });
        if self.failing.contains(&script) {
            Ok(CommandOutput::failure(1, format!("{script}: boom")))
        } else {
            Ok(CommandOutput::success(""))
        }
    }
}

fn build_registry() -> StageRegistry {
    let mut registry = StageRegistry::new();
    stages::register_defaults(&mut registry);
    registry
}

fn executor_with_env(yaml: &str, host_env: &[(&str, &str)]) -> PipelineExecutor {
    let declaration: Declaration = serde_yaml::from_str(yaml).unwrap();
    let host_env = host_env
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    build_pipeline(
        &build_registry(),
        &declaration,
        PathBuf::from("."),
        host_env,
    )
    .unwrap()
}

fn executor() -> PipelineExecutor {
    executor_with_env(DECLARATION, &[("AWS_SECRET_ACCESS_KEY", "s3cr3t")])
}

#[test]
fn all_stages_succeed_in_order() {
    let runner = ScriptedRunner::default();
    let result = executor().execute(&runner, &FixedApproval(Decision::Proceed));

    assert!(result.is_success());
    assert_eq!(
        runner.scripts(),
        [
            "dvc pull",
            "dvc repro",
            "docker build -t img .",
            "docker push img",
            "kubectl rollout status deployment/model-server",
        ]
    );
    assert_eq!(
        result.status_of("Approve Promotion"),
        Some(StageStatus::Approved)
    );
}

#[test]
fn rejected_approval_skips_every_later_stage() {
    let runner = ScriptedRunner::default();
    let result = executor().execute(&runner, &FixedApproval(Decision::Abort));

    assert!(!result.is_success());
    assert!(matches!(
        &result.outcome,
        RunOutcome::Aborted { stage, .. } if stage == "Approve Promotion"
    ));
    assert_eq!(
        result.status_of("Approve Promotion"),
        Some(StageStatus::Rejected)
    );
    assert_eq!(result.status_of("Build Image"), Some(StageStatus::Skipped));
    assert_eq!(result.status_of("Deploy"), Some(StageStatus::Skipped));
    assert_eq!(runner.scripts(), ["dvc pull", "dvc repro"]);
}

#[test]
fn optional_data_pull_failure_still_trains() {
    let runner = ScriptedRunner::failing(&["dvc pull"]);
    let result = executor().execute(&runner, &FixedApproval(Decision::Proceed));

    assert!(result.is_success());
    assert_eq!(result.status_of("Pull Data"), Some(StageStatus::Degraded));
    assert_eq!(result.status_of("Train"), Some(StageStatus::Succeeded));
    assert!(runner.scripts().contains(&"dvc repro".to_string()));
}

#[test]
fn image_push_failure_never_deploys() {
    let runner = ScriptedRunner::failing(&["docker push img"]);
    let executor = executor();
    let result = executor.execute(&runner, &FixedApproval(Decision::Proceed));

    assert!(matches!(
        &result.outcome,
        RunOutcome::Failed { stage, error } if stage == "Build Image" && error.contains("boom")
    ));
    assert_eq!(result.status_of("Deploy"), Some(StageStatus::Skipped));
    assert!(
        !runner
            .scripts()
            .iter()
            .any(|script| script.starts_with("kubectl"))
    );

    let snapshot = executor.metrics().snapshot();
    assert_eq!(snapshot.outcomes.failed, 1);
    assert_eq!(snapshot.outcomes.skipped, 1);
    assert_eq!(snapshot.stages["Train"].calls, 1);
    assert!(!snapshot.stages.contains_key("Deploy"));
}

#[test]
fn credentials_reach_only_scoped_stages() {
    let runner = ScriptedRunner::default();
    executor().execute(&runner, &FixedApproval(Decision::Proceed));

    let calls = runner.calls.lock().unwrap();
    let pull = calls.iter().find(|c| c.script == "dvc pull").unwrap();
    assert_eq!(
        pull.env.get("AWS_SECRET_ACCESS_KEY").map(String::as_str),
        Some("s3cr3t")
    );
    assert!(pull.env_remove.is_empty());

    let train = calls.iter().find(|c| c.script == "dvc repro").unwrap();
    assert!(!train.env.contains_key("AWS_SECRET_ACCESS_KEY"));
    assert_eq!(train.env_remove, ["AWS_SECRET_ACCESS_KEY"]);
    assert_eq!(
        train.env.get("AWS_REGION").map(String::as_str),
        Some("us-west-2")
    );
}

#[test]
fn missing_credential_fails_the_stage() {
    let runner = ScriptedRunner::default();
    let result = executor_with_env(DECLARATION, &[])
        .execute(&runner, &FixedApproval(Decision::Proceed));

    // Pull Data is optional, Build Image is not.
    assert_eq!(result.status_of("Pull Data"), Some(StageStatus::Degraded));
    assert!(matches!(
        &result.outcome,
        RunOutcome::Failed { stage, error }
            if stage == "Build Image" && error.contains("AWS_SECRET_ACCESS_KEY")
    ));
    assert!(!runner.scripts().iter().any(|s| s.starts_with("docker")));
}

struct ServiceRunner {
    started: AtomicBool,
    calls: Mutex<Vec<String>>,
}

impl CommandRunner for ServiceRunner {
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        let script = spec.display();
        self.calls.lock().unwrap().push(script.clone());
        if script == "start-tracking" {
            self.started.store(true, Ordering::SeqCst);
            return Ok(CommandOutput::success("started"));
        }
        if self.started.load(Ordering::SeqCst) {
            Ok(CommandOutput::success("ok"))
        } else {
            Ok(CommandOutput::failure(7, "connection refused"))
        }
    }
}

const SERVICE_DECLARATION: &str = r#"
version: 1
name: service
stages:
  - name: Tracking Server
    stage: ensure_service
    required: false
    params:
      probe: probe-tracking
      start: start-tracking
      attempts: 3
      interval_secs: 0
  - name: Train
    stage: shell
    params:
      commands: ["dvc repro"]
"#;

#[test]
fn unreachable_service_is_started_then_probed() {
    let runner = ServiceRunner {
        started: AtomicBool::new(false),
        calls: Mutex::default(),
    };
    let result = executor_with_env(SERVICE_DECLARATION, &[])
        .execute(&runner, &FixedApproval(Decision::Proceed));

    assert!(result.is_success());
    assert_eq!(
        result.status_of("Tracking Server"),
        Some(StageStatus::Succeeded)
    );
    assert_eq!(
        *runner.calls.lock().unwrap(),
        ["probe-tracking", "start-tracking", "probe-tracking", "dvc repro"]
    );
}

#[test]
fn failed_service_start_degrades_but_continues() {
    let runner = ScriptedRunner::failing(&["probe-tracking", "start-tracking"]);
    let result = executor_with_env(SERVICE_DECLARATION, &[])
        .execute(&runner, &FixedApproval(Decision::Proceed));

    assert!(result.is_success());
    assert_eq!(
        result.status_of("Tracking Server"),
        Some(StageStatus::Degraded)
    );
    assert_eq!(result.status_of("Train"), Some(StageStatus::Succeeded));
}

#[test]
fn service_that_never_comes_up_exhausts_its_probes() {
    let runner = ScriptedRunner::failing(&["probe-tracking"]);
    let result = executor_with_env(SERVICE_DECLARATION, &[])
        .execute(&runner, &FixedApproval(Decision::Proceed));

    let report = result
        .stages
        .iter()
        .find(|stage| stage.name == "Tracking Server")
        .unwrap();
    assert_eq!(report.status, StageStatus::Degraded);
    let message = report.message.as_deref().unwrap_or_default();
    assert!(message.contains("still unreachable after 3 probe(s)"), "{message}");
    assert_eq!(
        runner.scripts(),
        [
            "probe-tracking",
            "start-tracking",
            "probe-tracking",
            "probe-tracking",
            "probe-tracking",
            "dvc repro",
        ]
    );
    assert!(result.is_success());
}
