use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde_json::{Value, json};

use crate::declaration::{CredentialScope, Declaration};
use crate::pipeline::{StageParameters, StageSpec};

pub const PRESETS: &[&str] = &["mlops", "local"];

pub fn preset(name: &str) -> Result<Declaration> {
    match name {
        "mlops" => Ok(mlops_preset()),
        "local" => Ok(local_preset()),
        other => anyhow::bail!(
            "Unknown preset '{other}'. Available presets: {}",
            PRESETS.join(", ")
        ),
    }
}

pub fn generate_preset(name: &str, destination: &Path) -> Result<PathBuf> {
    let declaration = preset(name)?;
    let rendered = serde_yaml::to_string(&declaration)?;
    if let Some(parent) = destination.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    fs::write(destination, rendered).with_context(|| {
        format!(
            "Failed to write pipeline declaration: {}",
            destination.display()
        )
    })?;

    Ok(destination.to_path_buf())
}

/// Train, gate, promote, publish and roll out the model server.
fn mlops_preset() -> Declaration {
    let image = "${IMAGE_NAME}:${BUILD_NUMBER:-latest}";
    let remote_image = "${ECR_REGISTRY}/${IMAGE_NAME}:${BUILD_NUMBER:-latest}";

    Declaration {
        version: 1,
        name: "mlops-demo".into(),
        environment: env(&[
            ("AWS_REGION", "us-east-1"),
            ("MLFLOW_TRACKING_URI", "http://localhost:5000"),
            ("MODEL_NAME", "iris-classifier"),
            ("IMAGE_NAME", "mlops-model-server"),
            ("ECR_REGISTRY", "123456789012.dkr.ecr.us-east-1.amazonaws.com"),
            ("DEPLOYMENT", "model-server"),
        ]),
        credentials: BTreeMap::from([(
            "aws".to_string(),
            CredentialScope {
                env: vec!["AWS_ACCESS_KEY_ID".into(), "AWS_SECRET_ACCESS_KEY".into()],
            },
        )]),
        stages: vec![
            shell("Checkout", None, &["git rev-parse --short HEAD"]),
            shell(
                "Verify Tools",
                Some("aws"),
                &[
                    "dvc --version",
                    "docker --version",
                    "aws --version",
                    "kubectl version --client",
                    "aws sts get-caller-identity",
                ],
            ),
            shell(
                "Install Dependencies",
                None,
                &["pip install -r requirements.txt"],
            ),
            optional(stage(
                "Tracking Server",
                "ensure_service",
                None,
                params(json!({
                    "probe": "curl -sf \"${MLFLOW_TRACKING_URI}/health\"",
                    "start": "docker-compose up -d mlflow",
                    "attempts": 10,
                    "interval_secs": 3,
                })),
            )),
            optional(shell("Pull Data", Some("aws"), &["dvc pull"])),
            shell("Train", Some("aws"), &["dvc repro"]),
            stage(
                "Show Metrics",
                "metrics",
                None,
                params(json!({ "path": "metrics/*.json" })),
            ),
            optional(shell(
                "Registry Check",
                None,
                &["curl -sf \"${MLFLOW_TRACKING_URI}/api/2.0/mlflow/registered-models/get?name=${MODEL_NAME}\""],
            )),
            stage(
                "Approve Promotion",
                "approval",
                None,
                params(json!({
                    "message": "Promote model to production?",
                    "timeout_secs": 3600,
                })),
            ),
            stage("Promote", "promote", None, None),
            shell("Push Artifacts", Some("aws"), &["dvc push"]),
            shell(
                "Build Image",
                Some("aws"),
                &[
                    &format!("docker build -t {image} ."),
                    &format!("docker run --rm {image} python -c \"import serve\""),
                    &format!("docker tag {image} {remote_image}"),
                    "aws ecr get-login-password --region \"${AWS_REGION}\" | docker login --username AWS --password-stdin \"${ECR_REGISTRY}\"",
                    &format!("docker push {remote_image}"),
                ],
            ),
            shell(
                "Deploy",
                Some("aws"),
                &[
                    &format!("kubectl set image \"deployment/${{DEPLOYMENT}}\" \"model-server={remote_image}\""),
                    "kubectl rollout status \"deployment/${DEPLOYMENT}\" --timeout=300s",
                ],
            ),
        ],
    }
}

/// Workstation loop without cloud pushes or deployment.
fn local_preset() -> Declaration {
    Declaration {
        version: 1,
        name: "mlops-local".into(),
        environment: env(&[("MLFLOW_TRACKING_URI", "http://localhost:5000")]),
        credentials: BTreeMap::new(),
        stages: vec![
            optional(stage(
                "Tracking Server",
                "ensure_service",
                None,
                params(json!({
                    "probe": "curl -sf \"${MLFLOW_TRACKING_URI}/health\"",
                    "start": "docker-compose up -d mlflow",
                })),
            )),
            shell("Train", None, &["dvc repro"]),
            stage("Show Metrics", "metrics", None, None),
            stage(
                "Approve Promotion",
                "approval",
                None,
                params(json!({ "timeout_secs": 600 })),
            ),
            stage("Promote", "promote", None, None),
        ],
    }
}

fn env(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
        .collect()
}

fn stage(
    name: &str,
    kind: &str,
    credentials: Option<&str>,
    params: Option<StageParameters>,
) -> StageSpec {
    StageSpec {
        name: name.into(),
        stage: kind.into(),
        required: true,
        credentials: credentials.map(Into::into),
        params,
    }
}

fn shell(name: &str, credentials: Option<&str>, commands: &[&str]) -> StageSpec {
    stage(
        name,
        "shell",
        credentials,
        params(json!({ "commands": commands })),
    )
}

fn optional(mut spec: StageSpec) -> StageSpec {
    spec.required = false;
    spec
}

fn params(value: Value) -> Option<StageParameters> {
    match value {
        Value::Object(map) => Some(map),
        _ => None,
    }
}
