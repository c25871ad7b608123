use std::fs;

use assert_cmd::Command;
use tempfile::tempdir;

fn cli() -> Command {
    let mut cmd = Command::cargo_bin("mlops-pipeline").unwrap();
    cmd.env_remove("MLOPS_APPROVAL")
        .env_remove("AWS_REGION")
        .env_remove("MLFLOW_BUCKET")
        .env("RUST_LOG", "warn");
    cmd
}

#[test]
fn init_then_validate_preset() {
    let temp = tempdir().unwrap();
    let path = temp.path().join("pipeline.yaml");

    cli()
        .args(["init", "--preset", "mlops", "--output"])
        .arg(&path)
        .assert()
        .success();
    cli().arg("validate").arg(&path).assert().success();

    // A second init must not clobber the file.
    cli()
        .args(["init", "--output"])
        .arg(&path)
        .assert()
        .failure();
}

#[test]
fn validate_rejects_broken_declaration() {
    let temp = tempdir().unwrap();
    let path = temp.path().join("pipeline.yaml");
    fs::write(
        &path,
        "version: 1\nname: broken\nstages:\n  - name: Gate\n    stage: approval\n    required: false\n",
    )
    .unwrap();

    cli().arg("validate").arg(&path).assert().failure();
}

#[test]
fn params_init_bucket_and_dry_run_provision() {
    let temp = tempdir().unwrap();
    let params = temp.path().join("params.yaml");

    cli()
        .args(["params", "init", "--output"])
        .arg(&params)
        .assert()
        .success();
    cli()
        .args(["params", "bucket", "--params"])
        .arg(&params)
        .assert()
        .success()
        .stdout("PLACEHOLDER\n");

    let before = fs::read_to_string(&params).unwrap();
    cli()
        .args(["provision", "--dry-run", "--bucket", "team-artifacts", "--params"])
        .arg(&params)
        .assert()
        .success()
        .stdout("team-artifacts\n");
    assert_eq!(fs::read_to_string(&params).unwrap(), before);
}

#[test]
fn setup_bucket_forwards_to_provision() {
    let temp = tempdir().unwrap();
    let params = temp.path().join("params.yaml");
    cli()
        .args(["params", "init", "--output"])
        .arg(&params)
        .assert()
        .success();
    let before = fs::read_to_string(&params).unwrap();

    Command::cargo_bin("setup-bucket")
        .unwrap()
        .env_remove("AWS_REGION")
        .env_remove("MLFLOW_BUCKET")
        .env("RUST_LOG", "warn")
        .args(["--dry-run", "--bucket", "team-artifacts", "--params"])
        .arg(&params)
        .assert()
        .success()
        .stdout("team-artifacts\n");
    assert_eq!(fs::read_to_string(&params).unwrap(), before);

    Command::cargo_bin("setup-bucket")
        .unwrap()
        .env("RUST_LOG", "warn")
        .args(["--dry-run", "--bucket", "Bad_Bucket", "--params"])
        .arg(&params)
        .assert()
        .failure();
}

#[test]
fn provision_rejects_invalid_bucket_name() {
    let temp = tempdir().unwrap();
    let params = temp.path().join("params.yaml");
    cli()
        .args(["params", "init", "--output"])
        .arg(&params)
        .assert()
        .success();

    cli()
        .args(["provision", "--dry-run", "--bucket", "Bad_Bucket", "--params"])
        .arg(&params)
        .assert()
        .failure();
}

#[test]
fn list_stages_names_every_kind() {
    let output = cli().arg("list-stages").output().unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8(output.stdout).unwrap();
    for kind in ["approval", "ensure_service", "metrics", "promote", "shell"] {
        assert!(stdout.contains(&format!("- {kind}")), "{stdout}");
    }
}

#[cfg(unix)]
#[test]
fn run_writes_report_and_stops_on_rejection() {
    let temp = tempdir().unwrap();
    let declaration = temp.path().join("pipeline.yaml");
    fs::write(
        &declaration,
        r#"
version: 1
name: smoke
stages:
  - name: Train
    stage: shell
    params: { commands: ["echo trained > trained.txt"] }
  - name: Approve
    stage: approval
  - name: Deploy
    stage: shell
    params: { commands: ["echo deployed > deployed.txt"] }
"#,
    )
    .unwrap();
    let report = temp.path().join("report.json");

    cli()
        .arg("run")
        .arg(&declaration)
        .arg("--workdir")
        .arg(temp.path())
        .args(["--approval", "reject", "--report"])
        .arg(&report)
        .assert()
        .failure();

    assert!(temp.path().join("trained.txt").exists());
    assert!(!temp.path().join("deployed.txt").exists());

    let report: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(&report).unwrap()).unwrap();
    assert_eq!(report["outcome"]["state"], "aborted");
    assert_eq!(report["stages"][2]["status"], "skipped");
}

#[cfg(unix)]
#[test]
fn run_with_approval_completes() {
    let temp = tempdir().unwrap();
    let declaration = temp.path().join("pipeline.yaml");
    fs::write(
        &declaration,
        r#"
version: 1
name: smoke
environment:
  TARGET: prod
stages:
  - name: Approve
    stage: approval
  - name: Deploy
    stage: shell
    params: { commands: ["echo $TARGET > deployed.txt"] }
"#,
    )
    .unwrap();
    let metrics = temp.path().join("out/metrics.prom");

    cli()
        .arg("run")
        .arg(&declaration)
        .arg("--workdir")
        .arg(temp.path())
        .env("MLOPS_APPROVAL", "approve")
        .arg("--metrics-prometheus")
        .arg(&metrics)
        .assert()
        .success();

    assert_eq!(
        fs::read_to_string(temp.path().join("deployed.txt")).unwrap(),
        "prod\n"
    );
    assert!(
        fs::read_to_string(&metrics)
            .unwrap()
            .contains("mlops_pipeline_")
    );
}
