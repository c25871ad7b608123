use mlops_pipeline::declaration::Declaration;
use mlops_pipeline::pipeline::StageRegistry;
use mlops_pipeline::presets::{PRESETS, generate_preset};
use mlops_pipeline::stages;
use mlops_pipeline::validation::{ValidationReport, validate_declaration};
use tempfile::tempdir;

fn validate(yaml: &str) -> ValidationReport {
    let mut registry = StageRegistry::new();
    stages::register_defaults(&mut registry);
    let declaration: Declaration = serde_yaml::from_str(yaml).unwrap();
    validate_declaration(&declaration, &registry)
}

#[test]
fn generated_presets_load_and_validate() {
    let temp = tempdir().unwrap();
    let mut registry = StageRegistry::new();
    stages::register_defaults(&mut registry);

    for name in PRESETS {
        let path = generate_preset(name, &temp.path().join(format!("{name}/pipeline.yaml")))
            .unwrap();
        let declaration = Declaration::load(&path).unwrap();
        let report = validate_declaration(&declaration, &registry);
        assert!(report.is_ok(), "{name}: {:?}", report.errors);
        assert!(report.warnings.is_empty(), "{name}: {:?}", report.warnings);
    }
}

#[test]
fn shell_stage_without_commands_is_rejected() {
    let report = validate(
        r#"
version: 1
name: broken
stages:
  - name: Train
    stage: shell
"#,
    );
    assert!(!report.is_ok());
    assert!(report.errors[0].contains("Train"), "{:?}", report.errors);
}

#[test]
fn duplicate_names_and_unknown_scopes_are_errors() {
    let report = validate(
        r#"
version: 1
name: broken
stages:
  - name: Train
    stage: shell
    params: { commands: ["dvc repro"] }
  - name: Train
    stage: shell
    credentials: gcp
    params: { commands: ["dvc push"] }
"#,
    );
    assert_eq!(report.errors.len(), 2, "{:?}", report.errors);
    assert!(report.errors.iter().any(|e| e.contains("Duplicate stage name 'Train'")));
    assert!(report.errors.iter().any(|e| e.contains("unknown credential scope 'gcp'")));
}

#[test]
fn unknown_stage_kind_and_parameters_are_errors() {
    let report = validate(
        r#"
version: 1
name: broken
stages:
  - name: Notify
    stage: slack
  - name: Show Metrics
    stage: metrics
    params: { path: "metrics/*.json", colour: true }
"#,
    );
    assert_eq!(report.errors.len(), 2, "{:?}", report.errors);
    assert!(report.errors.iter().any(|e| e.contains("slack")));
    assert!(report.errors.iter().any(|e| e.contains("colour")));
}

#[test]
fn optional_approval_is_an_error() {
    let report = validate(
        r#"
version: 1
name: gated
stages:
  - name: Approve Promotion
    stage: approval
    required: false
"#,
    );
    assert!(!report.is_ok());
    assert!(report.errors[0].contains("cannot be optional"));
}

#[test]
fn ungated_promotion_is_a_warning() {
    let report = validate(
        r#"
version: 1
name: ungated
stages:
  - name: Promote
    stage: promote
"#,
    );
    assert!(report.is_ok());
    assert_eq!(report.warnings.len(), 1);
    assert!(report.warnings[0].contains("without an earlier approval gate"));
}

#[test]
fn unsupported_version_and_empty_pipeline_are_errors() {
    let report = validate("version: 2\nname: empty\nstages: []\n");
    assert_eq!(report.errors.len(), 2, "{:?}", report.errors);
}
