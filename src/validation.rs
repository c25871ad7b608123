use std::collections::HashSet;

use serde::Serialize;

use crate::declaration::Declaration;
use crate::pipeline::{StageRegistry, StageSpec};

#[derive(Debug, Default, Serialize)]
pub struct ValidationReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn merge(&mut self, other: ValidationReport) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }
}

pub fn validate_declaration(declaration: &Declaration, registry: &StageRegistry) -> ValidationReport {
    let mut report = ValidationReport::default();

    if declaration.version != 1 {
        report.errors.push(format!(
            "Unsupported declaration version: {}",
            declaration.version
        ));
    }

    if declaration.name.trim().is_empty() {
        report.errors.push("Pipeline name cannot be empty".into());
    }

    if declaration.stages.is_empty() {
        report
            .errors
            .push("Pipeline must contain at least one stage".into());
    }

    for (scope, credential) in &declaration.credentials {
        if credential.env.is_empty() {
            report
                .warnings
                .push(format!("Credential scope '{scope}' binds no variables"));
        }
    }

    let mut seen = HashSet::new();
    for (idx, stage) in declaration.stages.iter().enumerate() {
        if stage.name.trim().is_empty() {
            report
                .errors
                .push(format!("Stage {} has an empty name", idx + 1));
        } else if !seen.insert(stage.name.as_str()) {
            report
                .errors
                .push(format!("Duplicate stage name '{}'", stage.name));
        }

        if let Some(scope) = &stage.credentials
            && !declaration.credentials.contains_key(scope)
        {
            report.errors.push(format!(
                "Stage '{}' references unknown credential scope '{scope}'",
                stage.name
            ));
        }

        report.merge(validate_stage_order(idx, stage, &declaration.stages));
        report.merge(validate_stage(stage, registry));
    }

    let approvals = declaration
        .stages
        .iter()
        .filter(|stage| stage.stage == "approval")
        .count();
    if approvals > 1 {
        report.warnings.push(format!(
            "Pipeline declares {approvals} approval gates; each one blocks the run"
        ));
    }

    report
}

fn validate_stage(stage: &StageSpec, registry: &StageRegistry) -> ValidationReport {
    let mut report = ValidationReport::default();

    let params = stage.params.clone().unwrap_or_default();
    if let Err(err) = registry.create(&stage.stage, params) {
        report.errors.push(format!(
            "Stage '{}': {:#}",
            stage.name,
            err.context("Failed to instantiate stage")
        ));
    }

    report
}

fn validate_stage_order(idx: usize, stage: &StageSpec, stages: &[StageSpec]) -> ValidationReport {
    let mut report = ValidationReport::default();
    if stage.stage == "approval" && !stage.required {
        report.errors.push(format!(
            "Approval stage '{}' cannot be optional",
            stage.name
        ));
    }
    if stage.stage == "promote" {
        let gated = stages[..idx].iter().any(|prev| prev.stage == "approval");
        if !gated {
            report.warnings.push(format!(
                "Promotion stage '{}' runs without an earlier approval gate",
                stage.name
            ));
        }
        if !stage.required {
            report.warnings.push(format!(
                "Promotion stage '{}' is optional; later stages may deploy an unpromoted model",
                stage.name
            ));
        }
    }
    report
}
