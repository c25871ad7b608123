use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result, anyhow, bail};
use serde::Deserialize;
use tracing::info;

use super::{reject_unknown, take_string};
use crate::params::{DEFAULT_PARAMS_PATH, ParamsFile};
use crate::pipeline::{Stage, StageContext, StageOutcome, StageParameters, StageRegistry};

pub const DEFAULT_EVAL_METRICS: &str = "metrics/eval_metrics.json";

pub fn register(registry: &mut StageRegistry) {
    registry.register("promote", |params| {
        Ok(Box::new(PromoteStage::from_params(params)?))
    });
}

#[derive(Debug, Deserialize)]
struct EvalMetrics {
    accuracy: f64,
}

/// Copy the staging model over the production one when its evaluated
/// accuracy reaches `promote.min_accuracy` from the params file.
struct PromoteStage {
    params: PathBuf,
    metrics: PathBuf,
}

impl PromoteStage {
    fn from_params(mut params: StageParameters) -> Result<Self> {
        let params_path = take_string(&mut params, "params")
            .unwrap_or_else(|| DEFAULT_PARAMS_PATH.to_string());
        let metrics = take_string(&mut params, "metrics")
            .unwrap_or_else(|| DEFAULT_EVAL_METRICS.to_string());
        reject_unknown(&params, "promote")?;
        Ok(Self {
            params: PathBuf::from(params_path),
            metrics: PathBuf::from(metrics),
        })
    }
}

impl Stage for PromoteStage {
    fn kind(&self) -> &'static str {
        "promote"
    }

    fn run(&self, ctx: &StageContext<'_>) -> Result<StageOutcome> {
        let params_path = ctx.resolve(&self.params);
        let promote = ParamsFile::load(&params_path)?
            .parse()?
            .promote
            .ok_or_else(|| anyhow!("{} has no 'promote' section", params_path.display()))?;

        let metrics_path = ctx.resolve(&self.metrics);
        let content = fs::read_to_string(&metrics_path).with_context(|| {
            format!("Failed to read evaluation metrics: {}", metrics_path.display())
        })?;
        let metrics: EvalMetrics = serde_json::from_str(&content).with_context(|| {
            format!("Failed to parse evaluation metrics: {}", metrics_path.display())
        })?;

        info!(
            accuracy = metrics.accuracy,
            min_accuracy = promote.min_accuracy,
            "Checking promotion threshold"
        );
        if metrics.accuracy < promote.min_accuracy {
            bail!(
                "Model accuracy {:.4} is below threshold {:.4}; model not promoted",
                metrics.accuracy,
                promote.min_accuracy
            );
        }

        let staging = ctx.resolve(&promote.staging_model);
        let production = ctx.resolve(&promote.production_model);
        if let Some(parent) = production.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create production directory: {}", parent.display())
            })?;
        }
        fs::copy(&staging, &production).with_context(|| {
            format!(
                "Failed to copy model from {} to {}",
                staging.display(),
                production.display()
            )
        })?;

        info!(
            staging = %staging.display(),
            production = %production.display(),
            "Model promoted to production"
        );
        Ok(StageOutcome::Completed(Some(format!(
            "promoted with accuracy {:.4}",
            metrics.accuracy
        ))))
    }
}
