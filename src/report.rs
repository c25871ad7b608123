use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::pipeline::{PipelineResult, RunOutcome, StageReport};

/// Durable record of one pipeline run.
#[derive(Debug, Serialize)]
pub struct RunReport {
    pub pipeline: String,
    pub declaration: PathBuf,
    pub declaration_sha256: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: RunOutcome,
    pub stages: Vec<StageReport>,
}

impl RunReport {
    pub fn new(declaration: &Path, result: &PipelineResult) -> Result<Self> {
        Ok(Self {
            pipeline: result.pipeline.clone(),
            declaration: declaration.to_path_buf(),
            declaration_sha256: compute_sha256(declaration)?,
            started_at: result.started_at,
            finished_at: result.finished_at,
            outcome: result.outcome.clone(),
            stages: result.stages.clone(),
        })
    }

    /// JSON for `.json` targets, YAML for anything else.
    pub fn write(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create report directory: {}", parent.display())
            })?;
        }

        let file = File::create(path)
            .with_context(|| format!("Failed to create run report: {}", path.display()))?;
        let is_json = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        if is_json {
            serde_json::to_writer_pretty(file, self)
                .with_context(|| format!("Failed to write run report: {}", path.display()))?;
        } else {
            serde_yaml::to_writer(file, self)
                .with_context(|| format!("Failed to write run report: {}", path.display()))?;
        }
        Ok(())
    }
}

/// SHA256 of the file at `path` as lowercase hex.
pub fn compute_sha256(path: &Path) -> Result<String> {
    let file = File::open(path)
        .with_context(|| format!("Failed to open file for hashing: {}", path.display()))?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];

    loop {
        let read = reader.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempfile::tempdir;

    use super::*;
    use crate::pipeline::StageStatus;

    #[test]
    fn compute_sha256_is_stable() {
        let temp = tempdir().unwrap();
        let file_path = temp.path().join("pipeline.yaml");
        let mut file = File::create(&file_path).unwrap();
        file.write_all(b"abc").unwrap();

        let digest = compute_sha256(&file_path).unwrap();
        assert_eq!(
            digest,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn report_format_follows_extension() {
        let temp = tempdir().unwrap();
        let declaration = temp.path().join("pipeline.yaml");
        std::fs::write(&declaration, "version: 1\n").unwrap();
        let result = PipelineResult {
            pipeline: "demo".into(),
            started_at: Utc::now(),
            finished_at: Utc::now(),
            outcome: RunOutcome::Aborted {
                stage: "Approve Promotion".into(),
                reason: "rejected by operator".into(),
            },
            stages: vec![StageReport {
                name: "Approve Promotion".into(),
                kind: "approval".into(),
                required: true,
                status: StageStatus::Rejected,
                duration_ms: 1.0,
                message: Some("rejected by operator".into()),
            }],
        };
        let report = RunReport::new(&declaration, &result).unwrap();

        let json_path = temp.path().join("reports/run.json");
        report.write(&json_path).unwrap();
        let json: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&json_path).unwrap()).unwrap();
        assert_eq!(json["outcome"]["state"], "aborted");
        assert_eq!(json["stages"][0]["status"], "rejected");

        let yaml_path = temp.path().join("run.yaml");
        report.write(&yaml_path).unwrap();
        let yaml = std::fs::read_to_string(&yaml_path).unwrap();
        assert!(yaml.contains("declaration_sha256"));
        assert!(yaml.contains("state: aborted"));
    }
}
