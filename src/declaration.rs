use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::pipeline::StageSpec;

pub const DEFAULT_DECLARATION_PATH: &str = "pipeline.yaml";

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Declaration {
    pub version: u32,
    pub name: String,
    /// Literal variables exported to every stage.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub environment: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub credentials: BTreeMap<String, CredentialScope>,
    pub stages: Vec<StageSpec>,
}

/// Host variables bound only into stages that name this scope.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct CredentialScope {
    pub env: Vec<String>,
}

impl Declaration {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read pipeline declaration: {}", path.display()))?;
        let declaration: Declaration = serde_yaml::from_str(&content).with_context(|| {
            format!("Failed to parse pipeline declaration YAML: {}", path.display())
        })?;
        Ok(declaration)
    }

    /// Every variable named by any credential scope.
    pub fn credential_variables(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .credentials
            .values()
            .flat_map(|scope| scope.env.iter().cloned())
            .collect();
        names.sort();
        names.dedup();
        names
    }
}
