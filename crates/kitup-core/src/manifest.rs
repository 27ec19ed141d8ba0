use std::fs;
use std::path::Path;

use anyhow::{anyhow, Context};
use semver::Version;
use serde::{Deserialize, Serialize};

use crate::tree::MANIFEST_FILE;

/// Identity record stored at the root of every asset tree.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ToolkitManifest {
    pub name: String,
    pub version: Version,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl ToolkitManifest {
    pub fn from_toml_str(input: &str) -> anyhow::Result<Self> {
        let manifest: Self = toml::from_str(input).context("failed to parse toolkit manifest")?;
        validate_toolkit_name(&manifest.name)?;
        Ok(manifest)
    }

    pub fn read_from_dir(dir: &Path) -> anyhow::Result<Self> {
        let path = dir.join(MANIFEST_FILE);
        let raw = fs::read_to_string(&path)
            .with_context(|| format!("failed to read toolkit manifest: {}", path.display()))?;
        Self::from_toml_str(&raw)
            .with_context(|| format!("invalid toolkit manifest: {}", path.display()))
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        toml::to_string(self).context("failed to serialize toolkit manifest")
    }
}

fn validate_toolkit_name(name: &str) -> anyhow::Result<()> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(anyhow!("toolkit name must not be empty"));
    }
    if trimmed != name {
        return Err(anyhow!(
            "toolkit name must not have surrounding whitespace: '{name}'"
        ));
    }
    if name
        .chars()
        .any(|ch| !(ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' || ch == '.'))
    {
        return Err(anyhow!("toolkit name contains invalid character(s): {name}"));
    }
    Ok(())
}
