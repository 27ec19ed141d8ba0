use std::fmt;

use anyhow::{Context, Result};
use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use kitup_core::UpgradeError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileStrategy {
    /// User-owned; the installed copy is kept.
    Preserve,
    /// Toolkit-managed; replaced by the incoming copy.
    Overwrite,
    /// Three-way merged against the shipped defaults.
    Merge,
}

impl FileStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Preserve => "preserve",
            Self::Overwrite => "overwrite",
            Self::Merge => "merge",
        }
    }
}

impl fmt::Display for FileStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

const DEFAULT_RULES: &[(&str, FileStrategy)] = &[
    ("toolkit.toml", FileStrategy::Overwrite),
    ("migrations.toml", FileStrategy::Overwrite),
    ("README.md", FileStrategy::Overwrite),
    ("CHANGELOG.md", FileStrategy::Overwrite),
    ("defaults/**", FileStrategy::Overwrite),
    ("templates/**", FileStrategy::Overwrite),
    ("docs/**", FileStrategy::Overwrite),
    ("scripts/**", FileStrategy::Overwrite),
    ("config.toml", FileStrategy::Preserve),
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StrategyRule {
    pub pattern: String,
    pub strategy: FileStrategy,
}

/// Ordered path-pattern table. Every file must match exactly one rule;
/// there is no fallback.
#[derive(Debug, Clone)]
pub struct StrategyTable {
    rules: Vec<StrategyRule>,
    set: GlobSet,
}

impl StrategyTable {
    pub fn new(rules: Vec<StrategyRule>) -> Result<Self> {
        let mut builder = GlobSetBuilder::new();
        for rule in &rules {
            let glob = GlobBuilder::new(&rule.pattern)
                .literal_separator(true)
                .build()
                .with_context(|| format!("invalid strategy pattern '{}'", rule.pattern))?;
            builder.add(glob);
        }
        let set = builder
            .build()
            .context("failed to compile strategy table")?;
        Ok(Self { rules, set })
    }

    pub fn builtin() -> Result<Self> {
        Self::new(
            DEFAULT_RULES
                .iter()
                .map(|(pattern, strategy)| StrategyRule {
                    pattern: (*pattern).to_string(),
                    strategy: *strategy,
                })
                .collect(),
        )
    }

    pub fn rules(&self) -> &[StrategyRule] {
        &self.rules
    }

    pub fn determine_file_strategy(&self, relative_path: &str) -> Result<FileStrategy, UpgradeError> {
        let matches = self.set.matches(relative_path);
        match matches.as_slice() {
            [index] => Ok(self.rules[*index].strategy),
            [] => Err(UpgradeError::Unclassified {
                path: relative_path.to_string(),
            }),
            many => Err(UpgradeError::AmbiguousStrategy {
                path: relative_path.to_string(),
                rules: many
                    .iter()
                    .map(|index| self.rules[*index].pattern.clone())
                    .collect(),
            }),
        }
    }

    /// Classifies every path, failing on the first one the table does not
    /// cover exactly once.
    pub fn validate_paths<'a, I>(&self, paths: I) -> Result<(), UpgradeError>
    where
        I: IntoIterator<Item = &'a str>,
    {
        for path in paths {
            self.determine_file_strategy(path)?;
        }
        Ok(())
    }
}
