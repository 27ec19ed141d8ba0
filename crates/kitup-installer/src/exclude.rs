use anyhow::{Context, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};

/// Regenerable subtrees left out of backups and file plans.
///
/// A pattern ending in `/**` also matches the directory itself, so walkers
/// can prune it without descending.
#[derive(Debug, Clone)]
pub struct PathExclusions {
    patterns: Vec<String>,
    set: GlobSet,
}

impl PathExclusions {
    pub fn new(patterns: &[String]) -> Result<Self> {
        let mut builder = GlobSetBuilder::new();
        for pattern in patterns {
            builder.add(
                Glob::new(pattern)
                    .with_context(|| format!("invalid exclusion pattern '{pattern}'"))?,
            );
            if let Some(dir) = pattern.strip_suffix("/**") {
                builder.add(
                    Glob::new(dir)
                        .with_context(|| format!("invalid exclusion pattern '{pattern}'"))?,
                );
            }
        }
        Ok(Self {
            patterns: patterns.to_vec(),
            set: builder
                .build()
                .context("failed to compile exclusion patterns")?,
        })
    }

    pub fn none() -> Self {
        Self {
            patterns: Vec::new(),
            set: GlobSet::empty(),
        }
    }

    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    pub fn is_excluded(&self, relative_path: &str) -> bool {
        self.set.is_match(relative_path)
    }
}
