//! Include/exclude path filtering.
//!
//! A path relative to the repository source is kept when it matches at
//! least one include pattern at its start (or there are none), and no
//! exclude pattern anywhere in it.

use anyhow::{Context, Result};
use regex::Regex;

#[derive(Debug, Clone, Default)]
pub struct PathFilter {
    include: Vec<Regex>,
    exclude: Vec<Regex>,
}

impl PathFilter {
    pub fn new(include: &[String], exclude: &[String]) -> Result<Self> {
        let compile = |patterns: &[String]| -> Result<Vec<Regex>> {
            patterns
                .iter()
                .map(|p| Regex::new(p).with_context(|| format!("invalid sync pattern '{p}'")))
                .collect()
        };
        Ok(Self {
            include: compile(include)?,
            exclude: compile(exclude)?,
        })
    }

    pub fn matches(&self, relpath: &str) -> bool {
        if !self.include.is_empty()
            && !self
                .include
                .iter()
                .any(|re| re.find(relpath).is_some_and(|m| m.start() == 0))
        {
            tracing::trace!(path = relpath, "no include pattern matches");
            return false;
        }
        if let Some(re) = self.exclude.iter().find(|re| re.is_match(relpath)) {
            tracing::trace!(path = relpath, pattern = re.as_str(), "excluded");
            return false;
        }
        true
    }
}
