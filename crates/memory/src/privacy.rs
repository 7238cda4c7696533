//! Sensitive-content detection for everything that gets written to memory.

use {
    regex::{Regex, RegexBuilder},
    tracing::warn,
};

use crate::{
    config::PrivacyConfig,
    error::{Error, Result},
};

const REDACTED: &str = "[REDACTED]";

/// Compiled set of sensitive-content patterns.
#[derive(Debug, Clone)]
pub struct PrivacyFilter {
    patterns: Vec<Regex>,
    enabled: bool,
}

impl PrivacyFilter {
    /// Compile `patterns` case-insensitively. An invalid pattern is a configuration error.
    pub fn new<S: AsRef<str>>(patterns: &[S], enabled: bool) -> Result<Self> {
        let patterns = patterns
            .iter()
            .map(|p| {
                RegexBuilder::new(p.as_ref())
                    .case_insensitive(true)
                    .build()
                    .map_err(|e| {
                        Error::config(format!("invalid privacy pattern {:?}: {e}", p.as_ref()))
                    })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { patterns, enabled })
    }

    pub fn from_config(config: &PrivacyConfig) -> Result<Self> {
        Self::new(&config.patterns, config.enabled)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn contains_sensitive(&self, text: &str) -> bool {
        self.enabled && self.patterns.iter().any(|re| re.is_match(text))
    }

    /// Every match, in pattern order. Empty when disabled.
    pub fn violations(&self, text: &str) -> Vec<String> {
        if !self.enabled {
            return Vec::new();
        }
        self.patterns
            .iter()
            .flat_map(|re| re.find_iter(text).map(|m| m.as_str().to_string()))
            .collect()
    }

    /// Replace every match with `[REDACTED]`.
    pub fn redact(&self, text: &str) -> String {
        if !self.enabled {
            return text.to_string();
        }
        let mut out = text.to_string();
        for re in &self.patterns {
            out = re.replace_all(&out, REDACTED).into_owned();
        }
        if out != text {
            warn!("redacted sensitive content before writing");
        }
        out
    }
}
