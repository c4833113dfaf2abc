//! Payload shaping: strip what the service does not understand.

use super::Payload;
use crate::errors::{ConfigError, JobError};
use regex::Regex;
use std::collections::BTreeSet;

/// Matches `--flag` directives plus a numeric value such as `5`, `0.5`,
/// `16:9` or `1024x1024`. A word after a flag is prompt text, not a value.
const FLAG_PATTERN: &str = r"(?:^|\s)--[A-Za-z][\w-]*(?:\s+\d[\d.:/x]*\b)?";

/// Cleans a payload before dispatch.
///
/// Shaping strips `--flag [value]` directives and configured patterns from
/// the prompt, collapses whitespace, truncates to `max_prompt_chars` and
/// drops parameters outside the allow-list. A prompt that ends up empty is a
/// permanent failure: retrying cannot make it valid.
#[derive(Debug, Clone)]
pub struct PayloadShaper {
    strip_flags: Option<Regex>,
    value_flags: Option<Regex>,
    patterns: Vec<Regex>,
    allowed_params: Option<BTreeSet<String>>,
    max_prompt_chars: Option<usize>,
}

impl Default for PayloadShaper {
    fn default() -> Self {
        Self {
            strip_flags: Regex::new(FLAG_PATTERN).ok(),
            value_flags: None,
            patterns: Vec::new(),
            allowed_params: None,
            max_prompt_chars: None,
        }
    }
}

impl PayloadShaper {
    /// Creates a shaper that strips flag directives only.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Keeps `--flag` directives in the prompt.
    #[must_use]
    pub fn keep_flags(mut self) -> Self {
        self.strip_flags = None;
        self
    }

    /// Flags whose value is a word, like `--style raw`. Their value is
    /// stripped along with the flag whatever it looks like.
    pub fn with_value_flags<I, S>(mut self, flags: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let names: Vec<String> = flags
            .into_iter()
            .map(|flag| regex::escape(flag.as_ref().trim_start_matches('-')))
            .filter(|name| !name.is_empty())
            .collect();
        if names.is_empty() {
            self.value_flags = None;
            return Ok(self);
        }
        let pattern = format!(r"(?:^|\s)--(?:{})(?:\s+[^\s-]\S*)?(?:\s|$)", names.join("|"));
        let regex = Regex::new(&pattern)
            .map_err(|e| ConfigError::invalid("shaper.value_flags", e.to_string()))?;
        self.value_flags = Some(regex);
        Ok(self)
    }

    /// Also strips every match of `pattern`.
    pub fn with_pattern(mut self, pattern: &str) -> Result<Self, ConfigError> {
        let regex = Regex::new(pattern)
            .map_err(|e| ConfigError::invalid("shaper.patterns", e.to_string()))?;
        self.patterns.push(regex);
        Ok(self)
    }

    /// Keeps only these parameters.
    #[must_use]
    pub fn with_allowed_params<I, S>(mut self, params: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_params = Some(params.into_iter().map(Into::into).collect());
        self
    }

    /// Truncates prompts to `max` characters.
    #[must_use]
    pub fn with_max_prompt_chars(mut self, max: usize) -> Self {
        self.max_prompt_chars = Some(max);
        self
    }

    /// Returns a shaped copy of `payload`.
    pub fn shape(&self, payload: &Payload) -> Result<Payload, JobError> {
        let mut prompt = payload.prompt.clone();
        if let Some(flags) = &self.value_flags {
            prompt = flags.replace_all(&prompt, " ").into_owned();
        }
        if let Some(flags) = &self.strip_flags {
            prompt = flags.replace_all(&prompt, " ").into_owned();
        }
        for pattern in &self.patterns {
            prompt = pattern.replace_all(&prompt, " ").into_owned();
        }

        let mut prompt = collapse_whitespace(&prompt);
        if let Some(max) = self.max_prompt_chars {
            if let Some((cut, _)) = prompt.char_indices().nth(max) {
                prompt.truncate(cut);
                prompt = prompt.trim_end().to_string();
            }
        }
        if prompt.is_empty() {
            return Err(JobError::permanent("prompt is empty after shaping"));
        }

        let params = match &self.allowed_params {
            Some(allowed) => payload
                .params
                .iter()
                .filter(|(key, _)| allowed.contains(key.as_str()))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            None => payload.params.clone(),
        };

        Ok(Payload { prompt, params })
    }
}

/// Joins whitespace-separated words with single spaces.
pub(crate) fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}
