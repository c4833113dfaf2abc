//! Payload mutation between content-rejection retries.

use crate::errors::JobError;
use crate::pipeline::{collapse_whitespace, Payload};
use regex::{Regex, RegexBuilder};
use std::fmt::Debug;
use tracing::{debug, warn};

/// Rewrites a rejected payload before it is retried.
pub trait PayloadMutator: Send + Sync + Debug {
    /// Returns the payload to use for the next attempt.
    fn mutate(&self, payload: &Payload, error: &JobError) -> Payload;
}

/// Removes flagged terms from the prompt.
///
/// Terms reported on the rejection are removed as whole words, ignoring
/// case, along with any configured always-strip terms.
#[derive(Debug, Clone, Default)]
pub struct FlaggedTermStripper {
    extra_terms: Vec<String>,
}

impl FlaggedTermStripper {
    /// Creates a stripper that only removes reported terms.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Also strips `terms` on every rejection.
    #[must_use]
    pub fn with_terms<I, S>(mut self, terms: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.extra_terms.extend(terms.into_iter().map(Into::into));
        self
    }

    // `\b` only anchors next to a word character, so it is added per edge;
    // a term like `c++` would otherwise never match.
    fn term_regex(term: &str) -> Option<Regex> {
        let term = term.trim();
        let is_word = |c: char| c.is_alphanumeric() || c == '_';
        let start = if term.starts_with(is_word) { r"\b" } else { "" };
        let end = if term.ends_with(is_word) { r"\b" } else { "" };
        let pattern = format!("{start}{}{end}", regex::escape(term));
        match RegexBuilder::new(&pattern).case_insensitive(true).build() {
            Ok(regex) => Some(regex),
            Err(e) => {
                warn!(term, error = %e, "Skipping unusable flagged term");
                None
            }
        }
    }
}

impl PayloadMutator for FlaggedTermStripper {
    fn mutate(&self, payload: &Payload, error: &JobError) -> Payload {
        let reported: &[String] = match error {
            JobError::ContentRejected { flagged_terms, .. } => flagged_terms,
            _ => &[],
        };

        let mut prompt = payload.prompt.clone();
        for term in reported.iter().chain(&self.extra_terms) {
            if term.trim().is_empty() {
                continue;
            }
            if let Some(regex) = Self::term_regex(term) {
                prompt = regex.replace_all(&prompt, "").into_owned();
            }
        }
        let prompt = collapse_whitespace(&prompt);
        debug!(
            removed_chars = payload.prompt.len().saturating_sub(prompt.len()),
            "Stripped flagged terms"
        );

        Payload {
            prompt,
            params: payload.params.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn rejected(terms: &[&str]) -> JobError {
        JobError::content_rejected("flagged", terms.iter().map(|t| t.to_string()).collect())
    }

    #[test]
    fn test_strips_reported_terms_case_insensitively() {
        let payload = Payload::new("A Bloody battle, bloody sunset").with_param("n", 1);
        let mutated = FlaggedTermStripper::new().mutate(&payload, &rejected(&["bloody"]));
        assert_eq!(mutated.prompt, "A battle, sunset");
        assert_eq!(mutated.params, payload.params);
    }

    #[test]
    fn test_whole_words_only() {
        let payload = Payload::new("gun gunner");
        let mutated = FlaggedTermStripper::new().mutate(&payload, &rejected(&["gun"]));
        assert_eq!(mutated.prompt, "gunner");
    }

    #[test]
    fn test_extra_terms_and_metacharacters() {
        let payload = Payload::new("c++ code with (weapon) art");
        let mutated = FlaggedTermStripper::new()
            .with_terms(["weapon"])
            .mutate(&payload, &rejected(&["c++", " "]));
        assert_eq!(mutated.prompt, "code with () art");
    }

    #[test]
    fn test_terms_with_symbol_edges_are_stripped() {
        let payload = Payload::new("write c++ and #gore tags, keep c# code");
        let mutated = FlaggedTermStripper::new().mutate(&payload, &rejected(&["c++", "#gore"]));
        assert_eq!(mutated.prompt, "write and tags, keep c# code");
    }

    #[test]
    fn test_other_errors_only_use_extra_terms() {
        let payload = Payload::new("red dragon");
        let mutated = FlaggedTermStripper::new()
            .with_terms(["red"])
            .mutate(&payload, &JobError::transient("x"));
        assert_eq!(mutated.prompt, "dragon");
    }
}
