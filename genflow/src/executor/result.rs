//! Per-job results and batch aggregates.

use crate::errors::{JobError, JobErrorKind};
use crate::pipeline::{Artifact, JobState};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Final outcome of one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    /// `JobSpec::index` of the job this result belongs to.
    pub index: usize,
    /// True when an artifact was produced.
    pub success: bool,
    /// The artifact, on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<Artifact>,
    /// The final error, on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JobError>,
    /// Retries taken, of either kind.
    pub retry_count: u32,
    /// Pipeline attempts made.
    pub attempts: u32,
    /// True when the artifact came from the cache.
    pub cache_hit: bool,
    /// Wall time from start to result, in milliseconds.
    pub elapsed_ms: u64,
    /// Every state the job went through.
    pub history: Vec<JobState>,
}

impl JobResult {
    /// Creates a successful result.
    #[must_use]
    pub fn success(index: usize, artifact: Artifact) -> Self {
        Self {
            index,
            success: true,
            artifact: Some(artifact),
            error: None,
            retry_count: 0,
            attempts: 1,
            cache_hit: false,
            elapsed_ms: 0,
            history: Vec::new(),
        }
    }

    /// Creates a failed result.
    #[must_use]
    pub fn failure(index: usize, error: JobError) -> Self {
        Self {
            index,
            success: false,
            artifact: None,
            error: Some(error),
            retry_count: 0,
            attempts: 1,
            cache_hit: false,
            elapsed_ms: 0,
            history: Vec::new(),
        }
    }

    /// Sets the retry and attempt counts.
    #[must_use]
    pub fn with_attempts(mut self, attempts: u32, retry_count: u32) -> Self {
        self.attempts = attempts;
        self.retry_count = retry_count;
        self
    }

    /// Marks the result as served from cache.
    #[must_use]
    pub fn with_cache_hit(mut self, cache_hit: bool) -> Self {
        self.cache_hit = cache_hit;
        self
    }

    /// Sets the elapsed time.
    #[must_use]
    pub fn with_elapsed_ms(mut self, elapsed_ms: u64) -> Self {
        self.elapsed_ms = elapsed_ms;
        self
    }

    /// Sets the state history.
    #[must_use]
    pub fn with_history(mut self, history: Vec<JobState>) -> Self {
        self.history = history;
        self
    }

    /// Kind of the final error, if the job failed.
    #[must_use]
    pub fn error_kind(&self) -> Option<JobErrorKind> {
        self.error.as_ref().map(JobError::kind)
    }
}

/// Aggregate counts over a batch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchSummary {
    /// Number of results.
    pub total: usize,
    /// Results with an artifact.
    pub succeeded: usize,
    /// Results without one.
    pub failed: usize,
    /// Results served from cache.
    pub cache_hits: usize,
    /// Retries across all jobs.
    pub total_retries: u64,
    /// Failures grouped by final error kind.
    pub failures_by_kind: BTreeMap<JobErrorKind, usize>,
}

impl BatchSummary {
    /// Summarizes a batch.
    #[must_use]
    pub fn from_results(results: &[JobResult]) -> Self {
        let mut summary = Self {
            total: results.len(),
            ..Self::default()
        };
        for result in results {
            if result.success {
                summary.succeeded += 1;
            } else {
                summary.failed += 1;
            }
            if result.cache_hit {
                summary.cache_hits += 1;
            }
            summary.total_retries += u64::from(result.retry_count);
            if let Some(kind) = result.error_kind() {
                *summary.failures_by_kind.entry(kind).or_default() += 1;
            }
        }
        summary
    }

    /// Returns the success rate.
    #[must_use]
    pub fn success_rate(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.succeeded as f64 / self.total as f64
    }

    /// Returns true if any job failed.
    #[must_use]
    pub fn has_failures(&self) -> bool {
        self.failed > 0
    }

    /// Converts to dictionary.
    #[must_use]
    pub fn to_dict(&self) -> HashMap<String, serde_json::Value> {
        let mut map = HashMap::new();
        map.insert("total".to_string(), serde_json::json!(self.total));
        map.insert("succeeded".to_string(), serde_json::json!(self.succeeded));
        map.insert("failed".to_string(), serde_json::json!(self.failed));
        map.insert("cache_hits".to_string(), serde_json::json!(self.cache_hits));
        map.insert("total_retries".to_string(), serde_json::json!(self.total_retries));
        map.insert("success_rate".to_string(), serde_json::json!(self.success_rate()));
        map.insert(
            "failures_by_kind".to_string(),
            serde_json::json!(self
                .failures_by_kind
                .iter()
                .map(|(kind, count)| (kind.to_string(), *count))
                .collect::<BTreeMap<_, _>>()),
        );
        map
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn ok(index: usize) -> JobResult {
        JobResult::success(index, Artifact::new("t", vec![], "image/png"))
    }

    #[test]
    fn test_summary_counts() {
        let results = vec![
            ok(0).with_attempts(3, 2),
            ok(1).with_cache_hit(true),
            JobResult::failure(2, JobError::permanent("400")),
            JobResult::failure(3, JobError::rate_limit_timeout(Duration::from_secs(1))),
            JobResult::failure(4, JobError::permanent("404")).with_attempts(2, 1),
        ];
        let summary = BatchSummary::from_results(&results);

        assert_eq!(summary.total, 5);
        assert_eq!(summary.succeeded, 2);
        assert_eq!(summary.failed, 3);
        assert_eq!(summary.cache_hits, 1);
        assert_eq!(summary.total_retries, 3);
        assert_eq!(summary.failures_by_kind[&JobErrorKind::PermanentFailure], 2);
        assert_eq!(summary.failures_by_kind[&JobErrorKind::RateLimitTimeout], 1);
        assert!((summary.success_rate() - 0.4).abs() < f64::EPSILON);
        assert!(summary.has_failures());

        let dict = summary.to_dict();
        assert_eq!(dict["failures_by_kind"]["permanent_failure"], 2);
    }

    #[test]
    fn test_empty_summary() {
        let summary = BatchSummary::from_results(&[]);
        assert_eq!(summary.success_rate(), 0.0);
        assert!(!summary.has_failures());
    }

    #[test]
    fn test_result_serializes_error_tag() {
        let result = JobResult::failure(7, JobError::transient("503"));
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["error"]["kind"], "transient_failure");
        assert_eq!(result.error_kind(), Some(JobErrorKind::TransientFailure));
    }
}
