//! Bounded-concurrency batch execution.

use super::{FlaggedTermStripper, JobResult, PayloadMutator, RetryDecision, RetryState};
use crate::config::{ExecutorConfig, RetryConfig};
use crate::errors::{ConfigError, JobError};
use crate::events::{event_types, job_event_data, job_event_data_with, EventSink, NoOpEventSink};
use crate::pipeline::{JobPipeline, JobSpec, JobState, PipelineContext};
use futures::future::join_all;
use serde_json::json;
use std::any::Any;
use std::cmp::Reverse;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::Instant;
use tracing::{debug, info, info_span, warn, Instrument};

/// Runs jobs through a [`JobPipeline`] under a concurrency cap.
///
/// Every submitted job yields exactly one [`JobResult`], at the same position
/// it was submitted at. A failing or panicking job never affects its
/// siblings.
#[derive(Debug, Clone)]
pub struct BatchExecutor {
    runner: JobRunner,
    max_concurrency: usize,
}

/// Everything a spawned job needs, cheap to clone.
#[derive(Debug, Clone)]
struct JobRunner {
    pipeline: Arc<JobPipeline>,
    retry: RetryConfig,
    mutator: Arc<dyn PayloadMutator>,
    events: Arc<dyn EventSink>,
}

impl BatchExecutor {
    /// Creates an executor with default retry settings.
    #[must_use]
    pub fn new(pipeline: JobPipeline) -> Self {
        let config = ExecutorConfig::default();
        Self {
            runner: JobRunner {
                pipeline: Arc::new(pipeline),
                retry: config.retry,
                mutator: Arc::new(FlaggedTermStripper::new()),
                events: Arc::new(NoOpEventSink),
            },
            max_concurrency: config.max_concurrency,
        }
    }

    /// Creates an executor from a validated config.
    pub fn from_config(pipeline: JobPipeline, config: &ExecutorConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::new(pipeline)
            .with_retry(config.retry.clone())
            .with_max_concurrency(config.max_concurrency))
    }

    /// Sets the retry configuration.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.runner.retry = retry;
        self
    }

    /// Sets the payload mutator used after content rejections.
    #[must_use]
    pub fn with_mutator(mut self, mutator: Arc<dyn PayloadMutator>) -> Self {
        self.runner.mutator = mutator;
        self
    }

    /// Sets the event sink.
    #[must_use]
    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.runner.events = events;
        self
    }

    /// Sets the concurrency cap used by [`run_batch`](Self::run_batch).
    #[must_use]
    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency.max(1);
        self
    }

    /// Default concurrency cap.
    #[must_use]
    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    /// Runs one job to completion, retries included.
    ///
    /// The job runs on its own task, so a panicking stage yields a
    /// `PermanentFailure` result exactly as it would inside a batch.
    pub async fn submit(&self, job: JobSpec) -> JobResult {
        let index = job.index;
        let span = info_span!("job", index);
        let handle = tokio::spawn(self.runner.clone().run(job).instrument(span));
        match handle.await {
            Ok(result) => result,
            Err(err) => self.contain_join_error(index, err),
        }
    }

    /// Runs `jobs` with the configured concurrency cap.
    pub async fn run_batch(&self, jobs: Vec<JobSpec>) -> Vec<JobResult> {
        self.submit_batch(jobs, self.max_concurrency).await
    }

    /// Runs `jobs` with at most `max_concurrency` in flight.
    ///
    /// Jobs start in priority order (higher first, then submission order).
    /// Results come back in submission order whatever the completion order.
    /// Dropping the returned future does not stop jobs already started.
    pub async fn submit_batch(&self, jobs: Vec<JobSpec>, max_concurrency: usize) -> Vec<JobResult> {
        let max_concurrency = max_concurrency.max(1);
        let started = Instant::now();
        let total = jobs.len();
        info!(jobs = total, max_concurrency, "Starting batch");
        self.runner
            .events
            .emit(
                event_types::BATCH_STARTED,
                Some(json!({ "jobs": total, "max_concurrency": max_concurrency })),
            )
            .await;

        let indices: Vec<usize> = jobs.iter().map(|job| job.index).collect();
        let mut dispatch_order: Vec<usize> = (0..total).collect();
        dispatch_order.sort_by_key(|&pos| (Reverse(jobs[pos].priority), pos));

        let mut pending: Vec<Option<JobSpec>> = jobs.into_iter().map(Some).collect();
        let mut spawned: Vec<(usize, JoinHandle<JobResult>)> = Vec::with_capacity(total);
        let semaphore = Arc::new(Semaphore::new(max_concurrency));

        for pos in dispatch_order {
            let Some(job) = pending[pos].take() else {
                continue;
            };
            // The semaphore is never closed, so this only fails on a bug.
            let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
                break;
            };
            let runner = self.runner.clone();
            let span = info_span!("job", index = job.index);
            let handle = tokio::spawn(
                async move {
                    let _permit = permit;
                    runner.run(job).await
                }
                .instrument(span),
            );
            spawned.push((pos, handle));
        }

        let joined = join_all(
            spawned
                .into_iter()
                .map(|(pos, handle)| async move { (pos, handle.await) }),
        )
        .await;

        let mut slots: Vec<Option<JobResult>> = (0..total).map(|_| None).collect();
        for (pos, outcome) in joined {
            slots[pos] = Some(match outcome {
                Ok(result) => result,
                Err(err) => self.contain_join_error(indices[pos], err),
            });
        }
        let results: Vec<JobResult> = slots
            .into_iter()
            .enumerate()
            .map(|(pos, slot)| {
                slot.unwrap_or_else(|| {
                    JobResult::failure(indices[pos], JobError::permanent("job was never dispatched"))
                        .with_attempts(0, 0)
                        .with_history(vec![JobState::Pending, JobState::Failed])
                })
            })
            .collect();

        let succeeded = results.iter().filter(|r| r.success).count();
        let elapsed_ms = started.elapsed().as_millis() as u64;
        info!(
            jobs = total,
            succeeded,
            failed = total - succeeded,
            elapsed_ms,
            "Batch completed"
        );
        self.runner
            .events
            .emit(
                event_types::BATCH_COMPLETED,
                Some(json!({
                    "jobs": total,
                    "succeeded": succeeded,
                    "failed": total - succeeded,
                    "elapsed_ms": elapsed_ms,
                })),
            )
            .await;
        results
    }

    fn contain_join_error(&self, index: usize, err: JoinError) -> JobResult {
        let message = if err.is_panic() {
            format!("job panicked: {}", panic_message(err.into_panic()))
        } else {
            "job task was cancelled".to_string()
        };
        warn!(index, error = %message, "Job task did not finish");
        let error = JobError::permanent(message);
        self.runner.events.try_emit(
            event_types::JOB_FAILED,
            Some(job_event_data_with(index, 0, json!({ "error": error.to_dict() }))),
        );
        JobResult::failure(index, error).with_history(vec![JobState::Pending, JobState::Failed])
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

impl JobRunner {
    async fn run(self, job: JobSpec) -> JobResult {
        let started = Instant::now();
        let index = job.index;
        let mut history = vec![JobState::Pending];
        let mut state = RetryState::new();
        let mut payload = job.payload.clone();
        let mut attempt: u32 = 0;

        self.events
            .emit(event_types::JOB_STARTED, Some(job_event_data(index, 1)))
            .await;

        loop {
            attempt += 1;
            let mut ctx = PipelineContext::new(job.clone())
                .with_payload(payload.clone())
                .with_attempt(attempt)
                .with_event_sink(Arc::clone(&self.events));

            let outcome = self.pipeline.run(&mut ctx).await;
            history.extend(ctx.take_history());
            let elapsed_ms = || started.elapsed().as_millis() as u64;

            let error = match outcome {
                Ok(artifact) => {
                    history.push(JobState::Done);
                    debug!(index, attempt, cache_hit = ctx.cache_hit, "Job completed");
                    self.events
                        .emit(
                            event_types::JOB_COMPLETED,
                            Some(job_event_data_with(
                                index,
                                attempt,
                                json!({ "cache_hit": ctx.cache_hit, "task_id": artifact.task_id }),
                            )),
                        )
                        .await;
                    return JobResult::success(index, artifact)
                        .with_attempts(attempt, state.total_retries())
                        .with_cache_hit(ctx.cache_hit)
                        .with_elapsed_ms(elapsed_ms())
                        .with_history(history);
                }
                Err(error) => error,
            };

            match state.decide(&error, &self.retry) {
                RetryDecision::Retry { delay, mutate } => {
                    history.push(JobState::Retrying);
                    if mutate {
                        payload = self.mutator.mutate(&payload, &error);
                    }
                    warn!(
                        index,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        kind = %error.kind(),
                        error = %error,
                        "Retrying job"
                    );
                    self.events
                        .emit(
                            event_types::JOB_RETRYING,
                            Some(job_event_data_with(
                                index,
                                attempt,
                                json!({
                                    "kind": error.kind(),
                                    "delay_ms": delay.as_millis() as u64,
                                    "mutated": mutate,
                                }),
                            )),
                        )
                        .await;
                    if delay > Duration::ZERO {
                        tokio::time::sleep(delay).await;
                    }
                }
                RetryDecision::GiveUp | RetryDecision::NotRetryable => {
                    history.push(JobState::Failed);
                    warn!(index, attempt, kind = %error.kind(), error = %error, "Job failed");
                    self.events
                        .emit(
                            event_types::JOB_FAILED,
                            Some(job_event_data_with(
                                index,
                                attempt,
                                json!({ "error": error.to_dict() }),
                            )),
                        )
                        .await;
                    return JobResult::failure(index, error)
                        .with_attempts(attempt, state.total_retries())
                        .with_elapsed_ms(elapsed_ms())
                        .with_history(history);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::JitterStrategy;
    use crate::pipeline::{Artifact, FnStage, GenerationClient, MockGenerationClient, Payload};
    use pretty_assertions::assert_eq;

    fn fast_retry() -> RetryConfig {
        RetryConfig::new()
            .with_base_delay_ms(100)
            .with_max_delay_ms(1000)
            .with_jitter(JitterStrategy::None)
    }

    fn executor(client: MockGenerationClient) -> BatchExecutor {
        let client: Arc<dyn GenerationClient> = Arc::new(client);
        BatchExecutor::new(JobPipeline::generation(client).build()).with_retry(fast_retry())
    }

    fn png(task: &str) -> Artifact {
        Artifact::new(task, vec![0x89, 0x50], "image/png")
    }

    #[tokio::test(start_paused = true)]
    async fn test_submit_success_history() {
        let mut client = MockGenerationClient::new();
        client.expect_invoke().returning(|_| Ok(png("t1")));

        let result = executor(client)
            .submit(JobSpec::new(3, Payload::new("forest")))
            .await;
        assert!(result.success);
        assert_eq!(result.index, 3);
        assert_eq!(result.attempts, 1);
        assert_eq!(
            result.history,
            vec![JobState::Pending, JobState::Dispatched, JobState::Success, JobState::Done]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_back_off_then_succeed() {
        let mut client = MockGenerationClient::new();
        let mut seq = mockall::Sequence::new();
        client
            .expect_invoke()
            .times(2)
            .in_sequence(&mut seq)
            .returning(|_| Err(JobError::from_status(502, "bad gateway")));
        client
            .expect_invoke()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(png("t2")));

        let start = Instant::now();
        let result = executor(client)
            .submit(JobSpec::new(0, Payload::new("forest")))
            .await;

        assert!(result.success);
        assert_eq!(result.retry_count, 2);
        assert_eq!(result.attempts, 3);
        // 100ms then 200ms of backoff.
        assert_eq!(start.elapsed(), Duration::from_millis(300));
        assert_eq!(
            result.history,
            vec![
                JobState::Pending,
                JobState::Dispatched,
                JobState::Error,
                JobState::Retrying,
                JobState::Dispatched,
                JobState::Error,
                JobState::Retrying,
                JobState::Dispatched,
                JobState::Success,
                JobState::Done,
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_retries_exhausted() {
        let mut client = MockGenerationClient::new();
        client
            .expect_invoke()
            .times(3)
            .returning(|_| Err(JobError::transient("timeout")));

        let exec = executor(client).with_retry(fast_retry().with_max_transient_retries(2));
        let result = exec.submit(JobSpec::new(0, Payload::new("forest"))).await;

        assert!(!result.success);
        assert_eq!(result.retry_count, 2);
        assert_eq!(result.error_kind(), Some(crate::errors::JobErrorKind::TransientFailure));
        assert_eq!(result.history.last(), Some(&JobState::Failed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_content_rejection_mutates_payload() {
        let mut client = MockGenerationClient::new();
        client
            .expect_invoke()
            .withf(|p| p.prompt.contains("bloody"))
            .times(1)
            .returning(|_| Err(JobError::content_rejected("gore", vec!["bloody".to_string()])));
        client
            .expect_invoke()
            .withf(|p| p.prompt == "a battle")
            .times(1)
            .returning(|_| Ok(png("clean")));

        let result = executor(client)
            .submit(JobSpec::new(0, Payload::new("a bloody battle")))
            .await;
        assert!(result.success);
        assert_eq!(result.retry_count, 1);
        assert_eq!(result.artifact.unwrap().task_id, "clean");
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_failure_is_not_retried() {
        let mut client = MockGenerationClient::new();
        client
            .expect_invoke()
            .times(1)
            .returning(|_| Err(JobError::from_status(400, "malformed")));

        let result = executor(client)
            .submit(JobSpec::new(0, Payload::new("forest")))
            .await;
        assert!(!result.success);
        assert_eq!(result.attempts, 1);
        assert_eq!(result.retry_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_results_follow_submission_order() {
        let mut client = MockGenerationClient::new();
        client.expect_invoke().returning(|p| {
            if p.prompt == "bad" {
                Err(JobError::permanent("rejected"))
            } else {
                Ok(png(&p.prompt))
            }
        });

        let jobs = JobSpec::batch(vec![
            Payload::new("a"),
            Payload::new("bad"),
            Payload::new("c"),
        ]);
        let results = executor(client).submit_batch(jobs, 2).await;

        assert_eq!(results.len(), 3);
        assert_eq!(results.iter().map(|r| r.index).collect::<Vec<_>>(), vec![0, 1, 2]);
        assert!(results[0].success && !results[1].success && results[2].success);
        assert_eq!(results[2].artifact.as_ref().unwrap().task_id, "c");
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_stage_is_contained() {
        let pipeline = JobPipeline::builder()
            .stage(Arc::new(FnStage::new("explode", |ctx: &mut PipelineContext| {
                if ctx.job.index == 1 {
                    panic!("stage blew up");
                }
                ctx.artifact = Some(Artifact::new("ok", vec![], "text/plain"));
                Ok::<(), JobError>(())
            })))
            .build()
            .unwrap();

        let jobs = JobSpec::batch((0..3).map(|i| Payload::new(format!("job {i}"))));
        let results = BatchExecutor::new(pipeline).submit_batch(jobs, 3).await;

        assert!(results[0].success);
        assert!(results[2].success);
        let failed = &results[1];
        assert!(!failed.success);
        assert_eq!(failed.index, 1);
        match &failed.error {
            Some(JobError::PermanentFailure { message }) => {
                assert!(message.contains("stage blew up"), "{message}");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_submit_contains_panicking_stage() {
        let pipeline = JobPipeline::builder()
            .stage(Arc::new(FnStage::new("explode", |_: &mut PipelineContext| -> Result<(), JobError> {
                panic!("single job blew up");
            })))
            .build()
            .unwrap();

        let result = BatchExecutor::new(pipeline)
            .submit(JobSpec::new(7, Payload::new("forest")))
            .await;

        assert!(!result.success);
        assert_eq!(result.index, 7);
        assert_eq!(result.history, vec![JobState::Pending, JobState::Failed]);
        match &result.error {
            Some(JobError::PermanentFailure { message }) => {
                assert!(message.contains("single job blew up"), "{message}");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_batch() {
        let client = MockGenerationClient::new();
        assert!(executor(client).submit_batch(Vec::new(), 4).await.is_empty());
    }

    #[test]
    fn test_from_config_validates() {
        let pipeline = || {
            JobPipeline::builder()
                .stage(Arc::new(FnStage::new("noop", |_: &mut PipelineContext| {
                    Ok::<(), JobError>(())
                })))
                .build()
                .unwrap()
        };
        assert!(BatchExecutor::from_config(pipeline(), &ExecutorConfig::new().with_max_concurrency(0)).is_err());
        let exec = BatchExecutor::from_config(pipeline(), &ExecutorConfig::new().with_max_concurrency(7)).unwrap();
        assert_eq!(exec.max_concurrency(), 7);
    }
}
