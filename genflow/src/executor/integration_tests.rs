//! End-to-end batch scenarios: limiter, cache, pipeline and executor together.
//!
//! Everything runs on a paused tokio clock, so timings are exact.

use super::*;
use crate::cache::{Cache, MemoryCache};
use crate::config::{CacheConfig, LimiterConfig, RetryConfig};
use crate::errors::{JobError, JobErrorKind};
use crate::events::event_types;
use crate::limiter::{Limiter, LimiterRegistry, TokenBucket};
use crate::pipeline::{
    ExternalCallStage, GenerationClient, JobPipeline, JobSpec, JobState, Payload,
};
use crate::testing::{PanickingStage, RecordingEventSink, ScriptedClient, LATENCY_PARAM};
use pretty_assertions::assert_eq;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

fn fast_retry() -> RetryConfig {
    RetryConfig::new()
        .with_base_delay_ms(100)
        .with_max_delay_ms(2000)
        .with_jitter(JitterStrategy::None)
}

fn as_client(client: &Arc<ScriptedClient>) -> Arc<dyn GenerationClient> {
    client.clone()
}

fn prompts(n: usize) -> Vec<JobSpec> {
    JobSpec::batch((0..n).map(|i| Payload::new(format!("scene {i}"))))
}

fn indices(results: &[JobResult]) -> Vec<usize> {
    results.iter().map(|r| r.index).collect()
}

#[tokio::test(start_paused = true)]
async fn test_token_bucket_paces_batch() {
    let client = Arc::new(ScriptedClient::new());
    let limiter: Arc<dyn Limiter> = Arc::new(TokenBucket::new(10.0, 10.0));
    let pipeline = JobPipeline::generation(as_client(&client))
        .with_limiter(limiter, Duration::from_secs(5))
        .build();
    let executor = BatchExecutor::new(pipeline).with_retry(fast_retry());

    let origin = Instant::now();
    let results = executor.submit_batch(prompts(15), 3).await;

    assert_eq!(indices(&results), (0..15).collect::<Vec<_>>());
    assert!(results.iter().all(|r| r.success));
    assert!(client.max_in_flight() <= 3);

    let mut offsets = client.dispatch_offsets(origin);
    offsets.sort();
    assert_eq!(offsets.len(), 15);
    assert!(offsets[9] <= Duration::from_millis(50), "{offsets:?}");
    let last = offsets[14];
    assert!(
        last >= Duration::from_millis(450) && last <= Duration::from_millis(650),
        "last dispatch at {last:?}"
    );
}

#[tokio::test(start_paused = true)]
async fn test_concurrency_cap_holds() {
    let client = Arc::new(ScriptedClient::new().with_latency(Duration::from_millis(100)));
    let executor = BatchExecutor::new(JobPipeline::generation(as_client(&client)).build())
        .with_max_concurrency(3);

    let origin = Instant::now();
    let results = executor.run_batch(prompts(8)).await;

    assert_eq!(results.len(), 8);
    assert_eq!(client.max_in_flight(), 3);
    assert_eq!(origin.elapsed(), Duration::from_millis(300));
}

#[tokio::test(start_paused = true)]
async fn test_results_keep_submission_order_under_varied_latency() {
    let client = Arc::new(ScriptedClient::new());
    let executor = BatchExecutor::new(JobPipeline::generation(as_client(&client)).build());

    let jobs = JobSpec::batch(
        [400u64, 50, 300, 0, 200]
            .iter()
            .enumerate()
            .map(|(i, ms)| Payload::new(format!("p{i}")).with_param(LATENCY_PARAM, *ms)),
    );
    let results = executor.submit_batch(jobs, 5).await;

    assert_eq!(indices(&results), vec![0, 1, 2, 3, 4]);
    for (i, result) in results.iter().enumerate() {
        let artifact = result.artifact.as_ref().unwrap();
        assert_eq!(artifact.data, format!("p{i}").into_bytes());
    }
}

#[tokio::test(start_paused = true)]
async fn test_panic_is_isolated_to_its_job() {
    let client = Arc::new(ScriptedClient::new());
    let pipeline = JobPipeline::builder()
        .stage(Arc::new(PanickingStage::for_indices("explode", [2])))
        .stage(Arc::new(ExternalCallStage::new(as_client(&client))))
        .build()
        .unwrap();

    let results = BatchExecutor::new(pipeline).submit_batch(prompts(5), 2).await;

    assert_eq!(indices(&results), vec![0, 1, 2, 3, 4]);
    let failed: Vec<usize> = results.iter().filter(|r| !r.success).map(|r| r.index).collect();
    assert_eq!(failed, vec![2]);
    assert_eq!(results[2].error_kind(), Some(JobErrorKind::PermanentFailure));
    assert_eq!(results[2].history, vec![JobState::Pending, JobState::Failed]);
    assert_eq!(client.call_count(), 4);

    let summary = BatchSummary::from_results(&results);
    assert_eq!(summary.succeeded, 4);
    assert_eq!(summary.failures_by_kind[&JobErrorKind::PermanentFailure], 1);
}

#[tokio::test(start_paused = true)]
async fn test_content_rejection_retries_with_stripped_prompt() {
    let client = Arc::new(ScriptedClient::new().with_rejected_terms(["gore"]));
    let executor = BatchExecutor::new(JobPipeline::generation(as_client(&client)).build())
        .with_retry(fast_retry());

    let origin = Instant::now();
    let result = executor
        .submit(JobSpec::new(0, Payload::new("castle with gore at dusk")))
        .await;

    assert!(result.success);
    assert_eq!(result.retry_count, 1);
    assert_eq!(client.prompts(), vec!["castle with gore at dusk", "castle with at dusk"]);
    // Content retries do not back off.
    assert_eq!(origin.elapsed(), Duration::ZERO);
    assert!(result.history.contains(&JobState::Retrying));
}

#[tokio::test(start_paused = true)]
async fn test_content_rejection_budget_exhausted() {
    // Substring match keeps flagging a prompt the whole-word stripper leaves alone.
    let client = Arc::new(ScriptedClient::new().with_rejected_terms(["gore"]));
    let executor = BatchExecutor::new(JobPipeline::generation(as_client(&client)).build())
        .with_retry(fast_retry().with_max_content_retries(2));

    let result = executor
        .submit(JobSpec::new(0, Payload::new("goreish castle")))
        .await;

    assert!(!result.success);
    assert_eq!(result.error_kind(), Some(JobErrorKind::ContentRejected));
    assert_eq!(result.attempts, 3);
    assert_eq!(client.call_count(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_transient_retry_honors_retry_after() {
    let client = Arc::new(
        ScriptedClient::new()
            .with_script([Err(JobError::transient_after("status 429", Duration::from_secs(1)))]),
    );
    let executor = BatchExecutor::new(JobPipeline::generation(as_client(&client)).build())
        .with_retry(fast_retry());

    let origin = Instant::now();
    let result = executor.submit(JobSpec::new(0, Payload::new("harbor"))).await;

    assert!(result.success);
    assert_eq!(result.retry_count, 1);
    assert_eq!(
        client.dispatch_offsets(origin),
        vec![Duration::ZERO, Duration::from_secs(1)]
    );
}

#[tokio::test(start_paused = true)]
async fn test_priority_orders_dispatch_not_results() {
    let client = Arc::new(ScriptedClient::new());
    let executor = BatchExecutor::new(JobPipeline::generation(as_client(&client)).build());

    let jobs = vec![
        JobSpec::new(0, Payload::new("low")),
        JobSpec::new(1, Payload::new("high")).with_priority(5),
        JobSpec::new(2, Payload::new("mid")).with_priority(1),
        JobSpec::new(3, Payload::new("low too")),
    ];
    let results = executor.submit_batch(jobs, 1).await;

    assert_eq!(client.prompts(), vec!["high", "mid", "low", "low too"]);
    assert_eq!(indices(&results), vec![0, 1, 2, 3]);
}

#[tokio::test(start_paused = true)]
async fn test_repeated_job_is_served_from_cache() {
    let client = Arc::new(ScriptedClient::new());
    let cache: Arc<dyn Cache> = Arc::new(MemoryCache::new(&CacheConfig::new()));
    let pipeline = JobPipeline::generation(as_client(&client))
        .with_cache(Arc::clone(&cache), None)
        .build();
    let executor = BatchExecutor::new(pipeline);

    let first = executor.run_batch(prompts(2)).await;
    let second = executor.run_batch(prompts(2)).await;

    assert_eq!(client.call_count(), 2);
    assert!(first.iter().all(|r| r.success && !r.cache_hit));
    assert!(second.iter().all(|r| r.success && r.cache_hit));
    assert_eq!(
        second[0].history,
        vec![JobState::Pending, JobState::CacheHit, JobState::Done]
    );
    assert_eq!(
        second[1].artifact.as_ref().unwrap().task_id,
        first[1].artifact.as_ref().unwrap().task_id
    );
    assert_eq!(cache.get_stats().hits, 2);
}

#[tokio::test(start_paused = true)]
async fn test_rate_limit_timeout_is_not_retried() {
    let client = Arc::new(ScriptedClient::new());
    let limiter: Arc<dyn Limiter> = Arc::new(TokenBucket::new(1.0, 1.0));
    let pipeline = JobPipeline::generation(as_client(&client))
        .with_limiter(limiter, Duration::from_millis(100))
        .build();

    let results = BatchExecutor::new(pipeline)
        .with_retry(fast_retry())
        .submit_batch(prompts(2), 2)
        .await;

    let summary = BatchSummary::from_results(&results);
    assert_eq!(summary.succeeded, 1);
    assert_eq!(summary.failures_by_kind[&JobErrorKind::RateLimitTimeout], 1);
    let timed_out = results.iter().find(|r| !r.success).unwrap();
    assert_eq!(timed_out.attempts, 1);
    assert_eq!(client.call_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_registry_limiter_resolved_by_name() {
    let mut configs = BTreeMap::new();
    configs.insert("images".to_string(), LimiterConfig::new(5.0));
    let registry = Arc::new(LimiterRegistry::from_config(&configs).unwrap());
    let client = Arc::new(ScriptedClient::new());

    let known = JobPipeline::generation(as_client(&client))
        .with_registry_limiter(Arc::clone(&registry), "images", Duration::from_secs(1))
        .build();
    let unknown = JobPipeline::generation(as_client(&client))
        .with_registry_limiter(Arc::clone(&registry), "video", Duration::from_secs(1))
        .build();

    let ok = BatchExecutor::new(known).run_batch(prompts(3)).await;
    assert!(ok.iter().all(|r| r.success));
    assert!(registry.get("images").unwrap().available() < 3.0);

    let missing = BatchExecutor::new(unknown).submit(JobSpec::new(0, Payload::new("x"))).await;
    assert_eq!(missing.error_kind(), Some(JobErrorKind::PermanentFailure));
    assert_eq!(client.call_count(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_lifecycle_events() {
    let client = Arc::new(ScriptedClient::new().with_script([Err(JobError::transient("503"))]));
    let sink = Arc::new(RecordingEventSink::new());
    let executor = BatchExecutor::new(JobPipeline::generation(as_client(&client)).build())
        .with_retry(fast_retry())
        .with_event_sink(sink.clone());

    executor.submit_batch(prompts(2), 1).await;

    let types = sink.event_types();
    assert_eq!(types.first().map(String::as_str), Some(event_types::BATCH_STARTED));
    assert_eq!(types.last().map(String::as_str), Some(event_types::BATCH_COMPLETED));
    assert_eq!(sink.count(event_types::JOB_STARTED), 2);
    assert_eq!(sink.count(event_types::JOB_DISPATCHED), 3);
    assert_eq!(sink.count(event_types::JOB_RETRYING), 1);
    assert_eq!(sink.count(event_types::JOB_COMPLETED), 2);
    assert_eq!(sink.count(event_types::JOB_FAILED), 0);

    let (_, data) = &sink.events_of_type(event_types::BATCH_COMPLETED)[0];
    assert_eq!(data.as_ref().unwrap()["succeeded"], 2);
}
