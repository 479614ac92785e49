//! Bounded parallel execution of per-item LLM calls.
//!
//! [`map_with_limit`] runs one task per input with at most `workers` in
//! flight, a per-task deadline, and partial-failure tolerance: a failed or
//! timed-out task yields `T::default()` at its index and never aborts the
//! batch. Results are positionally aligned with inputs regardless of
//! completion order, and token usage from successful tasks is summed into
//! the outcome.

use crate::error::Result;
use crate::provider::TokenUsage;
use crate::PipelineError;
use futures::stream::{self, StreamExt};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Options for one pooled batch.
#[derive(Debug, Clone)]
pub struct PoolOptions {
    /// Upper bound on concurrent in-flight tasks.
    pub workers: usize,
    /// Per-task deadline.
    pub timeout: Duration,
    /// Optional cooperative cancellation; checked before each task starts.
    pub cancel: Option<Arc<AtomicBool>>,
}

impl PoolOptions {
    pub fn new(workers: usize, timeout: Duration) -> Self {
        Self {
            workers: workers.max(1),
            timeout,
            cancel: None,
        }
    }

    pub fn with_cancellation(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = Some(cancel);
        self
    }
}

/// The aggregate result of one pooled batch.
#[derive(Debug)]
pub struct PoolOutcome<T> {
    /// One entry per input, in input order. Failed slots hold
    /// `T::default()`.
    pub results: Vec<T>,
    /// Token usage summed across successful tasks.
    pub usage: TokenUsage,
    /// How many tasks failed or timed out.
    pub failed: usize,
}

/// Run `f` over every input with bounded concurrency.
///
/// `f` receives `(index, input)` and returns `(value, usage)`. The progress
/// callback fires with a completed-count delta after every finished task.
///
/// Per-task failures are swallowed: a parse error, provider error, or
/// timeout logs a warning and records the default value for that index.
/// [`PipelineError::Cancelled`] is the exception — it aborts the batch.
pub async fn map_with_limit<In, T, F, Fut>(
    inputs: Vec<In>,
    f: F,
    opts: &PoolOptions,
    mut on_progress: impl FnMut(usize),
) -> Result<PoolOutcome<T>>
where
    T: Default,
    F: Fn(usize, In) -> Fut,
    Fut: Future<Output = Result<(T, TokenUsage)>>,
{
    let total = inputs.len();
    let mut results: Vec<T> = Vec::with_capacity(total);
    results.resize_with(total, T::default);

    let mut usage = TokenUsage::default();
    let mut failed = 0usize;

    let cancel = opts.cancel.clone();
    let timeout = opts.timeout;
    let f = &f;

    let mut completions = stream::iter(inputs.into_iter().enumerate().map(|(index, input)| {
        let cancel = cancel.clone();
        async move {
            if let Some(flag) = &cancel {
                if flag.load(Ordering::Relaxed) {
                    return (index, Err(PipelineError::Cancelled));
                }
            }
            match tokio::time::timeout(timeout, f(index, input)).await {
                Ok(result) => (index, result),
                Err(_) => (
                    index,
                    Err(PipelineError::Other(format!(
                        "task {index} timed out after {timeout:?}"
                    ))),
                ),
            }
        }
    }))
    .buffer_unordered(opts.workers);

    while let Some((index, result)) = completions.next().await {
        match result {
            Ok((value, task_usage)) => {
                results[index] = value;
                usage.add(&task_usage);
            }
            Err(PipelineError::Cancelled) => return Err(PipelineError::Cancelled),
            Err(e) => {
                tracing::warn!(index, error = %e, "task failed, recording empty result");
                failed += 1;
            }
        }
        on_progress(1);
    }

    Ok(PoolOutcome {
        results,
        usage,
        failed,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn opts(workers: usize) -> PoolOptions {
        PoolOptions::new(workers, Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_results_in_input_order() {
        let inputs = vec![30u64, 10, 20];
        let outcome = map_with_limit(
            inputs,
            |i, delay| async move {
                tokio::time::sleep(Duration::from_millis(delay)).await;
                Ok((format!("item-{i}"), TokenUsage::new(1, 1, 2)))
            },
            &opts(3),
            |_| {},
        )
        .await
        .unwrap();

        assert_eq!(outcome.results, vec!["item-0", "item-1", "item-2"]);
        assert_eq!(outcome.usage, TokenUsage::new(3, 3, 6));
        assert_eq!(outcome.failed, 0);
    }

    #[tokio::test]
    async fn test_partial_failure_keeps_alignment() {
        let inputs = vec!["a", "fail", "c"];
        let outcome = map_with_limit(
            inputs,
            |_, input| async move {
                if input == "fail" {
                    Err(PipelineError::Parse("bad json".into()))
                } else {
                    Ok((vec![input.to_string()], TokenUsage::new(1, 0, 1)))
                }
            },
            &opts(2),
            |_| {},
        )
        .await
        .unwrap();

        assert_eq!(outcome.results[0], vec!["a".to_string()]);
        assert!(outcome.results[1].is_empty());
        assert_eq!(outcome.results[2], vec!["c".to_string()]);
        assert_eq!(outcome.failed, 1);
        assert_eq!(outcome.usage, TokenUsage::new(2, 0, 2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_yields_default() {
        let inputs = vec![1u8, 2];
        let outcome = map_with_limit(
            inputs,
            |i, _| async move {
                if i == 0 {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                }
                Ok((i as u32 + 1, TokenUsage::default()))
            },
            &PoolOptions::new(2, Duration::from_secs(1)),
            |_| {},
        )
        .await
        .unwrap();

        assert_eq!(outcome.results, vec![0, 2]);
        assert_eq!(outcome.failed, 1);
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let inputs: Vec<usize> = (0..16).collect();
        let outcome = map_with_limit(
            inputs,
            |_, _| {
                let in_flight = in_flight.clone();
                let peak = peak.clone();
                async move {
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    Ok(((), TokenUsage::default()))
                }
            },
            &opts(4),
            |_| {},
        )
        .await
        .unwrap();

        assert_eq!(outcome.results.len(), 16);
        assert!(peak.load(Ordering::SeqCst) <= 4, "pool exceeded its bound");
    }

    #[tokio::test]
    async fn test_progress_counts_every_task() {
        let mut seen = 0usize;
        map_with_limit(
            vec![(); 5],
            |_, _| async { Ok((1u8, TokenUsage::default())) },
            &opts(2),
            |delta| seen += delta,
        )
        .await
        .unwrap();
        assert_eq!(seen, 5);
    }

    #[tokio::test]
    async fn test_cancellation_aborts_batch() {
        let cancel = Arc::new(AtomicBool::new(true));
        let result: Result<PoolOutcome<u8>> = map_with_limit(
            vec![(); 3],
            |_, _| async { Ok((1u8, TokenUsage::default())) },
            &opts(2).with_cancellation(cancel),
            |_| {},
        )
        .await;
        assert!(matches!(result.unwrap_err(), PipelineError::Cancelled));
    }
}
