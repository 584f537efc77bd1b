//! Concurrent fan-out over the literature source adapters.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use pipeline::{Paper, SearchRequest, SourceAdapter, SourceError};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Instrument};

/// Merged result of one fan-out.
#[derive(Debug, Default)]
pub struct FetchResult {
    /// Documents in adapter registration order, then adapter result order.
    pub papers: Vec<Paper>,
    pub failures: Vec<SourceError>,
    pub succeeded: usize,
}

impl FetchResult {
    pub fn all_failed(&self) -> bool {
        self.succeeded == 0
    }
}

/// Queries every adapter concurrently, each bounded by `timeout`.
///
/// Returns `None` when `cancel` fires before the join completes. A failing or
/// timed-out adapter contributes no documents and one entry in `failures`.
pub async fn fetch_all(
    adapters: &[Arc<dyn SourceAdapter>],
    request: &SearchRequest,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Option<FetchResult> {
    let calls = adapters.iter().map(|adapter| {
        let span = tracing::info_span!("source", source = %adapter.name());
        async move {
            match tokio::time::timeout(timeout, adapter.search(request)).await {
                Ok(result) => result,
                Err(_) => Err(SourceError::Timeout {
                    source_name: adapter.name().clone(),
                    after: timeout,
                }),
            }
        }
        .instrument(span)
    });

    // join_all yields results in input order regardless of completion order.
    let results = tokio::select! {
        biased;
        _ = cancel.cancelled() => return None,
        results = join_all(calls) => results,
    };

    let mut merged = FetchResult::default();
    for (adapter, result) in adapters.iter().zip(results) {
        match result {
            Ok(mut papers) => {
                info!(source = %adapter.name(), count = papers.len(), "Source returned documents");
                papers.truncate(request.limit.max(1));
                merged.papers.append(&mut papers);
                merged.succeeded += 1;
            }
            Err(e) => {
                warn!(source = %adapter.name(), error = %e, "Source failed");
                merged.failures.push(e);
            }
        }
    }
    Some(merged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use pipeline::SourceName;

    struct Delayed {
        name: SourceName,
        delay: Duration,
        outcome: Result<Vec<&'static str>, ()>,
    }

    #[async_trait]
    impl SourceAdapter for Delayed {
        fn name(&self) -> &SourceName {
            &self.name
        }

        async fn search(&self, _request: &SearchRequest) -> Result<Vec<Paper>, SourceError> {
            tokio::time::sleep(self.delay).await;
            match &self.outcome {
                Ok(titles) => Ok(titles
                    .iter()
                    .map(|t| Paper::new(*t, self.name.clone()))
                    .collect()),
                Err(()) => Err(SourceError::Status {
                    source_name: self.name.clone(),
                    status: 503,
                }),
            }
        }
    }

    fn adapter(name: &'static str, delay_ms: u64, outcome: Result<Vec<&'static str>, ()>) -> Arc<dyn SourceAdapter> {
        Arc::new(Delayed {
            name: SourceName::from_static(name),
            delay: Duration::from_millis(delay_ms),
            outcome,
        })
    }

    fn request() -> SearchRequest {
        SearchRequest {
            limit: 10,
            ..Default::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_merge_order_follows_registration_not_completion() {
        let adapters = vec![
            adapter("slow", 300, Ok(vec!["a1", "a2"])),
            adapter("fast", 10, Ok(vec!["b1"])),
        ];
        let result = fetch_all(&adapters, &request(), Duration::from_secs(5), &CancellationToken::new())
            .await
            .unwrap();
        let titles: Vec<_> = result.papers.iter().map(|p| p.title.as_str()).collect();
        assert_eq!(titles, vec!["a1", "a2", "b1"]);
        assert_eq!(result.succeeded, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_and_slow_sources_contribute_nothing() {
        let adapters = vec![
            adapter("broken", 0, Err(())),
            adapter("stuck", 60_000, Ok(vec!["never"])),
            adapter("ok", 5, Ok(vec!["c1"])),
        ];
        let result = fetch_all(&adapters, &request(), Duration::from_secs(1), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.papers.len(), 1);
        assert_eq!(result.failures.len(), 2);
        assert!(matches!(result.failures[1], SourceError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_cancellation_abandons_the_fan_out() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let adapters = vec![adapter("ok", 5, Ok(vec!["c1"]))];
        assert!(fetch_all(&adapters, &request(), Duration::from_secs(1), &cancel)
            .await
            .is_none());
    }
}
