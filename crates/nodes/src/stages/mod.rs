//! Downstream stages: analysis, validation, synthesis, report, quality.
//!
//! Each reads prior outputs from the state, calls the compute resource
//! through a [`crate::gateway::StageGateway`], and commits its full output
//! collection in one step. Per-document work runs with bounded concurrency.

pub mod analysis;
pub mod quality;
pub mod report;
pub mod synthesis;
pub mod validation;

use std::future::Future;

use futures::stream::{self, StreamExt};
use futures::FutureExt;

use crate::gateway::InvocationFailure;

pub use analysis::DocumentAnalysisStage;
pub use quality::QualityControlStage;
pub use report::ReportGenerationStage;
pub use synthesis::ContentSynthesisStage;
pub use validation::ConceptValidationStage;

/// Runs `f` over `items` with at most `limit` calls in flight, returning
/// results in input order.
///
/// Each future is boxed so the combined future stays `Send` inside
/// `#[async_trait]` stage bodies.
pub(crate) async fn map_bounded<'a, T, R, F, Fut>(items: &'a [T], limit: usize, f: F) -> Vec<R>
where
    F: Fn(&'a T) -> Fut,
    Fut: Future<Output = R> + Send + 'a,
{
    let futures: Vec<_> = items.iter().map(|item| f(item).boxed()).collect();
    stream::iter(futures)
        .buffered(limit.max(1))
        .collect()
        .await
}

/// `true` if any per-item result was a cancellation.
pub(crate) fn any_cancelled<T>(results: &[Result<T, InvocationFailure>]) -> bool {
    results
        .iter()
        .any(|r| matches!(r, Err(InvocationFailure::Cancelled)))
}

/// First `limit` characters of `text`, with an ellipsis when cut.
pub(crate) fn excerpt(text: &str, limit: usize) -> String {
    let mut chars = text.chars();
    let head: String = chars.by_ref().take(limit).collect();
    if chars.next().is_some() {
        format!("{head}...")
    } else {
        head
    }
}
