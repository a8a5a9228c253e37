// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;

/// The fixed reason attached to pages produced by Compute-environment stages, which never inline a
/// continuation and instead expect the caller to invoke
/// [`QueryPipelineStage::try_get_cursor`] when it wants to serialize its position.
pub const DISALLOW_CURSOR_USE_TRY_GET: &str = "Use try_get_cursor";

/// Represents a stage in the query execution pipeline.
///
/// Stages are the building blocks of the cross-partition pipeline. Each stage wraps a `source`
/// stage (ultimately backed by the per-partition fetchers) and transforms the pages it drains from
/// it: suppressing duplicates, accumulating groupings, and so on.
///
/// The contract is deliberately small:
///
/// * [`drain`](QueryPipelineStage::drain) pulls the next page of up to `max_elements` elements.
///   A page with fewer elements (including zero) does NOT mean the stage is done, only that the
///   stage could not produce more without another turn.
/// * [`try_get_cursor`](QueryPipelineStage::try_get_cursor) reports the stage's resumable
///   position, if one exists right now.
/// * [`is_done`](QueryPipelineStage::is_done) is monotonic: once it returns `true` it never
///   returns `false` again.
///
/// The pipeline is single-threaded and cooperative. A caller must await one `drain` before
/// issuing the next on the same stage; stages carry no internal locking.
#[async_trait]
pub trait QueryPipelineStage: Send {
    /// Drains the next page of up to `max_elements` elements from this stage.
    ///
    /// The cancellation token is forwarded to the source, which is where I/O happens. A source
    /// call that is cancelled surfaces as a failure page, never as a partially-applied success:
    /// stages only update their internal state on success pages, so the caller can retry a failed
    /// drain from the same continuation.
    async fn drain(
        &mut self,
        max_elements: usize,
        cancel: &CancellationToken,
    ) -> crate::Result<StagePage>;

    /// Reports the stage's current resumable position.
    fn try_get_cursor(&self) -> crate::Result<CursorState>;

    /// Indicates if the stage has produced everything it will ever produce.
    fn is_done(&self) -> bool;

    /// Retrieves the name of this stage, which defaults to it's type name.
    fn name(&self) -> &'static str {
        std::any::type_name_of_val(self)
    }
}

/// A heap-allocated, dynamically-typed [`QueryPipelineStage`].
pub type BoxedPipelineStage = Box<dyn QueryPipelineStage>;

/// A callback that builds the source stage a DISTINCT or GROUP BY stage sits on top of.
///
/// The upstream pipeline builder supplies this; the stage factory invokes it exactly once, passing
/// the source continuation token extracted from the inbound request continuation (or `None` for a
/// fresh query).
pub type SourceStageFactory =
    Box<dyn FnOnce(Option<String>) -> BoxFuture<'static, crate::Result<BoxedPipelineStage>> + Send>;

/// The result of asking a stage for its resumable position.
///
/// This is the tagged rendering of the `(ok, cursor)` pair exposed to the surrounding engine:
/// `Done` is `(true, null)`, `Available` is `(true, cursor)`, and `Unavailable` is `(false, _)`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CursorState {
    /// The stage has completed; there is nothing left to resume.
    Done,

    /// A continuation that, passed back to the stage factory, resumes the query at the stage's
    /// current position.
    Available(String),

    /// The underlying source cannot supply a continuation right now.
    Unavailable,
}

/// A page of results drained from a pipeline stage.
#[derive(Clone, Debug, PartialEq)]
pub struct StagePage {
    /// The outcome of the drain.
    ///
    /// Failure pages flow through this channel, not through `Err`: they are propagated verbatim
    /// from the source so the caller can retry the same continuation once the transient condition
    /// clears.
    pub result: PageResult,

    /// An inline continuation for this page, when the stage's cursor-emission policy allows one.
    pub cursor: Option<String>,

    /// When a stage refuses to inline a continuation, the reason why.
    pub disallow_cursor_reason: Option<&'static str>,

    /// Accounting metadata copied through from the source page.
    pub metrics: PageMetrics,
}

impl StagePage {
    /// Creates a plain success page with no inline continuation.
    pub fn success(elements: Vec<serde_json::Value>, metrics: PageMetrics) -> Self {
        Self {
            result: PageResult::Success { elements },
            cursor: None,
            disallow_cursor_reason: None,
            metrics,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.result, PageResult::Success { .. })
    }
}

/// The outcome of draining a page.
#[derive(Clone, Debug, PartialEq)]
pub enum PageResult {
    /// The drain produced elements (possibly zero of them).
    Success { elements: Vec<serde_json::Value> },

    /// The source failed transiently. The page is surfaced to the caller unchanged; no stage
    /// state was mutated, so resuming from the pre-drain continuation is safe.
    Failure {
        message: String,
        status_code: Option<u16>,
    },
}

/// Accounting metadata attached to every page.
///
/// DISTINCT copies these through from the source page untouched. GROUP BY propagates them during
/// its fill phase and zeroes them (aside from activity id continuity) while emitting groupings.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PageMetrics {
    /// The activity id of the source page this page was derived from.
    pub activity_id: Option<String>,

    /// The request charge accrued producing this page.
    pub request_charge: f64,

    /// Opaque diagnostics from the backing store.
    pub diagnostics: Option<String>,

    /// The size of the source response, in bytes.
    pub response_bytes: u64,
}
