// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The cross-partition query execution pipeline.
//!
//! A cross-partition query runs separately against every partition of the backing store, and each
//! partition returns its own pages of results with its own continuation. The stages in this
//! module sit on top of a `source` stage (supplied by the upstream pipeline builder) that merges
//! those per-partition streams, and turn them into globally correct results:
//!
//! * [`DistinctStage`] suppresses duplicates across all pages of all partitions.
//! * [`GroupByStage`] accumulates aggregate state per grouping key and emits completed groupings
//!   once every input has been seen.
//!
//! Both stages are fully resumable: their positions serialize into opaque continuation tokens
//! ([`DistinctContinuationToken`], [`GroupByContinuationToken`]) that the factories accept back.

use std::str::FromStr;

use crate::ErrorKind;

mod aggregators;
mod distinct;
mod distinct_map;
mod fingerprint;
mod group_by;
mod grouping_table;
mod query_result;
mod single_group;
mod stage;

pub use aggregators::{AggregateKind, Aggregator};
pub use distinct::{DistinctContinuationToken, DistinctStage};
pub use distinct_map::{DistinctMap, DistinctType};
pub use group_by::{GroupByContinuationToken, GroupByStage, DISALLOW_CURSOR_MID_EMIT};
pub use grouping_table::GroupingTable;
pub use query_result::{QueryClauseItem, RewrittenGroupByProjection};
pub use single_group::SingleGroupAggregator;
pub use stage::{
    BoxedPipelineStage, CursorState, PageMetrics, PageResult, QueryPipelineStage,
    SourceStageFactory, StagePage, DISALLOW_CURSOR_USE_TRY_GET,
};

/// Selects the variant of a pipeline stage for the environment executing the query.
///
/// The two environments share each stage's implementation and differ only in when a continuation
/// may be serialized:
///
/// * `Client` stages may inline a continuation on each page they return.
/// * `Compute` stages never inline a continuation; the caller decides when to serialize by
///   invoking [`QueryPipelineStage::try_get_cursor`] explicitly.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExecutionEnvironment {
    Client,
    Compute,
}

impl FromStr for ExecutionEnvironment {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "Client" => Ok(ExecutionEnvironment::Client),
            "Compute" => Ok(ExecutionEnvironment::Compute),
            _ => Err(ErrorKind::BadRequest
                .with_message(format!("unknown ExecutionEnvironment: {s}"))),
        }
    }
}
