// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! A simulated multi-partition source stage used to test the DISTINCT and GROUP BY stages.
//!
//! The backend here is VERY simple and depends on a few assumptions:
//! * Partitions are served one at a time, ordered by partition id (in the real engine, physical
//!   partitions are ordered by the minimum partition key value they cover).
//! * Each drain returns at most one page from the current partition.
//! * Continuations are an index into the flattened partition list, so any page boundary is a
//!   resumable position.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use docstore_query_engine::query::{
    BoxedPipelineStage, CursorState, PageMetrics, PageResult, QueryPipelineStage,
    SourceStageFactory, StagePage,
};
use docstore_query_engine::ErrorKind;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

/// Represents a container in the simulated backend: a set of partitions, each holding the
/// single-partition results the real backend would return for the (already rewritten) query.
#[derive(Clone, Default)]
pub struct Container {
    partitions: BTreeMap<String, Vec<serde_json::Value>>,
}

impl Container {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(
        &mut self,
        partition_id: impl Into<String>,
        items: impl IntoIterator<Item = serde_json::Value>,
    ) {
        self.partitions
            .entry(partition_id.into())
            .or_default()
            .extend(items);
    }
}

/// Knobs for the simulated source, shared with the test so behavior can be changed mid-query.
#[derive(Clone)]
pub struct SourceConfig {
    /// The maximum number of items served from a partition per drain.
    pub page_size: usize,

    /// When `false`, `try_get_cursor` reports that no continuation is available, simulating a
    /// source that cannot currently be snapshotted.
    pub cursor_available: bool,

    /// When set, the next drain fails with a transient failure page (and clears the flag, so a
    /// retry succeeds).
    pub fail_next: Arc<AtomicBool>,
}

impl SourceConfig {
    pub fn new(page_size: usize) -> Self {
        Self {
            page_size,
            cursor_available: true,
            fail_next: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn without_cursor(mut self) -> Self {
        self.cursor_available = false;
        self
    }

    pub fn fail_next_drain(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }
}

/// Builds the `SourceStageFactory` the stage factories expect, backed by `container`.
pub fn source_factory(container: Arc<Container>, config: SourceConfig) -> SourceStageFactory {
    Box::new(move |continuation| {
        Box::pin(async move {
            let source = PartitionedSource::resume(&container, config, continuation.as_deref())?;
            Ok(Box::new(source) as BoxedPipelineStage)
        })
    })
}

/// The position of a [`PartitionedSource`], serialized as its continuation token.
#[derive(Debug, Serialize, Deserialize)]
struct SourcePosition {
    partition: usize,
    offset: usize,
}

pub struct PartitionedSource {
    partitions: Vec<(String, Vec<serde_json::Value>)>,
    partition_index: usize,
    offset: usize,
    config: SourceConfig,
}

impl PartitionedSource {
    fn resume(
        container: &Container,
        config: SourceConfig,
        continuation: Option<&str>,
    ) -> Result<Self, docstore_query_engine::Error> {
        let (partition_index, offset) = match continuation {
            None => (0, 0),
            Some(token) => {
                let position: SourcePosition = serde_json::from_str(token).map_err(|e| {
                    ErrorKind::BadRequest
                        .with_message(format!("malformed source continuation '{token}': {e}"))
                })?;
                (position.partition, position.offset)
            }
        };

        let mut source = Self {
            partitions: container
                .partitions
                .iter()
                .map(|(id, items)| (id.clone(), items.clone()))
                .collect(),
            partition_index,
            offset,
            config,
        };
        source.normalize();
        Ok(source)
    }

    /// Skips exhausted partitions so `is_done` is accurate immediately after the last item is
    /// served rather than on the next drain.
    fn normalize(&mut self) {
        while self.partition_index < self.partitions.len()
            && self.offset >= self.partitions[self.partition_index].1.len()
        {
            self.partition_index += 1;
            self.offset = 0;
        }
    }

    fn position(&self) -> String {
        serde_json::to_string(&SourcePosition {
            partition: self.partition_index,
            offset: self.offset,
        })
        .unwrap()
    }

    fn failure_page(message: &str) -> StagePage {
        StagePage {
            result: PageResult::Failure {
                message: message.to_string(),
                status_code: Some(503),
            },
            cursor: None,
            disallow_cursor_reason: None,
            metrics: PageMetrics {
                activity_id: Some(uuid::Uuid::new_v4().to_string()),
                ..PageMetrics::default()
            },
        }
    }
}

#[async_trait]
impl QueryPipelineStage for PartitionedSource {
    async fn drain(
        &mut self,
        max_elements: usize,
        cancel: &CancellationToken,
    ) -> Result<StagePage, docstore_query_engine::Error> {
        if cancel.is_cancelled() {
            return Ok(Self::failure_page("query was cancelled"));
        }
        if self.config.fail_next.swap(false, Ordering::SeqCst) {
            return Ok(Self::failure_page("simulated transient failure"));
        }

        let elements: Vec<serde_json::Value> = match self.partitions.get(self.partition_index) {
            None => Vec::new(),
            Some((_, items)) => {
                let count = max_elements.min(self.config.page_size);
                items.iter().skip(self.offset).take(count).cloned().collect()
            }
        };

        let response_bytes: u64 = elements.iter().map(|e| e.to_string().len() as u64).sum();
        self.offset += elements.len();
        self.normalize();

        Ok(StagePage {
            result: PageResult::Success { elements },
            cursor: if self.is_done() {
                None
            } else {
                Some(self.position())
            },
            disallow_cursor_reason: None,
            metrics: PageMetrics {
                activity_id: Some(uuid::Uuid::new_v4().to_string()),
                request_charge: 2.5,
                diagnostics: None,
                response_bytes,
            },
        })
    }

    fn try_get_cursor(&self) -> Result<CursorState, docstore_query_engine::Error> {
        if !self.config.cursor_available {
            return Ok(CursorState::Unavailable);
        }
        if self.is_done() {
            return Ok(CursorState::Done);
        }
        Ok(CursorState::Available(self.position()))
    }

    fn is_done(&self) -> bool {
        self.partition_index >= self.partitions.len()
    }
}

/// Drains `stage` to completion, returning the elements seen and every page produced.
pub async fn run_to_completion(
    stage: &mut BoxedPipelineStage,
    max_elements: usize,
) -> (Vec<serde_json::Value>, Vec<StagePage>) {
    let cancel = CancellationToken::new();
    let mut elements = Vec::new();
    let mut pages = Vec::new();
    let mut turns = 0;
    while !stage.is_done() {
        turns += 1;
        assert!(turns < 64, "stage did not terminate after {turns} drains");
        let page = stage.drain(max_elements, &cancel).await.expect("drain failed");
        if let PageResult::Success {
            elements: page_elements,
        } = &page.result
        {
            elements.extend(page_elements.iter().cloned());
        } else {
            panic!("unexpected failure page: {page:?}");
        }
        pages.push(page);
    }
    (elements, pages)
}
