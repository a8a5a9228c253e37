// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::distinct_map::{DistinctMap, DistinctType};
use super::stage::{
    BoxedPipelineStage, CursorState, PageResult, QueryPipelineStage, SourceStageFactory,
    StagePage, DISALLOW_CURSOR_USE_TRY_GET,
};
use super::ExecutionEnvironment;
use crate::ErrorKind;

/// The resumable position of a DISTINCT query: where the source was, and what the distinct map
/// had seen at that point.
///
/// Round-trippable through its string form, which is what travels to and from the client.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DistinctContinuationToken {
    pub source_token: Option<String>,
    pub distinct_map_token: Option<String>,
}

impl DistinctContinuationToken {
    pub fn parse(s: &str) -> crate::Result<Self> {
        serde_json::from_str(s).map_err(|e| {
            ErrorKind::BadRequest
                .with_message(format!("malformed DISTINCT continuation token '{s}': {e}"))
        })
    }

    pub fn encode(&self) -> String {
        serde_json::to_string(self).expect("continuation tokens always serialize")
    }
}

/// The pipeline stage that suppresses duplicate documents across all pages of all partitions.
///
/// Every drained source element is offered to the distinct map; only first sightings pass
/// through, in source order. The stage is done exactly when its source is done; an empty page is
/// not a termination signal, it just means everything the source returned this turn was a
/// duplicate.
///
/// The Client and Compute execution environments share this one implementation and differ only in
/// cursor-emission policy, selected by the [`ExecutionEnvironment`] value: Client inlines a
/// combined continuation on each page when the source supplied one, Compute withholds it and
/// requires an explicit [`try_get_cursor`](QueryPipelineStage::try_get_cursor) call.
pub struct DistinctStage {
    environment: ExecutionEnvironment,
    source: BoxedPipelineStage,
    map: DistinctMap,
}

impl DistinctStage {
    /// Creates a DISTINCT stage, resuming from `request_continuation` if one is given.
    ///
    /// The source stage is built through `source_factory`, which receives the source's own
    /// continuation extracted from the inbound token (or `None` for a fresh query).
    #[tracing::instrument(level = "debug", skip(source_factory), err)]
    pub async fn create(
        environment: ExecutionEnvironment,
        distinct_type: DistinctType,
        request_continuation: Option<&str>,
        source_factory: SourceStageFactory,
    ) -> crate::Result<BoxedPipelineStage> {
        let token = match request_continuation {
            Some(s) => DistinctContinuationToken::parse(s)?,
            None => DistinctContinuationToken::default(),
        };
        let map = DistinctMap::from_cursor(distinct_type, token.distinct_map_token.as_deref())?;
        let source = source_factory(token.source_token).await?;
        Ok(Box::new(Self {
            environment,
            source,
            map,
        }))
    }
}

#[async_trait]
impl QueryPipelineStage for DistinctStage {
    async fn drain(
        &mut self,
        max_elements: usize,
        cancel: &CancellationToken,
    ) -> crate::Result<StagePage> {
        let page = self.source.drain(max_elements, cancel).await?;
        match page.result {
            // Failure pages pass through untouched. The distinct map was not consulted, so the
            // caller can retry from the continuation it already holds.
            PageResult::Failure { .. } => Ok(page),
            PageResult::Success { elements } => {
                let mut admitted = Vec::with_capacity(elements.len());
                for element in elements {
                    let (keep, fingerprint) = self.map.add(&element);
                    if keep {
                        admitted.push(element);
                    } else {
                        tracing::trace!(fingerprint, "suppressed duplicate document");
                    }
                }

                let (cursor, disallow_cursor_reason) = match self.environment {
                    ExecutionEnvironment::Client => match page.cursor {
                        Some(source_token) if !self.source.is_done() => {
                            let token = DistinctContinuationToken {
                                source_token: Some(source_token),
                                distinct_map_token: Some(self.map.cursor()),
                            };
                            (Some(token.encode()), None)
                        }
                        _ => (None, None),
                    },
                    ExecutionEnvironment::Compute => (None, Some(DISALLOW_CURSOR_USE_TRY_GET)),
                };

                Ok(StagePage {
                    result: PageResult::Success { elements: admitted },
                    cursor,
                    disallow_cursor_reason,
                    metrics: page.metrics,
                })
            }
        }
    }

    fn try_get_cursor(&self) -> crate::Result<CursorState> {
        if self.is_done() {
            return Ok(CursorState::Done);
        }
        match self.source.try_get_cursor()? {
            CursorState::Done => Ok(CursorState::Done),
            CursorState::Unavailable => Ok(CursorState::Unavailable),
            CursorState::Available(source_token) => {
                let token = DistinctContinuationToken {
                    source_token: Some(source_token),
                    distinct_map_token: Some(self.map.cursor()),
                };
                Ok(CursorState::Available(token.encode()))
            }
        }
    }

    fn is_done(&self) -> bool {
        self.source.is_done()
    }
}
