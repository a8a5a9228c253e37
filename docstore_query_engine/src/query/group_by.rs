// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::aggregators::AggregateKind;
use super::grouping_table::GroupingTable;
use super::query_result::RewrittenGroupByProjection;
use super::stage::{
    BoxedPipelineStage, CursorState, PageMetrics, PageResult, QueryPipelineStage,
    SourceStageFactory, StagePage, DISALLOW_CURSOR_USE_TRY_GET,
};
use super::ExecutionEnvironment;
use crate::ErrorKind;

/// The reason Client-environment pages carry once groupings are being emitted: the Client
/// variant does not support resuming a partially emitted GROUP BY result set.
pub const DISALLOW_CURSOR_MID_EMIT: &str =
    "Continuations are not supported while GROUP BY results are being emitted";

/// The resumable position of a GROUP BY query.
///
/// During the fill phase both halves are present. Once the source is exhausted only the grouping
/// table half remains; a null `sourceToken` on resume means the source was already exhausted when
/// the token was taken, so no source stage is rebuilt.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupByContinuationToken {
    pub source_token: Option<String>,
    pub grouping_table_token: Option<String>,
}

impl GroupByContinuationToken {
    pub fn parse(s: &str) -> crate::Result<Self> {
        serde_json::from_str(s).map_err(|e| {
            ErrorKind::BadRequest
                .with_message(format!("malformed GROUP BY continuation token '{s}': {e}"))
        })
    }

    pub fn encode(&self) -> String {
        serde_json::to_string(self).expect("continuation tokens always serialize")
    }
}

/// The pipeline stage that accumulates aggregate state per grouping key across all pages of all
/// partitions, then emits completed groupings on demand.
///
/// The stage runs in two phases. While the source still has data (the *fill* phase), every drain
/// forwards the source's rewritten elements into the grouping table and returns a success page
/// with zero elements: a grouping cannot be final until every input has been seen. Once the
/// source is exhausted (the *emit* phase), drains return pages of completed groupings out of the
/// table until it empties.
pub struct GroupByStage {
    environment: ExecutionEnvironment,
    /// `None` when the inbound continuation recorded the source as already exhausted.
    source: Option<BoxedPipelineStage>,
    grouping_table: GroupingTable,
    /// Carried into emit-phase pages, which otherwise have no source metrics to propagate.
    last_activity_id: Option<String>,
}

impl GroupByStage {
    /// Creates a GROUP BY stage, resuming from `request_continuation` if one is given.
    ///
    /// `alias_to_aggregate` maps each output alias to its aggregate function, or `None` for the
    /// scalar grouping-key columns; `ordered_aliases` fixes the output column order;
    /// `has_select_value` selects the single-value projection mode (which admits at most one
    /// alias).
    #[tracing::instrument(level = "debug", skip_all, err)]
    pub async fn create(
        environment: ExecutionEnvironment,
        alias_to_aggregate: HashMap<String, Option<AggregateKind>>,
        ordered_aliases: Vec<String>,
        has_select_value: bool,
        request_continuation: Option<&str>,
        source_factory: SourceStageFactory,
    ) -> crate::Result<BoxedPipelineStage> {
        let (grouping_table, source) = match request_continuation {
            None => {
                let table = GroupingTable::new(ordered_aliases, alias_to_aggregate, has_select_value)?;
                let source = source_factory(None).await?;
                (table, Some(source))
            }
            Some(s) => {
                let token = GroupByContinuationToken::parse(s)?;
                let table = match token.grouping_table_token.as_deref() {
                    Some(cursor) => GroupingTable::from_cursor(
                        ordered_aliases,
                        alias_to_aggregate,
                        has_select_value,
                        cursor,
                    )?,
                    None => {
                        GroupingTable::new(ordered_aliases, alias_to_aggregate, has_select_value)?
                    }
                };
                let source = match token.source_token {
                    Some(source_token) => Some(source_factory(Some(source_token)).await?),
                    // The token was taken mid-emit: everything left to produce is in the table.
                    None => None,
                };
                (table, source)
            }
        };

        Ok(Box::new(Self {
            environment,
            source,
            grouping_table,
            last_activity_id: None,
        }))
    }

    fn source_is_done(&self) -> bool {
        self.source.as_ref().map_or(true, |s| s.is_done())
    }
}

#[async_trait]
impl QueryPipelineStage for GroupByStage {
    async fn drain(
        &mut self,
        max_elements: usize,
        cancel: &CancellationToken,
    ) -> crate::Result<StagePage> {
        if let Some(source) = self.source.as_mut().filter(|s| !s.is_done()) {
            // Fill phase: everything the source produces goes into the grouping table.
            let page = source.drain(max_elements, cancel).await?;
            let source_done = source.is_done();
            match page.result {
                // Failure pages pass through untouched; the grouping table was not updated, so
                // the caller can retry from the continuation it already holds.
                PageResult::Failure { .. } => Ok(page),
                PageResult::Success { elements } => {
                    for element in &elements {
                        let projection = RewrittenGroupByProjection::from_element(element)?;
                        self.grouping_table.add_payload(&projection)?;
                    }
                    tracing::debug!(
                        ingested = elements.len(),
                        groups = self.grouping_table.len(),
                        "accumulated source page into grouping table"
                    );
                    self.last_activity_id = page.metrics.activity_id.clone();

                    let (cursor, disallow_cursor_reason) = match self.environment {
                        ExecutionEnvironment::Client => match page.cursor {
                            Some(source_token) if !source_done => {
                                let token = GroupByContinuationToken {
                                    source_token: Some(source_token),
                                    grouping_table_token: Some(self.grouping_table.cursor()),
                                };
                                (Some(token.encode()), None)
                            }
                            _ => (None, None),
                        },
                        ExecutionEnvironment::Compute => (None, Some(DISALLOW_CURSOR_USE_TRY_GET)),
                    };

                    // Groupings are held back until every input has been seen.
                    Ok(StagePage {
                        result: PageResult::Success {
                            elements: Vec::new(),
                        },
                        cursor,
                        disallow_cursor_reason,
                        metrics: page.metrics,
                    })
                }
            }
        } else {
            // Emit phase: the source is exhausted, drain completed groupings from the table.
            let elements = self.grouping_table.drain(max_elements)?;
            tracing::debug!(
                emitted = elements.len(),
                remaining = self.grouping_table.len(),
                "emitted grouped results"
            );
            let disallow_cursor_reason = match self.environment {
                ExecutionEnvironment::Client => Some(DISALLOW_CURSOR_MID_EMIT),
                ExecutionEnvironment::Compute => Some(DISALLOW_CURSOR_USE_TRY_GET),
            };
            Ok(StagePage {
                result: PageResult::Success { elements },
                cursor: None,
                disallow_cursor_reason,
                metrics: PageMetrics {
                    activity_id: self.last_activity_id.clone(),
                    ..PageMetrics::default()
                },
            })
        }
    }

    fn try_get_cursor(&self) -> crate::Result<CursorState> {
        if self.is_done() {
            return Ok(CursorState::Done);
        }
        match self.source.as_ref().filter(|s| !s.is_done()) {
            Some(source) => match source.try_get_cursor()? {
                CursorState::Available(source_token) => {
                    let token = GroupByContinuationToken {
                        source_token: Some(source_token),
                        grouping_table_token: Some(self.grouping_table.cursor()),
                    };
                    Ok(CursorState::Available(token.encode()))
                }
                _ => Ok(CursorState::Unavailable),
            },
            None => match self.environment {
                // Mid-emit, the remaining groups are the entire resumable state.
                ExecutionEnvironment::Compute => {
                    let token = GroupByContinuationToken {
                        source_token: None,
                        grouping_table_token: Some(self.grouping_table.cursor()),
                    };
                    Ok(CursorState::Available(token.encode()))
                }
                ExecutionEnvironment::Client => Ok(CursorState::Unavailable),
            },
        }
    }

    fn is_done(&self) -> bool {
        self.source_is_done() && self.grouping_table.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn continuation_token_round_trips() {
        let token = GroupByContinuationToken {
            source_token: None,
            grouping_table_token: Some("{}".to_string()),
        };
        let parsed = GroupByContinuationToken::parse(&token.encode()).unwrap();
        assert_eq!(parsed, token);
    }

    #[test]
    fn continuation_token_uses_wire_casing() {
        let encoded = GroupByContinuationToken {
            source_token: Some("s".to_string()),
            grouping_table_token: Some("g".to_string()),
        }
        .encode();
        assert_eq!(
            encoded,
            r#"{"sourceToken":"s","groupingTableToken":"g"}"#
        );
    }

    #[test]
    fn malformed_continuation_token_is_rejected_with_the_token() {
        let err = GroupByContinuationToken::parse("]]").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BadRequest);
        assert!(err.to_string().contains("]]"));
    }
}
