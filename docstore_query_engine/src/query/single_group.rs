// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::aggregators::{AggregateKind, Aggregator};
use super::query_result::QueryClauseItem;
use crate::ErrorKind;

/// The internal alias used for a `SELECT VALUE` projection, which has no alias of its own.
const SELECT_VALUE_ALIAS: &str = "$value";

/// The composite aggregator holding the per-alias state for one grouping key.
///
/// One column per output alias, in projection order; each column is either an aggregate or a
/// scalar passthrough (the grouping-key columns themselves, whose value is identical for every
/// document in the group).
#[derive(Clone, Debug)]
pub struct SingleGroupAggregator {
    columns: Vec<AliasedAggregator>,
    has_select_value: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct AliasedAggregator {
    alias: String,
    aggregator: Aggregator,
}

/// Validates the grouping configuration shared by [`SingleGroupAggregator`] and the grouping
/// table, so both factories reject bad requests before any source data is fetched.
pub(crate) fn validate_grouping_config(
    ordered_aliases: &[String],
    alias_to_aggregate: &HashMap<String, Option<AggregateKind>>,
    has_select_value: bool,
) -> crate::Result<()> {
    if has_select_value && (ordered_aliases.len() > 1 || alias_to_aggregate.len() > 1) {
        return Err(ErrorKind::BadRequest.with_message(format!(
            "a SELECT VALUE projection aggregates exactly one value, but {} aliases were supplied",
            ordered_aliases.len().max(alias_to_aggregate.len())
        )));
    }
    Ok(())
}

impl SingleGroupAggregator {
    /// Creates an empty aggregator set for one grouping key.
    pub fn new(
        ordered_aliases: &[String],
        alias_to_aggregate: &HashMap<String, Option<AggregateKind>>,
        has_select_value: bool,
    ) -> crate::Result<Self> {
        validate_grouping_config(ordered_aliases, alias_to_aggregate, has_select_value)?;

        let columns = if has_select_value {
            // A SELECT VALUE projection has a single column; it may arrive with no alias at all.
            let (alias, kind) = match ordered_aliases.first() {
                Some(alias) => (alias.clone(), aggregate_kind(alias_to_aggregate, alias)),
                None => (
                    SELECT_VALUE_ALIAS.to_string(),
                    alias_to_aggregate.values().next().copied().flatten(),
                ),
            };
            vec![AliasedAggregator {
                alias,
                aggregator: Aggregator::new(kind),
            }]
        } else {
            ordered_aliases
                .iter()
                .map(|alias| AliasedAggregator {
                    alias: alias.clone(),
                    aggregator: Aggregator::new(aggregate_kind(alias_to_aggregate, alias)),
                })
                .collect()
        };

        Ok(Self {
            columns,
            has_select_value,
        })
    }

    /// Folds one rewritten payload into the per-alias aggregators.
    pub fn add_values(&mut self, payload: &serde_json::Value) -> crate::Result<()> {
        if self.has_select_value {
            let column = self
                .columns
                .first_mut()
                .expect("select-value aggregators always have exactly one column");
            let input = match column.aggregator.kind() {
                // The payload IS the single aggregated value.
                Some(_) => aggregate_input(Some(payload))?,
                None => QueryClauseItem::from_value(payload.clone()),
            };
            return column.aggregator.add_value(&input);
        }

        let serde_json::Value::Object(payload) = payload else {
            return Err(ErrorKind::BadRequest.with_message(format!(
                "malformed rewritten GROUP BY projection: payload must be an object, got: {payload}"
            )));
        };

        for column in &mut self.columns {
            let value = payload.get(&column.alias);
            let input = match column.aggregator.kind() {
                Some(_) => aggregate_input(value)?,
                None => QueryClauseItem {
                    item: value.cloned(),
                },
            };
            column.aggregator.add_value(&input)?;
        }
        Ok(())
    }

    /// Stitches the per-alias results into the grouping's output document.
    ///
    /// Aliases whose aggregate came out undefined are omitted, the same way a projection of a
    /// missing property would be. In select-value mode the single result is returned unwrapped;
    /// JSON has no undefined, so an undefined select-value result surfaces as null.
    pub fn result(&self) -> crate::Result<serde_json::Value> {
        if self.has_select_value {
            let column = self
                .columns
                .first()
                .expect("select-value aggregators always have exactly one column");
            return Ok(column.aggregator.result()?.unwrap_or(serde_json::Value::Null));
        }

        let mut output = serde_json::Map::new();
        for column in &self.columns {
            if let Some(value) = column.aggregator.result()? {
                output.insert(column.alias.clone(), value);
            }
        }
        Ok(serde_json::Value::Object(output))
    }

    /// Serializes every column's state, in alias order, for embedding in a continuation token.
    pub fn continuation(&self) -> String {
        serde_json::to_string(&self.columns).expect("aggregator states always serialize")
    }

    /// Rebuilds an aggregator set from a continuation produced by
    /// [`SingleGroupAggregator::continuation`].
    ///
    /// The resumed columns must line up, alias for alias and kind for kind, with the
    /// configuration the stage was created with; anything else means the continuation belongs to
    /// a different query.
    pub fn from_continuation(
        ordered_aliases: &[String],
        alias_to_aggregate: &HashMap<String, Option<AggregateKind>>,
        has_select_value: bool,
        continuation: &str,
    ) -> crate::Result<Self> {
        let template = Self::new(ordered_aliases, alias_to_aggregate, has_select_value)?;

        let columns: Vec<AliasedAggregator> = serde_json::from_str(continuation).map_err(|e| {
            ErrorKind::BadRequest.with_message(format!(
                "malformed grouping continuation '{continuation}': {e}"
            ))
        })?;

        if columns.len() != template.columns.len()
            || columns.iter().zip(&template.columns).any(|(got, want)| {
                got.alias != want.alias || got.aggregator.kind() != want.aggregator.kind()
            })
        {
            return Err(ErrorKind::BadRequest.with_message(format!(
                "grouping continuation '{continuation}' does not match the query's aliases"
            )));
        }

        Ok(Self {
            columns,
            has_select_value,
        })
    }
}

fn aggregate_kind(
    alias_to_aggregate: &HashMap<String, Option<AggregateKind>>,
    alias: &str,
) -> Option<AggregateKind> {
    alias_to_aggregate.get(alias).copied().flatten()
}

/// Unwraps the `{"item": v}` envelope the rewrite puts around aggregate contributions.
///
/// A missing alias, or an envelope without an `item`, is an undefined contribution. Anything
/// that is not an envelope at all means the upstream rewrite is broken.
fn aggregate_input(value: Option<&serde_json::Value>) -> crate::Result<QueryClauseItem> {
    match value {
        None => Ok(QueryClauseItem::undefined()),
        Some(serde_json::Value::Object(envelope)) => Ok(QueryClauseItem {
            item: envelope.get("item").cloned(),
        }),
        Some(other) => Err(ErrorKind::InvalidSourceResponse.with_message(format!(
            "aggregate value must be an object with an 'item' property, got: {other}"
        ))),
    }
}
