// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::collections::{BTreeMap, HashMap};

use super::aggregators::AggregateKind;
use super::fingerprint;
use super::query_result::RewrittenGroupByProjection;
use super::single_group::{validate_grouping_config, SingleGroupAggregator};
use crate::ErrorKind;

/// Maps each grouping-key fingerprint to the aggregator accumulating that group.
///
/// The map is ordered by fingerprint, which makes both drain order and continuation snapshots
/// deterministic for a fixed input sequence without a separate insertion-order sidecar. A key's
/// aggregator is created exactly once and keeps accumulating for the lifetime of the query,
/// including across a continuation resume.
///
/// Draining is destructive: a drained group cannot be re-entered, so draining must only begin
/// once the upstream is exhausted. The GROUP BY stage enforces that; the table just carries the
/// state. The table holds every live group in memory; callers that need to bound cardinality can
/// watch [`GroupingTable::len`] between payloads.
#[derive(Debug)]
pub struct GroupingTable {
    groups: BTreeMap<u128, SingleGroupAggregator>,
    ordered_aliases: Vec<String>,
    alias_to_aggregate: HashMap<String, Option<AggregateKind>>,
    has_select_value: bool,
    done: bool,
}

impl GroupingTable {
    /// Creates an empty table for the given grouping configuration.
    pub fn new(
        ordered_aliases: Vec<String>,
        alias_to_aggregate: HashMap<String, Option<AggregateKind>>,
        has_select_value: bool,
    ) -> crate::Result<Self> {
        validate_grouping_config(&ordered_aliases, &alias_to_aggregate, has_select_value)?;
        Ok(Self {
            groups: BTreeMap::new(),
            ordered_aliases,
            alias_to_aggregate,
            has_select_value,
            done: false,
        })
    }

    /// Rebuilds a table from a continuation previously produced by [`GroupingTable::cursor`].
    pub fn from_cursor(
        ordered_aliases: Vec<String>,
        alias_to_aggregate: HashMap<String, Option<AggregateKind>>,
        has_select_value: bool,
        cursor: &str,
    ) -> crate::Result<Self> {
        let mut table = Self::new(ordered_aliases, alias_to_aggregate, has_select_value)?;

        let entries: serde_json::Map<String, serde_json::Value> = serde_json::from_str(cursor)
            .map_err(|e| {
                ErrorKind::BadRequest
                    .with_message(format!("malformed grouping table continuation '{cursor}': {e}"))
            })?;

        for (key, value) in entries {
            let fingerprint = key.parse::<u128>().map_err(|e| {
                ErrorKind::BadRequest.with_message(format!(
                    "malformed group key '{key}' in grouping table continuation '{cursor}': {e}"
                ))
            })?;
            let serde_json::Value::String(aggregator_continuation) = value else {
                return Err(ErrorKind::BadRequest.with_message(format!(
                    "group '{key}' in grouping table continuation '{cursor}' is not a string"
                )));
            };
            let aggregator = SingleGroupAggregator::from_continuation(
                &table.ordered_aliases,
                &table.alias_to_aggregate,
                table.has_select_value,
                &aggregator_continuation,
            )?;
            table.groups.insert(fingerprint, aggregator);
        }

        tracing::debug!(groups = table.groups.len(), "resumed grouping table");
        Ok(table)
    }

    /// Folds one rewritten source element into the table.
    pub fn add_payload(&mut self, projection: &RewrittenGroupByProjection) -> crate::Result<()> {
        let key = fingerprint::of_group_key(&projection.group_by_items);
        let aggregator = match self.groups.entry(key) {
            std::collections::btree_map::Entry::Occupied(entry) => entry.into_mut(),
            std::collections::btree_map::Entry::Vacant(entry) => {
                tracing::trace!(key, "admitting new group");
                entry.insert(SingleGroupAggregator::new(
                    &self.ordered_aliases,
                    &self.alias_to_aggregate,
                    self.has_select_value,
                )?)
            }
        };
        aggregator.add_values(&projection.payload)
    }

    /// Removes up to `max_item_count` groups, in fingerprint order, and returns their stitched
    /// results. Once the table empties it is done for good.
    pub fn drain(&mut self, max_item_count: usize) -> crate::Result<Vec<serde_json::Value>> {
        let mut results = Vec::new();
        while results.len() < max_item_count {
            let Some((_, aggregator)) = self.groups.pop_first() else {
                break;
            };
            results.push(aggregator.result()?);
        }
        if self.groups.is_empty() {
            self.done = true;
        }
        Ok(results)
    }

    /// Serializes every still-resident group for embedding in a continuation token: an object
    /// keyed by the decimal form of each fingerprint.
    pub fn cursor(&self) -> String {
        let entries: serde_json::Map<String, serde_json::Value> = self
            .groups
            .iter()
            .map(|(key, aggregator)| {
                (
                    key.to_string(),
                    serde_json::Value::String(aggregator.continuation()),
                )
            })
            .collect();
        serde_json::to_string(&entries).expect("grouping table continuations always serialize")
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// True once a drain has emptied the table. No further groups will be admitted after this;
    /// the upstream is exhausted by construction when draining begins.
    pub fn is_done(&self) -> bool {
        self.done
    }
}
