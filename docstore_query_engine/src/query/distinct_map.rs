// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::collections::BTreeSet;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::fingerprint;
use crate::ErrorKind;

/// Selects the duplicate-suppression strategy for a DISTINCT query.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DistinctType {
    /// No ordering guarantee from upstream; every seen fingerprint must be retained.
    Unordered,

    /// Upstream emits documents sorted by the distinct key, so only the most recent fingerprint
    /// needs to be retained. This is the memory-efficient path, used when the query rewriter can
    /// prove an order.
    Ordered,
}

impl FromStr for DistinctType {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "Unordered" => Ok(DistinctType::Unordered),
            "Ordered" => Ok(DistinctType::Ordered),
            _ => Err(ErrorKind::BadRequest.with_message(format!("unknown DistinctType: {s}"))),
        }
    }
}

/// Tracks which documents the DISTINCT stage has already emitted.
///
/// Both variants reduce each document to its 128-bit content fingerprint and remember
/// fingerprints only, never documents.
// --
// This uses enum dispatch rather than a trait object: the variant set is closed and internal,
// so a plain match avoids the indirection.
#[derive(Clone, Debug)]
pub enum DistinctMap {
    Unordered {
        /// Every fingerprint seen so far. An ordered set, so continuation snapshots are
        /// deterministic.
        seen: BTreeSet<u128>,
    },
    Ordered {
        /// The fingerprint of the most recently seen document.
        last: Option<u128>,
    },
}

/// The persisted form of a [`DistinctMap`], embedded (stringified) in DISTINCT continuation
/// tokens. Fingerprints travel as decimal strings; JSON numbers cannot carry 128 bits.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
enum DistinctMapToken {
    Unordered { fingerprints: Vec<String> },
    Ordered { last: Option<String> },
}

impl DistinctMap {
    /// Creates an empty map for the given distinct type.
    pub fn new(distinct_type: DistinctType) -> Self {
        match distinct_type {
            DistinctType::Unordered => DistinctMap::Unordered {
                seen: BTreeSet::new(),
            },
            DistinctType::Ordered => DistinctMap::Ordered { last: None },
        }
    }

    /// Rebuilds a map from a continuation previously produced by [`DistinctMap::cursor`].
    ///
    /// `None` builds a fresh map. A token that does not parse, or that was produced by the other
    /// variant, is rejected with the offending token in the message.
    pub fn from_cursor(distinct_type: DistinctType, cursor: Option<&str>) -> crate::Result<Self> {
        let Some(cursor) = cursor else {
            return Ok(Self::new(distinct_type));
        };

        let token: DistinctMapToken = serde_json::from_str(cursor).map_err(|e| {
            ErrorKind::BadRequest
                .with_message(format!("malformed distinct map continuation '{cursor}': {e}"))
        })?;

        match (distinct_type, token) {
            (DistinctType::Unordered, DistinctMapToken::Unordered { fingerprints }) => {
                let seen = fingerprints
                    .iter()
                    .map(|f| parse_fingerprint(f, cursor))
                    .collect::<crate::Result<BTreeSet<u128>>>()?;
                Ok(DistinctMap::Unordered { seen })
            }
            (DistinctType::Ordered, DistinctMapToken::Ordered { last }) => {
                let last = last
                    .as_deref()
                    .map(|f| parse_fingerprint(f, cursor))
                    .transpose()?;
                Ok(DistinctMap::Ordered { last })
            }
            _ => Err(ErrorKind::BadRequest.with_message(format!(
                "distinct map continuation '{cursor}' does not match distinct type {distinct_type:?}"
            ))),
        }
    }

    /// Records a document and reports whether it is new.
    ///
    /// Returns the admission decision and the document's fingerprint. Repeated adds of
    /// canonically equal documents return `false` after the first (for the ordered variant, as
    /// long as duplicates arrive adjacently, which the upstream sort guarantees).
    pub fn add(&mut self, element: &serde_json::Value) -> (bool, u128) {
        let fingerprint = fingerprint::of_element(element);
        let admitted = match self {
            DistinctMap::Unordered { seen } => seen.insert(fingerprint),
            DistinctMap::Ordered { last } => {
                if *last == Some(fingerprint) {
                    false
                } else {
                    *last = Some(fingerprint);
                    true
                }
            }
        };
        (admitted, fingerprint)
    }

    /// Serializes the map's state for embedding in a continuation token.
    ///
    /// For the unordered variant this snapshots the entire fingerprint set, which is expensive
    /// but exact; the ordered variant is a single fingerprint.
    pub fn cursor(&self) -> String {
        let token = match self {
            DistinctMap::Unordered { seen } => DistinctMapToken::Unordered {
                fingerprints: seen.iter().map(|f| f.to_string()).collect(),
            },
            DistinctMap::Ordered { last } => DistinctMapToken::Ordered {
                last: last.map(|f| f.to_string()),
            },
        };
        serde_json::to_string(&token).expect("distinct map tokens always serialize")
    }
}

fn parse_fingerprint(text: &str, cursor: &str) -> crate::Result<u128> {
    text.parse::<u128>().map_err(|e| {
        ErrorKind::BadRequest.with_message(format!(
            "malformed fingerprint '{text}' in distinct map continuation '{cursor}': {e}"
        ))
    })
}
