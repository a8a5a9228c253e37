use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::query_result::{deserialize_item, QueryClauseItem};
use crate::ErrorKind;

/// The aggregate functions a GROUP BY projection can request for an output alias.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AggregateKind {
    Count,
    Sum,
    Min,
    Max,
    Average,
}

impl FromStr for AggregateKind {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        // A match statement seems like the right thing to do, but it means forcing the string to lowercase first.
        // This allows us to do the comparison in a case-insensitive way without having to allocate a new string.
        if s.eq_ignore_ascii_case("count") {
            Ok(AggregateKind::Count)
        } else if s.eq_ignore_ascii_case("sum") {
            Ok(AggregateKind::Sum)
        } else if s.eq_ignore_ascii_case("min") {
            Ok(AggregateKind::Min)
        } else if s.eq_ignore_ascii_case("max") {
            Ok(AggregateKind::Max)
        } else if s.eq_ignore_ascii_case("average") {
            Ok(AggregateKind::Average)
        } else {
            Err(ErrorKind::BadRequest.with_message(format!("unknown aggregate type: {}", s)))
        }
    }
}

/// Accumulates one output column of one grouping.
///
/// The variant states are serializable so that a partially accumulated column can travel inside a
/// continuation token and resume later. "Undefined" never appears in the serialized form as a
/// JSON value; it is encoded structurally (a missing or null state field), mirroring how
/// [`QueryClauseItem`] treats a missing `item`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Aggregator {
    /// Passthrough for non-aggregated projection columns: the first non-undefined value wins.
    Scalar {
        #[serde(
            default,
            deserialize_with = "deserialize_item",
            skip_serializing_if = "Option::is_none"
        )]
        value: Option<serde_json::Value>,
    },
    Count {
        count: u64,
    },
    /// `sum` is `None` once any non-numeric contribution has been seen; that state is sticky and
    /// the result is undefined.
    Sum {
        sum: Option<f64>,
    },
    Min {
        min: Option<QueryClauseItem>,
    },
    Max {
        max: Option<QueryClauseItem>,
    },
    Average {
        sum: Option<f64>,
        count: u64,
    },
}

impl Aggregator {
    /// Creates an empty aggregator for the given kind; `None` means scalar passthrough.
    pub fn new(kind: Option<AggregateKind>) -> Self {
        match kind {
            None => Aggregator::Scalar { value: None },
            Some(AggregateKind::Count) => Aggregator::Count { count: 0 },
            Some(AggregateKind::Sum) => Aggregator::Sum { sum: Some(0.0) },
            Some(AggregateKind::Min) => Aggregator::Min { min: None },
            Some(AggregateKind::Max) => Aggregator::Max { max: None },
            Some(AggregateKind::Average) => Aggregator::Average {
                sum: Some(0.0),
                count: 0,
            },
        }
    }

    /// The kind this aggregator was created for; `None` for scalar passthrough.
    pub fn kind(&self) -> Option<AggregateKind> {
        match self {
            Aggregator::Scalar { .. } => None,
            Aggregator::Count { .. } => Some(AggregateKind::Count),
            Aggregator::Sum { .. } => Some(AggregateKind::Sum),
            Aggregator::Min { .. } => Some(AggregateKind::Min),
            Aggregator::Max { .. } => Some(AggregateKind::Max),
            Aggregator::Average { .. } => Some(AggregateKind::Average),
        }
    }

    /// Folds one contribution into the accumulated state.
    pub fn add_value(&mut self, value: &QueryClauseItem) -> crate::Result<()> {
        match self {
            Aggregator::Scalar { value: recorded } => {
                if recorded.is_none() {
                    if let Some(v) = &value.item {
                        *recorded = Some(v.clone());
                    }
                }
            }
            Aggregator::Count { count } => {
                // A partition that never saw this group contributes nothing to its count.
                if let Some(v) = &value.item {
                    let int_value = v.as_u64().ok_or_else(|| {
                        ErrorKind::InvalidSourceResponse
                            .with_message("count aggregator expects a non-negative integer value")
                    })?;
                    *count += int_value;
                }
            }
            Aggregator::Sum { sum } => add_numeric(sum, value),
            Aggregator::Min { min } => {
                if let Some(new) = better_extremum(min, value, std::cmp::Ordering::Less)? {
                    *min = Some(new);
                }
            }
            Aggregator::Max { max } => {
                if let Some(new) = better_extremum(max, value, std::cmp::Ordering::Greater)? {
                    *max = Some(new);
                }
            }
            Aggregator::Average { sum, count } => {
                if add_numeric_counted(sum, value) {
                    *count += 1;
                }
            }
        }
        Ok(())
    }

    /// Produces the accumulated result, or `None` when the result is undefined.
    pub fn result(&self) -> crate::Result<Option<serde_json::Value>> {
        let result = match self {
            Aggregator::Scalar { value } => value.clone(),
            Aggregator::Count { count } => Some(serde_json::Value::Number((*count).into())),
            Aggregator::Sum { sum } => sum.map(to_json_number).transpose()?,
            Aggregator::Min { min } => min.as_ref().and_then(|c| c.item.clone()),
            Aggregator::Max { max } => max.as_ref().and_then(|c| c.item.clone()),
            Aggregator::Average { sum, count } => match sum {
                Some(sum) if *count > 0 => Some(to_json_number(*sum / (*count as f64))?),
                _ => None,
            },
        };
        Ok(result)
    }

    /// Serializes the internal state for embedding in a continuation token.
    pub fn continuation(&self) -> String {
        serde_json::to_string(self).expect("aggregator state always serializes")
    }

    /// Rebuilds an aggregator from a continuation produced by [`Aggregator::continuation`].
    pub fn from_continuation(continuation: &str) -> crate::Result<Self> {
        serde_json::from_str(continuation).map_err(|e| {
            ErrorKind::BadRequest.with_message(format!(
                "malformed aggregator continuation '{continuation}': {e}"
            ))
        })
    }
}

/// Accumulates a numeric contribution into `sum`, making the state sticky-undefined on anything
/// non-numeric (undefined included).
fn add_numeric(sum: &mut Option<f64>, value: &QueryClauseItem) {
    let contribution = value.item.as_ref().and_then(|v| v.as_f64());
    *sum = match (*sum, contribution) {
        (Some(current), Some(v)) => Some(current + v),
        _ => None,
    };
}

/// Like [`add_numeric`], reporting whether the contribution counted.
fn add_numeric_counted(sum: &mut Option<f64>, value: &QueryClauseItem) -> bool {
    let before = sum.is_some();
    add_numeric(sum, value);
    before && sum.is_some()
}

fn better_extremum(
    current: &Option<QueryClauseItem>,
    candidate: &QueryClauseItem,
    preferred_ordering: std::cmp::Ordering,
) -> crate::Result<Option<QueryClauseItem>> {
    Ok(match current {
        None => Some(candidate.clone()),
        Some(existing) if candidate.compare(existing)? == preferred_ordering => {
            Some(candidate.clone())
        }
        _ => None,
    })
}

/// Renders an accumulated float as a JSON number, keeping integral results integral so a sum of
/// integers reads back as an integer.
fn to_json_number(value: f64) -> crate::Result<serde_json::Value> {
    if !value.is_finite() {
        return Err(
            ErrorKind::ArithmeticOverflow.with_message("aggregate produced a non-finite value")
        );
    }
    if value.fract() == 0.0 && (i64::MIN as f64..=i64::MAX as f64).contains(&value) {
        Ok(serde_json::Value::Number((value as i64).into()))
    } else {
        serde_json::Number::from_f64(value)
            .map(serde_json::Value::Number)
            .ok_or_else(|| {
                ErrorKind::ArithmeticOverflow.with_message("aggregate produced a non-finite value")
            })
    }
}
