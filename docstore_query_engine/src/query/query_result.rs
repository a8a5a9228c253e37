// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use serde::{Deserialize, Deserializer, Serialize};

use crate::ErrorKind;

/// The gateway-rewritten queries cause the backend to produce `{"item": <value>}` objects for
/// group by items and aggregate inputs. This struct represents that shape, and provides the
/// comparison logic MIN/MAX aggregation is defined over.
///
/// A *missing* `item` field means the value was undefined in the source document, which is
/// distinct from a present-but-null `item`. The custom deserializer below preserves that
/// distinction: missing deserializes to `None`, `null` to `Some(Value::Null)`.
#[derive(Clone, Debug, Deserialize, Serialize, Default, PartialEq)]
pub struct QueryClauseItem {
    #[serde(
        default,
        deserialize_with = "deserialize_item",
        skip_serializing_if = "Option::is_none"
    )]
    pub item: Option<serde_json::Value>,
}

// Based on https://github.com/serde-rs/serde/issues/984#issuecomment-314143738
// This will deserialize a missing field to `None`, a present-but-null field to `Some(serde_json::Value::Null)` and a present-non-null field to `Some(value)`.
pub(crate) fn deserialize_item<'de, T, D>(deserializer: D) -> Result<Option<T>, D::Error>
where
    T: Deserialize<'de>,
    D: Deserializer<'de>,
{
    Deserialize::deserialize(deserializer).map(Some)
}

impl QueryClauseItem {
    /// Creates a new [`QueryClauseItem`] from a [`serde_json::Value`].
    pub fn from_value(value: serde_json::Value) -> Self {
        Self { item: Some(value) }
    }

    /// Creates a [`QueryClauseItem`] holding the undefined value.
    pub fn undefined() -> Self {
        Self { item: None }
    }

    pub fn is_undefined(&self) -> bool {
        self.item.is_none()
    }

    /// Compares two [`QueryClauseItem`]s under the total order used by MIN/MAX aggregation:
    /// undefined, then null, then booleans, then numbers, then strings.
    ///
    /// We can't just implement [`PartialOrd`] here, because we need to be able to return an error.
    pub fn compare(&self, other: &Self) -> crate::Result<std::cmp::Ordering> {
        let left_ordinal = self.type_ordinal()?;
        let right_ordinal = other.type_ordinal()?;

        if left_ordinal != right_ordinal {
            return Ok(left_ordinal.cmp(&right_ordinal));
        }

        match (&self.item, &other.item) {
            (None, None) => Ok(std::cmp::Ordering::Equal),
            (Some(serde_json::Value::Null), Some(serde_json::Value::Null)) => {
                Ok(std::cmp::Ordering::Equal)
            }
            (Some(serde_json::Value::String(left)), Some(serde_json::Value::String(right))) => {
                Ok(left.cmp(right))
            }
            (Some(serde_json::Value::Bool(left)), Some(serde_json::Value::Bool(right))) => {
                Ok(left.cmp(right))
            }
            (Some(serde_json::Value::Number(left)), Some(serde_json::Value::Number(right))) => {
                // Try integer comparison first. This will fail if either value is not an integer.
                if let (Some(l_int), Some(r_int)) = (left.as_i64(), right.as_i64()) {
                    Ok(l_int.cmp(&r_int))
                } else {
                    // We need to compare as floats.
                    let l = left.as_f64().ok_or_else(|| {
                        ErrorKind::InvalidSourceResponse
                            .with_message("encountered NaN or Infinity while comparing floats")
                    })?;
                    let r = right.as_f64().ok_or_else(|| {
                        ErrorKind::InvalidSourceResponse
                            .with_message("encountered NaN or Infinity while comparing floats")
                    })?;
                    l.partial_cmp(&r).ok_or_else(|| {
                        ErrorKind::InvalidSourceResponse
                            .with_message("encountered NaN or Infinity while comparing floats")
                    })
                }
            }

            // Shouldn't be possible to get here, since we've already checked the type ordinal.
            _ => unreachable!("encountered different types after comparing type ordinal, this shouldn't be possible")
        }
    }

    /// Gets the "Type Ordinal" for a given item.
    ///
    /// The Type Ordinal is used to order items of differing types.
    /// If the Type Ordinal is the same, the items are compared using their underlying values.
    ///
    /// Returns an error if a non-primitive value is encountered.
    fn type_ordinal(&self) -> crate::Result<usize> {
        match &self.item {
            None => Ok(0),
            Some(serde_json::Value::Null) => Ok(1),
            Some(serde_json::Value::Bool(_)) => Ok(2),
            // 3 is reserved by the backend's ordering for a type JSON cannot carry.
            Some(serde_json::Value::Number(_)) => Ok(4),
            Some(serde_json::Value::String(_)) => Ok(5),
            _ => Err(ErrorKind::InvalidSourceResponse
                .with_message("cannot compare non-primitive values")),
        }
    }
}

/// The shape the upstream rewrite gives every source element of a GROUP BY query.
///
/// The grouping key is the ordered `groupByItems` array; `payload` drives the per-alias
/// aggregator updates.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RewrittenGroupByProjection {
    pub group_by_items: Vec<QueryClauseItem>,
    pub payload: serde_json::Value,
}

impl RewrittenGroupByProjection {
    /// Validates a source element against the rewritten shape.
    ///
    /// A missing `groupByItems` or `payload` field, or a wrong-typed one, means the element did
    /// not come from the expected rewrite and the query cannot proceed.
    pub fn from_element(element: &serde_json::Value) -> crate::Result<Self> {
        serde_json::from_value(element.clone()).map_err(|e| {
            ErrorKind::BadRequest
                .with_message(format!("malformed rewritten GROUP BY projection: {e}"))
        })
    }
}

#[cfg(test)]
mod tests {
    use std::cmp::Ordering;

    use super::*;

    macro_rules! ordering_tests {
        (
            $(
                $name:ident {
                    $($left:tt, $right:tt => $expected:pat,)*
                }
            )+
        ) => {
            $(
                #[test]
                #[allow(clippy::redundant_pattern_matching)] // Clippy doesn't like that sometimes we match on Err(_) instead of calling .is_err
                pub fn $name() {
                    $(
                        let left = serde_json::json!($left);
                        let right = serde_json::json!($right);
                        let left: QueryClauseItem = serde_json::from_value(left).unwrap();
                        let right: QueryClauseItem  = serde_json::from_value(right).unwrap();
                        let result = left.compare(&right);

                        assert!(matches!(result, $expected), "comparing {:?} and {:?}, expected: {}, but got {:?}", left, right, stringify!($expected), result);
                    )*
                }
            )+
        };
    }

    ordering_tests! {
        compare_numbers {
            {"item": 1}, {"item": 1} => Ok(Ordering::Equal),
            {"item": 1}, {"item": 2} => Ok(Ordering::Less),
            {"item": 2}, {"item": 1} => Ok(Ordering::Greater),
            {"item": 1.0}, {"item": 1.1} => Ok(Ordering::Less),
            {"item": -1}, {"item": 1} => Ok(Ordering::Less),
        }

        compare_bools {
            {"item": true}, {"item": false} => Ok(Ordering::Greater),
            {"item": false}, {"item": true} => Ok(Ordering::Less),
            {"item": true}, {"item": true} => Ok(Ordering::Equal),
        }

        compare_strings {
            {"item": "aaa"}, {"item": "aab"} => Ok(Ordering::Less),
            {"item": "aab"}, {"item": "aaa"} => Ok(Ordering::Greater),
            {"item": "aaa"}, {"item": "aaa"} => Ok(Ordering::Equal),
        }

        compare_nulls_and_undefined {
            {}, {} => Ok(Ordering::Equal),
            {"item": null}, {"item": null} => Ok(Ordering::Equal),
            {}, {"item": null} => Ok(Ordering::Less),
        }

        compare_mixed_types {
            {}, {"item": null} => Ok(Ordering::Less),
            {"item": null}, {"item": true} => Ok(Ordering::Less),
            {"item": true}, {"item": 1} => Ok(Ordering::Less),
            {"item": 1}, {"item": "a"} => Ok(Ordering::Less),
        }

        cannot_compare_non_primitives {
            {"item": {"a": 1}}, {"item": {"a": 2}} => Err(_),
            {"item": [1, 2]}, {"item": [3, 4]} => Err(_),
            {"item": {"a": 1}}, {} => Err(_),
        }
    }

    #[test]
    fn clause_item_round_trips_undefined_and_null() {
        let undefined = QueryClauseItem::undefined();
        let serialized = serde_json::to_string(&undefined).unwrap();
        assert_eq!(serialized, "{}");
        let parsed: QueryClauseItem = serde_json::from_str(&serialized).unwrap();
        assert!(parsed.is_undefined());

        let null = QueryClauseItem::from_value(serde_json::Value::Null);
        let serialized = serde_json::to_string(&null).unwrap();
        assert_eq!(serialized, r#"{"item":null}"#);
        let parsed: QueryClauseItem = serde_json::from_str(&serialized).unwrap();
        assert_eq!(parsed.item, Some(serde_json::Value::Null));
    }

    #[test]
    fn projection_parses_rewritten_shape() {
        let element = serde_json::json!({
            "groupByItems": [{"item": "A"}, {}],
            "payload": {"team": "A", "total": {"item": 3}},
        });
        let projection = RewrittenGroupByProjection::from_element(&element).unwrap();
        assert_eq!(projection.group_by_items.len(), 2);
        assert_eq!(
            projection.group_by_items[0],
            QueryClauseItem::from_value(serde_json::json!("A"))
        );
        assert!(projection.group_by_items[1].is_undefined());
    }

    #[test]
    fn projection_rejects_missing_fields() {
        for element in [
            serde_json::json!({"payload": {}}),
            serde_json::json!({"groupByItems": []}),
            serde_json::json!({"groupByItems": 42, "payload": {}}),
            serde_json::json!("not an object"),
        ] {
            let err = RewrittenGroupByProjection::from_element(&element).unwrap_err();
            assert_eq!(err.kind(), crate::ErrorKind::BadRequest);
        }
    }
}
