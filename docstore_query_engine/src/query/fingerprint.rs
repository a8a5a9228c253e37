// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Content-addressed fingerprints for documents.
//!
//! Duplicate suppression and grouping both reduce a document to a 128-bit MurmurHash3 fingerprint
//! of a canonical serialization. Fingerprint equality is the sole equality relation used by the
//! distinct map and the grouping table; hash collisions are accepted as negligible and are not
//! resolved.
//!
//! The canonical serialization prefixes every value with a type tag byte, so `1` (integer),
//! `1.0` (double), `"1"` (string) and `true` all hash differently. Object keys are visited in
//! codepoint-sorted order, which makes the fingerprint insensitive to key order; array element
//! order is significant.

use std::io::Cursor;

use super::QueryClauseItem;

/// The seed for every fingerprint hash.
///
/// Fingerprints are persisted inside continuation tokens, so they must be stable across process
/// restarts: this value must never change. (MurmurHash3-x64-128 takes a 32-bit seed; the
/// remaining initial state is the algorithm's fixed constants.)
pub const FINGERPRINT_SEED: u32 = 0x2F8A_94D3;

const TAG_UNDEFINED: u8 = 0x00;
const TAG_NULL: u8 = 0x01;
const TAG_BOOLEAN: u8 = 0x02;
const TAG_INT64: u8 = 0x03;
const TAG_UINT64: u8 = 0x04;
const TAG_FLOAT64: u8 = 0x05;
const TAG_STRING: u8 = 0x06;
const TAG_ARRAY: u8 = 0x07;
const TAG_OBJECT: u8 = 0x08;

/// Computes the fingerprint of a single document element.
pub fn of_element(element: &serde_json::Value) -> u128 {
    let mut buffer = Vec::new();
    write_canonical(&mut buffer, element);
    hash(&buffer)
}

/// Computes the fingerprint of a grouping-key tuple.
///
/// The tuple is hashed with the array rules, so the key `["A", 1]` and a single-item key `["A"]`
/// never collide structurally. A missing item (an undefined grouping key component) contributes
/// the undefined tag.
pub fn of_group_key(items: &[QueryClauseItem]) -> u128 {
    let mut buffer = Vec::new();
    buffer.push(TAG_ARRAY);
    buffer.extend_from_slice(&(items.len() as u64).to_le_bytes());
    for item in items {
        let child = match &item.item {
            None => hash(&[TAG_UNDEFINED]),
            Some(value) => of_element(value),
        };
        buffer.extend_from_slice(&child.to_le_bytes());
    }
    hash(&buffer)
}

/// Writes the canonical byte form of `value` into `buffer`.
///
/// Containers embed the *fingerprints* of their children rather than the children's raw bytes,
/// so the canonical form of a value is always small relative to deeply nested inputs.
fn write_canonical(buffer: &mut Vec<u8>, value: &serde_json::Value) {
    match value {
        serde_json::Value::Null => buffer.push(TAG_NULL),
        serde_json::Value::Bool(b) => {
            buffer.push(TAG_BOOLEAN);
            buffer.push(*b as u8);
        }
        serde_json::Value::Number(n) => {
            // One tag per numeric subtype: an integer 1 and a double 1.0 are distinct documents.
            if let Some(i) = n.as_i64() {
                buffer.push(TAG_INT64);
                buffer.extend_from_slice(&i.to_le_bytes());
            } else if let Some(u) = n.as_u64() {
                buffer.push(TAG_UINT64);
                buffer.extend_from_slice(&u.to_le_bytes());
            } else {
                let f = n
                    .as_f64()
                    .expect("serde_json numbers are always i64, u64 or f64");
                buffer.push(TAG_FLOAT64);
                buffer.extend_from_slice(&f.to_le_bytes());
            }
        }
        serde_json::Value::String(s) => {
            buffer.push(TAG_STRING);
            buffer.extend_from_slice(s.as_bytes());
        }
        serde_json::Value::Array(items) => {
            buffer.push(TAG_ARRAY);
            buffer.extend_from_slice(&(items.len() as u64).to_le_bytes());
            for item in items {
                buffer.extend_from_slice(&of_element(item).to_le_bytes());
            }
        }
        serde_json::Value::Object(map) => {
            buffer.push(TAG_OBJECT);
            buffer.extend_from_slice(&(map.len() as u64).to_le_bytes());

            // Keys are visited in codepoint-sorted order so that `{a:1,b:2}` and `{b:2,a:1}`
            // share a fingerprint. serde_json's default map is already sorted, but we must not
            // depend on a feature flag for a persisted format.
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort_unstable();
            for key in keys {
                let mut key_bytes = Vec::with_capacity(key.len() + 1);
                key_bytes.push(TAG_STRING);
                key_bytes.extend_from_slice(key.as_bytes());
                buffer.extend_from_slice(&hash(&key_bytes).to_le_bytes());
                buffer.extend_from_slice(&of_element(&map[key]).to_le_bytes());
            }
        }
    }
}

fn hash(bytes: &[u8]) -> u128 {
    murmur3::murmur3_x64_128(&mut Cursor::new(bytes), FINGERPRINT_SEED)
        .expect("reading from an in-memory buffer cannot fail")
}
