//! Deterministic byte encodings.
//!
//! Two different canonical forms are used, and they must not be confused:
//!
//! - ballots use a *fixed* key order (`e`, `t`, `p`) that is never sorted, so the
//!   receipt and chain hashes depend on byte-identical output for identical input;
//! - signed documents (results bundles) use *sorted* keys, so that the signer and any
//!   verifier re-serialising the same JSON arrive at the same bytes.
//!
//! Neither form contains insignificant whitespace.

use crate::*;
use serde::Serialize;
use serde_json::{Map, Value};

// Field order here is the wire order.
#[derive(Serialize)]
struct CanonicalBallot<'a> {
    e: &'a str,
    t: &'a str,
    p: &'a [u32],
}

/// Canonical bytes of a ranked ballot: `{"e":<election>,"t":<timestamp>,"p":[...]}`
///
/// Preference order is preserved exactly. Duplicate detection happens earlier, in
/// `validate_preferences`.
pub fn canonicalize(preferences: &[u32], election_id: &str, timestamp: &str) -> Vec<u8> {
    let ballot = CanonicalBallot {
        e: election_id,
        t: timestamp,
        p: preferences,
    };
    serde_json::to_vec(&ballot).expect("ballotledger: Unexpected error serializing ballot")
}

/// Sorted-key, whitespace-free JSON of any serializable value
pub fn canonical_json<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let value = serde_json::to_value(value)?;
    Ok(serde_json::to_vec(&sort_keys(&value))?)
}

// serde_json is built with `preserve_order`, so objects must be rebuilt in key order.
fn sort_keys(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();

            let mut sorted = Map::with_capacity(map.len());
            for key in keys {
                sorted.insert(key.clone(), sort_keys(&map[key.as_str()]));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(sort_keys).collect()),
        other => other.clone(),
    }
}
