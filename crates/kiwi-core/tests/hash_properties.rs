// SPDX-License-Identifier: MIT OR Apache-2.0
//! Property tests for canonical JSON hashing (spec §2/§3: hashes must be
//! stable regardless of how a JSON object's keys happen to be ordered in
//! memory, since that ordering is never part of the artifact's identity).

use kiwi_core::canonical_json;
use proptest::prelude::*;
use serde_json::{Map, Value};

fn shuffled_object(keys: &[&str]) -> impl Strategy<Value = (Value, Value)> {
    let mut forward = Map::new();
    let mut backward = Map::new();
    for (i, key) in keys.iter().enumerate() {
        forward.insert((*key).to_string(), Value::from(i as i64));
    }
    for (i, key) in keys.iter().rev().enumerate() {
        backward.insert((*key).to_string(), Value::from((keys.len() - 1 - i) as i64));
    }
    Just((Value::Object(forward), Value::Object(backward)))
}

proptest! {
    #[test]
    fn canonical_json_is_independent_of_construction_order(
        (a, b) in shuffled_object(&["zeta", "alpha", "mid", "beta"])
    ) {
        prop_assert_eq!(canonical_json(&a).unwrap(), canonical_json(&b).unwrap());
    }

    #[test]
    fn canonical_json_round_trips_through_value(n in any::<i64>(), s in "\\PC*") {
        let original = serde_json::json!({"n": n, "s": s});
        let canon = canonical_json(&original).unwrap();
        let reparsed: Value = serde_json::from_str(&canon).unwrap();
        prop_assert_eq!(reparsed, original);
    }
}
