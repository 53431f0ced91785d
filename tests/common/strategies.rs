//! Proptest strategies for routing keys and pool workloads

use proptest::prelude::*;

/// A single routing-key word
pub fn word_strategy() -> impl Strategy<Value = String> {
    "[a-z]{1,6}"
}

/// A dotted routing key of one to five words
pub fn routing_key_strategy() -> impl Strategy<Value = Vec<String>> {
    prop::collection::vec(word_strategy(), 1..=5)
}

/// Pool size and number of channels rented at once
pub fn pool_workload_strategy() -> impl Strategy<Value = (usize, usize)> {
    (1usize..8, 0usize..20)
}
