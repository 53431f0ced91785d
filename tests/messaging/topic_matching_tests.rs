use outbox_core::messaging::providers::topic_matches;
use proptest::prelude::*;

use crate::common::strategies::*;

proptest! {
    /// Property: a routing key used as a pattern matches itself
    #[test]
    fn key_matches_itself(words in routing_key_strategy()) {
        let key = words.join(".");
        prop_assert!(topic_matches(&key, &key));
    }

    /// Property: `#` matches any key
    #[test]
    fn hash_matches_everything(words in routing_key_strategy()) {
        prop_assert!(topic_matches("#", &words.join(".")));
    }

    /// Property: replacing one word with `*` still matches
    #[test]
    fn star_replaces_exactly_one_word(words in routing_key_strategy(), index in any::<prop::sample::Index>()) {
        let key = words.join(".");
        let mut pattern = words.clone();
        let position = index.index(pattern.len());
        pattern[position] = "*".to_string();
        prop_assert!(topic_matches(&pattern.join("."), &key));
    }

    /// Property: `*` patterns never match a key with a different word count
    #[test]
    fn star_pattern_requires_same_length(words in routing_key_strategy(), extra in word_strategy()) {
        let pattern = vec!["*"; words.len()].join(".");
        let mut longer = words.clone();
        longer.push(extra);
        prop_assert!(topic_matches(&pattern, &words.join(".")));
        prop_assert!(!topic_matches(&pattern, &longer.join(".")));
    }

    /// Property: `prefix.#` matches the prefix alone and anything below it
    #[test]
    fn trailing_hash_matches_zero_or_more_words(prefix in word_strategy(), rest in routing_key_strategy()) {
        let pattern = format!("{prefix}.#");
        prop_assert!(topic_matches(&pattern, &prefix));
        let below = format!("{prefix}.{}", rest.join("."));
        prop_assert!(topic_matches(&pattern, &below));
    }
}

#[test]
fn test_literal_mismatch() {
    assert!(!topic_matches("orders.created", "orders.paid"));
    assert!(!topic_matches("orders.*", "orders"));
    assert!(topic_matches("*.created", "orders.created"));
}
