//! Name similarity for rename detection

use std::collections::{BTreeMap, BTreeSet};

/// Larger of the token overlap coefficient and the bigram Dice coefficient
///
/// Token overlap catches suffixed names (`headscale` / `headscale-ui` score
/// 1.0); bigram Dice catches spelling drift (`postgres` / `postgresql`).
pub fn similarity(a: &str, b: &str) -> f64 {
    token_overlap(a, b).max(bigram_dice(a, b))
}

fn tokens(name: &str) -> BTreeSet<String> {
    name.split(['-', '_', '.'])
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .collect()
}

/// |A ∩ B| / min(|A|, |B|) over name tokens
pub fn token_overlap(a: &str, b: &str) -> f64 {
    let (ta, tb) = (tokens(a), tokens(b));
    let smaller = ta.len().min(tb.len());
    if smaller == 0 {
        return 0.0;
    }
    ta.intersection(&tb).count() as f64 / smaller as f64
}

fn bigrams(name: &str) -> BTreeMap<(char, char), usize> {
    let chars: Vec<char> = name.to_lowercase().chars().collect();
    let mut counts = BTreeMap::new();
    for pair in chars.windows(2) {
        *counts.entry((pair[0], pair[1])).or_insert(0) += 1;
    }
    counts
}

/// 2·|common bigrams| / (|bigrams a| + |bigrams b|), counting repeats
pub fn bigram_dice(a: &str, b: &str) -> f64 {
    let (ba, bb) = (bigrams(a), bigrams(b));
    let total: usize = ba.values().sum::<usize>() + bb.values().sum::<usize>();
    if total == 0 {
        return if a.eq_ignore_ascii_case(b) { 1.0 } else { 0.0 };
    }
    let common: usize = ba
        .iter()
        .map(|(gram, n)| (*n).min(bb.get(gram).copied().unwrap_or(0)))
        .sum();
    2.0 * common as f64 / total as f64
}
