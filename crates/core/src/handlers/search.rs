//! Two-tier search: exact and fuzzy always both run, then union.

use std::collections::HashSet;
use std::hash::Hash;

use tracing::debug;

use crate::metrics::Metrics;
use crate::store::StoreError;

/// Concatenate tiers, keeping the first record seen for each key.
pub fn union_by_key<T, K, F>(tiers: impl IntoIterator<Item = Vec<T>>, key: F) -> Vec<T>
where
    K: Eq + Hash,
    F: Fn(&T) -> K,
{
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for tier in tiers {
        for record in tier {
            if seen.insert(key(&record)) {
                out.push(record);
            }
        }
    }
    out
}

/// Run the exact tier and the fuzzy tier and merge them by primary key.
///
/// The fuzzy tier runs even when the exact tier has hits, so abbreviation
/// matches are never hidden behind a literal match.
pub fn two_tier<T, K, E, Z, F>(
    module: &'static str,
    metrics: &Metrics,
    exact: E,
    fuzzy: Z,
    key: F,
) -> Result<Vec<T>, StoreError>
where
    K: Eq + Hash,
    E: FnOnce() -> Result<Vec<T>, StoreError>,
    Z: FnOnce() -> Result<Vec<T>, StoreError>,
    F: Fn(&T) -> K,
{
    let exact = exact()?;
    let fuzzy = fuzzy()?;
    metrics
        .search_results
        .with_label_values(&[module, "exact"])
        .inc_by(exact.len() as u64);
    metrics
        .search_results
        .with_label_values(&[module, "fuzzy"])
        .inc_by(fuzzy.len() as u64);
    debug!(module, exact = exact.len(), fuzzy = fuzzy.len(), "Two-tier search");
    Ok(union_by_key([exact, fuzzy], key))
}
