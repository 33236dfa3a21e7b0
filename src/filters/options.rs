//! Presentation ranking for filter options

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RankedOption {
    pub value: String,
    pub count: i64,
    pub selected: bool,
}

/// Order `values` by count descending, then alphabetically.
///
/// Options below `min_count` are dropped unless currently selected, so a
/// noisy dimension never hides a value the user already picked.
pub fn rank_options(
    values: &[String],
    counts: &BTreeMap<String, i64>,
    selected: &BTreeSet<String>,
    min_count: i64,
) -> Vec<RankedOption> {
    let mut ranked: Vec<RankedOption> = values
        .iter()
        .map(|value| RankedOption {
            value: value.clone(),
            count: counts.get(value).copied().unwrap_or(0),
            selected: selected.contains(value),
        })
        .filter(|option| option.selected || option.count >= min_count)
        .collect();

    ranked.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.value.cmp(&b.value)));
    ranked
}
