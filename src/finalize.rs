//! Export-ready, denormalized view of a grouping state.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{GroupingState, MainGroup, Result, SubGroup};

/// One distinct item name and how many rows carry it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalItem {
    pub name: String,
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalSubGroup {
    pub id: String,
    pub name: String,
    /// Sorted by count descending, then name
    pub items: Vec<FinalItem>,
    /// Rows only present in the elided aggregate
    pub other_items: u64,
    pub total_items: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalGroup {
    pub id: String,
    pub name: String,
    pub enabled: bool,
    pub sub_groups: Vec<FinalSubGroup>,
    pub total_items: u64,
    pub estimated_savings_percent: f64,
}

/// The final results tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructuredResult {
    pub dataset_id: String,
    pub main_groups: Vec<FinalGroup>,
    /// Grouped plus ungrouped rows
    pub total_items: u64,
    pub total_groups: usize,
    pub total_sub_groups: usize,
    pub ungrouped_items_count: u64,
    /// Average of the per-group estimates
    pub estimated_total_savings_percent: f64,
    pub generated_at: DateTime<Utc>,
}

/// Final results saved for a dataset, kept with the state they were built from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SavedFinalResults {
    pub dataset_id: String,
    pub results: StructuredResult,
    /// Grouping state at save time
    pub source_state: GroupingState,
    pub saved_at: DateTime<Utc>,
    pub version: String,
}

/// Record format version written by [`SavedFinalResults::capture`].
pub const FINAL_RESULTS_VERSION: &str = "1.0";

impl SavedFinalResults {
    /// Finalize a state and pair the result with its source.
    pub fn capture(state: &GroupingState) -> Self {
        Self {
            dataset_id: state.dataset_id.clone(),
            results: finalize_state(state),
            source_state: state.clone(),
            saved_at: Utc::now(),
            version: FINAL_RESULTS_VERSION.to_string(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec_named(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}

/// Bulk-procurement savings estimate for a group of `distinct_items` items.
///
/// - 10 or more: 10% plus 0.5% per item beyond 10, capped at 25%
/// - 5 to 9: 5% plus 1% per item beyond 5, capped at 15%
/// - fewer: 2% per item, at least 5%
pub fn estimated_savings_percent(distinct_items: usize) -> f64 {
    let n = distinct_items as f64;
    if distinct_items >= 10 {
        (10.0 + (n - 10.0) * 0.5).min(25.0)
    } else if distinct_items >= 5 {
        (5.0 + (n - 5.0)).min(15.0)
    } else {
        (n * 2.0).max(5.0)
    }
}

fn final_sub_group(sub: &SubGroup) -> Option<FinalSubGroup> {
    if sub.is_empty() {
        return None;
    }

    let mut counts: HashMap<&str, u64> = HashMap::new();
    for item in &sub.items {
        *counts.entry(item.name.trim()).or_insert(0) += item.repetition;
    }
    let mut items: Vec<FinalItem> = counts
        .into_iter()
        .map(|(name, count)| FinalItem {
            name: name.to_string(),
            count,
        })
        .collect();
    items.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.name.cmp(&b.name)));

    Some(FinalSubGroup {
        id: sub.id.clone(),
        name: sub.name.clone(),
        items,
        other_items: sub.elided.rows,
        total_items: sub.derived_count(),
    })
}

fn final_group(group: &MainGroup) -> Option<FinalGroup> {
    let sub_groups: Vec<FinalSubGroup> = group.sub_groups.iter().filter_map(final_sub_group).collect();
    if sub_groups.is_empty() {
        return None;
    }
    let distinct_items = sub_groups.iter().map(|sg| sg.items.len()).sum::<usize>()
        + group.sub_groups.iter().map(|sg| sg.elided.items as usize).sum::<usize>();

    Some(FinalGroup {
        id: group.id.clone(),
        name: group.name.clone(),
        enabled: group.enabled,
        total_items: sub_groups.iter().map(|sg| sg.total_items).sum(),
        sub_groups,
        estimated_savings_percent: estimated_savings_percent(distinct_items),
    })
}

/// Build the final results tree. Empty sub-groups and groups are left out.
pub fn finalize_state(state: &GroupingState) -> StructuredResult {
    let main_groups: Vec<FinalGroup> = state.main_groups.iter().filter_map(final_group).collect();

    let grouped: u64 = main_groups.iter().map(|g| g.total_items).sum();
    let ungrouped = state.ungrouped.derived_count();
    let estimated_total_savings_percent = if main_groups.is_empty() {
        0.0
    } else {
        main_groups.iter().map(|g| g.estimated_savings_percent).sum::<f64>() / main_groups.len() as f64
    };

    StructuredResult {
        dataset_id: state.dataset_id.clone(),
        total_items: grouped + ungrouped,
        total_groups: main_groups.len(),
        total_sub_groups: main_groups.iter().map(|g| g.sub_groups.len()).sum(),
        ungrouped_items_count: ungrouped,
        estimated_total_savings_percent,
        main_groups,
        generated_at: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Elided, GenerationMethod, Item, PromotedFields};

    fn item(row: usize, name: &str, repetition: u64) -> Item {
        Item {
            id: Item::id_for_row(row),
            name: name.to_string(),
            fields: PromotedFields::default(),
            repetition,
            first_row: row,
            row_data: None,
        }
    }

    #[test]
    fn test_savings_heuristic() {
        assert_eq!(estimated_savings_percent(1), 5.0);
        assert_eq!(estimated_savings_percent(4), 8.0);
        assert_eq!(estimated_savings_percent(5), 5.0);
        assert_eq!(estimated_savings_percent(9), 9.0);
        assert_eq!(estimated_savings_percent(12), 11.0);
        assert_eq!(estimated_savings_percent(100), 25.0);
    }

    #[test]
    fn test_unique_names_are_summed_and_sorted() {
        let mut state = GroupingState::new("ds", 9, GenerationMethod::ConfiguredColumns);
        let gi = state.push_group("Fruit");
        let si = state.push_sub_group(gi, "Apples");
        state.main_groups[gi].sub_groups[si].items = vec![
            item(0, "Gala", 1),
            item(1, "Fuji", 2),
            item(2, "Gala ", 2),
            item(3, "Braeburn", 3),
        ];
        state.main_groups[gi].sub_groups[si].elided = Elided { items: 1, rows: 1 };
        state.push_sub_group(gi, "Empty");
        state.push_group("Nothing");
        state.refresh();

        let result = finalize_state(&state);
        assert_eq!(result.total_groups, 1);
        assert_eq!(result.total_sub_groups, 1);

        let apples = &result.main_groups[0].sub_groups[0];
        let names: Vec<(&str, u64)> = apples.items.iter().map(|i| (i.name.as_str(), i.count)).collect();
        assert_eq!(names, vec![("Braeburn", 3), ("Gala", 3), ("Fuji", 2)]);
        assert_eq!(apples.other_items, 1);
        assert_eq!(apples.total_items, 9);
        assert_eq!(result.total_items, 9);
        // 3 distinct names + 1 elided item
        assert_eq!(result.main_groups[0].estimated_savings_percent, 8.0);
        assert_eq!(result.estimated_total_savings_percent, 8.0);
    }

    #[test]
    fn test_disabled_groups_are_flagged() {
        let mut state = GroupingState::new("ds", 1, GenerationMethod::ConfiguredColumns);
        let gi = state.push_group("Fruit");
        let si = state.push_sub_group(gi, "Apples");
        state.main_groups[gi].sub_groups[si].items.push(item(0, "Gala", 1));
        state.main_groups[gi].enabled = false;
        state.refresh();

        let result = finalize_state(&state);
        assert!(!result.main_groups[0].enabled);
        assert_eq!(result.ungrouped_items_count, 0);
    }

    #[test]
    fn test_saved_results_keep_source_state() {
        let mut state = GroupingState::new("ds", 2, GenerationMethod::ConfiguredColumns);
        let gi = state.push_group("Fruit");
        let si = state.push_sub_group(gi, "Apples");
        state.main_groups[gi].sub_groups[si].items.push(item(0, "Gala", 2));
        state.refresh();

        let saved = SavedFinalResults::capture(&state);
        assert_eq!(saved.version, FINAL_RESULTS_VERSION);
        assert_eq!(saved.results.total_items, 2);

        let decoded = SavedFinalResults::decode(&saved.encode().unwrap()).unwrap();
        assert_eq!(decoded.source_state, state);
        assert_eq!(decoded.results.main_groups, saved.results.main_groups);
    }
}
