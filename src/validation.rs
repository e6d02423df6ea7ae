//! Structural invariant checks for a grouping state.
//!
//! Everything is recomputed from the items themselves; stored counts are only
//! compared, never trusted. The validator is pure and never modifies state.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::GroupingState;

/// Counts recomputed by the validator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationCounts {
    pub total_rows: u64,
    pub grouped_records: u64,
    pub ungrouped_records: u64,
    pub main_groups: usize,
    pub total_sub_groups: usize,
    pub ungrouped_sub_groups: usize,
}

/// Validator output, embedded in every returned state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub is_valid: bool,
    pub counts: ValidationCounts,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

/// Check every structural invariant of `state`.
pub fn validate(state: &GroupingState) -> ValidationReport {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    // Each item id in exactly one bucket
    let mut seen: HashSet<&str> = HashSet::new();
    for item in state.items() {
        if !seen.insert(item.id.as_str()) {
            errors.push(format!("Item '{}' appears in more than one bucket", item.id));
        }
        if item.repetition == 0 {
            errors.push(format!("Item '{}' has a zero repetition count", item.id));
        }
    }

    let mut grouped_records = 0u64;
    let mut ungrouped_sub_groups = 0usize;

    for group in &state.main_groups {
        let mut group_total = 0u64;
        let mut flagged = 0usize;
        let mut names: HashMap<String, usize> = HashMap::new();

        for sub in &group.sub_groups {
            let count = sub.derived_count();
            group_total += count;
            if count != sub.item_count {
                errors.push(format!(
                    "Sub-group '{}' in '{}' stores {} items but holds {}",
                    sub.name, group.name, sub.item_count, count
                ));
            }
            if sub.is_ungrouped {
                flagged += 1;
            } else if sub.is_empty() {
                warnings.push(format!("Sub-group '{}' in '{}' is empty", sub.name, group.name));
            }
            if sub.is_truncated() {
                warnings.push(format!(
                    "Sub-group '{}' in '{}' shows a truncated preview ({} items elided)",
                    sub.name, group.name, sub.elided.items
                ));
            }
            *names.entry(sub.name.to_lowercase()).or_insert(0) += 1;
        }

        if group_total != group.total_items {
            errors.push(format!(
                "Main group '{}' stores {} items but its sub-groups hold {}",
                group.name, group.total_items, group_total
            ));
        }
        if flagged > 1 {
            errors.push(format!(
                "Main group '{}' has {} ungrouped sub-groups",
                group.name, flagged
            ));
        }
        if let Some(id) = &group.ungrouped_sub_group_id {
            let present = group.sub_group(id).map_or(false, |sg| sg.is_ungrouped);
            if !present {
                errors.push(format!(
                    "Main group '{}' lost its ungrouped sub-group '{}'",
                    group.name, id
                ));
            }
        }

        if group.sub_groups.is_empty() {
            warnings.push(format!("Main group '{}' has no sub-groups", group.name));
        } else if group_total == 0 {
            warnings.push(format!("Main group '{}' has no items", group.name));
        }
        if !group.enabled && group_total > 0 {
            warnings.push(format!(
                "Main group '{}' is disabled but still holds {} items",
                group.name, group_total
            ));
        }
        let mut duplicates: Vec<&String> = names.iter().filter(|(_, n)| **n > 1).map(|(k, _)| k).collect();
        duplicates.sort();
        for name in duplicates {
            warnings.push(format!(
                "Main group '{}' has more than one sub-group named '{}'",
                group.name, name
            ));
        }

        grouped_records += group_total;
        ungrouped_sub_groups += flagged;
    }

    let ungrouped_records = state.ungrouped.derived_count();
    if ungrouped_records != state.ungrouped.item_count {
        errors.push(format!(
            "Ungrouped bucket stores {} items but holds {}",
            state.ungrouped.item_count, ungrouped_records
        ));
    }
    if state.ungrouped.is_truncated() {
        warnings.push(format!(
            "Ungrouped bucket shows a truncated preview ({} items elided)",
            state.ungrouped.elided.items
        ));
    }

    let covered = grouped_records + ungrouped_records;
    if covered != state.total_rows {
        errors.push(format!(
            "Grouping covers {} rows but the dataset has {}",
            covered, state.total_rows
        ));
    }

    ValidationReport {
        is_valid: errors.is_empty(),
        counts: ValidationCounts {
            total_rows: state.total_rows,
            grouped_records,
            ungrouped_records,
            main_groups: state.main_groups.len(),
            total_sub_groups: state.sub_group_count(),
            ungrouped_sub_groups,
        },
        errors,
        warnings,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Elided, GenerationMethod, Item, PromotedFields};

    fn item(row: usize) -> Item {
        Item {
            id: Item::id_for_row(row),
            name: format!("Item {}", row),
            fields: PromotedFields::default(),
            repetition: 1,
            first_row: row,
            row_data: None,
        }
    }

    fn valid_state() -> GroupingState {
        let mut state = GroupingState::new("ds", 3, GenerationMethod::ConfiguredColumns);
        let gi = state.push_group("Fruit");
        let si = state.push_sub_group(gi, "Apples");
        state.main_groups[gi].sub_groups[si].items.push(item(0));
        state.main_groups[gi].sub_groups[si].items.push(item(1));
        state.ungrouped.items.push(item(2));
        state.recompute_counts();
        state
    }

    #[test]
    fn test_valid_state() {
        let report = validate(&valid_state());
        assert!(report.is_valid, "{:?}", report.errors);
        assert_eq!(report.counts.grouped_records, 2);
        assert_eq!(report.counts.ungrouped_records, 1);
        assert_eq!(report.counts.main_groups, 1);
        assert_eq!(report.counts.total_sub_groups, 1);
    }

    #[test]
    fn test_stale_counts_are_errors() {
        let mut state = valid_state();
        state.main_groups[0].sub_groups[0].item_count = 7;
        let report = validate(&state);
        assert!(!report.is_valid);
        assert!(report.errors.iter().any(|e| e.contains("stores 7")));
    }

    #[test]
    fn test_duplicate_item_and_coverage() {
        let mut state = valid_state();
        state.ungrouped.items.push(item(0));
        state.recompute_counts();
        let report = validate(&state);
        assert!(report.errors.iter().any(|e| e.contains("more than one bucket")));
        assert!(report.errors.iter().any(|e| e.contains("covers 4 rows")));
    }

    #[test]
    fn test_elided_rows_count_toward_coverage() {
        let mut state = valid_state();
        state.total_rows = 10;
        state.main_groups[0].sub_groups[0].elided = Elided { items: 3, rows: 7 };
        state.recompute_counts();
        let report = validate(&state);
        assert!(report.is_valid, "{:?}", report.errors);
        assert!(report.warnings.iter().any(|w| w.contains("truncated")));
    }

    #[test]
    fn test_missing_ungrouped_sub_group() {
        let mut state = valid_state();
        state.ensure_ungrouped_sub_group(0);
        state.main_groups[0].sub_groups.retain(|sg| !sg.is_ungrouped);
        let report = validate(&state);
        assert!(report.errors.iter().any(|e| e.contains("lost its ungrouped")));
    }

    #[test]
    fn test_warnings() {
        let mut state = valid_state();
        state.main_groups[0].enabled = false;
        state.push_sub_group(0, "apples");
        let gi = state.push_group("Empty");
        assert_eq!(gi, 1);
        state.recompute_counts();

        let report = validate(&state);
        assert!(report.is_valid);
        assert!(report.warnings.iter().any(|w| w.contains("disabled")));
        assert!(report.warnings.iter().any(|w| w.contains("named 'apples'")));
        assert!(report.warnings.iter().any(|w| w.contains("'Empty' has no sub-groups")));
        assert!(report.warnings.iter().any(|w| w.contains("is empty")));
    }
}
