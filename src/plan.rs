//! Named plans: reusable label structures.
//!
//! A plan captures the main/sub-group names of a state together with aliases
//! learned from its items, so the same structure can be replayed onto another
//! dataset (or a regenerated one). Replay recreates every group, even groups
//! no row matches, and keeps each group's enabled flag.

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::dataset::{ColumnRoles, Dataset, ResolvedColumns};
use crate::matching::{best_match, label_key};
use crate::merger::{ChunkMerger, Placement};
use crate::{GenerationMethod, GroupingError, GroupingState, Result};

/// Current plan format version.
pub const PLAN_VERSION: u32 = 1;

/// Category value that carries no information and is never an alias.
const UNKNOWN_CATEGORY: &str = "Unknown";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanSubGroup {
    pub name: String,
    /// Sub-group name plus the distinct item names it held
    pub aliases: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanGroup {
    pub name: String,
    pub enabled: bool,
    /// Group name plus the distinct category values of its items
    pub aliases: Vec<String>,
    pub sub_groups: Vec<PlanSubGroup>,
}

/// A saved label structure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamedPlan {
    /// Assigned by the store when the plan is first saved
    pub id: String,
    pub name: String,
    pub description: String,
    pub created_at: DateTime<Utc>,
    pub version: u32,
    /// Dataset the plan was captured from
    pub source_dataset: String,
    pub main_column: Option<String>,
    pub sub_column: Option<String>,
    pub groups: Vec<PlanGroup>,
}

/// Listing entry for a plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanSummary {
    pub id: String,
    pub name: String,
    pub description: String,
    pub created_at: DateTime<Utc>,
    pub group_count: usize,
    pub sub_group_count: usize,
}

fn distinct<'a>(first: &'a str, values: impl Iterator<Item = &'a str>) -> Vec<String> {
    let mut seen = BTreeSet::new();
    let mut out = Vec::new();
    for value in std::iter::once(first).chain(values) {
        let value = value.trim();
        if !value.is_empty() && seen.insert(label_key(value)) {
            out.push(value.to_string());
        }
    }
    out
}

impl NamedPlan {
    /// Capture the label structure of `state`.
    pub fn from_state(state: &GroupingState, name: &str, description: Option<&str>) -> Result<Self> {
        let name = name.trim();
        if name.is_empty() {
            return Err(GroupingError::InvalidName("plan name must not be blank".to_string()));
        }

        let groups = state
            .main_groups
            .iter()
            .map(|group| {
                let categories = group
                    .sub_groups
                    .iter()
                    .flat_map(|sg| sg.items.iter())
                    .map(|i| i.fields.category.as_str())
                    .filter(|c| *c != UNKNOWN_CATEGORY);
                PlanGroup {
                    name: group.name.clone(),
                    enabled: group.enabled,
                    aliases: distinct(&group.name, categories),
                    sub_groups: group
                        .sub_groups
                        .iter()
                        .filter(|sg| !sg.is_ungrouped)
                        .map(|sg| PlanSubGroup {
                            name: sg.name.clone(),
                            aliases: distinct(&sg.name, sg.items.iter().map(|i| i.name.as_str())),
                        })
                        .collect(),
                }
            })
            .collect();

        Ok(Self {
            id: String::new(),
            name: name.to_string(),
            description: description.unwrap_or_default().trim().to_string(),
            created_at: Utc::now(),
            version: PLAN_VERSION,
            source_dataset: state.dataset_id.clone(),
            main_column: state.metadata.main_column.clone(),
            sub_column: state.metadata.sub_column.clone(),
            groups,
        })
    }

    pub fn summary(&self) -> PlanSummary {
        PlanSummary {
            id: self.id.clone(),
            name: self.name.clone(),
            description: self.description.clone(),
            created_at: self.created_at,
            group_count: self.groups.len(),
            sub_group_count: self.groups.iter().map(|g| g.sub_groups.len()).sum(),
        }
    }

    /// Replay the plan onto `dataset`, producing a fresh state.
    pub fn apply(&self, dataset: &Dataset, threshold: f64) -> Result<GroupingState> {
        let resolved = plan_columns(self, dataset)?;

        let mut state = GroupingState::new(&dataset.id, dataset.len() as u64, GenerationMethod::NamedPlan);
        for group in &self.groups {
            let gi = state.push_group(&group.name);
            state.main_groups[gi].enabled = group.enabled;
            for sub in &group.sub_groups {
                state.push_sub_group(gi, &sub.name);
            }
        }
        state.metadata.plan_applied = Some(self.id.clone());

        let index = AliasIndex::new(self);
        let mut merger = ChunkMerger::from_state(state, dataset.len(), threshold);
        let mut cache: HashMap<(String, Option<String>, String), Placement> = HashMap::new();

        for row in 0..dataset.len() {
            let main = resolved.main.map(|c| label_key(dataset.cell(row, c)));
            let sub = resolved.sub.map(|c| label_key(dataset.cell(row, c)));
            let item = label_key(&resolved.item_name(dataset, row));
            let key = (main.unwrap_or_default(), sub, item);

            let placement = match cache.get(&key) {
                Some(p) => *p,
                None => {
                    let p = index.place(&key.0, key.1.as_deref(), &key.2, threshold);
                    let p = match p {
                        PlanPlacement::SubGroup(gi, si) => Placement::SubGroup(gi, si),
                        PlanPlacement::GroupUngrouped(gi) => {
                            Placement::SubGroup(gi, merger.state_mut().ensure_ungrouped_sub_group(gi))
                        }
                        PlanPlacement::Ungrouped => Placement::Ungrouped,
                    };
                    cache.insert(key, p);
                    p
                }
            };
            merger.place_row(row, placement);
        }

        merger.set_label_columns(dataset, &resolved);
        let state = merger.finish(dataset, &resolved);
        log::info!(
            "[NamedPlan] Applied '{}' to '{}': {} grouped / {} ungrouped rows",
            self.name,
            dataset.id,
            state.validation.counts.grouped_records,
            state.validation.counts.ungrouped_records
        );
        Ok(state)
    }
}

enum PlanPlacement {
    SubGroup(usize, usize),
    GroupUngrouped(usize),
    Ungrouped,
}

/// Exact-alias lookups for replay. Earlier groups win on alias collisions.
struct AliasIndex<'a> {
    plan: &'a NamedPlan,
    main: HashMap<String, usize>,
    sub: Vec<HashMap<String, usize>>,
    items: HashMap<String, (usize, usize)>,
}

impl<'a> AliasIndex<'a> {
    fn new(plan: &'a NamedPlan) -> Self {
        let mut main = HashMap::new();
        let mut sub = Vec::with_capacity(plan.groups.len());
        let mut items = HashMap::new();

        for (gi, group) in plan.groups.iter().enumerate() {
            for alias in &group.aliases {
                main.entry(label_key(alias)).or_insert(gi);
            }
            let mut subs = HashMap::new();
            for (si, sg) in group.sub_groups.iter().enumerate() {
                for alias in &sg.aliases {
                    subs.entry(label_key(alias)).or_insert(si);
                    items.entry(label_key(alias)).or_insert((gi, si));
                }
            }
            sub.push(subs);
        }
        Self { plan, main, sub, items }
    }

    fn main_group(&self, hint: &str, threshold: f64) -> Option<usize> {
        if hint.is_empty() {
            return None;
        }
        if let Some(&gi) = self.main.get(hint) {
            return Some(gi);
        }
        let names = self.plan.groups.iter().map(|g| g.name.as_str());
        best_match(hint, names, threshold).map(|m| m.index)
    }

    fn sub_group(&self, gi: usize, hint: &str, threshold: f64) -> Option<usize> {
        if hint.is_empty() {
            return None;
        }
        if let Some(&si) = self.sub[gi].get(hint) {
            return Some(si);
        }
        let names = self.plan.groups[gi].sub_groups.iter().map(|sg| sg.name.as_str());
        best_match(hint, names, threshold).map(|m| m.index)
    }

    /// Sub-groups in the plan are pushed first, so plan indices are state
    /// indices.
    fn place(&self, main: &str, sub: Option<&str>, item: &str, threshold: f64) -> PlanPlacement {
        match self.main_group(main, threshold) {
            Some(gi) => {
                let sub_hint = sub.unwrap_or(item);
                match self.sub_group(gi, sub_hint, threshold) {
                    Some(si) => PlanPlacement::SubGroup(gi, si),
                    None => PlanPlacement::GroupUngrouped(gi),
                }
            }
            None => match self.items.get(item) {
                Some(&(gi, si)) => PlanPlacement::SubGroup(gi, si),
                None => PlanPlacement::Ungrouped,
            },
        }
    }
}

/// Label columns for replaying `plan` onto `dataset`. Columns the dataset
/// lacks are ignored and inferred instead.
pub fn plan_columns(plan: &NamedPlan, dataset: &Dataset) -> Result<ResolvedColumns> {
    let known = |c: &Option<String>| c.clone().filter(|c| dataset.column_index(c).is_some());
    dataset.resolve_columns(Some(&ColumnRoles {
        main_group_column: known(&plan.main_column),
        sub_group_column: known(&plan.sub_column),
        ..Default::default()
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::GroupingPipeline;
    use crate::{ColumnClassifier, GenerationConfig, GroupingConfig};
    use std::sync::Arc;

    fn dataset(id: &str, rows: &[[&str; 3]]) -> Dataset {
        Dataset::new(
            id,
            vec!["Item".into(), "Dept".into(), "Kind".into()],
            rows.iter()
                .map(|r| r.iter().map(|s| s.to_string()).collect())
                .collect(),
        )
    }

    fn configured(ds: &Dataset) -> GroupingState {
        GroupingPipeline::new(GroupingConfig::default(), Arc::new(ColumnClassifier))
            .run_configured(
                ds,
                &GenerationConfig {
                    use_main_groups: true,
                    main_group_column: Some("Dept".into()),
                    sub_group_column: Some("Kind".into()),
                },
            )
            .unwrap()
    }

    fn source() -> Dataset {
        dataset(
            "source",
            &[
                ["Apple", "Produce", "Fruit"],
                ["Carrot", "Produce", "Veg"],
                ["Milk", "Dairy", "Drinks"],
            ],
        )
    }

    #[test]
    fn test_capture_aliases() {
        let state = configured(&source());
        let plan = NamedPlan::from_state(&state, " Weekly ", Some("shop layout")).unwrap();
        assert_eq!(plan.name, "Weekly");
        assert_eq!(plan.version, PLAN_VERSION);
        assert_eq!(plan.main_column.as_deref(), Some("Dept"));
        assert_eq!(plan.groups.len(), 2);

        let produce = &plan.groups[0];
        assert_eq!(produce.aliases, vec!["Produce"]);
        assert_eq!(produce.sub_groups[0].aliases, vec!["Fruit", "Apple"]);
        assert_eq!(plan.summary().sub_group_count, 3);
    }

    #[test]
    fn test_blank_plan_name() {
        let state = configured(&source());
        assert!(matches!(
            NamedPlan::from_state(&state, "  ", None),
            Err(GroupingError::InvalidName(_))
        ));
    }

    #[test]
    fn test_replay_onto_new_dataset() {
        let mut state = configured(&source());
        state.main_groups[1].enabled = false;
        let plan = NamedPlan::from_state(&state, "Weekly", None).unwrap();

        let target = dataset(
            "target",
            &[
                ["Pear", "produce", "fruits"],
                ["Leek", "Produce", "Herbs"],
                ["Bolt", "Hardware", "Fixings"],
            ],
        );
        let replayed = plan.apply(&target, 0.6).unwrap();

        assert_eq!(replayed.metadata.method, GenerationMethod::NamedPlan);
        assert_eq!(replayed.main_groups.len(), 2);
        let produce = &replayed.main_groups[0];
        assert_eq!(produce.sub_groups[0].name, "Fruit");
        assert_eq!(produce.sub_groups[0].item_count, 1);
        // "Herbs" matches no sub-group of Produce
        let ungrouped = &produce.sub_groups[produce.ungrouped_index().unwrap()];
        assert_eq!(ungrouped.items[0].name, "Leek");

        // Dairy is recreated empty and stays disabled
        let dairy = &replayed.main_groups[1];
        assert_eq!(dairy.total_items, 0);
        assert!(!dairy.enabled);

        assert_eq!(replayed.ungrouped.item_count, 1);
        assert!(replayed.validation.is_valid);
    }

    #[test]
    fn test_replay_without_label_columns_uses_item_names() {
        let plan = NamedPlan::from_state(&configured(&source()), "Weekly", None).unwrap();
        let bare = Dataset::new(
            "bare",
            vec!["Product".into()],
            vec![vec!["Milk".into()], vec!["Apple".into()], vec!["Rock".into()]],
        );
        let columns = plan_columns(&plan, &bare).unwrap();
        assert_eq!(columns.main, None);

        let replayed = plan.apply(&bare, 0.6).unwrap();
        assert_eq!(replayed.main_groups[0].sub_groups[0].items[0].name, "Apple");
        assert_eq!(replayed.main_groups[1].sub_groups[0].items[0].name, "Milk");
        assert_eq!(replayed.ungrouped.item_count, 1);
    }
}
