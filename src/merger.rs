//! Running reduction of per-chunk labels into one global grouping.
//!
//! The merger is the single writer of the state under construction. Chunks
//! are folded in chunk order; every label is matched against the groups that
//! already exist before a new group is created, so labels that differ only in
//! case, spacing or pluralization collapse into one group.
//!
//! Besides the group tree the merger keeps a hint index: for every row the
//! classifier labelled, the row's own column values (its "hints") are mapped
//! to where that row landed. Rows the classifier never saw are then placed by
//! looking their hints up in that index, then by label similarity.

use std::collections::HashMap;

use crate::dataset::{Dataset, ResolvedColumns};
use crate::extractor::LabelTriple;
use crate::matching::{best_match, label_key};
use crate::{
    GenerationMethod, GroupingState, Item, DEFAULT_SUB_GROUP_NAME,
};

/// Where a row ends up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Placement {
    /// Main group index, sub-group index
    SubGroup(usize, usize),
    /// Dataset-level ungrouped bucket
    Ungrouped,
}

/// Column values of a row used to place it without a classifier label.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RowHint {
    /// Normalized main hint (main column value, else the item name)
    pub main: String,
    /// Normalized sub hint (sub column value), if the dataset has one
    pub sub: Option<String>,
}

impl RowHint {
    pub fn for_row(dataset: &Dataset, roles: &ResolvedColumns, row: usize) -> Self {
        let main = match roles.main {
            Some(c) => label_key(dataset.cell(row, c)),
            None => label_key(&roles.item_name(dataset, row)),
        };
        let sub = roles.sub.map(|c| label_key(dataset.cell(row, c)));
        Self { main, sub }
    }
}

/// Folds chunk results into a [`GroupingState`].
pub struct ChunkMerger {
    state: GroupingState,
    threshold: f64,
    placements: Vec<Option<Placement>>,
    item_names: HashMap<usize, String>,
    main_cache: HashMap<String, usize>,
    sub_cache: HashMap<(usize, String), usize>,
    pair_hints: HashMap<RowHint, Placement>,
    main_hints: HashMap<String, Placement>,
    resolved: HashMap<RowHint, Placement>,
}

impl ChunkMerger {
    pub fn new(dataset_id: &str, total_rows: usize, method: GenerationMethod, threshold: f64) -> Self {
        Self {
            state: GroupingState::new(dataset_id, total_rows as u64, method),
            threshold,
            placements: vec![None; total_rows],
            item_names: HashMap::new(),
            main_cache: HashMap::new(),
            sub_cache: HashMap::new(),
            pair_hints: HashMap::new(),
            main_hints: HashMap::new(),
            resolved: HashMap::new(),
        }
    }

    /// Start from an already-built group tree (used for plan replay).
    pub fn from_state(state: GroupingState, total_rows: usize, threshold: f64) -> Self {
        let mut merger = Self::new(&state.dataset_id, total_rows, state.metadata.method, threshold);
        merger.state = state;
        merger
    }

    pub fn state(&self) -> &GroupingState {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut GroupingState {
        &mut self.state
    }

    /// Record a placement decided elsewhere.
    pub fn place_row(&mut self, row: usize, placement: Placement) {
        if let Some(slot) = self.placements.get_mut(row) {
            *slot = Some(placement);
        }
    }

    /// Record the column names the labels were read from.
    pub fn set_label_columns(&mut self, dataset: &Dataset, roles: &ResolvedColumns) {
        let name = |c: Option<usize>| c.and_then(|c| dataset.columns.get(c).cloned());
        self.state.metadata.main_column = name(roles.main);
        self.state.metadata.sub_column = name(roles.sub);
    }

    /// Index of the main group matching `label`, created if none matches.
    pub fn resolve_main(&mut self, label: &str) -> usize {
        let key = label_key(label);
        if let Some(&gi) = self.main_cache.get(&key) {
            return gi;
        }
        let names = self.state.main_groups.iter().map(|g| g.name.as_str());
        let gi = match best_match(label, names, self.threshold) {
            Some(m) => m.index,
            None => self.state.push_group(label.trim()),
        };
        self.main_cache.insert(key, gi);
        gi
    }

    /// Index of the sub-group of `gi` matching `label`, created if none
    /// matches. `None` resolves to the group's ungrouped sub-group.
    pub fn resolve_sub(&mut self, gi: usize, label: Option<&str>) -> usize {
        let Some(label) = label.filter(|l| !l.trim().is_empty()) else {
            return self.state.ensure_ungrouped_sub_group(gi);
        };
        let key = (gi, label_key(label));
        if let Some(&si) = self.sub_cache.get(&key) {
            return si;
        }
        let si = match self.match_sub(gi, label) {
            Some(si) => si,
            None => self.state.push_sub_group(gi, label.trim()),
        };
        self.sub_cache.insert(key, si);
        si
    }

    fn match_sub(&self, gi: usize, label: &str) -> Option<usize> {
        let subs = &self.state.main_groups[gi].sub_groups;
        let candidates: Vec<(usize, &str)> = subs
            .iter()
            .enumerate()
            .filter(|(_, sg)| !sg.is_ungrouped)
            .map(|(i, sg)| (i, sg.name.as_str()))
            .collect();
        best_match(label, candidates.iter().map(|(_, n)| *n), self.threshold)
            .map(|m| candidates[m.index].0)
    }

    /// Place one labelled row. Rows already placed keep their first placement.
    pub fn place_triple(&mut self, triple: &LabelTriple, hint: Option<RowHint>) -> Option<Placement> {
        if self.placements.get(triple.row).map_or(true, |p| p.is_some()) {
            return None;
        }
        let gi = self.resolve_main(&triple.main_label);
        let si = self.resolve_sub(gi, triple.sub_label.as_deref());
        let placement = Placement::SubGroup(gi, si);

        self.placements[triple.row] = Some(placement);
        self.item_names.insert(triple.row, triple.item_name.clone());

        if let Some(hint) = hint.filter(|h| !h.main.is_empty()) {
            self.main_hints.entry(hint.main.clone()).or_insert(placement);
            self.pair_hints.entry(hint).or_insert(placement);
        }
        Some(placement)
    }

    /// Fold the triples of one successful chunk.
    pub fn merge_chunk(
        &mut self,
        triples: &[LabelTriple],
        dataset: &Dataset,
        roles: &ResolvedColumns,
    ) -> usize {
        let mut placed = 0;
        for triple in triples {
            let hint = RowHint::for_row(dataset, roles, triple.row);
            if self.place_triple(triple, Some(hint)).is_some() {
                placed += 1;
            }
        }
        self.state.metadata.chunks_processed += 1;
        placed
    }

    /// Route every row of a failed chunk to the dataset-level bucket.
    pub fn fail_chunk(&mut self, chunk_index: usize, rows: std::ops::Range<usize>) {
        for row in rows {
            if let Some(slot) = self.placements.get_mut(row) {
                if slot.is_none() {
                    *slot = Some(Placement::Ungrouped);
                }
            }
        }
        self.state.metadata.chunks_processed += 1;
        self.state.metadata.failed_chunks.push(chunk_index);
    }

    /// Place a row the classifier did not label, using its hints.
    pub fn place_by_hint(&mut self, row: usize, hint: RowHint) -> Placement {
        if let Some(Some(p)) = self.placements.get(row) {
            return *p;
        }
        let placement = match self.resolved.get(&hint) {
            Some(p) => *p,
            None => {
                let p = self.lookup_hint(&hint);
                self.resolved.insert(hint, p);
                p
            }
        };
        if let Some(slot) = self.placements.get_mut(row) {
            *slot = Some(placement);
        }
        placement
    }

    fn lookup_hint(&mut self, hint: &RowHint) -> Placement {
        if hint.main.is_empty() {
            return Placement::Ungrouped;
        }
        if let Some(p) = self.pair_hints.get(hint) {
            return *p;
        }

        // Main group by exact hint, then by similarity to group names
        let (gi, default_sub) = match self.main_hints.get(&hint.main) {
            Some(Placement::SubGroup(gi, si)) => (*gi, Some(*si)),
            _ => {
                let names = self.state.main_groups.iter().map(|g| g.name.as_str());
                match best_match(&hint.main, names, self.threshold) {
                    Some(m) => (m.index, self.default_sub(m.index)),
                    None => return Placement::Ungrouped,
                }
            }
        };

        let si = match hint.sub.as_deref() {
            None => default_sub,
            Some("") => None,
            Some(sub) => self.match_sub(gi, sub),
        };
        let si = match si {
            Some(si) => si,
            None => self.state.ensure_ungrouped_sub_group(gi),
        };
        Placement::SubGroup(gi, si)
    }

    fn default_sub(&self, gi: usize) -> Option<usize> {
        let subs = &self.state.main_groups[gi].sub_groups;
        subs.iter()
            .position(|sg| sg.name == DEFAULT_SUB_GROUP_NAME)
            .or_else(|| {
                let regular: Vec<usize> = subs
                    .iter()
                    .enumerate()
                    .filter(|(_, sg)| !sg.is_ungrouped)
                    .map(|(i, _)| i)
                    .collect();
                (regular.len() == 1).then(|| regular[0])
            })
    }

    /// True once every row has a placement.
    pub fn is_complete(&self) -> bool {
        self.placements.iter().all(Option::is_some)
    }

    /// Materialize items for every row and return the finished state.
    ///
    /// Rows without a placement fall to the dataset-level bucket. Identical
    /// rows in the same bucket collapse into one item.
    pub fn finish(mut self, dataset: &Dataset, roles: &ResolvedColumns) -> GroupingState {
        let mut dedup: HashMap<(Placement, &[String]), usize> = HashMap::new();

        for row in 0..dataset.len() {
            let placement = self.placements[row].unwrap_or(Placement::Ungrouped);
            let values: &[String] = &dataset.rows[row];

            let bucket = match placement {
                Placement::SubGroup(gi, si) => &mut self.state.main_groups[gi].sub_groups[si].items,
                Placement::Ungrouped => &mut self.state.ungrouped.items,
            };

            if let Some(&idx) = dedup.get(&(placement, values)) {
                bucket[idx].repetition += 1;
                continue;
            }

            let name = self
                .item_names
                .remove(&row)
                .unwrap_or_else(|| roles.item_name(dataset, row));
            bucket.push(Item {
                id: Item::id_for_row(row),
                name,
                fields: roles.promoted(dataset, row),
                repetition: 1,
                first_row: row,
                row_data: Some(dataset.row_map(row)),
            });
            dedup.insert((placement, values), bucket.len() - 1);
        }

        self.state.refresh();
        self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn triple(row: usize, main: &str, sub: Option<&str>) -> LabelTriple {
        LabelTriple {
            row,
            main_label: main.to_string(),
            sub_label: sub.map(str::to_string),
            item_name: format!("Row {}", row),
        }
    }

    fn dataset(rows: Vec<[&str; 3]>) -> Dataset {
        Dataset::new(
            "ds",
            vec!["Item".into(), "Category".into(), "Type".into()],
            rows.into_iter()
                .map(|r| r.iter().map(|s| s.to_string()).collect())
                .collect(),
        )
    }

    fn roles() -> ResolvedColumns {
        ResolvedColumns {
            main: Some(1),
            sub: Some(2),
            item_name: Some(0),
            ..Default::default()
        }
    }

    #[test]
    fn test_labels_collapse_across_chunks() {
        let mut merger = ChunkMerger::new("ds", 3, GenerationMethod::ChunkedClassification, 0.6);
        let a = merger.resolve_main("Office Supplies");
        let b = merger.resolve_main("office supply");
        let c = merger.resolve_main("Furniture");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(merger.state().main_groups.len(), 2);
        assert_eq!(merger.state().main_groups[a].name, "Office Supplies");
    }

    #[test]
    fn test_missing_sub_label_uses_ungrouped_sub_group() {
        let mut merger = ChunkMerger::new("ds", 1, GenerationMethod::ChunkedClassification, 0.6);
        let placement = merger.place_triple(&triple(0, "Fruit", None), None).unwrap();
        let Placement::SubGroup(gi, si) = placement else {
            panic!("expected sub-group placement");
        };
        assert!(merger.state().main_groups[gi].sub_groups[si].is_ungrouped);
    }

    #[test]
    fn test_first_placement_wins() {
        let mut merger = ChunkMerger::new("ds", 1, GenerationMethod::ChunkedClassification, 0.6);
        assert!(merger.place_triple(&triple(0, "Fruit", Some("Apples")), None).is_some());
        assert!(merger.place_triple(&triple(0, "Veg", Some("Carrots")), None).is_none());
        assert_eq!(merger.state().main_groups.len(), 1);
    }

    #[test]
    fn test_unsampled_rows_follow_hints() {
        let ds = dataset(vec![
            ["Apple", "Fruit", "Pome"],
            ["Pear", "fruit", "pome"],
            ["Kiwi", "Fruits", "Berry"],
            ["Rock", "Minerals", "Igneous"],
            ["Plum", "Fruit", ""],
        ]);
        let roles = roles();
        let mut merger = ChunkMerger::new("ds", ds.len(), GenerationMethod::ChunkedClassification, 0.6);
        merger.merge_chunk(&[triple(0, "Fruit", Some("Pome"))], &ds, &roles);

        for row in 1..ds.len() {
            let hint = RowHint::for_row(&ds, &roles, row);
            merger.place_by_hint(row, hint);
        }
        assert!(merger.is_complete());

        let state = merger.finish(&ds, &roles);
        assert_eq!(state.main_groups.len(), 1);
        let fruit = &state.main_groups[0];
        let pome = fruit.sub_groups.iter().find(|sg| sg.name == "Pome").unwrap();
        assert_eq!(pome.item_count, 2);

        // "Berry" and the empty sub value land in the ungrouped sub-group
        let ungrouped = &fruit.sub_groups[fruit.ungrouped_index().unwrap()];
        assert_eq!(ungrouped.item_count, 2);

        // "Minerals" matches nothing
        assert_eq!(state.ungrouped.item_count, 1);
        assert_eq!(state.validation.counts.grouped_records + state.validation.counts.ungrouped_records, 5);
        assert!(state.validation.is_valid);
    }

    #[test]
    fn test_failed_chunk_rows_are_ungrouped() {
        let ds = dataset(vec![["Apple", "Fruit", "Pome"], ["Pear", "Fruit", "Pome"]]);
        let roles = roles();
        let mut merger = ChunkMerger::new("ds", 2, GenerationMethod::ChunkedClassification, 0.6);
        merger.fail_chunk(0, 0..2);

        let state = merger.finish(&ds, &roles);
        assert!(state.main_groups.is_empty());
        assert_eq!(state.ungrouped.item_count, 2);
        assert_eq!(state.metadata.failed_chunks, vec![0]);
    }

    #[test]
    fn test_identical_rows_collapse() {
        let ds = dataset(vec![
            ["Apple", "Fruit", "Pome"],
            ["Apple", "Fruit", "Pome"],
            ["Apple", "Fruit", "Pome"],
        ]);
        let roles = roles();
        let mut merger = ChunkMerger::new("ds", 3, GenerationMethod::ChunkedClassification, 0.6);
        merger.merge_chunk(&[triple(0, "Fruit", Some("Pome"))], &ds, &roles);
        for row in 1..3 {
            merger.place_by_hint(row, RowHint::for_row(&ds, &roles, row));
        }

        let state = merger.finish(&ds, &roles);
        let items = &state.main_groups[0].sub_groups[0].items;
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].repetition, 3);
        assert_eq!(items[0].id, "item-0");
        assert_eq!(state.main_groups[0].total_items, 3);
    }
}
