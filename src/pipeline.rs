//! Grouping pipeline: chunk, sample, extract, merge, assign.
//!
//! Extraction is the only expensive step and is independent per chunk, so
//! with the `parallel` feature chunks are classified with rayon. Merging is a
//! sequential reduction in chunk order, which keeps the result deterministic
//! regardless of how extraction was scheduled.

use std::sync::Arc;
use std::time::Instant;

use crate::dataset::{ColumnRoles, Dataset, GenerationConfig, ResolvedColumns};
use crate::extractor::{ChunkOutcome, Classifier, LabelTriple, PatternExtractor};
use crate::matching::clean_label;
use crate::merger::{ChunkMerger, RowHint};
use crate::sampler::{draw_samples, ChunkSample};
use crate::{
    GenerationMethod, GroupingConfig, GroupingError, GroupingState, Result,
    DEFAULT_SUB_GROUP_NAME,
};

/// Produces a complete grouping state from a dataset.
pub struct GroupingPipeline {
    config: GroupingConfig,
    extractor: PatternExtractor,
}

impl GroupingPipeline {
    pub fn new(config: GroupingConfig, classifier: Arc<dyn Classifier>) -> Self {
        let extractor = PatternExtractor::new(classifier, config.extractor_timeout_ms);
        Self { config, extractor }
    }

    pub fn config(&self) -> &GroupingConfig {
        &self.config
    }

    /// Chunked, classifier-driven generation.
    ///
    /// Always returns a state covering every row: chunks whose classifier call
    /// fails are routed to the ungrouped bucket. Errors are only returned for
    /// bad column roles.
    pub fn run(&self, dataset: &Dataset, roles: Option<&ColumnRoles>) -> Result<GroupingState> {
        let start = Instant::now();
        let resolved = dataset.resolve_columns(roles)?;
        let samples: Vec<Arc<ChunkSample>> = draw_samples(dataset, resolved, &self.config)
            .into_iter()
            .map(Arc::new)
            .collect();

        log::info!(
            "[GroupingPipeline] Dataset '{}': {} rows in {} chunks (classifier: {})",
            dataset.id,
            dataset.len(),
            samples.len(),
            self.extractor.classifier_name()
        );

        let outcomes = self.extract_all(&samples);

        let mut merger = ChunkMerger::new(
            &dataset.id,
            dataset.len(),
            GenerationMethod::ChunkedClassification,
            self.config.label_match_threshold,
        );
        for (sample, outcome) in samples.iter().zip(outcomes) {
            match outcome.result {
                Ok(triples) => {
                    merger.merge_chunk(&triples, dataset, &resolved);
                }
                Err(_) => merger.fail_chunk(outcome.chunk_index, sample.rows.clone()),
            }
        }

        self.assign_remaining(&mut merger, dataset, &resolved);
        merger.set_label_columns(dataset, &resolved);
        let state = merger.finish(dataset, &resolved);

        log::info!(
            "[GroupingPipeline] Dataset '{}': {} main groups, {} sub-groups, {} grouped / {} ungrouped rows, {} failed chunks in {:?}",
            dataset.id,
            state.main_groups.len(),
            state.sub_group_count(),
            state.validation.counts.grouped_records,
            state.validation.counts.ungrouped_records,
            state.metadata.failed_chunks.len(),
            start.elapsed()
        );
        Ok(state)
    }

    #[cfg(feature = "parallel")]
    fn extract_all(&self, samples: &[Arc<ChunkSample>]) -> Vec<ChunkOutcome> {
        use rayon::prelude::*;

        samples
            .par_iter()
            .map(|sample| self.extractor.extract(Arc::clone(sample)))
            .collect()
    }

    #[cfg(not(feature = "parallel"))]
    fn extract_all(&self, samples: &[Arc<ChunkSample>]) -> Vec<ChunkOutcome> {
        samples
            .iter()
            .map(|sample| self.extractor.extract(Arc::clone(sample)))
            .collect()
    }

    fn assign_remaining(&self, merger: &mut ChunkMerger, dataset: &Dataset, roles: &ResolvedColumns) {
        for row in 0..dataset.len() {
            merger.place_by_hint(row, RowHint::for_row(dataset, roles, row));
        }
    }

    /// Generation from user-selected columns, applied to every row.
    ///
    /// With `use_main_groups` the main column defines the main groups and the
    /// optional sub column the sub-groups. Without it the sub column alone
    /// defines the groups, each with a single `All Items` sub-group.
    pub fn run_configured(&self, dataset: &Dataset, config: &GenerationConfig) -> Result<GroupingState> {
        let (main_column, sub_column) = match (
            config.use_main_groups,
            config.main_group_column.as_deref(),
            config.sub_group_column.as_deref(),
        ) {
            (true, Some(main), sub) => (main, sub),
            (_, _, Some(sub)) => (sub, None),
            _ => {
                return Err(GroupingError::Dataset(
                    "configured generation needs a main or sub group column".to_string(),
                ))
            }
        };

        let roles = ColumnRoles {
            main_group_column: Some(main_column.to_string()),
            sub_group_column: sub_column.map(str::to_string),
            ..Default::default()
        };
        let resolved = dataset.resolve_columns(Some(&roles))?;
        let (Some(main_col), sub_col) = (resolved.main, resolved.sub) else {
            return Err(GroupingError::Dataset(format!("Unknown column '{}'", main_column)));
        };

        let mut merger = ChunkMerger::new(
            &dataset.id,
            dataset.len(),
            GenerationMethod::ConfiguredColumns,
            self.config.label_match_threshold,
        );

        for row in 0..dataset.len() {
            let main = dataset.cell(row, main_col).trim();
            if main.is_empty() {
                continue;
            }
            let sub_label = match sub_col {
                Some(c) => {
                    let sub = dataset.cell(row, c).trim();
                    (!sub.is_empty()).then(|| clean_label(sub))
                }
                None => Some(DEFAULT_SUB_GROUP_NAME.to_string()),
            };
            let triple = LabelTriple {
                row,
                main_label: clean_label(main),
                sub_label,
                item_name: resolved.item_name(dataset, row),
            };
            merger.place_triple(&triple, None);
        }

        merger.set_label_columns(dataset, &resolved);
        let state = merger.finish(dataset, &resolved);
        log::info!(
            "[GroupingPipeline] Configured grouping of '{}' by '{}'{}: {} main groups, {} ungrouped rows",
            dataset.id,
            main_column,
            sub_column.map(|s| format!(" / '{}'", s)).unwrap_or_default(),
            state.main_groups.len(),
            state.validation.counts.ungrouped_records
        );
        Ok(state)
    }
}
