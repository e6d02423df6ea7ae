//! Fixed-size chunking and bounded per-chunk sampling.
//!
//! Chunks are always `chunk_size` rows (the last one may be shorter), so a
//! dataset no larger than one chunk is a single chunk. A chunk with no more
//! rows than `sample_size` is sampled whole; otherwise rows are taken at a
//! uniform stride from the start of the chunk. Sampling is deterministic.

use std::ops::Range;

use serde::{Deserialize, Serialize};

use crate::{Dataset, GroupingConfig, ResolvedColumns};

/// One sampled source row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleRow {
    /// Index of the row in the source dataset
    pub row: usize,
    pub values: Vec<String>,
}

/// The bounded sample handed to a classifier for one chunk.
#[derive(Debug, Clone)]
pub struct ChunkSample {
    pub chunk_index: usize,
    /// Source rows covered by the chunk
    pub rows: Range<usize>,
    pub columns: Vec<String>,
    /// Column roles resolved for the dataset
    pub roles: ResolvedColumns,
    pub sample: Vec<SampleRow>,
}

impl ChunkSample {
    /// Draw the sample for one chunk of `dataset`.
    pub fn draw(
        dataset: &Dataset,
        chunk_index: usize,
        rows: Range<usize>,
        roles: ResolvedColumns,
        sample_size: usize,
    ) -> Self {
        let sample = sample_indices(rows.clone(), sample_size)
            .into_iter()
            .map(|row| SampleRow {
                row,
                values: dataset.rows.get(row).cloned().unwrap_or_default(),
            })
            .collect();

        Self {
            chunk_index,
            rows,
            columns: dataset.columns.clone(),
            roles,
            sample,
        }
    }

    /// Value of a role column for a sampled row, or an empty string.
    pub fn value<'a>(&self, row: &'a SampleRow, column: Option<usize>) -> &'a str {
        column
            .and_then(|c| row.values.get(c))
            .map(|v| v.trim())
            .unwrap_or("")
    }
}

/// Partition `total_rows` into consecutive chunks of `chunk_size` rows.
pub fn chunk_ranges(total_rows: usize, chunk_size: usize) -> Vec<Range<usize>> {
    let chunk_size = chunk_size.max(1);
    (0..total_rows)
        .step_by(chunk_size)
        .map(|start| start..(start + chunk_size).min(total_rows))
        .collect()
}

/// Row indices sampled from a chunk, in ascending order.
pub fn sample_indices(rows: Range<usize>, sample_size: usize) -> Vec<usize> {
    let len = rows.len();
    if sample_size == 0 || len == 0 {
        return Vec::new();
    }
    if len <= sample_size {
        return rows.collect();
    }

    // Uniform sampling across the chunk
    let step = len / sample_size;
    (0..sample_size).map(|i| rows.start + i * step).collect()
}

/// Draw every chunk sample for a dataset.
pub fn draw_samples(
    dataset: &Dataset,
    roles: ResolvedColumns,
    config: &GroupingConfig,
) -> Vec<ChunkSample> {
    chunk_ranges(dataset.len(), config.chunk_size)
        .into_iter()
        .enumerate()
        .map(|(i, range)| ChunkSample::draw(dataset, i, range, roles, config.sample_size))
        .collect()
}
