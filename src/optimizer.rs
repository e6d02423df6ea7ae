//! Size-bounded encoding of grouping states for the record store.
//!
//! The store rejects records above a fixed size. When a state's encoding is
//! too large the optimizer degrades fidelity step by step until it fits:
//! 1. drop the original row data from every item
//! 2. cap every bucket's materialized items at each preview limit in turn
//!
//! Capped items are folded into the bucket's elided aggregate, so counts stay
//! exact at every level.

use crate::{
    Elided, GroupingError, GroupingState, Item, OptimizationLevel, Result, StorageConfig,
};

/// An encoded state ready to be written, plus the state it encodes.
#[derive(Debug, Clone)]
pub struct OptimizedRecord {
    pub state: GroupingState,
    pub bytes: Vec<u8>,
    /// Size of the unoptimized encoding
    pub original_size: usize,
}

impl OptimizedRecord {
    pub fn level(&self) -> OptimizationLevel {
        self.state.metadata.optimization
    }

    pub fn size(&self) -> usize {
        self.bytes.len()
    }
}

/// Encode a state as a persisted blob.
pub fn encode_state(state: &GroupingState) -> Result<Vec<u8>> {
    Ok(rmp_serde::to_vec_named(state)?)
}

/// Decode a persisted blob.
pub fn decode_state(bytes: &[u8]) -> Result<GroupingState> {
    Ok(rmp_serde::from_slice(bytes)?)
}

/// Move items past `cap` into the elided aggregate.
fn cap_bucket(items: &mut Vec<Item>, elided: &mut Elided, cap: usize) {
    if items.len() <= cap {
        return;
    }
    for item in items.drain(cap..) {
        elided.items += 1;
        elided.rows += item.repetition;
    }
}

fn strip_row_data(state: &mut GroupingState) {
    for group in &mut state.main_groups {
        for sub in &mut group.sub_groups {
            for item in &mut sub.items {
                item.row_data = None;
            }
        }
    }
    for item in &mut state.ungrouped.items {
        item.row_data = None;
    }
}

fn cap_previews(state: &mut GroupingState, cap: usize) {
    for group in &mut state.main_groups {
        for sub in &mut group.sub_groups {
            cap_bucket(&mut sub.items, &mut sub.elided, cap);
        }
    }
    cap_bucket(&mut state.ungrouped.items, &mut state.ungrouped.elided, cap);
}

/// Fits grouping states under the store's per-record ceiling.
#[derive(Debug, Clone, Default)]
pub struct StorageOptimizer {
    config: StorageConfig,
}

impl StorageOptimizer {
    pub fn new(config: StorageConfig) -> Self {
        Self { config }
    }

    pub fn limit(&self) -> usize {
        self.config.max_record_bytes
    }

    /// Encode `state`, degrading it as far as needed to fit the ceiling.
    ///
    /// Fails with [`GroupingError::CapacityExceeded`] when even the smallest
    /// preview does not fit.
    pub fn optimize(&self, state: &GroupingState) -> Result<OptimizedRecord> {
        let limit = self.limit();
        let bytes = encode_state(state)?;
        let original_size = bytes.len();
        if original_size <= limit {
            return Ok(OptimizedRecord {
                state: state.clone(),
                bytes,
                original_size,
            });
        }

        log::warn!(
            "[StorageOptimizer] State for '{}' is {} bytes, limit {}; optimizing",
            state.dataset_id,
            original_size,
            limit
        );

        let mut reduced = state.clone();
        strip_row_data(&mut reduced);
        reduced.metadata.optimization = OptimizationLevel::RowDataDropped;
        reduced.refresh();
        let mut bytes = encode_state(&reduced)?;

        for &cap in &self.config.preview_limits {
            if bytes.len() <= limit {
                break;
            }
            cap_previews(&mut reduced, cap);
            reduced.metadata.optimization = OptimizationLevel::PreviewCapped(cap);
            reduced.refresh();
            bytes = encode_state(&reduced)?;
        }

        if bytes.len() > limit {
            log::warn!(
                "[StorageOptimizer] State for '{}' still {} bytes after optimization",
                state.dataset_id,
                bytes.len()
            );
            return Err(GroupingError::CapacityExceeded {
                size: bytes.len(),
                limit,
            });
        }

        log::info!(
            "[StorageOptimizer] State for '{}' reduced from {} to {} bytes ({:?})",
            state.dataset_id,
            original_size,
            bytes.len(),
            reduced.metadata.optimization
        );
        Ok(OptimizedRecord {
            state: reduced,
            bytes,
            original_size,
        })
    }
}
