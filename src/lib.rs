//! # Row Grouper
//!
//! Chunked, AI-assisted hierarchical grouping of large tabular datasets.
//!
//! This library provides:
//! - A grouping pipeline that samples fixed-size chunks, asks a classifier for
//!   (main group, sub-group, item) labels, and folds the results into one
//!   globally consistent grouping covering every row
//! - A mutation engine for user edits that keeps every derived count exact
//! - A validator that re-checks the structural invariants from scratch
//! - A storage optimizer that keeps persisted states under a per-record ceiling
//!
//! ## Features
//!
//! - **`parallel`** - Extract chunks in parallel with rayon
//! - **`http`** - Enable the HTTP classifier for chat-completion endpoints
//! - **`persistence`** - Enable the SQLite record store
//! - **`full`** - Enable all features
//!
//! ## Quick Start
//!
//! ```rust
//! use row_grouper::{Dataset, GroupingEngine};
//!
//! let dataset = Dataset::new(
//!     "groceries",
//!     vec!["Item".into(), "Category".into()],
//!     vec![
//!         vec!["Apple".into(), "Fruit".into()],
//!         vec!["Apple".into(), "Fruit".into()],
//!         vec!["Carrot".into(), "Veg".into()],
//!     ],
//! );
//!
//! let engine = GroupingEngine::in_memory();
//! engine.register_dataset(dataset).unwrap();
//! let state = engine.generate("groceries", None).unwrap();
//!
//! assert_eq!(state.main_groups.len(), 2);
//! assert!(state.validation.is_valid);
//! ```

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// Unified error handling
pub mod error;
pub use error::{GroupingError, OptionExt, Result};

// Source tables and column roles
pub mod dataset;
pub use dataset::{ColumnRoles, Dataset, GenerationConfig, ResolvedColumns};

// Label similarity scoring
pub mod matching;
pub use matching::{clean_label, label_similarity, LabelMatch};

// Per-chunk row sampling
pub mod sampler;
pub use sampler::{ChunkSample, SampleRow};

// Classifier capability and timeout-bounded extraction
pub mod extractor;
pub use extractor::{
    ChunkOutcome, Classifier, ColumnClassifier, KeywordClassifier, LabelTriple, PatternExtractor,
};

// Chat-completion classifier (optional)
#[cfg(feature = "http")]
pub mod http;
#[cfg(feature = "http")]
pub use http::{HttpClassifier, HttpClassifierConfig};

// Running reduction of chunk results into a global grouping
pub mod merger;
pub use merger::ChunkMerger;

// Chunk → sample → extract → merge → assign orchestration
pub mod pipeline;
pub use pipeline::GroupingPipeline;

// User edits
pub mod mutation;
pub use mutation::{apply_action, Action, Destination, MutationRequest};

// Invariant checks
pub mod validation;
pub use validation::{validate, ValidationCounts, ValidationReport};

// Size-bounded persistence encoding
pub mod optimizer;
pub use optimizer::{OptimizedRecord, StorageOptimizer};

// Saved label structures
pub mod plan;
pub use plan::{NamedPlan, PlanGroup, PlanSubGroup, PlanSummary};

// Export-ready tree
pub mod finalize;
pub use finalize::{finalize_state, SavedFinalResults, StructuredResult};

// Record stores
pub mod store;
pub use store::{MemoryStore, StateStore};

#[cfg(feature = "persistence")]
pub mod persistence;
#[cfg(feature = "persistence")]
pub use persistence::SqliteStore;

// Engine call surface (per-dataset locking, singleton)
pub mod engine;
pub use engine::{install_engine, with_engine, EngineStats, GroupingEngine, ENGINE};

// ============================================================================
// Constants
// ============================================================================

/// Name given to a main group's auto-created ungrouped bucket.
pub const UNGROUPED_SUB_GROUP_NAME: &str = "Ungrouped Items";

/// Sub-group used when labels carry no sub-group information.
pub const DEFAULT_SUB_GROUP_NAME: &str = "All Items";

/// Sub-group created alongside a user-added main group.
pub const NEW_GROUP_SUB_GROUP_NAME: &str = "Default";

// ============================================================================
// Core Types
// ============================================================================

/// Scalar fields promoted out of the source row for display and statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromotedFields {
    pub price: f64,
    pub category: String,
    pub quantity: i64,
}

impl Default for PromotedFields {
    fn default() -> Self {
        Self {
            price: 0.0,
            category: "Unknown".to_string(),
            quantity: 1,
        }
    }
}

/// A deduplicated representative of one or more identical source rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    /// Stable identifier, derived from the first source row it represents
    pub id: String,
    /// Display name
    pub name: String,
    /// Promoted scalar fields
    pub fields: PromotedFields,
    /// Number of source rows this item represents (always >= 1)
    pub repetition: u64,
    /// Index of the first source row represented
    pub first_row: usize,
    /// Full original row (column -> value); dropped by the storage optimizer
    pub row_data: Option<BTreeMap<String, String>>,
}

impl Item {
    /// Identifier for the item whose first source row is `row`.
    pub fn id_for_row(row: usize) -> String {
        format!("item-{}", row)
    }
}

/// Aggregate of items that were dropped from a bucket's materialized preview.
///
/// Bucket counts include these rows, so they stay exact after truncation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Elided {
    /// Number of items not materialized
    pub items: u64,
    /// Sum of their repetition counts
    pub rows: u64,
}

impl Elided {
    pub fn is_empty(&self) -> bool {
        self.items == 0 && self.rows == 0
    }

    pub fn absorb(&mut self, other: Elided) {
        self.items += other.items;
        self.rows += other.rows;
    }
}

/// Sum of repetition counts over items plus elided rows.
pub fn bucket_rows(items: &[Item], elided: &Elided) -> u64 {
    items.iter().map(|i| i.repetition).sum::<u64>() + elided.rows
}

/// A named bucket of items inside exactly one main group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubGroup {
    pub id: String,
    pub name: String,
    pub items: Vec<Item>,
    pub elided: Elided,
    /// Derived: sum of item repetition counts (including elided rows)
    pub item_count: u64,
    /// True for the main group's distinguished ungrouped bucket
    pub is_ungrouped: bool,
}

impl SubGroup {
    pub fn new(id: String, name: String) -> Self {
        Self {
            id,
            name,
            items: Vec::new(),
            elided: Elided::default(),
            item_count: 0,
            is_ungrouped: false,
        }
    }

    /// Recompute the count from the materialized items and elided aggregate.
    pub fn derived_count(&self) -> u64 {
        bucket_rows(&self.items, &self.elided)
    }

    /// True when some items are only represented by the elided aggregate.
    pub fn is_truncated(&self) -> bool {
        self.elided.items > 0
    }

    /// True when the bucket represents no rows at all.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty() && self.elided.is_empty()
    }
}

/// A named, independently enable-able top-level bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MainGroup {
    pub id: String,
    pub name: String,
    pub enabled: bool,
    pub sub_groups: Vec<SubGroup>,
    /// Derived: sum over sub-group counts
    pub total_items: u64,
    /// Id of the ungrouped sub-group, recorded once it has been created
    pub ungrouped_sub_group_id: Option<String>,
}

impl MainGroup {
    pub fn new(id: String, name: String) -> Self {
        Self {
            id,
            name,
            enabled: true,
            sub_groups: Vec::new(),
            total_items: 0,
            ungrouped_sub_group_id: None,
        }
    }

    pub fn sub_group(&self, sub_group_id: &str) -> Option<&SubGroup> {
        self.sub_groups.iter().find(|sg| sg.id == sub_group_id)
    }

    pub fn sub_group_mut(&mut self, sub_group_id: &str) -> Option<&mut SubGroup> {
        self.sub_groups.iter_mut().find(|sg| sg.id == sub_group_id)
    }

    /// Index of the ungrouped sub-group, if it exists.
    pub fn ungrouped_index(&self) -> Option<usize> {
        self.sub_groups.iter().position(|sg| sg.is_ungrouped)
    }

    /// Sum of sub-group counts, recomputed from items.
    pub fn derived_count(&self) -> u64 {
        self.sub_groups.iter().map(|sg| sg.derived_count()).sum()
    }
}

/// Dataset-level container of items not assigned to any main group.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UngroupedBucket {
    pub items: Vec<Item>,
    pub elided: Elided,
    /// Derived: sum of item repetition counts (including elided rows)
    pub item_count: u64,
}

impl UngroupedBucket {
    pub fn derived_count(&self) -> u64 {
        bucket_rows(&self.items, &self.elided)
    }

    pub fn is_truncated(&self) -> bool {
        self.elided.items > 0
    }
}

/// How a grouping state was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GenerationMethod {
    /// Chunked sampling with classifier-proposed labels
    ChunkedClassification,
    /// Labels read from user-selected columns for every row
    ConfiguredColumns,
    /// Replay of a saved named plan
    NamedPlan,
}

/// Fidelity level applied by the storage optimizer before persisting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OptimizationLevel {
    /// Stored as generated
    Full,
    /// Original row data dropped from every item
    RowDataDropped,
    /// Row data dropped and previews capped to this many items per bucket
    PreviewCapped(usize),
}

/// Provenance and bookkeeping for a grouping state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateMetadata {
    pub method: GenerationMethod,
    pub chunks_processed: usize,
    /// Chunks whose classifier call failed or timed out
    pub failed_chunks: Vec<usize>,
    pub plan_applied: Option<String>,
    /// Column whose values became main group labels, if any
    pub main_column: Option<String>,
    /// Column whose values became sub-group labels, if any
    pub sub_column: Option<String>,
    pub optimization: OptimizationLevel,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl StateMetadata {
    pub fn new(method: GenerationMethod) -> Self {
        let now = Utc::now();
        Self {
            method,
            chunks_processed: 0,
            failed_chunks: Vec::new(),
            plan_applied: None,
            main_column: None,
            sub_column: None,
            optimization: OptimizationLevel::Full,
            created_at: now,
            updated_at: now,
        }
    }
}

/// The full grouping tree for one dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupingState {
    pub dataset_id: String,
    /// Row count of the source dataset
    pub total_rows: u64,
    pub main_groups: Vec<MainGroup>,
    pub ungrouped: UngroupedBucket,
    pub validation: ValidationReport,
    pub metadata: StateMetadata,
    /// Counter used to mint group ids
    pub next_id: u64,
}

/// Where an item currently lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemLocation {
    /// Main group index, sub-group index, item index
    SubGroup(usize, usize, usize),
    /// Index in the dataset-level ungrouped bucket
    Ungrouped(usize),
}

impl GroupingState {
    /// Create an empty state for a dataset of `total_rows` rows.
    pub fn new(dataset_id: &str, total_rows: u64, method: GenerationMethod) -> Self {
        Self {
            dataset_id: dataset_id.to_string(),
            total_rows,
            main_groups: Vec::new(),
            ungrouped: UngroupedBucket::default(),
            validation: ValidationReport::default(),
            metadata: StateMetadata::new(method),
            next_id: 1,
        }
    }

    /// Mint a fresh id with the given prefix (`mg`, `sg`).
    pub fn mint_id(&mut self, prefix: &str) -> String {
        let id = format!("{}-{}", prefix, self.next_id);
        self.next_id += 1;
        id
    }

    pub fn group(&self, group_id: &str) -> Option<&MainGroup> {
        self.main_groups.iter().find(|g| g.id == group_id)
    }

    pub fn group_mut(&mut self, group_id: &str) -> Option<&mut MainGroup> {
        self.main_groups.iter_mut().find(|g| g.id == group_id)
    }

    pub fn group_index(&self, group_id: &str) -> Option<usize> {
        self.main_groups.iter().position(|g| g.id == group_id)
    }

    /// Add a main group and return its index.
    pub fn push_group(&mut self, name: &str) -> usize {
        let id = self.mint_id("mg");
        self.main_groups.push(MainGroup::new(id, name.to_string()));
        self.main_groups.len() - 1
    }

    /// Add a sub-group to the main group at `group_idx` and return its index.
    pub fn push_sub_group(&mut self, group_idx: usize, name: &str) -> usize {
        let id = self.mint_id("sg");
        let group = &mut self.main_groups[group_idx];
        group.sub_groups.push(SubGroup::new(id, name.to_string()));
        group.sub_groups.len() - 1
    }

    /// Index of the main group's ungrouped sub-group, creating it if needed.
    pub fn ensure_ungrouped_sub_group(&mut self, group_idx: usize) -> usize {
        if let Some(idx) = self.main_groups[group_idx].ungrouped_index() {
            return idx;
        }
        let idx = self.push_sub_group(group_idx, UNGROUPED_SUB_GROUP_NAME);
        let group = &mut self.main_groups[group_idx];
        group.sub_groups[idx].is_ungrouped = true;
        group.ungrouped_sub_group_id = Some(group.sub_groups[idx].id.clone());
        idx
    }

    /// Locate an item by id anywhere in the state.
    pub fn locate_item(&self, item_id: &str) -> Option<ItemLocation> {
        for (gi, group) in self.main_groups.iter().enumerate() {
            for (si, sub) in group.sub_groups.iter().enumerate() {
                if let Some(ii) = sub.items.iter().position(|i| i.id == item_id) {
                    return Some(ItemLocation::SubGroup(gi, si, ii));
                }
            }
        }
        self.ungrouped
            .items
            .iter()
            .position(|i| i.id == item_id)
            .map(ItemLocation::Ungrouped)
    }

    /// Detach an item from wherever it lives.
    pub fn take_item(&mut self, location: ItemLocation) -> Item {
        match location {
            ItemLocation::SubGroup(gi, si, ii) => {
                self.main_groups[gi].sub_groups[si].items.remove(ii)
            }
            ItemLocation::Ungrouped(ii) => self.ungrouped.items.remove(ii),
        }
    }

    /// Recompute every derived count bottom-up.
    pub fn recompute_counts(&mut self) {
        for group in &mut self.main_groups {
            for sub in &mut group.sub_groups {
                sub.item_count = sub.derived_count();
            }
            group.total_items = group.sub_groups.iter().map(|sg| sg.item_count).sum();
        }
        self.ungrouped.item_count = self.ungrouped.derived_count();
    }

    /// Rows represented by main groups.
    pub fn grouped_rows(&self) -> u64 {
        self.main_groups.iter().map(|g| g.derived_count()).sum()
    }

    /// Total sub-group count across all main groups.
    pub fn sub_group_count(&self) -> usize {
        self.main_groups.iter().map(|g| g.sub_groups.len()).sum()
    }

    /// Iterate every materialized item.
    pub fn items(&self) -> impl Iterator<Item = &Item> {
        self.main_groups
            .iter()
            .flat_map(|g| g.sub_groups.iter())
            .flat_map(|sg| sg.items.iter())
            .chain(self.ungrouped.items.iter())
    }

    /// Recompute counts, re-run the validator and embed its report.
    pub fn refresh(&mut self) {
        self.recompute_counts();
        self.validation = validate(self);
    }
}

// ============================================================================
// Configuration
// ============================================================================

/// Configuration for the grouping pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GroupingConfig {
    /// Rows per chunk.
    /// Default: 1000
    pub chunk_size: usize,

    /// Maximum rows sampled from each chunk for classification.
    /// Default: 100
    pub sample_size: usize,

    /// Minimum label similarity for two labels to be treated as the same group.
    /// Default: 0.6 (token Jaccard >= 0.75 for non-identical labels)
    pub label_match_threshold: f64,

    /// Maximum time a single classifier call may take before the chunk is
    /// treated as failed.
    /// Default: 30000 ms
    pub extractor_timeout_ms: u64,
}

impl Default for GroupingConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1000,
            sample_size: 100,
            label_match_threshold: 0.6,
            extractor_timeout_ms: 30_000,
        }
    }
}

/// Configuration for persisted record sizes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Per-record ceiling of the backing store in bytes.
    /// Default: 16 MiB minus 1 KiB
    pub max_record_bytes: usize,

    /// Successive per-bucket preview caps tried after dropping row data.
    /// Default: [50, 10]
    pub preview_limits: Vec<usize>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            max_record_bytes: 16 * 1024 * 1024 - 1024,
            preview_limits: vec![50, 10],
        }
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub grouping: GroupingConfig,
    pub storage: StorageConfig,
}

impl EngineConfig {
    /// Parse a configuration from JSON; missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}
