//! # Grouping Engine
//!
//! Stateful call surface over datasets, grouping states and named plans.
//!
//! ## Architecture
//!
//! The engine keeps:
//! - Registered datasets (shared, immutable)
//! - One slot per dataset holding the latest grouping state as an `Arc`
//!   snapshot, plus a writer lock serializing changes to that dataset
//! - A record store that receives every committed state
//!
//! Readers clone the snapshot `Arc` and never see a state mid-mutation.
//! Mutations run read-modify-write under the dataset's writer lock. Generation
//! runs without the lock and only takes it to swap the result in, so the
//! previous state stays readable while a new one is computed. Nothing is
//! swapped in until the store accepted it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use once_cell::sync::Lazy;

use crate::dataset::{ColumnRoles, Dataset, GenerationConfig};
use crate::extractor::{Classifier, ColumnClassifier};
use crate::finalize::{finalize_state, SavedFinalResults, StructuredResult};
use crate::mutation::{apply_action, Action, MutationRequest};
use crate::optimizer::{decode_state, StorageOptimizer};
use crate::pipeline::GroupingPipeline;
use crate::plan::{NamedPlan, PlanSummary};
use crate::store::{MemoryStore, StateStore};
use crate::{EngineConfig, GroupingError, GroupingState, Result};

// ============================================================================
// Core Types
// ============================================================================

/// Latest state of one dataset.
#[derive(Default)]
struct DatasetSlot {
    /// Held for the whole read-modify-write of a change
    writer: Mutex<()>,
    state: RwLock<Option<Arc<GroupingState>>>,
}

impl DatasetSlot {
    fn snapshot(&self) -> Result<Option<Arc<GroupingState>>> {
        Ok(self.state.read().map_err(|_| poisoned("state"))?.clone())
    }

    fn swap(&self, state: Arc<GroupingState>) -> Result<()> {
        *self.state.write().map_err(|_| poisoned("state"))? = Some(state);
        Ok(())
    }
}

fn poisoned(what: &str) -> GroupingError {
    GroupingError::Storage(format!("{} lock poisoned", what))
}

/// Engine statistics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineStats {
    pub dataset_count: u32,
    /// Datasets with a state held in memory
    pub cached_state_count: u32,
    pub plan_count: u32,
    pub store: String,
}

// ============================================================================
// Grouping Engine
// ============================================================================

pub struct GroupingEngine {
    config: EngineConfig,
    pipeline: GroupingPipeline,
    optimizer: StorageOptimizer,
    store: Arc<dyn StateStore>,
    datasets: RwLock<HashMap<String, Arc<Dataset>>>,
    slots: RwLock<HashMap<String, Arc<DatasetSlot>>>,
}

impl GroupingEngine {
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn StateStore>,
        classifier: Arc<dyn Classifier>,
    ) -> Self {
        log::info!(
            "[GroupingEngine] Created with {} store, {} classifier (chunk {}, sample {})",
            store.name(),
            classifier.name(),
            config.grouping.chunk_size,
            config.grouping.sample_size
        );
        Self {
            pipeline: GroupingPipeline::new(config.grouping.clone(), classifier),
            optimizer: StorageOptimizer::new(config.storage.clone()),
            config,
            store,
            datasets: RwLock::new(HashMap::new()),
            slots: RwLock::new(HashMap::new()),
        }
    }

    /// Engine with default configuration, an in-memory store and the
    /// column classifier.
    pub fn in_memory() -> Self {
        let config = EngineConfig::default();
        let store = Arc::new(MemoryStore::new(config.storage.max_record_bytes));
        Self::new(config, store, Arc::new(ColumnClassifier))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // ========================================================================
    // Datasets
    // ========================================================================

    /// Register (or replace) a dataset. Any existing state is kept until the
    /// next generation.
    pub fn register_dataset(&self, dataset: Dataset) -> Result<()> {
        let mut datasets = self.datasets.write().map_err(|_| poisoned("dataset"))?;
        log::info!(
            "[GroupingEngine] Registered dataset '{}' ({} rows, {} columns)",
            dataset.id,
            dataset.len(),
            dataset.columns.len()
        );
        datasets.insert(dataset.id.clone(), Arc::new(dataset));
        Ok(())
    }

    fn is_registered(&self, dataset_id: &str) -> Result<bool> {
        Ok(self
            .datasets
            .read()
            .map_err(|_| poisoned("dataset"))?
            .contains_key(dataset_id))
    }

    pub fn dataset(&self, dataset_id: &str) -> Result<Arc<Dataset>> {
        self.datasets
            .read()
            .map_err(|_| poisoned("dataset"))?
            .get(dataset_id)
            .cloned()
            .ok_or_else(|| GroupingError::UnknownDataset(dataset_id.to_string()))
    }

    fn slot(&self, dataset_id: &str) -> Result<Arc<DatasetSlot>> {
        if let Some(slot) = self.slots.read().map_err(|_| poisoned("slot"))?.get(dataset_id) {
            return Ok(Arc::clone(slot));
        }
        let mut slots = self.slots.write().map_err(|_| poisoned("slot"))?;
        Ok(Arc::clone(slots.entry(dataset_id.to_string()).or_default()))
    }

    // ========================================================================
    // Commit path
    // ========================================================================

    /// Optimize, persist and publish a state. Caller holds the writer lock.
    fn commit_locked(&self, slot: &DatasetSlot, state: GroupingState) -> Result<Arc<GroupingState>> {
        let record = self.optimizer.optimize(&state)?;
        self.store.put_state(&state.dataset_id, &record.bytes)?;

        let state = Arc::new(record.state);
        slot.swap(Arc::clone(&state))?;
        Ok(state)
    }

    /// Commit a freshly generated state.
    fn publish(&self, state: GroupingState) -> Result<Arc<GroupingState>> {
        let slot = self.slot(&state.dataset_id)?;
        let _writer = slot.writer.lock().map_err(|_| poisoned("writer"))?;
        self.commit_locked(&slot, state)
    }

    /// Current state, loading it from the store on first access.
    /// Caller holds the writer lock.
    fn load_locked(&self, dataset_id: &str, slot: &DatasetSlot) -> Result<Arc<GroupingState>> {
        if let Some(state) = slot.snapshot()? {
            return Ok(state);
        }
        let bytes = match self.store.get_state(dataset_id)? {
            Some(bytes) => bytes,
            None if self.is_registered(dataset_id)? => {
                return Err(GroupingError::NotGenerated(dataset_id.to_string()))
            }
            None => return Err(GroupingError::UnknownDataset(dataset_id.to_string())),
        };
        let state = Arc::new(decode_state(&bytes)?);
        slot.swap(Arc::clone(&state))?;
        log::info!(
            "[GroupingEngine] Loaded state for '{}' from {} store ({} bytes)",
            dataset_id,
            self.store.name(),
            bytes.len()
        );
        Ok(state)
    }

    // ========================================================================
    // Generation
    // ========================================================================

    /// Chunked, classifier-driven generation.
    pub fn generate(&self, dataset_id: &str, roles: Option<&ColumnRoles>) -> Result<Arc<GroupingState>> {
        let dataset = self.dataset(dataset_id)?;
        let state = self.pipeline.run(&dataset, roles)?;
        self.publish(state)
    }

    /// Generation from user-selected columns.
    pub fn apply_configured_generation(
        &self,
        dataset_id: &str,
        config: &GenerationConfig,
    ) -> Result<Arc<GroupingState>> {
        let dataset = self.dataset(dataset_id)?;
        let state = self.pipeline.run_configured(&dataset, config)?;
        self.publish(state)
    }

    // ========================================================================
    // State access and edits
    // ========================================================================

    /// Latest state of a dataset, with its embedded validation report.
    pub fn get_state(&self, dataset_id: &str) -> Result<Arc<GroupingState>> {
        let slot = self.slot(dataset_id)?;
        if let Some(state) = slot.snapshot()? {
            return Ok(state);
        }
        let _writer = slot.writer.lock().map_err(|_| poisoned("writer"))?;
        self.load_locked(dataset_id, &slot)
    }

    /// Apply one user edit. On any error the stored and visible state are
    /// unchanged.
    pub fn apply_mutation(&self, dataset_id: &str, action: &Action) -> Result<Arc<GroupingState>> {
        let start = Instant::now();
        let slot = self.slot(dataset_id)?;
        let _writer = slot.writer.lock().map_err(|_| poisoned("writer"))?;

        let current = self.load_locked(dataset_id, &slot)?;
        let next = apply_action(&current, action).map_err(|e| {
            log::warn!(
                "[GroupingEngine] Rejected {} on '{}': {}",
                action.kind(),
                dataset_id,
                e
            );
            e
        })?;
        let state = self.commit_locked(&slot, next)?;

        log::info!(
            "[GroupingEngine] Applied {} to '{}' in {:?}",
            action.kind(),
            dataset_id,
            start.elapsed()
        );
        Ok(state)
    }

    /// Apply an edit in its loosely-typed wire form.
    pub fn apply_request(&self, dataset_id: &str, request: MutationRequest) -> Result<Arc<GroupingState>> {
        let action = Action::try_from(request)?;
        self.apply_mutation(dataset_id, &action)
    }

    /// Export-ready results tree for the current state.
    pub fn finalize(&self, dataset_id: &str) -> Result<StructuredResult> {
        let state = self.get_state(dataset_id)?;
        Ok(finalize_state(&state))
    }

    /// Finalize the current state and save the result alongside that state,
    /// replacing any earlier save for the dataset.
    pub fn save_final_results(&self, dataset_id: &str) -> Result<SavedFinalResults> {
        let state = self.get_state(dataset_id)?;
        let saved = SavedFinalResults::capture(&state);
        let bytes = saved.encode()?;
        self.store.put_final_results(dataset_id, &bytes)?;
        log::info!(
            "[GroupingEngine] Saved final results for '{}': {} groups, {} items ({} bytes)",
            dataset_id,
            saved.results.total_groups,
            saved.results.total_items,
            bytes.len()
        );
        Ok(saved)
    }

    pub fn get_final_results(&self, dataset_id: &str) -> Result<SavedFinalResults> {
        let bytes = self
            .store
            .get_final_results(dataset_id)?
            .ok_or_else(|| GroupingError::NoFinalResults(dataset_id.to_string()))?;
        SavedFinalResults::decode(&bytes)
    }

    /// Saved results if any, otherwise a fresh finalize of the current state.
    pub fn structured_results(&self, dataset_id: &str) -> Result<StructuredResult> {
        match self.store.get_final_results(dataset_id)? {
            Some(bytes) => Ok(SavedFinalResults::decode(&bytes)?.results),
            None => self.finalize(dataset_id),
        }
    }

    pub fn delete_final_results(&self, dataset_id: &str) -> Result<()> {
        if !self.store.delete_final_results(dataset_id)? {
            return Err(GroupingError::NoFinalResults(dataset_id.to_string()));
        }
        log::info!("[GroupingEngine] Deleted final results for '{}'", dataset_id);
        Ok(())
    }

    // ========================================================================
    // Named plans
    // ========================================================================

    /// Capture the label structure of a dataset's state as a new plan.
    pub fn save_named_plan(
        &self,
        dataset_id: &str,
        name: &str,
        description: Option<&str>,
    ) -> Result<NamedPlan> {
        let state = self.get_state(dataset_id)?;
        let plan = self.store.insert_plan(NamedPlan::from_state(&state, name, description)?)?;
        log::info!(
            "[GroupingEngine] Saved plan '{}' ({}) from '{}' with {} main groups",
            plan.name,
            plan.id,
            dataset_id,
            plan.groups.len()
        );
        Ok(plan)
    }

    /// Replay a saved plan onto a dataset, replacing its state.
    pub fn apply_named_plan(&self, dataset_id: &str, plan_id: &str) -> Result<Arc<GroupingState>> {
        let dataset = self.dataset(dataset_id)?;
        let plan = self.get_plan(plan_id)?;
        let state = plan.apply(&dataset, self.config.grouping.label_match_threshold)?;
        log::info!(
            "[GroupingEngine] Applied plan '{}' to '{}': {} grouped / {} ungrouped rows",
            plan.id,
            dataset_id,
            state.validation.counts.grouped_records,
            state.validation.counts.ungrouped_records
        );
        self.publish(state)
    }

    pub fn get_plan(&self, plan_id: &str) -> Result<NamedPlan> {
        self.store
            .get_plan(plan_id)?
            .ok_or_else(|| GroupingError::UnknownPlan(plan_id.to_string()))
    }

    pub fn list_plans(&self) -> Result<Vec<PlanSummary>> {
        self.store.list_plans()
    }

    pub fn delete_plan(&self, plan_id: &str) -> Result<()> {
        if !self.store.delete_plan(plan_id)? {
            return Err(GroupingError::UnknownPlan(plan_id.to_string()));
        }
        log::info!("[GroupingEngine] Deleted plan '{}'", plan_id);
        Ok(())
    }

    // ========================================================================
    // Statistics
    // ========================================================================

    pub fn stats(&self) -> Result<EngineStats> {
        let dataset_count = self.datasets.read().map_err(|_| poisoned("dataset"))?.len() as u32;
        let cached_state_count = self
            .slots
            .read()
            .map_err(|_| poisoned("slot"))?
            .values()
            .filter(|slot| matches!(slot.snapshot(), Ok(Some(_))))
            .count() as u32;

        Ok(EngineStats {
            dataset_count,
            cached_state_count,
            plan_count: self.store.list_plans()?.len() as u32,
            store: self.store.name().to_string(),
        })
    }
}

// ============================================================================
// Global Singleton
// ============================================================================

/// Process-wide engine instance for hosts that cannot thread one through.
pub static ENGINE: Lazy<RwLock<Option<Arc<GroupingEngine>>>> = Lazy::new(|| RwLock::new(None));

/// Install the global engine, replacing any previous one.
pub fn install_engine(engine: GroupingEngine) -> Arc<GroupingEngine> {
    let engine = Arc::new(engine);
    match ENGINE.write() {
        Ok(mut guard) => *guard = Some(Arc::clone(&engine)),
        Err(_) => log::warn!("[GroupingEngine] Global engine lock poisoned, not installed"),
    }
    engine
}

/// Run `f` against the global engine. Returns `None` if none is installed.
pub fn with_engine<F, R>(f: F) -> Option<R>
where
    F: FnOnce(&GroupingEngine) -> R,
{
    let engine = ENGINE.read().ok()?.clone()?;
    Some(f(&engine))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mutation::Destination;
    use crate::optimizer::encode_state;

    fn groceries() -> Dataset {
        Dataset::new(
            "groceries",
            vec!["Item".into(), "Category".into()],
            vec![
                vec!["Apple".into(), "Fruit".into()],
                vec!["Pear".into(), "Fruit".into()],
                vec!["Carrot".into(), "Veg".into()],
            ],
        )
    }

    fn engine() -> GroupingEngine {
        let engine = GroupingEngine::in_memory();
        engine.register_dataset(groceries()).unwrap();
        engine
    }

    #[test]
    fn test_unknown_dataset() {
        let engine = GroupingEngine::in_memory();
        assert!(matches!(
            engine.generate("missing", None),
            Err(GroupingError::UnknownDataset(_))
        ));
        assert!(matches!(
            engine.get_state("missing"),
            Err(GroupingError::UnknownDataset(_))
        ));
    }

    #[test]
    fn test_registered_but_not_generated() {
        let engine = engine();
        let err = engine.get_state("groceries").unwrap_err();
        assert!(matches!(err, GroupingError::NotGenerated(ref id) if id == "groceries"));
        assert!(err.is_input_error());
        assert!(matches!(
            engine.apply_mutation("groceries", &Action::AddMainGroup { name: "Bakery".into() }),
            Err(GroupingError::NotGenerated(_))
        ));
        assert!(matches!(engine.finalize("groceries"), Err(GroupingError::NotGenerated(_))));
    }

    #[test]
    fn test_finalize_current_state() {
        let engine = engine();
        engine.generate("groceries", None).unwrap();
        let result = engine.finalize("groceries").unwrap();
        assert_eq!(result.dataset_id, "groceries");
        assert_eq!(result.total_items, 3);
        assert_eq!(result.total_groups, 2);
    }

    #[test]
    fn test_final_results_lifecycle() {
        let engine = engine();
        engine.generate("groceries", None).unwrap();
        assert!(matches!(
            engine.get_final_results("groceries"),
            Err(GroupingError::NoFinalResults(_))
        ));

        let saved = engine.save_final_results("groceries").unwrap();
        assert_eq!(saved.results.total_items, 3);
        assert_eq!(*engine.get_state("groceries").unwrap(), saved.source_state);

        // Later edits do not touch the saved copy
        engine
            .apply_mutation("groceries", &Action::AddMainGroup { name: "Bakery".into() })
            .unwrap();
        let fetched = engine.get_final_results("groceries").unwrap();
        assert_eq!(fetched.source_state.main_groups.len(), 2);
        assert_eq!(fetched.results, saved.results);
        assert_eq!(engine.structured_results("groceries").unwrap(), saved.results);

        engine.delete_final_results("groceries").unwrap();
        assert!(matches!(
            engine.delete_final_results("groceries"),
            Err(GroupingError::NoFinalResults(_))
        ));
        // Falls back to the live state once the save is gone
        assert_eq!(engine.structured_results("groceries").unwrap().total_items, 3);
    }

    #[test]
    fn test_generate_then_get_state() {
        let engine = engine();
        let generated = engine.generate("groceries", None).unwrap();
        let fetched = engine.get_state("groceries").unwrap();
        assert!(Arc::ptr_eq(&generated, &fetched));
        assert_eq!(fetched.validation.counts.total_rows, 3);
    }

    #[test]
    fn test_failed_mutation_keeps_state() {
        let engine = engine();
        engine.generate("groceries", None).unwrap();
        let before = encode_state(&engine.get_state("groceries").unwrap()).unwrap();

        let result = engine.apply_mutation(
            "groceries",
            &Action::MoveItem {
                item_id: "item-1".into(),
                destination: Destination::SubGroup {
                    group_id: "mg-404".into(),
                    sub_group_id: "sg-404".into(),
                },
            },
        );
        assert!(matches!(result, Err(GroupingError::UnknownGroup(_))));

        let after = encode_state(&engine.get_state("groceries").unwrap()).unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn test_mutation_via_request() {
        let engine = engine();
        engine.generate("groceries", None).unwrap();
        let state = engine
            .apply_request(
                "groceries",
                MutationRequest {
                    action: "add_group".into(),
                    name: Some("Bakery".into()),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(state.main_groups.len(), 3);
        assert!(state.validation.is_valid);
    }

    #[test]
    fn test_state_reloads_from_store() {
        let store: Arc<dyn StateStore> = Arc::new(MemoryStore::default());
        let first = GroupingEngine::new(EngineConfig::default(), Arc::clone(&store), Arc::new(ColumnClassifier));
        first.register_dataset(groceries()).unwrap();
        let generated = first.generate("groceries", None).unwrap();

        let second = GroupingEngine::new(EngineConfig::default(), store, Arc::new(ColumnClassifier));
        let loaded = second.get_state("groceries").unwrap();
        assert_eq!(loaded.main_groups, generated.main_groups);
        // Edits work without re-registering the dataset
        let group_id = loaded.main_groups[0].id.clone();
        let toggled = second
            .apply_mutation("groceries", &Action::ToggleMainGroup { group_id, enabled: None })
            .unwrap();
        assert!(!toggled.main_groups[0].enabled);
    }

    #[test]
    fn test_plan_lifecycle() {
        let engine = engine();
        engine.generate("groceries", None).unwrap();
        let plan = engine.save_named_plan("groceries", "Weekly", None).unwrap();

        assert_eq!(engine.list_plans().unwrap().len(), 1);
        assert_eq!(engine.get_plan(&plan.id).unwrap().name, "Weekly");
        let replayed = engine.apply_named_plan("groceries", &plan.id).unwrap();
        assert_eq!(replayed.metadata.plan_applied.as_deref(), Some(plan.id.as_str()));

        engine.delete_plan(&plan.id).unwrap();
        assert!(matches!(engine.delete_plan(&plan.id), Err(GroupingError::UnknownPlan(_))));
        assert!(matches!(
            engine.apply_named_plan("groceries", &plan.id),
            Err(GroupingError::UnknownPlan(_))
        ));
    }

    #[test]
    fn test_stats() {
        let engine = engine();
        engine.generate("groceries", None).unwrap();
        let stats = engine.stats().unwrap();
        assert_eq!(stats.dataset_count, 1);
        assert_eq!(stats.cached_state_count, 1);
        assert_eq!(stats.plan_count, 0);
        assert_eq!(stats.store, "memory");
    }

    #[test]
    fn test_global_engine() {
        let engine = install_engine(engine());
        engine.generate("groceries", None).unwrap();
        let groups = with_engine(|e| e.get_state("groceries").map(|s| s.main_groups.len()));
        assert_eq!(groups.unwrap().unwrap(), 2);
    }
}
