//! Record store abstraction.
//!
//! The engine persists one encoded grouping state per dataset, one record
//! per named plan and at most one saved final results record per dataset. Stores enforce the per-record size ceiling themselves, so a
//! record that slips past the optimizer is still rejected rather than
//! truncated.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use crate::plan::{NamedPlan, PlanSummary};
use crate::{GroupingError, Result};

/// Backing store for grouping states and named plans.
pub trait StateStore: Send + Sync {
    /// Write the encoded state for a dataset, replacing any previous record.
    fn put_state(&self, dataset_id: &str, bytes: &[u8]) -> Result<()>;

    /// Read the encoded state for a dataset.
    fn get_state(&self, dataset_id: &str) -> Result<Option<Vec<u8>>>;

    /// Remove a dataset's state. Returns whether a record existed.
    fn delete_state(&self, dataset_id: &str) -> Result<bool>;

    /// Write the encoded final results for a dataset, replacing any previous record.
    fn put_final_results(&self, dataset_id: &str, bytes: &[u8]) -> Result<()>;

    fn get_final_results(&self, dataset_id: &str) -> Result<Option<Vec<u8>>>;

    /// Remove a dataset's saved final results. Returns whether a record existed.
    fn delete_final_results(&self, dataset_id: &str) -> Result<bool>;

    /// Save a new plan. The store assigns the id and returns the stored plan.
    fn insert_plan(&self, plan: NamedPlan) -> Result<NamedPlan>;

    fn get_plan(&self, plan_id: &str) -> Result<Option<NamedPlan>>;

    /// All plans, oldest first.
    fn list_plans(&self) -> Result<Vec<PlanSummary>>;

    fn delete_plan(&self, plan_id: &str) -> Result<bool>;

    /// Per-record ceiling in bytes.
    fn max_record_bytes(&self) -> usize;

    /// Short backend name used in logs.
    fn name(&self) -> &str;
}

/// Reject a record above the ceiling.
pub(crate) fn check_record_size(size: usize, limit: usize) -> Result<()> {
    if size > limit {
        return Err(GroupingError::CapacityExceeded { size, limit });
    }
    Ok(())
}

pub(crate) fn plan_id(seq: u64) -> String {
    format!("plan-{}", seq)
}

fn lock_error(what: &str) -> GroupingError {
    GroupingError::Storage(format!("{} lock poisoned", what))
}

/// Volatile store backed by hash maps.
pub struct MemoryStore {
    states: RwLock<HashMap<String, Vec<u8>>>,
    final_results: RwLock<HashMap<String, Vec<u8>>>,
    /// Keyed by insertion sequence so listings stay in save order
    plans: RwLock<BTreeMap<u64, NamedPlan>>,
    next_plan: AtomicU64,
    max_record_bytes: usize,
}

impl MemoryStore {
    pub fn new(max_record_bytes: usize) -> Self {
        Self {
            states: RwLock::new(HashMap::new()),
            final_results: RwLock::new(HashMap::new()),
            plans: RwLock::new(BTreeMap::new()),
            next_plan: AtomicU64::new(1),
            max_record_bytes,
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(crate::StorageConfig::default().max_record_bytes)
    }
}

impl StateStore for MemoryStore {
    fn put_state(&self, dataset_id: &str, bytes: &[u8]) -> Result<()> {
        check_record_size(bytes.len(), self.max_record_bytes)?;
        self.states
            .write()
            .map_err(|_| lock_error("state"))?
            .insert(dataset_id.to_string(), bytes.to_vec());
        Ok(())
    }

    fn get_state(&self, dataset_id: &str) -> Result<Option<Vec<u8>>> {
        Ok(self
            .states
            .read()
            .map_err(|_| lock_error("state"))?
            .get(dataset_id)
            .cloned())
    }

    fn delete_state(&self, dataset_id: &str) -> Result<bool> {
        Ok(self
            .states
            .write()
            .map_err(|_| lock_error("state"))?
            .remove(dataset_id)
            .is_some())
    }

    fn put_final_results(&self, dataset_id: &str, bytes: &[u8]) -> Result<()> {
        check_record_size(bytes.len(), self.max_record_bytes)?;
        self.final_results
            .write()
            .map_err(|_| lock_error("final results"))?
            .insert(dataset_id.to_string(), bytes.to_vec());
        Ok(())
    }

    fn get_final_results(&self, dataset_id: &str) -> Result<Option<Vec<u8>>> {
        Ok(self
            .final_results
            .read()
            .map_err(|_| lock_error("final results"))?
            .get(dataset_id)
            .cloned())
    }

    fn delete_final_results(&self, dataset_id: &str) -> Result<bool> {
        Ok(self
            .final_results
            .write()
            .map_err(|_| lock_error("final results"))?
            .remove(dataset_id)
            .is_some())
    }

    fn insert_plan(&self, mut plan: NamedPlan) -> Result<NamedPlan> {
        let size = rmp_serde::to_vec_named(&plan)?.len();
        check_record_size(size, self.max_record_bytes)?;

        let seq = self.next_plan.fetch_add(1, Ordering::SeqCst);
        plan.id = plan_id(seq);
        self.plans
            .write()
            .map_err(|_| lock_error("plan"))?
            .insert(seq, plan.clone());
        Ok(plan)
    }

    fn get_plan(&self, plan_id: &str) -> Result<Option<NamedPlan>> {
        Ok(self
            .plans
            .read()
            .map_err(|_| lock_error("plan"))?
            .values()
            .find(|p| p.id == plan_id)
            .cloned())
    }

    fn list_plans(&self) -> Result<Vec<PlanSummary>> {
        Ok(self
            .plans
            .read()
            .map_err(|_| lock_error("plan"))?
            .values()
            .map(NamedPlan::summary)
            .collect())
    }

    fn delete_plan(&self, plan_id: &str) -> Result<bool> {
        let mut plans = self.plans.write().map_err(|_| lock_error("plan"))?;
        let seq = plans
            .iter()
            .find(|(_, p)| p.id == plan_id)
            .map(|(seq, _)| *seq);
        Ok(seq.and_then(|s| plans.remove(&s)).is_some())
    }

    fn max_record_bytes(&self) -> usize {
        self.max_record_bytes
    }

    fn name(&self) -> &str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{GenerationMethod, GroupingState};

    fn plan(name: &str) -> NamedPlan {
        let mut state = GroupingState::new("ds", 0, GenerationMethod::ConfiguredColumns);
        let gi = state.push_group("Fruit");
        state.push_sub_group(gi, "Apples");
        NamedPlan::from_state(&state, name, None).unwrap()
    }

    #[test]
    fn test_state_records() {
        let store = MemoryStore::new(8);
        store.put_state("a", b"1234").unwrap();
        assert_eq!(store.get_state("a").unwrap(), Some(b"1234".to_vec()));
        assert_eq!(store.get_state("b").unwrap(), None);

        let err = store.put_state("a", b"123456789").unwrap_err();
        assert!(matches!(err, GroupingError::CapacityExceeded { size: 9, limit: 8 }));
        // Rejected write leaves the old record
        assert_eq!(store.get_state("a").unwrap(), Some(b"1234".to_vec()));

        assert!(store.delete_state("a").unwrap());
        assert!(!store.delete_state("a").unwrap());
    }

    #[test]
    fn test_final_results_are_separate_from_states() {
        let store = MemoryStore::new(8);
        store.put_state("a", b"state").unwrap();
        store.put_final_results("a", b"final").unwrap();
        assert_eq!(store.get_final_results("a").unwrap(), Some(b"final".to_vec()));

        assert!(matches!(
            store.put_final_results("a", b"123456789"),
            Err(GroupingError::CapacityExceeded { size: 9, limit: 8 })
        ));
        assert_eq!(store.get_final_results("a").unwrap(), Some(b"final".to_vec()));

        assert!(store.delete_final_results("a").unwrap());
        assert!(!store.delete_final_results("a").unwrap());
        assert_eq!(store.get_state("a").unwrap(), Some(b"state".to_vec()));
    }

    #[test]
    fn test_plans_get_sequential_ids() {
        let store = MemoryStore::default();
        let first = store.insert_plan(plan("First")).unwrap();
        let second = store.insert_plan(plan("Second")).unwrap();
        assert_eq!(first.id, "plan-1");
        assert_eq!(second.id, "plan-2");

        let listed: Vec<String> = store.list_plans().unwrap().into_iter().map(|p| p.name).collect();
        assert_eq!(listed, vec!["First", "Second"]);

        assert_eq!(store.get_plan("plan-2").unwrap().unwrap().name, "Second");
        assert!(store.delete_plan("plan-1").unwrap());
        assert!(store.get_plan("plan-1").unwrap().is_none());
        assert_eq!(store.list_plans().unwrap().len(), 1);
    }
}
