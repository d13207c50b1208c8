use std::{collections::HashMap, sync::Arc};

use parking_lot::Mutex;
use tokio::sync::OwnedMutexGuard;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    config::AppConfig,
    operator::{Operator, OperatorEnv, Stopper},
};

/// Cancellation handle of the run currently owned by an operator.
#[derive(Clone)]
pub struct ActiveRun {
    pub token: CancellationToken,
    pub stopper: Stopper,
}

/// Registry entry: the operator behind its lifecycle lock plus the handle of
/// its live run, if any.
pub struct OperatorHandle {
    id: String,
    lifecycle: Arc<tokio::sync::Mutex<Operator>>,
    active: Mutex<Option<ActiveRun>>,
}

impl OperatorHandle {
    fn new(operator: Operator) -> Self {
        Self {
            id: operator.id().to_string(),
            lifecycle: Arc::new(tokio::sync::Mutex::new(operator)),
            active: Mutex::new(None),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Exclusive access to the lifecycle methods. `None` while another request
    /// or a run task holds it.
    pub fn try_acquire(&self) -> Option<OwnedMutexGuard<Operator>> {
        Arc::clone(&self.lifecycle).try_lock_owned().ok()
    }

    /// Waits for the lifecycle lock.
    pub async fn acquire(&self) -> OwnedMutexGuard<Operator> {
        Arc::clone(&self.lifecycle).lock_owned().await
    }

    pub fn arm(&self, run: ActiveRun) {
        let previous = self.active.lock().replace(run);
        if previous.is_some() {
            warn!(tasker_id = %self.id, "replaced a stale run handle");
        }
    }

    pub fn disarm(&self) -> Option<ActiveRun> {
        self.active.lock().take()
    }

    pub fn active_run(&self) -> Option<ActiveRun> {
        self.active.lock().clone()
    }

    pub fn is_running(&self) -> bool {
        self.active.lock().is_some()
    }
}

/// Id -> operator map. Every operation holds the lock for map access only.
#[derive(Default)]
pub struct OperatorRegistry {
    operators: Mutex<HashMap<String, Arc<OperatorHandle>>>,
}

impl OperatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// One operator per configured tasker.
    pub fn from_config(config: &AppConfig, env: Arc<OperatorEnv>) -> Self {
        let registry = Self::new();
        for profile in &config.taskers {
            let operator = Operator::new(profile.clone(), Arc::clone(&env));
            registry.add(operator);
        }
        registry
    }

    /// Inserts `operator` unless its id is taken; the existing entry wins.
    pub fn add(&self, operator: Operator) -> bool {
        let handle = Arc::new(OperatorHandle::new(operator));
        let id = handle.id.clone();
        let inserted = {
            let mut operators = self.operators.lock();
            if operators.contains_key(&id) {
                false
            } else {
                operators.insert(id.clone(), handle);
                true
            }
        };
        if inserted {
            debug!(tasker_id = %id, "operator registered");
        } else {
            warn!(tasker_id = %id, "operator id already registered");
        }
        inserted
    }

    pub fn remove(&self, id: &str) -> bool {
        let removed = self.operators.lock().remove(id).is_some();
        if removed {
            debug!(tasker_id = %id, "operator removed");
        }
        removed
    }

    pub fn get(&self, id: &str) -> Option<Arc<OperatorHandle>> {
        self.operators.lock().get(id).cloned()
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.operators.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn handles(&self) -> Vec<Arc<OperatorHandle>> {
        self.operators.lock().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.operators.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.operators.lock().is_empty()
    }
}
