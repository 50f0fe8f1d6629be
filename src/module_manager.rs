//! Module lifecycle manager: registers modules with their dependency
//! edges and drives `initialize/start/stop/dispose` in topological order
//! (Kahn's algorithm), rolling back on failure.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::warn;

use crate::error::HsiError;

pub type ModuleId = &'static str;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleStatus {
    Uninitialized,
    Initialized,
    Running,
    Stopped,
    Error,
}

/// The capability set every managed module exposes, replacing
/// inheritance with a small trait object surface.
#[async_trait]
pub trait Module: Send + Sync {
    async fn initialize(&self) -> Result<(), HsiError>;
    async fn start(&self) -> Result<(), HsiError>;
    async fn stop(&self) -> Result<(), HsiError>;
    async fn dispose(&self) -> Result<(), HsiError>;
}

struct ModuleEntry {
    module: Arc<dyn Module>,
    depends_on: Vec<ModuleId>,
    status: ModuleStatus,
}

/// Registers modules with `dependsOn` edges and runs lifecycle
/// transitions in dependency order: `start` runs dependencies first,
/// `stop` runs dependents first.
pub struct ModuleManager {
    entries: Mutex<HashMap<ModuleId, ModuleEntry>>,
}

impl Default for ModuleManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ModuleManager {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Registers a module. Rejects the registration if it would
    /// introduce a dependency cycle.
    pub async fn register(
        &self,
        id: ModuleId,
        module: Arc<dyn Module>,
        depends_on: Vec<ModuleId>,
    ) -> Result<(), HsiError> {
        let mut entries = self.entries.lock().await;
        entries.insert(
            id,
            ModuleEntry {
                module,
                depends_on,
                status: ModuleStatus::Uninitialized,
            },
        );
        if topological_order(&entries).is_err() {
            entries.remove(id);
            return Err(HsiError::InvalidConfig(format!(
                "registering module {id} would introduce a dependency cycle"
            )));
        }
        Ok(())
    }

    pub async fn status(&self, id: ModuleId) -> Option<ModuleStatus> {
        self.entries.lock().await.get(id).map(|e| e.status)
    }

    /// Initializes every registered module, dependencies first. On
    /// failure, already-started modules are stopped in reverse order and
    /// the error is returned.
    pub async fn initialize_all(&self) -> Result<(), HsiError> {
        self.run_forward(Lifecycle::Initialize).await
    }

    /// Starts every registered module, dependencies first. On failure,
    /// already-started modules are stopped in reverse order.
    pub async fn start_all(&self) -> Result<(), HsiError> {
        self.run_forward(Lifecycle::Start).await
    }

    /// Stops every registered module, dependents first (reverse of the
    /// start order).
    pub async fn stop_all(&self) -> Result<(), HsiError> {
        self.run_reverse(Lifecycle::Stop).await
    }

    pub async fn dispose_all(&self) -> Result<(), HsiError> {
        self.run_reverse(Lifecycle::Dispose).await
    }

    async fn run_forward(&self, op: Lifecycle) -> Result<(), HsiError> {
        let mut entries = self.entries.lock().await;
        let order = topological_order(&entries)?;
        let target = op.target_status();
        let mut completed: Vec<ModuleId> = Vec::new();

        for id in order {
            if entries.get(&id).map(|e| e.status) == Some(target) {
                continue;
            }
            let module = entries.get(&id).unwrap().module.clone();
            match op.run(&module).await {
                Ok(()) => {
                    entries.get_mut(&id).unwrap().status = target;
                    completed.push(id);
                }
                Err(e) => {
                    entries.get_mut(&id).unwrap().status = ModuleStatus::Error;
                    for rollback_id in completed.iter().rev() {
                        if let Some(entry) = entries.get_mut(rollback_id) {
                            if let Err(rollback_err) = entry.module.stop().await {
                                warn!(module = *rollback_id, error = %rollback_err, "rollback stop failed");
                            }
                            entry.status = ModuleStatus::Stopped;
                        }
                    }
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    async fn run_reverse(&self, op: Lifecycle) -> Result<(), HsiError> {
        let mut entries = self.entries.lock().await;
        let mut order = topological_order(&entries)?;
        order.reverse();
        let target = op.target_status();

        let mut first_err = None;
        for id in order {
            if entries.get(&id).map(|e| e.status) == Some(target) {
                continue;
            }
            let module = entries.get(&id).unwrap().module.clone();
            if let Err(e) = op.run(&module).await {
                warn!(module = id, error = %e, "module lifecycle transition failed");
                entries.get_mut(&id).unwrap().status = ModuleStatus::Error;
                if first_err.is_none() {
                    first_err = Some(e);
                }
                continue;
            }
            entries.get_mut(&id).unwrap().status = target;
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[derive(Clone, Copy)]
enum Lifecycle {
    Initialize,
    Start,
    Stop,
    Dispose,
}

impl Lifecycle {
    fn target_status(self) -> ModuleStatus {
        match self {
            Lifecycle::Initialize => ModuleStatus::Initialized,
            Lifecycle::Start => ModuleStatus::Running,
            Lifecycle::Stop | Lifecycle::Dispose => ModuleStatus::Stopped,
        }
    }

    async fn run(self, module: &Arc<dyn Module>) -> Result<(), HsiError> {
        match self {
            Lifecycle::Initialize => module.initialize().await,
            Lifecycle::Start => module.start().await,
            Lifecycle::Stop => module.stop().await,
            Lifecycle::Dispose => module.dispose().await,
        }
    }
}

/// Kahn's algorithm over `depends_on` edges: dependencies sort before
/// their dependents. Returns `Err` if a cycle is present.
fn topological_order(entries: &HashMap<ModuleId, ModuleEntry>) -> Result<Vec<ModuleId>, HsiError> {
    let mut in_degree: HashMap<ModuleId, usize> = HashMap::new();
    let mut dependents: HashMap<ModuleId, Vec<ModuleId>> = HashMap::new();

    for (&id, entry) in entries {
        in_degree.entry(id).or_insert(0);
        for &dep in &entry.depends_on {
            *in_degree.entry(id).or_insert(0) += 1;
            dependents.entry(dep).or_default().push(id);
        }
    }

    let mut queue: VecDeque<ModuleId> = in_degree
        .iter()
        .filter(|(_, &deg)| deg == 0)
        .map(|(&id, _)| id)
        .collect();
    let mut order = Vec::new();
    let mut visited: HashSet<ModuleId> = HashSet::new();

    while let Some(id) = queue.pop_front() {
        if !visited.insert(id) {
            continue;
        }
        order.push(id);
        if let Some(deps) = dependents.get(id) {
            for &dependent in deps {
                let degree = in_degree.get_mut(dependent).unwrap();
                *degree -= 1;
                if *degree == 0 {
                    queue.push_back(dependent);
                }
            }
        }
    }

    if order.len() != entries.len() {
        return Err(HsiError::InvalidConfig("module dependency graph has a cycle".into()));
    }
    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct RecordingModule {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
        fail_start: bool,
    }

    #[async_trait]
    impl Module for RecordingModule {
        async fn initialize(&self) -> Result<(), HsiError> {
            self.log.lock().await.push(format!("{}:init", self.name));
            Ok(())
        }
        async fn start(&self) -> Result<(), HsiError> {
            self.log.lock().await.push(format!("{}:start", self.name));
            if self.fail_start {
                return Err(HsiError::Fatal("boom".into()));
            }
            Ok(())
        }
        async fn stop(&self) -> Result<(), HsiError> {
            self.log.lock().await.push(format!("{}:stop", self.name));
            Ok(())
        }
        async fn dispose(&self) -> Result<(), HsiError> {
            self.log.lock().await.push(format!("{}:dispose", self.name));
            Ok(())
        }
    }

    #[tokio::test]
    async fn dependencies_start_before_dependents() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let manager = ModuleManager::new();
        manager
            .register(
                "consent",
                Arc::new(RecordingModule { name: "consent", log: log.clone(), fail_start: false }),
                vec![],
            )
            .await
            .unwrap();
        manager
            .register(
                "fusion",
                Arc::new(RecordingModule { name: "fusion", log: log.clone(), fail_start: false }),
                vec!["consent"],
            )
            .await
            .unwrap();

        manager.start_all().await.unwrap();
        let entries = log.lock().await;
        let consent_idx = entries.iter().position(|e| e == "consent:start").unwrap();
        let fusion_idx = entries.iter().position(|e| e == "fusion:start").unwrap();
        assert!(consent_idx < fusion_idx);
    }

    #[tokio::test]
    async fn cyclic_registration_is_rejected() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let manager = ModuleManager::new();
        manager
            .register("a", Arc::new(RecordingModule { name: "a", log: log.clone(), fail_start: false }), vec!["b"])
            .await
            .unwrap();
        let result = manager
            .register("b", Arc::new(RecordingModule { name: "b", log: log.clone(), fail_start: false }), vec!["a"])
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn failed_start_rolls_back_already_started_modules() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let manager = ModuleManager::new();
        manager
            .register("a", Arc::new(RecordingModule { name: "a", log: log.clone(), fail_start: false }), vec![])
            .await
            .unwrap();
        manager
            .register("b", Arc::new(RecordingModule { name: "b", log: log.clone(), fail_start: true }), vec!["a"])
            .await
            .unwrap();

        let result = manager.start_all().await;
        assert!(result.is_err());
        let entries = log.lock().await;
        assert!(entries.contains(&"a:start".to_string()));
        assert!(entries.contains(&"a:stop".to_string()));
    }

    #[tokio::test]
    async fn reentrant_calls_are_idempotent() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let calls = Arc::new(AtomicUsize::new(0));
        struct CountingModule {
            calls: Arc<AtomicUsize>,
        }
        #[async_trait]
        impl Module for CountingModule {
            async fn initialize(&self) -> Result<(), HsiError> {
                Ok(())
            }
            async fn start(&self) -> Result<(), HsiError> {
                self.calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            async fn stop(&self) -> Result<(), HsiError> {
                Ok(())
            }
            async fn dispose(&self) -> Result<(), HsiError> {
                Ok(())
            }
        }
        let _ = log;
        let manager = ModuleManager::new();
        manager
            .register("a", Arc::new(CountingModule { calls: calls.clone() }), vec![])
            .await
            .unwrap();
        manager.start_all().await.unwrap();
        manager.start_all().await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
