use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use flowline_core::error::{FlowError, Result};
use flowline_core::traits::DefinitionStore;
use flowline_core::workflow::{WorkflowDefinition, WorkflowStatus};

use crate::graph::validate;

/// Workflow definitions and their activation lifecycle.
///
/// Lifecycle: `new` → `load` → serve → `close`. Reads come from an
/// in-memory cache; every mutation is written through to the store while
/// holding a per-definition lock.
///
/// Only one version of a definition exists. Nodes, edges and settings can
/// change only while the definition is a draft; once activated the graph
/// is frozen and changes need a new definition.
pub struct WorkflowRegistry {
    store: Arc<dyn DefinitionStore>,
    cache: RwLock<HashMap<String, Arc<WorkflowDefinition>>>,
    locks: std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>,
    closed: AtomicBool,
}

impl WorkflowRegistry {
    pub fn new(store: Arc<dyn DefinitionStore>) -> Self {
        Self {
            store,
            cache: RwLock::new(HashMap::new()),
            locks: std::sync::Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Populate the cache from the store. Returns the number of definitions.
    pub async fn load(&self) -> Result<usize> {
        let defs = self.store.list_definitions().await?;
        let mut cache = self.cache.write().await;
        cache.clear();
        for def in defs {
            cache.insert(def.id.clone(), Arc::new(def));
        }
        self.closed.store(false, Ordering::SeqCst);
        info!(count = cache.len(), "Workflow registry loaded");
        Ok(cache.len())
    }

    /// Drop the cache and refuse further calls until the next `load`.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.cache.write().await.clear();
        if let Ok(mut locks) = self.locks.lock() {
            locks.clear();
        }
        debug!("Workflow registry closed");
    }

    /// Register a new definition as a draft.
    pub async fn create(&self, mut def: WorkflowDefinition) -> Result<Arc<WorkflowDefinition>> {
        self.ensure_open()?;
        let lock = self.lock_for(&def.id)?;
        let _guard = lock.lock().await;

        if self.cache.read().await.contains_key(&def.id) {
            return Err(FlowError::AlreadyExists(def.id));
        }

        let now = Utc::now();
        def.status = WorkflowStatus::Draft;
        def.version = 1;
        def.created_at = now;
        def.updated_at = now;

        let def = self.persist(def).await?;
        info!(workflow_id = %def.id, "Workflow created");
        Ok(def)
    }

    pub async fn get(&self, id: &str) -> Result<Arc<WorkflowDefinition>> {
        self.ensure_open()?;
        self.cache
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| FlowError::WorkflowNotFound(id.to_string()))
    }

    /// All definitions, sorted by id, optionally filtered by status.
    pub async fn list(&self, status: Option<WorkflowStatus>) -> Result<Vec<Arc<WorkflowDefinition>>> {
        self.ensure_open()?;
        let mut defs: Vec<_> = self
            .cache
            .read()
            .await
            .values()
            .filter(|d| status.map_or(true, |s| d.status == s))
            .cloned()
            .collect();
        defs.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(defs)
    }

    /// Replace the content of a draft. Bumps the version.
    pub async fn update(&self, def: WorkflowDefinition) -> Result<Arc<WorkflowDefinition>> {
        self.ensure_open()?;
        let lock = self.lock_for(&def.id)?;
        let _guard = lock.lock().await;

        let current = self.get(&def.id).await?;
        if current.status != WorkflowStatus::Draft {
            return Err(transition(&current, "update"));
        }

        let next = WorkflowDefinition {
            status: WorkflowStatus::Draft,
            version: current.version + 1,
            created_at: current.created_at,
            updated_at: Utc::now(),
            ..def
        };
        let next = self.persist(next).await?;
        debug!(workflow_id = %next.id, version = next.version, "Workflow updated");
        Ok(next)
    }

    /// Validate and activate. Activating an active definition is a no-op.
    pub async fn activate(&self, id: &str) -> Result<Arc<WorkflowDefinition>> {
        self.ensure_open()?;
        let lock = self.lock_for(id)?;
        let _guard = lock.lock().await;

        let current = self.get(id).await?;
        match current.status {
            WorkflowStatus::Active => return Ok(current),
            WorkflowStatus::Archived => return Err(transition(&current, "activate")),
            WorkflowStatus::Draft | WorkflowStatus::Paused => {}
        }

        validate(&current)?;
        let def = self.set_status(&current, WorkflowStatus::Active).await?;
        info!(workflow_id = %id, version = def.version, "Workflow activated");
        Ok(def)
    }

    /// Stop admitting new runs. Runs already in flight continue.
    pub async fn pause(&self, id: &str) -> Result<Arc<WorkflowDefinition>> {
        self.ensure_open()?;
        let lock = self.lock_for(id)?;
        let _guard = lock.lock().await;

        let current = self.get(id).await?;
        match current.status {
            WorkflowStatus::Paused => Ok(current),
            WorkflowStatus::Active => {
                let def = self.set_status(&current, WorkflowStatus::Paused).await?;
                info!(workflow_id = %id, "Workflow paused");
                Ok(def)
            }
            WorkflowStatus::Draft | WorkflowStatus::Archived => Err(transition(&current, "pause")),
        }
    }

    /// Archive permanently.
    pub async fn archive(&self, id: &str) -> Result<Arc<WorkflowDefinition>> {
        self.ensure_open()?;
        let lock = self.lock_for(id)?;
        let _guard = lock.lock().await;

        let current = self.get(id).await?;
        if current.status == WorkflowStatus::Archived {
            return Ok(current);
        }
        let def = self.set_status(&current, WorkflowStatus::Archived).await?;
        info!(workflow_id = %id, "Workflow archived");
        Ok(def)
    }

    /// Import every `*.json` and `*.toml` definition in `dir`.
    ///
    /// New ids are created, existing drafts are updated, and definitions
    /// that already left draft are skipped. With `activate` set, imported
    /// drafts are activated as well. Returns the ids that were imported.
    pub async fn import_dir(&self, dir: &Path, activate: bool) -> Result<Vec<String>> {
        self.ensure_open()?;
        let mut paths: Vec<_> = std::fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| matches!(p.extension().and_then(|e| e.to_str()), Some("json" | "toml")))
            .collect();
        paths.sort();

        let mut imported = vec![];
        for path in paths {
            let def = read_definition(&path)?;
            let id = def.id.clone();

            match self.get(&id).await {
                Err(FlowError::WorkflowNotFound(_)) => {
                    self.create(def).await?;
                }
                Ok(existing) if existing.status == WorkflowStatus::Draft => {
                    self.update(def).await?;
                }
                Ok(existing) => {
                    warn!(
                        workflow_id = %id,
                        status = %existing.status,
                        path = %path.display(),
                        "Skipping import of a workflow that is no longer a draft"
                    );
                    continue;
                }
                Err(e) => return Err(e),
            }

            if activate {
                self.activate(&id).await?;
            }
            debug!(workflow_id = %id, path = %path.display(), "Workflow imported");
            imported.push(id);
        }
        Ok(imported)
    }

    async fn set_status(
        &self,
        current: &WorkflowDefinition,
        status: WorkflowStatus,
    ) -> Result<Arc<WorkflowDefinition>> {
        let mut next = current.clone();
        next.status = status;
        next.updated_at = Utc::now();
        self.persist(next).await
    }

    async fn persist(&self, def: WorkflowDefinition) -> Result<Arc<WorkflowDefinition>> {
        self.store.save_definition(&def).await?;
        let def = Arc::new(def);
        self.cache.write().await.insert(def.id.clone(), def.clone());
        Ok(def)
    }

    fn lock_for(&self, id: &str) -> Result<Arc<Mutex<()>>> {
        let mut locks = self
            .locks
            .lock()
            .map_err(|e| FlowError::Database(e.to_string()))?;
        Ok(locks.entry(id.to_string()).or_default().clone())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(FlowError::Config("workflow registry is closed".into()));
        }
        Ok(())
    }
}

fn transition(def: &WorkflowDefinition, action: &str) -> FlowError {
    FlowError::InvalidTransition {
        id: def.id.clone(),
        action: action.to_string(),
        status: def.status.to_string(),
    }
}

/// Parse a definition file by extension.
pub fn read_definition(path: &Path) -> Result<WorkflowDefinition> {
    let content = std::fs::read_to_string(path)?;
    match path.extension().and_then(|e| e.to_str()) {
        Some("toml") => toml::from_str(&content)
            .map_err(|e| FlowError::Config(format!("{}: {}", path.display(), e))),
        _ => Ok(serde_json::from_str(&content)?),
    }
}
