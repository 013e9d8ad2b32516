//! Worker registry: persisted configuration plus live scheduling state.
//!
//! Every structural mutation (add, remove, activate, update) is written to
//! the workers file before the call returns. If the write fails the change
//! is rolled back in memory, so a crash can never revive a removed worker
//! or silently drop a new one.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::config::ScoreWeights;
use crate::error::RegistryError;
use crate::workers::model::{WorkerConfig, WorkerPatch, WorkerState, WorkerStatus};
use crate::workers::scoring::{self, Candidate};

/// On-disk layout of the workers file.
#[derive(Debug, Default, Serialize, Deserialize)]
struct WorkersFile<T> {
    #[serde(default = "Vec::new")]
    workers: Vec<T>,
}

/// A configuration entry rejected during load.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RejectedEntry {
    /// Position in the file's `workers` array.
    pub index: usize,
    /// The entry's id, when one could be read.
    pub id: Option<String>,
    pub reason: String,
}

/// Outcome of loading the workers file.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LoadReport {
    pub loaded: usize,
    pub rejected: Vec<RejectedEntry>,
}

struct WorkerEntry {
    config: WorkerConfig,
    state: WorkerState,
    order: u64,
}

impl WorkerEntry {
    fn candidate(&self) -> Candidate<'_> {
        Candidate {
            id: &self.config.id,
            priority: self.config.priority,
            current_load: self.state.current_load,
            max_concurrent: self.config.max_concurrent,
            is_active: self.config.is_active,
            session_verified: self.state.session_verified,
            remaining_credits: self.state.remaining_credits,
            models: &self.config.models,
            order: self.order,
        }
    }

    fn status(&self) -> WorkerStatus {
        WorkerStatus::from_parts(&self.config, &self.state)
    }
}

#[derive(Default)]
struct RegistryInner {
    workers: HashMap<String, WorkerEntry>,
    next_order: u64,
}

impl RegistryInner {
    fn insert(&mut self, config: WorkerConfig) {
        let order = self.next_order;
        self.next_order += 1;
        self.workers.insert(
            config.id.clone(),
            WorkerEntry {
                config,
                state: WorkerState::default(),
                order,
            },
        );
    }

    fn ordered(&self) -> Vec<&WorkerEntry> {
        let mut entries: Vec<&WorkerEntry> = self.workers.values().collect();
        entries.sort_by_key(|e| e.order);
        entries
    }

    fn entry_mut(&mut self, id: &str) -> Result<&mut WorkerEntry, RegistryError> {
        self.workers
            .get_mut(id)
            .ok_or_else(|| RegistryError::UnknownWorker { id: id.to_string() })
    }
}

/// In-process registry of worker agents.
pub struct WorkerRegistry {
    path: PathBuf,
    inner: RwLock<RegistryInner>,
}

impl WorkerRegistry {
    /// Empty registry persisted at `path`. Nothing is written until the
    /// first mutation.
    pub fn empty(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            inner: RwLock::new(RegistryInner::default()),
        }
    }

    /// Load the workers file. A missing file yields an empty registry;
    /// malformed entries are rejected individually.
    pub async fn load(path: impl Into<PathBuf>) -> Result<(Self, LoadReport), RegistryError> {
        let registry = Self::empty(path);
        let report = registry.reload().await?;
        Ok((registry, report))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Re-read the workers file, replacing every entry and all runtime state.
    pub async fn reload(&self) -> Result<LoadReport, RegistryError> {
        let (configs, report) = read_workers_file(&self.path).await?;

        let mut inner = self.inner.write().await;
        *inner = RegistryInner::default();
        for config in configs {
            inner.insert(config);
        }

        info!(
            path = %self.path.display(),
            loaded = report.loaded,
            rejected = report.rejected.len(),
            "Worker configuration loaded"
        );
        for rejected in &report.rejected {
            warn!(
                index = rejected.index,
                id = rejected.id.as_deref().unwrap_or("?"),
                reason = %rejected.reason,
                "Rejected worker entry"
            );
        }
        Ok(report)
    }

    // ── Structural mutations (persisted) ────────────────────────────────

    pub async fn add(&self, config: WorkerConfig) -> Result<WorkerStatus, RegistryError> {
        config.validate()?;
        let mut inner = self.inner.write().await;
        if inner.workers.contains_key(&config.id) {
            return Err(RegistryError::DuplicateWorker { id: config.id });
        }

        let id = config.id.clone();
        inner.insert(config);
        if let Err(e) = self.persist(&inner).await {
            inner.workers.remove(&id);
            return Err(e);
        }

        info!(worker_id = %id, "Worker added");
        Ok(inner.workers[&id].status())
    }

    /// Remove a worker. The caller is responsible for tearing its session
    /// down first.
    pub async fn remove(&self, id: &str) -> Result<WorkerConfig, RegistryError> {
        let mut inner = self.inner.write().await;
        let entry = inner
            .workers
            .remove(id)
            .ok_or_else(|| RegistryError::UnknownWorker { id: id.to_string() })?;

        if let Err(e) = self.persist(&inner).await {
            inner.workers.insert(id.to_string(), entry);
            return Err(e);
        }

        info!(worker_id = %id, "Worker removed");
        Ok(entry.config)
    }

    /// Toggle activation. Returns the previous flag.
    pub async fn set_active(&self, id: &str, active: bool) -> Result<bool, RegistryError> {
        let mut inner = self.inner.write().await;
        let entry = inner.entry_mut(id)?;
        let previous = entry.config.is_active;
        if previous == active {
            return Ok(previous);
        }
        entry.config.is_active = active;
        if !active {
            entry.state.session_verified = false;
        }

        if let Err(e) = self.persist(&inner).await {
            if let Ok(entry) = inner.entry_mut(id) {
                entry.config.is_active = previous;
            }
            return Err(e);
        }

        info!(worker_id = %id, active, "Worker activation changed");
        Ok(previous)
    }

    /// Apply a partial configuration update. Lowering capacity below the
    /// current load is allowed; the worker simply takes nothing new until
    /// its load drains.
    pub async fn update(&self, id: &str, patch: &WorkerPatch) -> Result<WorkerStatus, RegistryError> {
        let mut inner = self.inner.write().await;
        let entry = inner.entry_mut(id)?;
        let previous = entry.config.clone();

        let mut updated = previous.clone();
        patch.apply_to(&mut updated);
        updated.validate()?;
        if patch.changes_credential(&previous) {
            entry.state.session_verified = false;
            entry.state.remaining_credits = None;
        }
        entry.config = updated;

        if let Err(e) = self.persist(&inner).await {
            if let Ok(entry) = inner.entry_mut(id) {
                entry.config = previous;
            }
            return Err(e);
        }

        info!(worker_id = %id, "Worker updated");
        Ok(inner.workers[id].status())
    }

    // ── Scheduling state (memory only) ──────────────────────────────────

    /// Select the best eligible worker for `model` and take one of its
    /// slots in the same critical section.
    pub async fn reserve_best(&self, model: &str, weights: &ScoreWeights) -> Option<String> {
        let mut inner = self.inner.write().await;
        let picked = {
            let entries = inner.ordered();
            scoring::select(entries.iter().map(|e| e.candidate()), model, weights)
                .map(str::to_string)
        }?;
        let entry = inner.workers.get_mut(&picked)?;
        entry.state.current_load += 1;
        debug!(
            worker_id = %picked,
            load = entry.state.current_load,
            capacity = entry.config.max_concurrent,
            "Reserved worker slot"
        );
        Some(picked)
    }

    /// Give back one slot. Saturates at zero; unknown ids are ignored
    /// (the worker may have been removed while the job was running).
    pub async fn release(&self, id: &str) {
        let mut inner = self.inner.write().await;
        if let Some(entry) = inner.workers.get_mut(id) {
            entry.state.current_load = entry.state.current_load.saturating_sub(1);
            debug!(worker_id = %id, load = entry.state.current_load, "Released worker slot");
        }
    }

    /// Count already-running jobs against a worker after a restart.
    pub async fn seed_load(&self, id: &str, count: u32) {
        let mut inner = self.inner.write().await;
        if let Some(entry) = inner.workers.get_mut(id) {
            entry.state.current_load = count;
        }
    }

    pub async fn mark_verified(&self, id: &str, verified: bool) {
        let mut inner = self.inner.write().await;
        if let Some(entry) = inner.workers.get_mut(id) {
            if entry.state.session_verified != verified {
                info!(worker_id = %id, verified, "Worker session verification changed");
            }
            entry.state.session_verified = verified;
        }
    }

    pub async fn set_credits(&self, id: &str, credits: Option<u32>) {
        let mut inner = self.inner.write().await;
        if let Some(entry) = inner.workers.get_mut(id) {
            entry.state.remaining_credits = credits;
        }
    }

    /// Forget all live state: loads, verification and credits.
    pub async fn reset_runtime(&self) {
        let mut inner = self.inner.write().await;
        for entry in inner.workers.values_mut() {
            entry.state = WorkerState::default();
        }
    }

    // ── Queries ─────────────────────────────────────────────────────────

    pub async fn get(&self, id: &str) -> Option<WorkerConfig> {
        self.inner.read().await.workers.get(id).map(|e| e.config.clone())
    }

    pub async fn status(&self, id: &str) -> Option<WorkerStatus> {
        self.inner.read().await.workers.get(id).map(WorkerEntry::status)
    }

    /// All workers in insertion order.
    pub async fn snapshot(&self) -> Vec<WorkerStatus> {
        let inner = self.inner.read().await;
        inner.ordered().into_iter().map(WorkerEntry::status).collect()
    }

    /// Configurations of active workers, in insertion order.
    pub async fn active_configs(&self) -> Vec<WorkerConfig> {
        let inner = self.inner.read().await;
        inner
            .ordered()
            .into_iter()
            .filter(|e| e.config.is_active)
            .map(|e| e.config.clone())
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.workers.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    // ── Persistence ─────────────────────────────────────────────────────

    async fn persist(&self, inner: &RegistryInner) -> Result<(), RegistryError> {
        let file = WorkersFile {
            workers: inner
                .ordered()
                .into_iter()
                .map(|e| &e.config)
                .collect::<Vec<_>>(),
        };
        let json = serde_json::to_string_pretty(&file)
            .map_err(|e| RegistryError::Persist(format!("serialize: {e}")))?;
        write_atomic(&self.path, json.as_bytes()).await
    }
}

async fn read_workers_file(path: &Path) -> Result<(Vec<WorkerConfig>, LoadReport), RegistryError> {
    let raw = match tokio::fs::read_to_string(path).await {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            info!(path = %path.display(), "No workers file yet, starting with an empty registry");
            return Ok((Vec::new(), LoadReport::default()));
        }
        Err(e) => return Err(e.into()),
    };

    let file: WorkersFile<serde_json::Value> =
        serde_json::from_str(&raw).map_err(|e| RegistryError::Parse(e.to_string()))?;

    let mut report = LoadReport::default();
    let mut configs: Vec<WorkerConfig> = Vec::with_capacity(file.workers.len());

    for (index, value) in file.workers.into_iter().enumerate() {
        let id = value.get("id").and_then(|v| v.as_str()).map(str::to_string);
        let reject = |reason: String| RejectedEntry {
            index,
            id: id.clone(),
            reason,
        };

        let config: WorkerConfig = match serde_json::from_value(value) {
            Ok(config) => config,
            Err(e) => {
                report.rejected.push(reject(e.to_string()));
                continue;
            }
        };
        if let Err(e) = config.validate() {
            report.rejected.push(reject(e.to_string()));
            continue;
        }
        if configs.iter().any(|c| c.id == config.id) {
            report.rejected.push(reject("duplicate id".to_string()));
            continue;
        }
        configs.push(config);
    }

    report.loaded = configs.len();
    Ok((configs, report))
}

/// Write to a sibling temp file, then rename over the target.
async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), RegistryError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    tokio::fs::write(&tmp, bytes)
        .await
        .map_err(|e| RegistryError::Persist(format!("write {}: {e}", tmp.display())))?;
    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|e| RegistryError::Persist(format!("rename to {}: {e}", path.display())))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry_in(dir: &tempfile::TempDir) -> WorkerRegistry {
        WorkerRegistry::empty(dir.path().join("workers.json"))
    }

    #[tokio::test]
    async fn missing_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let (registry, report) = WorkerRegistry::load(dir.path().join("absent.json"))
            .await
            .unwrap();
        assert!(registry.is_empty().await);
        assert_eq!(report.loaded, 0);
        assert!(report.rejected.is_empty());
    }

    #[tokio::test]
    async fn malformed_entries_rejected_individually() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("workers.json");
        let json = r#"{"workers": [
            {"id": "good", "credential_ref": "+1000", "priority": 5},
            {"id": "bad-priority", "credential_ref": "+1001", "priority": 42},
            {"id": "no-credential", "priority": 3},
            {"id": "good", "credential_ref": "+1002", "priority": 4},
            "not even an object",
            {"id": "also-good", "credential_ref": "+1003", "priority": 9, "max_concurrent": 1}
        ]}"#;
        std::fs::write(&path, json).unwrap();

        let (registry, report) = WorkerRegistry::load(&path).await.unwrap();
        assert_eq!(report.loaded, 2);
        assert_eq!(report.rejected.len(), 4);
        assert_eq!(report.rejected[0].id.as_deref(), Some("bad-priority"));
        assert_eq!(report.rejected[2].reason, "duplicate id");
        assert_eq!(report.rejected[3].id, None);

        let ids: Vec<String> = registry.snapshot().await.into_iter().map(|w| w.id).collect();
        assert_eq!(ids, vec!["good", "also-good"]);
    }

    #[tokio::test]
    async fn unparsable_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("workers.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(
            WorkerRegistry::load(&path).await,
            Err(RegistryError::Parse(_))
        ));
    }

    #[tokio::test]
    async fn mutations_persist_before_returning() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry_in(&dir);

        registry.add(WorkerConfig::new("w1", "+1", 5)).await.unwrap();
        registry
            .add(WorkerConfig::new("w2", "+2", 9).with_capacity(1))
            .await
            .unwrap();
        registry.set_active("w1", false).await.unwrap();
        registry.remove("w2").await.unwrap();

        let (reloaded, report) = WorkerRegistry::load(registry.path()).await.unwrap();
        assert_eq!(report.loaded, 1);
        let w1 = reloaded.get("w1").await.unwrap();
        assert!(!w1.is_active);
        assert!(reloaded.get("w2").await.is_none());
    }

    #[tokio::test]
    async fn duplicate_and_unknown_ids_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry_in(&dir);
        registry.add(WorkerConfig::new("w1", "+1", 5)).await.unwrap();

        assert!(matches!(
            registry.add(WorkerConfig::new("w1", "+9", 5)).await,
            Err(RegistryError::DuplicateWorker { .. })
        ));
        assert!(matches!(
            registry.remove("nope").await,
            Err(RegistryError::UnknownWorker { .. })
        ));
        assert!(matches!(
            registry.set_active("nope", true).await,
            Err(RegistryError::UnknownWorker { .. })
        ));
    }

    #[tokio::test]
    async fn failed_persist_rolls_back() {
        let dir = tempfile::tempdir().unwrap();
        // A directory where the file should be makes the rename fail.
        let path = dir.path().join("workers.json");
        std::fs::create_dir(&path).unwrap();
        let registry = WorkerRegistry::empty(&path);

        assert!(registry.add(WorkerConfig::new("w1", "+1", 5)).await.is_err());
        assert!(registry.get("w1").await.is_none());
    }

    #[tokio::test]
    async fn reservation_respects_eligibility_and_capacity() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry_in(&dir);
        registry
            .add(WorkerConfig::new("w1", "+1", 5).with_capacity(1))
            .await
            .unwrap();
        let weights = ScoreWeights::default();

        // Not verified yet.
        assert_eq!(registry.reserve_best("m", &weights).await, None);

        registry.mark_verified("w1", true).await;
        assert_eq!(registry.reserve_best("m", &weights).await.as_deref(), Some("w1"));
        assert_eq!(registry.reserve_best("m", &weights).await, None);
        assert_eq!(registry.status("w1").await.unwrap().load, 1);

        registry.release("w1").await;
        registry.release("w1").await;
        assert_eq!(registry.status("w1").await.unwrap().load, 0);
        assert_eq!(registry.reserve_best("m", &weights).await.as_deref(), Some("w1"));
    }

    #[tokio::test]
    async fn scenario_priority_then_capacity() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry_in(&dir);
        registry
            .add(WorkerConfig::new("W1", "+1", 5).with_capacity(2))
            .await
            .unwrap();
        registry
            .add(WorkerConfig::new("W2", "+2", 9).with_capacity(1))
            .await
            .unwrap();
        registry.mark_verified("W1", true).await;
        registry.mark_verified("W2", true).await;
        let weights = ScoreWeights::default();

        assert_eq!(registry.reserve_best("m", &weights).await.as_deref(), Some("W2"));
        assert_eq!(registry.reserve_best("m", &weights).await.as_deref(), Some("W1"));
        assert_eq!(registry.reserve_best("m", &weights).await.as_deref(), Some("W1"));
        assert_eq!(registry.reserve_best("m", &weights).await, None);

        registry.release("W2").await;
        assert_eq!(registry.reserve_best("m", &weights).await.as_deref(), Some("W2"));
    }

    #[tokio::test]
    async fn deactivation_clears_verification() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry_in(&dir);
        registry.add(WorkerConfig::new("w1", "+1", 5)).await.unwrap();
        registry.mark_verified("w1", true).await;

        assert!(registry.set_active("w1", false).await.unwrap());
        let status = registry.status("w1").await.unwrap();
        assert!(!status.is_active);
        assert!(!status.verified);
    }

    #[tokio::test]
    async fn update_changes_config_and_drops_session_on_new_credential() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry_in(&dir);
        registry.add(WorkerConfig::new("w1", "+1", 5)).await.unwrap();
        registry.mark_verified("w1", true).await;
        registry.set_credits("w1", Some(40)).await;

        let patch = WorkerPatch {
            priority: Some(8),
            ..Default::default()
        };
        let status = registry.update("w1", &patch).await.unwrap();
        assert_eq!(status.priority, 8);
        assert!(status.verified);

        let patch = WorkerPatch {
            credential_ref: Some("+2".into()),
            ..Default::default()
        };
        let status = registry.update("w1", &patch).await.unwrap();
        assert!(!status.verified);
        assert_eq!(status.remaining_credits, None);

        let invalid = WorkerPatch {
            priority: Some(0),
            ..Default::default()
        };
        assert!(registry.update("w1", &invalid).await.is_err());
        assert_eq!(registry.get("w1").await.unwrap().priority, 8);
    }

    #[tokio::test]
    async fn reset_runtime_clears_loads() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry_in(&dir);
        registry.add(WorkerConfig::new("w1", "+1", 5)).await.unwrap();
        registry.mark_verified("w1", true).await;
        registry.seed_load("w1", 2).await;

        registry.reset_runtime().await;
        let status = registry.status("w1").await.unwrap();
        assert_eq!(status.load, 0);
        assert!(!status.verified);
    }
}
