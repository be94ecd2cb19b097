//! StateStore: redb-backed state persistence for Cutover.
//!
//! Provides typed operations over task specification history, stable
//! version records, leases, pipeline runs and the local platform/registry
//! records. All values are JSON-serialized into redb's `&[u8]` value
//! columns. The store supports both on-disk and in-memory backends (the
//! latter for testing).

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

use cutover_core::{
    ArtifactReference, Digest, PipelineRun, ServiceKey, TaskSpecification, TaskVersion, epoch_secs,
    task_spec_key,
};

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

type JsonTable = TableDefinition<'static, &'static str, &'static [u8]>;

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        for table in [TASK_SPECS, STABLE_VERSIONS, LEASES, PIPELINE_RUNS, SERVICES, ARTIFACTS] {
            txn.open_table(table).map_err(map_err!(Table))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Generic helpers ────────────────────────────────────────────

    fn put_json<T: Serialize>(&self, def: JsonTable, key: &str, value: &T) -> StateResult<()> {
        let value = serde_json::to_vec(value).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(def).map_err(map_err!(Table))?;
            table
                .insert(key, value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn get_json<T: DeserializeOwned>(&self, def: JsonTable, key: &str) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(def).map_err(map_err!(Table))?;
        match table.get(key).map_err(map_err!(Read))? {
            Some(guard) => {
                let value: T =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// All values whose key starts with `prefix`, in key order.
    fn scan_json<T: DeserializeOwned>(&self, def: JsonTable, prefix: &str) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(def).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if key.value().starts_with(prefix) {
                let item: T =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                results.push(item);
            }
        }
        Ok(results)
    }

    // ── Task specifications ────────────────────────────────────────

    /// Register a new task specification version.
    ///
    /// Versions are append-only: registering a version that is not greater
    /// than every stored version of the family is a [`StateError::Conflict`].
    pub fn register_task_spec(&self, spec: &TaskSpecification) -> StateResult<()> {
        let key = spec.table_key();
        let prefix = format!("{}:", spec.family);
        let value = serde_json::to_vec(spec).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(TASK_SPECS).map_err(map_err!(Table))?;
            let mut latest: Option<TaskVersion> = None;
            for entry in table.iter().map_err(map_err!(Read))? {
                let (k, v) = entry.map_err(map_err!(Read))?;
                if k.value().starts_with(&prefix) {
                    let stored: TaskSpecification =
                        serde_json::from_slice(v.value()).map_err(map_err!(Deserialize))?;
                    latest = latest.max(Some(stored.version));
                }
            }
            if let Some(latest) = latest.filter(|v| *v >= spec.version) {
                return Err(StateError::Conflict(format!(
                    "{} v{} is not newer than stored v{latest}",
                    spec.family, spec.version
                )));
            }
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        info!(family = %spec.family, version = spec.version, "task specification registered");
        Ok(())
    }

    /// Get one version of a task family.
    pub fn get_task_spec(
        &self,
        family: &str,
        version: TaskVersion,
    ) -> StateResult<Option<TaskSpecification>> {
        self.get_json(TASK_SPECS, &task_spec_key(family, version))
    }

    /// All stored versions of a family, oldest first.
    pub fn list_task_specs(&self, family: &str) -> StateResult<Vec<TaskSpecification>> {
        self.scan_json(TASK_SPECS, &format!("{family}:"))
    }

    /// Highest stored version of a family.
    pub fn latest_task_version(&self, family: &str) -> StateResult<Option<TaskVersion>> {
        Ok(self
            .list_task_specs(family)?
            .iter()
            .map(|s| s.version)
            .max())
    }

    /// Delete the oldest versions of a family so at most `keep` remain.
    ///
    /// The newest version and `protect` (the last known-stable version)
    /// are never deleted. Returns the number of versions removed.
    pub fn prune_task_specs(
        &self,
        family: &str,
        keep: usize,
        protect: Option<TaskVersion>,
    ) -> StateResult<u32> {
        let versions: Vec<TaskVersion> = self
            .list_task_specs(family)?
            .iter()
            .map(|s| s.version)
            .collect();
        let keep = keep.max(1);
        if versions.len() <= keep {
            return Ok(0);
        }
        let doomed: Vec<TaskVersion> = versions[..versions.len() - keep]
            .iter()
            .copied()
            .filter(|v| Some(*v) != protect)
            .collect();

        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(TASK_SPECS).map_err(map_err!(Table))?;
            for version in &doomed {
                table
                    .remove(task_spec_key(family, *version).as_str())
                    .map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%family, removed = doomed.len(), "task specification history pruned");
        Ok(doomed.len() as u32)
    }

    // ── Stable versions ────────────────────────────────────────────

    /// Record the version a service last converged on.
    pub fn set_stable_version(
        &self,
        service: &ServiceKey,
        family: &str,
        version: TaskVersion,
    ) -> StateResult<()> {
        let record = StableRecord {
            family: family.to_string(),
            version,
            recorded_at: epoch_secs(),
        };
        self.put_json(STABLE_VERSIONS, &service.table_key(), &record)?;
        debug!(%service, version, "stable version recorded");
        Ok(())
    }

    pub fn get_stable_version(&self, service: &ServiceKey) -> StateResult<Option<StableRecord>> {
        self.get_json(STABLE_VERSIONS, &service.table_key())
    }

    /// The full task specification of the last known-stable version.
    pub fn get_stable_spec(&self, service: &ServiceKey) -> StateResult<Option<TaskSpecification>> {
        match self.get_stable_version(service)? {
            Some(record) => self.get_task_spec(&record.family, record.version),
            None => Ok(None),
        }
    }

    // ── Leases ─────────────────────────────────────────────────────

    /// Try to take the deployment lease for `key`.
    ///
    /// Succeeds when no lease exists, the existing lease has expired, or
    /// `owner` already holds it (which renews it). The check and the write
    /// happen in one write transaction.
    pub fn try_acquire_lease(
        &self,
        key: &str,
        owner: &str,
        ttl_ms: u64,
        now_ms: u64,
    ) -> StateResult<LeaseAttempt> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let attempt;
        {
            let mut table = txn.open_table(LEASES).map_err(map_err!(Table))?;
            let existing: Option<Lease> = match table.get(key).map_err(map_err!(Read))? {
                Some(guard) => {
                    Some(serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?)
                }
                None => None,
            };

            match existing {
                Some(held) if held.owner != owner && !held.is_expired(now_ms) => {
                    attempt = LeaseAttempt::Held(held);
                }
                prior => {
                    if let Some(stale) = prior.filter(|l| l.owner != owner) {
                        warn!(%key, previous_owner = %stale.owner, "taking over expired lease");
                    }
                    let lease = Lease {
                        key: key.to_string(),
                        owner: owner.to_string(),
                        acquired_at: now_ms,
                        expires_at: now_ms.saturating_add(ttl_ms),
                    };
                    let value = serde_json::to_vec(&lease).map_err(map_err!(Serialize))?;
                    table.insert(key, value.as_slice()).map_err(map_err!(Write))?;
                    attempt = LeaseAttempt::Acquired(lease);
                }
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(attempt)
    }

    /// Release a lease if `owner` holds it. Returns true if it was removed.
    pub fn release_lease(&self, key: &str, owner: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let released;
        {
            let mut table = txn.open_table(LEASES).map_err(map_err!(Table))?;
            let held: Option<Lease> = match table.get(key).map_err(map_err!(Read))? {
                Some(guard) => {
                    Some(serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?)
                }
                None => None,
            };
            released = match held {
                Some(lease) if lease.owner == owner => {
                    table.remove(key).map_err(map_err!(Write))?;
                    true
                }
                _ => false,
            };
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%key, %owner, released, "lease release");
        Ok(released)
    }

    /// Remove a lease regardless of owner (operator override).
    pub fn force_release_lease(&self, key: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(LEASES).map_err(map_err!(Table))?;
            existed = table.remove(key).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        warn!(%key, existed, "lease force-released");
        Ok(existed)
    }

    pub fn get_lease(&self, key: &str) -> StateResult<Option<Lease>> {
        self.get_json(LEASES, key)
    }

    pub fn list_leases(&self) -> StateResult<Vec<Lease>> {
        self.scan_json(LEASES, "")
    }

    // ── Pipeline runs ──────────────────────────────────────────────

    /// Append a pipeline run to the audit log. Existing records are never
    /// overwritten.
    pub fn append_pipeline_run(&self, run: &PipelineRun) -> StateResult<()> {
        let key = run.table_key();
        let value = serde_json::to_vec(run).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(PIPELINE_RUNS).map_err(map_err!(Table))?;
            if table.get(key.as_str()).map_err(map_err!(Read))?.is_some() {
                return Err(StateError::Conflict(format!("pipeline run {key} already recorded")));
            }
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%key, "pipeline run recorded");
        Ok(())
    }

    /// Runs for one service, oldest first.
    pub fn list_pipeline_runs(&self, service: &ServiceKey) -> StateResult<Vec<PipelineRun>> {
        self.scan_json(PIPELINE_RUNS, &format!("{}#", service.table_key()))
    }

    pub fn list_all_pipeline_runs(&self) -> StateResult<Vec<PipelineRun>> {
        self.scan_json(PIPELINE_RUNS, "")
    }

    // ── Local platform services ────────────────────────────────────

    pub fn put_service_record(&self, record: &LocalServiceRecord) -> StateResult<()> {
        self.put_json(SERVICES, &record.state.key.table_key(), record)
    }

    pub fn get_service_record(&self, key: &ServiceKey) -> StateResult<Option<LocalServiceRecord>> {
        self.get_json(SERVICES, &key.table_key())
    }

    pub fn list_service_records(&self) -> StateResult<Vec<LocalServiceRecord>> {
        self.scan_json(SERVICES, "")
    }

    // ── Local registry artifacts ───────────────────────────────────

    /// Record an artifact pushed under `repository`. Re-pushing a tag moves it.
    pub fn put_artifact(&self, repository: &str, artifact: &ArtifactReference) -> StateResult<()> {
        let key = format!("{repository}:{}", artifact.tag);
        self.put_json(ARTIFACTS, &key, artifact)?;
        debug!(%key, digest = %artifact.digest, "artifact recorded");
        Ok(())
    }

    pub fn get_artifact(&self, repository: &str, tag: &str) -> StateResult<Option<ArtifactReference>> {
        self.get_json(ARTIFACTS, &format!("{repository}:{tag}"))
    }

    pub fn find_artifact_by_digest(
        &self,
        repository: &str,
        digest: &Digest,
    ) -> StateResult<Option<ArtifactReference>> {
        Ok(self
            .scan_json::<ArtifactReference>(ARTIFACTS, &format!("{repository}:"))?
            .into_iter()
            .find(|a| &a.digest == digest))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use cutover_core::{
        EnvironmentName, RunOutcome, ServiceState, StageResult, Trigger,
    };

    fn test_spec(family: &str, version: TaskVersion) -> TaskSpecification {
        TaskSpecification {
            family: family.to_string(),
            version,
            container_name: "app".to_string(),
            image: format!("registry.local/{family}@sha256:0{version}"),
            cpu: 256,
            memory_mib: 512,
            environment: BTreeMap::new(),
            secrets: BTreeMap::new(),
            port_mappings: Vec::new(),
            health_check_path: Some("/healthcheck".to_string()),
            created_at: 1000,
        }
    }

    fn service() -> ServiceKey {
        ServiceKey::new(EnvironmentName::Dev, "cluster-dev", "api")
    }

    fn test_run(id: &str, started_at: u64) -> PipelineRun {
        PipelineRun {
            id: id.to_string(),
            trigger: Trigger {
                environment: "dev".to_string(),
                commit: "abc1234".to_string(),
                branch: "develop".to_string(),
            },
            service: service(),
            stages: vec![StageResult::success("source", vec![], 1)],
            outcome: RunOutcome::Success,
            started_at,
            finished_at: started_at + 10,
        }
    }

    // ── Task specifications ────────────────────────────────────────

    #[test]
    fn task_spec_register_and_get() {
        let store = StateStore::open_in_memory().unwrap();
        let spec = test_spec("app-dev", 1);

        store.register_task_spec(&spec).unwrap();
        assert_eq!(store.get_task_spec("app-dev", 1).unwrap(), Some(spec));
        assert!(store.get_task_spec("app-dev", 2).unwrap().is_none());
    }

    #[test]
    fn task_spec_versions_are_append_only() {
        let store = StateStore::open_in_memory().unwrap();
        store.register_task_spec(&test_spec("app-dev", 4)).unwrap();

        let same = store.register_task_spec(&test_spec("app-dev", 4));
        assert!(matches!(same, Err(StateError::Conflict(_))));

        let older = store.register_task_spec(&test_spec("app-dev", 3));
        assert!(matches!(older, Err(StateError::Conflict(_))));

        store.register_task_spec(&test_spec("app-dev", 5)).unwrap();
        assert_eq!(store.latest_task_version("app-dev").unwrap(), Some(5));
    }

    #[test]
    fn task_spec_families_are_isolated() {
        let store = StateStore::open_in_memory().unwrap();
        store.register_task_spec(&test_spec("app-dev", 7)).unwrap();
        store.register_task_spec(&test_spec("app-prod", 1)).unwrap();

        assert_eq!(store.list_task_specs("app-dev").unwrap().len(), 1);
        assert_eq!(store.latest_task_version("app-prod").unwrap(), Some(1));
        assert_eq!(store.latest_task_version("other").unwrap(), None);
    }

    #[test]
    fn task_spec_list_orders_numerically() {
        let store = StateStore::open_in_memory().unwrap();
        for v in [1, 2, 9, 10, 11] {
            store.register_task_spec(&test_spec("app", v)).unwrap();
        }
        let versions: Vec<_> = store
            .list_task_specs("app")
            .unwrap()
            .iter()
            .map(|s| s.version)
            .collect();
        assert_eq!(versions, vec![1, 2, 9, 10, 11]);
    }

    #[test]
    fn prune_keeps_newest_and_protected() {
        let store = StateStore::open_in_memory().unwrap();
        for v in 1..=6 {
            store.register_task_spec(&test_spec("app", v)).unwrap();
        }

        let removed = store.prune_task_specs("app", 2, Some(2)).unwrap();
        assert_eq!(removed, 3);
        let left: Vec<_> = store
            .list_task_specs("app")
            .unwrap()
            .iter()
            .map(|s| s.version)
            .collect();
        assert_eq!(left, vec![2, 5, 6]);

        // A pruned version cannot be registered again.
        assert!(store.register_task_spec(&test_spec("app", 3)).is_err());
    }

    // ── Stable versions ────────────────────────────────────────────

    #[test]
    fn stable_version_roundtrip() {
        let store = StateStore::open_in_memory().unwrap();
        store.register_task_spec(&test_spec("app-dev", 5)).unwrap();
        assert!(store.get_stable_spec(&service()).unwrap().is_none());

        store.set_stable_version(&service(), "app-dev", 5).unwrap();
        let record = store.get_stable_version(&service()).unwrap().unwrap();
        assert_eq!(record.version, 5);
        assert_eq!(store.get_stable_spec(&service()).unwrap().unwrap().version, 5);
    }

    // ── Leases ─────────────────────────────────────────────────────

    #[test]
    fn lease_is_exclusive_until_expiry() {
        let store = StateStore::open_in_memory().unwrap();

        let first = store.try_acquire_lease("dev/c/api", "run-a", 1000, 10_000).unwrap();
        assert!(matches!(first, LeaseAttempt::Acquired(_)));

        let second = store.try_acquire_lease("dev/c/api", "run-b", 1000, 10_500).unwrap();
        match second {
            LeaseAttempt::Held(lease) => assert_eq!(lease.owner, "run-a"),
            other => panic!("expected Held, got {other:?}"),
        }

        // After expiry another owner may take over.
        let third = store.try_acquire_lease("dev/c/api", "run-b", 1000, 11_000).unwrap();
        assert!(matches!(third, LeaseAttempt::Acquired(_)));
        assert_eq!(store.get_lease("dev/c/api").unwrap().unwrap().owner, "run-b");
    }

    #[test]
    fn lease_renewal_by_owner() {
        let store = StateStore::open_in_memory().unwrap();
        store.try_acquire_lease("k", "run-a", 1000, 0).unwrap();
        let renewed = store.try_acquire_lease("k", "run-a", 1000, 500).unwrap();
        match renewed {
            LeaseAttempt::Acquired(lease) => assert_eq!(lease.expires_at, 1500),
            other => panic!("expected Acquired, got {other:?}"),
        }
    }

    #[test]
    fn lease_release_checks_owner() {
        let store = StateStore::open_in_memory().unwrap();
        store.try_acquire_lease("k", "run-a", 1000, 0).unwrap();

        assert!(!store.release_lease("k", "run-b").unwrap());
        assert!(store.get_lease("k").unwrap().is_some());

        assert!(store.release_lease("k", "run-a").unwrap());
        assert!(store.get_lease("k").unwrap().is_none());
        assert!(!store.release_lease("k", "run-a").unwrap());
    }

    #[test]
    fn lease_force_release() {
        let store = StateStore::open_in_memory().unwrap();
        store.try_acquire_lease("k", "run-a", 1000, 0).unwrap();
        assert!(store.force_release_lease("k").unwrap());
        assert!(store.list_leases().unwrap().is_empty());
    }

    // ── Pipeline runs ──────────────────────────────────────────────

    #[test]
    fn pipeline_runs_append_and_list_in_order() {
        let store = StateStore::open_in_memory().unwrap();
        store.append_pipeline_run(&test_run("b", 2000)).unwrap();
        store.append_pipeline_run(&test_run("a", 1000)).unwrap();

        let runs = store.list_pipeline_runs(&service()).unwrap();
        let ids: Vec<_> = runs.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn pipeline_runs_are_never_overwritten() {
        let store = StateStore::open_in_memory().unwrap();
        store.append_pipeline_run(&test_run("a", 1000)).unwrap();
        let again = store.append_pipeline_run(&test_run("a", 1000));
        assert!(matches!(again, Err(StateError::Conflict(_))));
    }

    // ── Local records ──────────────────────────────────────────────

    #[test]
    fn service_record_roundtrip() {
        let store = StateStore::open_in_memory().unwrap();
        let record = LocalServiceRecord {
            state: ServiceState::empty(service()),
            target_spec: None,
            min_healthy: 0,
            max_running: 0,
            crashing_versions: Default::default(),
            restarts: 0,
        };
        store.put_service_record(&record).unwrap();
        assert_eq!(store.get_service_record(&service()).unwrap(), Some(record));
        assert_eq!(store.list_service_records().unwrap().len(), 1);
    }

    #[test]
    fn artifact_lookup_by_tag_and_digest() {
        let store = StateStore::open_in_memory().unwrap();
        let artifact = ArtifactReference {
            location: "app-dev".to_string(),
            digest: Digest::parse("sha256:abc123").unwrap(),
            tag: "abc1234".to_string(),
        };
        store.put_artifact("app-dev", &artifact).unwrap();

        assert_eq!(store.get_artifact("app-dev", "abc1234").unwrap(), Some(artifact.clone()));
        assert!(store.get_artifact("app-prod", "abc1234").unwrap().is_none());
        assert_eq!(
            store.find_artifact_by_digest("app-dev", &artifact.digest).unwrap(),
            Some(artifact)
        );
    }

    #[test]
    fn persistence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cutover.redb");

        {
            let store = StateStore::open(&path).unwrap();
            store.register_task_spec(&test_spec("app", 1)).unwrap();
            store.set_stable_version(&service(), "app", 1).unwrap();
        }

        let store = StateStore::open(&path).unwrap();
        assert_eq!(store.latest_task_version("app").unwrap(), Some(1));
        assert_eq!(store.get_stable_version(&service()).unwrap().unwrap().version, 1);
    }
}
