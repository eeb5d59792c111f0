//! Instance lifecycle engine: the process-record map and start/stop/kill/
//! restart/status contract (§4.1).

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::{info, warn};

use process_supervisor::{ProcessActor, ProcessConfig, ProcessHandle};

use crate::config::Paths;
use crate::db::Database;
use crate::error::AppError;
use crate::models::{Instance, InstanceConfig, InstanceRequest, InstanceStatus, StatusReport};
use crate::port_allocator::PortAllocator;
use crate::resource_monitor::ResourceMonitor;
use crate::version_manager::VersionManager;

const KEY_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
const KEY_LEN: usize = 8;

const ADJECTIVES: &[&str] = &[
    "swift", "bright", "calm", "eager", "gentle", "happy", "keen", "lively", "noble", "proud",
    "quiet", "rapid", "sharp", "smooth", "bold", "brave", "clever", "daring", "fearless",
    "graceful", "honest", "jolly", "kind", "merry", "patient", "polite", "steady", "trusty",
    "wise", "zealous",
];
const NOUNS: &[&str] = &[
    "falcon", "tiger", "eagle", "wolf", "fox", "bear", "lion", "hawk", "raven", "phoenix",
    "dragon", "griffin", "sphinx", "pegasus", "kraken", "comet", "nebula", "quasar", "pulsar",
    "galaxy",
];

struct ProcessRecord {
    handle: ProcessHandle,
    pid: u32,
    start_time: Instant,
}

/// Owns `{instance_id → ProcessRecord}` in memory only (§3); never
/// serialized. `records` itself only ever guards a single read or a single
/// insert/remove; what actually keeps a `start`/`stop`/`kill`/`restart` for
/// one id from interleaving with another call for the *same* id is a
/// per-instance `tokio::sync::Mutex` handed out by `lock_instance`, held for
/// the whole lifecycle operation (version resolve through the records
/// insert), matching §5's "concurrent start and stop on the same id must not
/// interleave." Operations on different ids never contend with each other.
pub struct InstanceManager {
    db: Database,
    paths: Paths,
    proxy_prefix: String,
    version_manager: Arc<VersionManager>,
    resource_monitor: Arc<ResourceMonitor>,
    records: Arc<RwLock<HashMap<i64, ProcessRecord>>>,
    instance_locks: StdMutex<HashMap<i64, Arc<Mutex<()>>>>,
}

impl InstanceManager {
    pub fn new(
        db: Database,
        paths: Paths,
        proxy_prefix: String,
        version_manager: Arc<VersionManager>,
        resource_monitor: Arc<ResourceMonitor>,
    ) -> Self {
        Self {
            db,
            paths,
            proxy_prefix,
            version_manager,
            resource_monitor,
            records: Arc::new(RwLock::new(HashMap::new())),
            instance_locks: StdMutex::new(HashMap::new()),
        }
    }

    /// Acquires the per-instance critical section used by `start`, `stop`,
    /// `kill` and `restart`, creating the lock on first use. The registry
    /// mutex itself is only ever held long enough to clone or insert an
    /// `Arc`, never across an `.await`.
    async fn lock_instance(&self, id: i64) -> OwnedMutexGuard<()> {
        let lock = self
            .instance_locks
            .lock()
            .unwrap()
            .entry(id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        lock.lock_owned().await
    }

    /// Persists `status=error` with `message` for a `start()` failure path
    /// and returns `err` unchanged, so callers can write
    /// `return Err(self.persist_start_failure(id, port, err).await);`.
    async fn persist_start_failure(&self, id: i64, port: Option<u16>, err: AppError) -> AppError {
        let message = err.to_string();
        let _ = self.db.update_status(id, InstanceStatus::Error, port, Some(&message)).await;
        err
    }

    pub async fn list(&self) -> anyhow::Result<Vec<Instance>> {
        self.db.list_instances().await
    }

    pub async fn get(&self, id: i64) -> anyhow::Result<Option<Instance>> {
        self.db.get_instance(id).await
    }

    pub async fn get_by_key(&self, key: &str) -> anyhow::Result<Option<Instance>> {
        self.db.get_instance_by_key(key).await
    }

    async fn get_or_404(&self, id: i64) -> Result<Instance, AppError> {
        self.db
            .get_instance(id)
            .await
            .map_err(AppError::Internal)?
            .ok_or_else(|| AppError::NotFound(format!("instance {id} not found")))
    }

    fn generate_key() -> String {
        let mut rng = rand::rng();
        (0..KEY_LEN)
            .map(|_| {
                let idx = rng.random_range(0..KEY_ALPHABET.len());
                KEY_ALPHABET[idx] as char
            })
            .collect()
    }

    async fn generate_unique_key(&self) -> Result<String, AppError> {
        for _ in 0..20 {
            let key = Self::generate_key();
            if self.db.get_instance_by_key(&key).await.map_err(AppError::Internal)?.is_none() {
                return Ok(key);
            }
        }
        Err(AppError::Internal(anyhow::anyhow!(
            "failed to generate a unique instance key after 20 attempts"
        )))
    }

    async fn generate_unique_name(&self) -> Result<String, AppError> {
        let mut rng = rand::rng();
        for _ in 0..20 {
            let adj = ADJECTIVES[rng.random_range(0..ADJECTIVES.len())];
            let noun = NOUNS[rng.random_range(0..NOUNS.len())];
            let suffix: u16 = rng.random_range(0..1000);
            let name = format!("{adj}-{noun}-{suffix:03}");
            if !self.db.name_exists(&name, None).await.map_err(AppError::Internal)? {
                return Ok(name);
            }
        }
        Err(AppError::Internal(anyhow::anyhow!(
            "failed to generate a unique instance name after 20 attempts"
        )))
    }

    fn validate_name(name: &str) -> Result<(), AppError> {
        if name.is_empty() || name.chars().count() > 100 {
            return Err(AppError::Validation(
                "name must be between 1 and 100 characters".to_string(),
            ));
        }
        Ok(())
    }

    pub async fn create(&self, req: InstanceRequest) -> Result<Instance, AppError> {
        let key = self.generate_unique_key().await?;

        let name = match req.name {
            Some(name) => {
                Self::validate_name(&name)?;
                if self.db.name_exists(&name, None).await.map_err(AppError::Internal)? {
                    return Err(AppError::Conflict(format!("name '{name}' is already in use")));
                }
                name
            }
            None => self.generate_unique_name().await?,
        };

        let persisted: HashSet<u16> = self
            .db
            .allocated_ports()
            .await
            .map_err(AppError::Internal)?
            .into_iter()
            .collect();
        let port = PortAllocator::next_available(&persisted).await;

        let mut config = match req.config {
            Some(c) => c,
            None => InstanceConfig::default_for(&self.proxy_prefix, &key),
        };
        config.flags.base_path = Some(format!("/{}/{}", self.proxy_prefix, key));

        let gowa_version = req.gowa_version.unwrap_or_else(|| "latest".to_string());

        let instance = self
            .db
            .insert_instance(&key, &name, port, &config, &gowa_version)
            .await
            .map_err(AppError::Internal)?;

        std::fs::create_dir_all(self.paths.instance_dir(instance.id))
            .map_err(|e| AppError::Internal(anyhow::anyhow!(e)))?;

        info!("created instance {} ({}) on port {port}", instance.id, instance.key);
        Ok(instance)
    }

    pub async fn update(&self, id: i64, req: InstanceRequest) -> Result<Instance, AppError> {
        let existing = self.get_or_404(id).await?;

        if let Some(name) = &req.name {
            Self::validate_name(name)?;
            if name != &existing.name
                && self.db.name_exists(name, Some(id)).await.map_err(AppError::Internal)?
            {
                return Err(AppError::Conflict(format!("name '{name}' is already in use")));
            }
        }

        let config = req.config.map(|mut c| {
            c.flags.base_path = Some(format!("/{}/{}", self.proxy_prefix, existing.key));
            c
        });

        self.db
            .update_instance_fields(id, req.name.as_deref(), config.as_ref(), req.gowa_version.as_deref())
            .await
            .map_err(AppError::Internal)?;

        self.get_or_404(id).await
    }

    pub async fn delete(&self, id: i64) -> Result<bool, AppError> {
        let existing = match self.db.get_instance(id).await.map_err(AppError::Internal)? {
            Some(instance) => instance,
            None => return Ok(false),
        };

        if existing.status == InstanceStatus::Running {
            self.stop(id).await?;
        }

        self.resource_monitor.forget(id).await;
        let _ = std::fs::remove_dir_all(self.paths.instance_dir(id));
        self.db.delete_instance(id).await.map_err(AppError::Internal)
    }

    /// Starts the instance, or returns its current status if already
    /// running. The whole body — version resolution, port
    /// reallocation+persist, spawn, and the records insert — runs as one
    /// critical section under the per-instance lock (§5), so two concurrent
    /// `start(id)` calls can never both spawn a child and race to own the
    /// `records` entry.
    pub async fn start(&self, id: i64) -> Result<StatusReport, AppError> {
        let _guard = self.lock_instance(id).await;
        self.start_locked(id).await
    }

    async fn start_locked(&self, id: i64) -> Result<StatusReport, AppError> {
        let instance = self.get_or_404(id).await?;

        {
            let records = self.records.read().await;
            if let Some(record) = records.get(&id) {
                if !record.handle.has_exited() {
                    return Ok(self.report(&instance, Some(record)));
                }
            }
        }

        let binary_path = match self.version_manager.resolve(&instance.gowa_version) {
            Ok(path) => path,
            Err(e) => return Err(self.persist_start_failure(id, instance.port, e).await),
        };

        let mut port = instance.port.unwrap_or(0);
        if port == 0 || !PortAllocator::is_free(port).await {
            let persisted: HashSet<u16> = match self.db.allocated_ports().await {
                Ok(ports) => ports.into_iter().collect(),
                Err(e) => {
                    return Err(self
                        .persist_start_failure(id, instance.port, AppError::Internal(e))
                        .await);
                }
            };
            port = PortAllocator::next_available(&persisted).await;
            if let Err(e) = self.db.update_port(id, port).await {
                return Err(self
                    .persist_start_failure(id, instance.port, AppError::Internal(e))
                    .await);
            }
        }

        let (argv, env) = instance.config.materialize(port);
        let working_dir = self.paths.instance_dir(id);
        if let Err(e) = std::fs::create_dir_all(&working_dir) {
            return Err(self
                .persist_start_failure(id, Some(port), AppError::Internal(anyhow::anyhow!(e)))
                .await);
        }

        let process_config = ProcessConfig {
            command: binary_path.to_string_lossy().to_string(),
            args: argv,
            working_dir: Some(working_dir.to_string_lossy().to_string()),
            env,
        };

        let handle = match ProcessActor::spawn(process_config) {
            Ok(handle) => handle,
            Err(e) => {
                let message = e.to_string();
                let _ = self
                    .db
                    .update_status(id, InstanceStatus::Error, Some(port), Some(&message))
                    .await;
                return Err(AppError::SpawnFailed(message));
            }
        };

        let pid = match handle.state().await {
            Ok(state) => match state.pid {
                Some(pid) => pid,
                None => {
                    return Err(self
                        .persist_start_failure(
                            id,
                            Some(port),
                            AppError::Internal(anyhow::anyhow!("spawned process reported no pid")),
                        )
                        .await);
                }
            },
            Err(e) => {
                return Err(self
                    .persist_start_failure(id, Some(port), AppError::Internal(anyhow::anyhow!(e)))
                    .await);
            }
        };

        self.db
            .update_status(id, InstanceStatus::Running, Some(port), None)
            .await
            .map_err(AppError::Internal)?;

        self.records.write().await.insert(
            id,
            ProcessRecord {
                handle: handle.clone(),
                pid,
                start_time: Instant::now(),
            },
        );

        spawn_exit_observer(id, handle, self.records.clone());

        info!("started instance {id} (pid {pid}, port {port})");
        let instance = self.get_or_404(id).await?;
        let records = self.records.read().await;
        Ok(self.report(&instance, records.get(&id)))
    }

    pub async fn stop(&self, id: i64) -> Result<StatusReport, AppError> {
        let _guard = self.lock_instance(id).await;
        self.stop_locked(id).await
    }

    async fn stop_locked(&self, id: i64) -> Result<StatusReport, AppError> {
        let instance = self.get_or_404(id).await?;

        if let Some(record) = self.records.write().await.remove(&id) {
            record
                .handle
                .kill(Some("SIGTERM"))
                .await
                .map_err(|e| AppError::Internal(anyhow::anyhow!(e)))?;
        }
        self.resource_monitor.forget(id).await;

        self.db
            .update_status(id, InstanceStatus::Stopped, instance.port, None)
            .await
            .map_err(AppError::Internal)?;

        let instance = self.get_or_404(id).await?;
        Ok(self.report(&instance, None))
    }

    pub async fn kill(&self, id: i64) -> Result<StatusReport, AppError> {
        let _guard = self.lock_instance(id).await;
        self.kill_locked(id).await
    }

    async fn kill_locked(&self, id: i64) -> Result<StatusReport, AppError> {
        let instance = self.get_or_404(id).await?;

        if let Some(record) = self.records.write().await.remove(&id) {
            record
                .handle
                .kill(Some("SIGKILL"))
                .await
                .map_err(|e| AppError::Internal(anyhow::anyhow!(e)))?;
        }
        self.resource_monitor.forget(id).await;

        self.db
            .update_status(id, InstanceStatus::Stopped, instance.port, None)
            .await
            .map_err(AppError::Internal)?;

        let instance = self.get_or_404(id).await?;
        Ok(self.report(&instance, None))
    }

    /// Stops and restarts the instance as a single critical section: the
    /// per-instance lock is held across both halves so a concurrent
    /// `start`/`stop` call can never land between this `stop` and this
    /// `start`.
    pub async fn restart(&self, id: i64) -> Result<StatusReport, AppError> {
        let _guard = self.lock_instance(id).await;
        self.stop_locked(id).await?;
        tokio::time::sleep(Duration::from_secs(1)).await;
        self.start_locked(id).await
    }

    pub async fn status(&self, id: i64) -> Result<StatusReport, AppError> {
        let instance = self.get_or_404(id).await?;
        let records = self.records.read().await;
        Ok(self.report(&instance, records.get(&id)))
    }

    /// Current pid for a live process record, used by handlers to enrich
    /// a status report with a resource-monitor sample.
    pub async fn live_pid(&self, id: i64) -> Option<u32> {
        self.records.read().await.get(&id).map(|r| r.pid)
    }

    pub fn instance_dir(&self, id: i64) -> std::path::PathBuf {
        self.paths.instance_dir(id)
    }

    fn report(&self, instance: &Instance, record: Option<&ProcessRecord>) -> StatusReport {
        StatusReport {
            id: instance.id,
            name: instance.name.clone(),
            status: instance.status,
            port: instance.port,
            pid: record.map(|r| r.pid),
            uptime_ms: record.map(|r| r.start_time.elapsed().as_millis() as i64),
            error_message: instance.error_message.clone(),
            resources: None,
        }
    }

    /// At boot, re-spawns every instance whose persisted status is
    /// `running` (§4.9). A start failure transitions that instance to
    /// `error`; it does not abort the remaining restarts.
    pub async fn startup_auto_restart(&self) -> anyhow::Result<()> {
        let running = self.db.running_instances().await?;
        info!("startup auto-restart: {} instance(s) to re-spawn", running.len());
        for instance in running {
            if let Err(e) = self.start(instance.id).await {
                warn!("startup auto-restart failed for instance {}: {e}", instance.id);
            }
        }
        Ok(())
    }

    /// Forceful kill of every tracked child, used on SIGINT/SIGTERM.
    /// Deliberately does not rewrite persisted status (§5).
    pub async fn shutdown_all(&self) {
        let mut records = self.records.write().await;
        for (id, record) in records.drain() {
            if let Err(e) = record.handle.kill(Some("SIGKILL")).await {
                warn!("shutdown: failed to kill instance {id}: {e}");
            }
        }
    }
}

fn spawn_exit_observer(
    id: i64,
    mut handle: ProcessHandle,
    records: Arc<RwLock<HashMap<i64, ProcessRecord>>>,
) {
    tokio::spawn(async move {
        handle.wait_exited().await;
        // Deliberately does not touch persisted status: the split between
        // "process gone" and "persisted status" lets startup auto-restart
        // reconcile drift after a crash (§9).
        records.write().await.remove(&id);
        info!("instance {id}: process exited, process record removed");
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_key_is_eight_uppercase_alphanumeric_chars() {
        let key = InstanceManager::generate_key();
        assert_eq!(key.len(), 8);
        assert!(key.chars().all(|c| c.is_ascii_uppercase() || c.is_ascii_digit()));
    }

    #[test]
    fn validate_name_rejects_empty_and_overlong() {
        assert!(InstanceManager::validate_name("").is_err());
        let long = "a".repeat(101);
        assert!(InstanceManager::validate_name(&long).is_err());
        assert!(InstanceManager::validate_name("ok").is_ok());
    }

    async fn manager(tmp: &std::path::Path) -> InstanceManager {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        let paths = Paths::new(Some(tmp.to_path_buf())).unwrap();
        let version_manager = Arc::new(VersionManager::new(paths.clone(), "http://127.0.0.1:0".to_string()));
        let resource_monitor = Arc::new(ResourceMonitor::new());
        InstanceManager::new(db, paths, "app".to_string(), version_manager, resource_monitor)
    }

    #[tokio::test]
    async fn create_allocates_port_and_reasserts_base_path() {
        let tmp = tempfile::tempdir().unwrap();
        let mgr = manager(tmp.path()).await;

        let instance = mgr
            .create(InstanceRequest {
                name: Some("my-instance".to_string()),
                config: None,
                gowa_version: None,
            })
            .await
            .unwrap();

        assert_eq!(instance.name, "my-instance");
        assert_eq!(instance.key.len(), 8);
        assert!(instance.port.unwrap() >= 8000);
        assert_eq!(
            instance.config.flags.base_path,
            Some(format!("/app/{}", instance.key))
        );
        assert_eq!(instance.status, InstanceStatus::Stopped);
    }

    #[tokio::test]
    async fn create_without_a_name_generates_one() {
        let tmp = tempfile::tempdir().unwrap();
        let mgr = manager(tmp.path()).await;
        let instance = mgr
            .create(InstanceRequest {
                name: None,
                config: None,
                gowa_version: None,
            })
            .await
            .unwrap();
        assert_eq!(instance.name.split('-').count(), 3);
    }

    #[tokio::test]
    async fn create_rejects_duplicate_name() {
        let tmp = tempfile::tempdir().unwrap();
        let mgr = manager(tmp.path()).await;
        mgr.create(InstanceRequest {
            name: Some("dup".to_string()),
            config: None,
            gowa_version: None,
        })
        .await
        .unwrap();

        let err = mgr
            .create(InstanceRequest {
                name: Some("dup".to_string()),
                config: None,
                gowa_version: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
    }

    #[tokio::test]
    async fn start_fails_with_version_unavailable_when_binary_missing() {
        let tmp = tempfile::tempdir().unwrap();
        let mgr = manager(tmp.path()).await;
        let instance = mgr
            .create(InstanceRequest {
                name: Some("no-binary".to_string()),
                config: None,
                gowa_version: None,
            })
            .await
            .unwrap();

        let err = mgr.start(instance.id).await.unwrap_err();
        assert!(matches!(err, AppError::VersionUnavailable(_)));

        let persisted = mgr.get(instance.id).await.unwrap().unwrap();
        assert_eq!(persisted.status, InstanceStatus::Error);
        assert!(persisted.error_message.is_some());
    }

    #[tokio::test]
    async fn delete_of_unknown_id_reports_false() {
        let tmp = tempfile::tempdir().unwrap();
        let mgr = manager(tmp.path()).await;
        assert!(!mgr.delete(999).await.unwrap());
    }
}
