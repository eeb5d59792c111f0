//! Periodic version-check task and its cascading restart of `latest`-pinned
//! instances (§4.5).

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::db::Database;
use crate::instance_manager::InstanceManager;
use crate::models::{InstanceStatus, UpdaterStatus};
use crate::version_manager::VersionManager;

const CHECK_INTERVAL: Duration = Duration::from_secs(60 * 60);
const FIRST_RUN_DELAY: Duration = Duration::from_secs(60);

/// Outcome of one cycle or manual check, returned to the triggering caller.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct CheckResult {
    pub updated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(rename = "restartedInstances")]
    pub restarted_instances: Vec<i64>,
}

/// `isChecking` doubles as a non-reentrancy flag: a manual check call that
/// observes a cycle already in flight is a no-op, per §4.5/§5.
pub struct AutoUpdater {
    db: Database,
    version_manager: Arc<VersionManager>,
    instance_manager: Arc<InstanceManager>,
    status: Mutex<UpdaterStatus>,
}

impl AutoUpdater {
    pub fn new(
        db: Database,
        version_manager: Arc<VersionManager>,
        instance_manager: Arc<InstanceManager>,
    ) -> Arc<Self> {
        Arc::new(Self {
            db,
            version_manager,
            instance_manager,
            status: Mutex::new(UpdaterStatus::default()),
        })
    }

    pub async fn status(&self) -> UpdaterStatus {
        self.status.lock().await.clone()
    }

    /// Spawns the background periodic task. Never returns.
    pub fn spawn(self: Arc<Self>) {
        tokio::spawn(async move {
            tokio::time::sleep(FIRST_RUN_DELAY).await;
            loop {
                let _ = self.run_cycle().await;
                let next_check = Utc::now() + chrono::Duration::from_std(CHECK_INTERVAL).unwrap();
                self.status.lock().await.next_check = Some(next_check);
                tokio::time::sleep(CHECK_INTERVAL).await;
            }
        });
    }

    /// Runs one cycle unless another is already in flight, in which case it
    /// returns immediately with `updated: false` and no restarts ("already
    /// checking, skipped").
    pub async fn run_cycle(&self) -> CheckResult {
        {
            let mut status = self.status.lock().await;
            if status.is_checking {
                info!("auto-update cycle already in progress, skipping");
                return CheckResult::default();
            }
            status.is_checking = true;
            status.last_check = Some(Utc::now());
        }

        let result = self.do_cycle().await;

        let mut status = self.status.lock().await;
        status.is_checking = false;
        if let Ok(ref result) = result {
            if result.version.is_some() {
                status.latest_version = result.version.clone();
            }
            if result.updated {
                status.last_update = Some(Utc::now());
            }
        }

        result.unwrap_or_default()
    }

    async fn do_cycle(&self) -> anyhow::Result<CheckResult> {
        let previously_installed: Vec<String> = self
            .version_manager
            .installed()
            .unwrap_or_default()
            .into_iter()
            .map(|v| v.version)
            .collect();

        let tag = match self.version_manager.install("latest").await {
            Ok(tag) => tag,
            Err(e) => {
                warn!("auto-updater: failed to check/install latest release: {e}");
                return Ok(CheckResult::default());
            }
        };

        if previously_installed.contains(&tag) {
            return Ok(CheckResult {
                updated: false,
                version: Some(tag),
                restarted_instances: Vec::new(),
            });
        }

        let instances = self.db.list_instances().await?;
        let mut restarted = Vec::new();
        for instance in instances {
            let pinned_to_latest = instance.gowa_version.is_empty() || instance.gowa_version == "latest";
            if pinned_to_latest && instance.status == InstanceStatus::Running {
                match self.instance_manager.restart(instance.id).await {
                    Ok(_) => restarted.push(instance.id),
                    Err(e) => warn!("auto-updater: failed to restart instance {}: {e}", instance.id),
                }
            }
        }

        info!("auto-update cycle complete: latest={tag}, restarted {} instance(s)", restarted.len());
        Ok(CheckResult {
            updated: true,
            version: Some(tag),
            restarted_instances: restarted,
        })
    }

    /// Instances currently pinned to the floating `latest` channel.
    pub async fn latest_pinned_instances(&self) -> anyhow::Result<Vec<crate::models::Instance>> {
        let instances = self.db.list_instances().await?;
        Ok(instances
            .into_iter()
            .filter(|i| i.gowa_version.is_empty() || i.gowa_version == "latest")
            .collect())
    }
}

#[allow(dead_code)]
fn next_check_after(now: DateTime<Utc>) -> DateTime<Utc> {
    now + chrono::Duration::from_std(CHECK_INTERVAL).unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Paths;
    use crate::resource_monitor::ResourceMonitor;

    async fn updater(tmp: &std::path::Path) -> Arc<AutoUpdater> {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        let paths = Paths::new(Some(tmp.to_path_buf())).unwrap();
        let version_manager = Arc::new(VersionManager::new(paths.clone(), "http://127.0.0.1:0".to_string()));
        let resource_monitor = Arc::new(ResourceMonitor::new());
        let instance_manager = Arc::new(InstanceManager::new(
            db.clone(),
            paths,
            "app".to_string(),
            version_manager.clone(),
            resource_monitor,
        ));
        AutoUpdater::new(db, version_manager, instance_manager)
    }

    #[tokio::test]
    async fn run_cycle_is_a_no_op_when_already_checking() {
        let tmp = tempfile::tempdir().unwrap();
        let updater = updater(tmp.path()).await;
        updater.status.lock().await.is_checking = true;

        let result = updater.run_cycle().await;
        assert!(!result.updated);
        assert!(result.restarted_instances.is_empty());
    }

    #[tokio::test]
    async fn run_cycle_sets_last_check_even_on_network_failure() {
        let tmp = tempfile::tempdir().unwrap();
        let updater = updater(tmp.path()).await;
        updater.run_cycle().await;
        assert!(updater.status().await.last_check.is_some());
    }

    #[tokio::test]
    async fn latest_pinned_instances_includes_missing_version() {
        let tmp = tempfile::tempdir().unwrap();
        let db = Database::connect("sqlite::memory:").await.unwrap();
        let paths = Paths::new(Some(tmp.path().to_path_buf())).unwrap();
        let version_manager = Arc::new(VersionManager::new(paths.clone(), "http://127.0.0.1:0".to_string()));
        let resource_monitor = Arc::new(ResourceMonitor::new());
        let instance_manager = Arc::new(InstanceManager::new(
            db.clone(),
            paths,
            "app".to_string(),
            version_manager.clone(),
            resource_monitor,
        ));
        instance_manager
            .create(crate::models::InstanceRequest {
                name: Some("pinned".to_string()),
                config: None,
                gowa_version: Some("latest".to_string()),
            })
            .await
            .unwrap();

        let updater = AutoUpdater::new(db, version_manager, instance_manager);
        let pinned = updater.latest_pinned_instances().await.unwrap();
        assert_eq!(pinned.len(), 1);
    }
}
