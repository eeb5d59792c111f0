//! Daily purge of per-instance volatile caches (§4.8).

use std::path::Path;
use std::time::Duration;

use chrono::{Local, Timelike};
use tracing::{info, warn};

use crate::config::Paths;
use crate::db::Database;

/// Spawns the daily-midnight sweep as a background task. Runs until the
/// process exits; errors on individual files are logged and do not abort
/// the sweep.
pub fn spawn(db: Database, paths: Paths) {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(duration_until_next_midnight()).await;
            run_sweep(&db, &paths).await;
        }
    });
}

fn duration_until_next_midnight() -> Duration {
    let now = Local::now();
    let midnight = (now + chrono::Duration::days(1))
        .date_naive()
        .and_hms_opt(0, 0, 0)
        .unwrap();
    let seconds = (midnight - now.naive_local()).num_seconds().max(1);
    Duration::from_secs(seconds as u64)
}

async fn run_sweep(db: &Database, paths: &Paths) {
    info!("running daily cleanup sweep");
    let instances = match db.list_instances().await {
        Ok(instances) => instances,
        Err(e) => {
            warn!("cleanup sweep: failed to list instances: {e}");
            return;
        }
    };

    for instance in instances {
        let dir = paths.instance_dir(instance.id);
        sweep_storages(&dir.join("storages"));
        sweep_statics_media(&dir.join("statics").join("media"));
    }
}

fn sweep_storages(dir: &Path) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let is_image = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.eq_ignore_ascii_case("jpg") || e.eq_ignore_ascii_case("jpeg"))
            .unwrap_or(false);
        if is_image {
            if let Err(e) = std::fs::remove_file(&path) {
                warn!("cleanup sweep: failed to remove {path:?}: {e}");
            }
        }
    }
}

fn sweep_statics_media(dir: &Path) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let result = if path.is_dir() {
            std::fs::remove_dir_all(&path)
        } else {
            std::fs::remove_file(&path)
        };
        if let Err(e) = result {
            warn!("cleanup sweep: failed to remove {path:?}: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duration_until_next_midnight_is_positive_and_bounded() {
        let d = duration_until_next_midnight();
        assert!(d.as_secs() > 0);
        assert!(d.as_secs() <= 24 * 60 * 60);
    }

    #[test]
    fn sweep_storages_removes_only_jpg_and_jpeg() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("a.jpg"), b"x").unwrap();
        std::fs::write(tmp.path().join("b.jpeg"), b"x").unwrap();
        std::fs::write(tmp.path().join("c.png"), b"x").unwrap();

        sweep_storages(tmp.path());

        assert!(!tmp.path().join("a.jpg").exists());
        assert!(!tmp.path().join("b.jpeg").exists());
        assert!(tmp.path().join("c.png").exists());
    }

    #[test]
    fn sweep_statics_media_removes_all_files_and_dirs() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("x.bin"), b"x").unwrap();
        std::fs::create_dir(tmp.path().join("sub")).unwrap();
        std::fs::write(tmp.path().join("sub").join("y.bin"), b"x").unwrap();

        sweep_statics_media(tmp.path());

        assert!(!tmp.path().join("x.bin").exists());
        assert!(!tmp.path().join("sub").exists());
    }
}
