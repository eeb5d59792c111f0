//! CPU/memory/disk sampling with rolling averages per child (§4.6).

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};
use tokio::sync::Mutex;

use crate::models::ResourceSample;

const HISTORY_CAPACITY: usize = 10;
const DISK_CACHE_TTL: Duration = Duration::from_secs(30);
/// Reference used to compute `memoryPercent`. The source hardcodes 16 GiB;
/// documented here as a constant an operator could make configurable.
const MEMORY_REFERENCE_BYTES: f64 = 16.0 * 1024.0 * 1024.0 * 1024.0;

struct History {
    cpu: VecDeque<f32>,
    memory: VecDeque<f64>,
}

impl History {
    fn new() -> Self {
        Self {
            cpu: VecDeque::with_capacity(HISTORY_CAPACITY),
            memory: VecDeque::with_capacity(HISTORY_CAPACITY),
        }
    }

    fn push(&mut self, cpu: f32, memory: f64) {
        if self.cpu.len() == HISTORY_CAPACITY {
            self.cpu.pop_front();
        }
        if self.memory.len() == HISTORY_CAPACITY {
            self.memory.pop_front();
        }
        self.cpu.push_back(cpu);
        self.memory.push_back(memory);
    }

    fn avg_cpu(&self) -> f32 {
        self.cpu.iter().sum::<f32>() / self.cpu.len() as f32
    }

    fn avg_memory(&self) -> f64 {
        self.memory.iter().sum::<f64>() / self.memory.len() as f64
    }
}

struct DiskCacheEntry {
    bytes: f64,
    sampled_at: Instant,
}

pub struct ResourceMonitor {
    system: Mutex<System>,
    history: Mutex<HashMap<i64, History>>,
    disk_cache: Mutex<HashMap<i64, DiskCacheEntry>>,
}

impl Default for ResourceMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceMonitor {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
            history: Mutex::new(HashMap::new()),
            disk_cache: Mutex::new(HashMap::new()),
        }
    }

    /// Reads the live process table for `pid`. Returns `None` once the pid
    /// no longer exists. When `instance_id` is supplied, pushes into that
    /// instance's rolling history and reports trailing averages, plus a
    /// TTL-cached disk-usage figure.
    pub async fn sample(
        &self,
        pid: u32,
        instance_id: Option<i64>,
        working_dir: Option<&PathBuf>,
    ) -> Option<ResourceSample> {
        let sysinfo_pid = Pid::from_u32(pid);

        let (cpu_percent, memory_bytes) = {
            let mut system = self.system.lock().await;
            system.refresh_processes_specifics(
                ProcessesToUpdate::Some(&[sysinfo_pid]),
                true,
                ProcessRefreshKind::everything(),
            );
            let process = system.process(sysinfo_pid)?;
            (process.cpu_usage(), process.memory() as f64)
        };

        let memory_mb = memory_bytes / (1024.0 * 1024.0);
        let memory_percent = ((memory_bytes / MEMORY_REFERENCE_BYTES) * 100.0) as f32;

        let (avg_cpu, avg_memory) = if let Some(id) = instance_id {
            let mut history = self.history.lock().await;
            let entry = history.entry(id).or_insert_with(History::new);
            entry.push(cpu_percent, memory_mb);
            (Some(entry.avg_cpu()), Some(entry.avg_memory()))
        } else {
            (None, None)
        };

        let disk_mb = match (instance_id, working_dir) {
            (Some(id), Some(dir)) => Some(self.disk_usage_mb(id, dir).await),
            _ => None,
        };

        Some(ResourceSample {
            cpu_percent,
            memory_mb,
            memory_percent,
            avg_cpu,
            avg_memory,
            disk_mb,
        })
    }

    async fn disk_usage_mb(&self, instance_id: i64, dir: &PathBuf) -> f64 {
        {
            let cache = self.disk_cache.lock().await;
            if let Some(entry) = cache.get(&instance_id) {
                if entry.sampled_at.elapsed() < DISK_CACHE_TTL {
                    return entry.bytes;
                }
            }
        }

        let bytes = directory_size(dir) as f64 / (1024.0 * 1024.0);
        let mut cache = self.disk_cache.lock().await;
        cache.insert(
            instance_id,
            DiskCacheEntry {
                bytes,
                sampled_at: Instant::now(),
            },
        );
        bytes
    }

    /// Drops an instance's rolling history and disk cache entry. Called on
    /// stop/kill/delete.
    pub async fn forget(&self, instance_id: i64) {
        self.history.lock().await.remove(&instance_id);
        self.disk_cache.lock().await.remove(&instance_id);
    }
}

fn directory_size(dir: &std::path::Path) -> u64 {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return 0;
    };
    entries
        .filter_map(|e| e.ok())
        .map(|entry| {
            let metadata = entry.metadata().ok();
            match metadata {
                Some(m) if m.is_dir() => directory_size(&entry.path()),
                Some(m) => m.len(),
                None => 0,
            }
        })
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sample_returns_none_for_a_nonexistent_pid() {
        let monitor = ResourceMonitor::new();
        let sample = monitor.sample(u32::MAX, None, None).await;
        assert!(sample.is_none());
    }

    #[tokio::test]
    async fn sample_for_the_current_process_succeeds() {
        let monitor = ResourceMonitor::new();
        let pid = std::process::id();
        // Give sysinfo a moment to have a CPU baseline.
        let sample = monitor.sample(pid, None, None).await;
        assert!(sample.is_some());
    }

    #[tokio::test]
    async fn history_accumulates_and_is_bounded() {
        let monitor = ResourceMonitor::new();
        let pid = std::process::id();
        for _ in 0..(HISTORY_CAPACITY + 5) {
            monitor.sample(pid, Some(1), None).await;
        }
        let history = monitor.history.lock().await;
        let entry = history.get(&1).unwrap();
        assert!(entry.cpu.len() <= HISTORY_CAPACITY);
    }

    #[tokio::test]
    async fn forget_clears_history_and_disk_cache() {
        let monitor = ResourceMonitor::new();
        let pid = std::process::id();
        monitor.sample(pid, Some(2), None).await;
        monitor.forget(2).await;
        assert!(monitor.history.lock().await.get(&2).is_none());
    }

    #[tokio::test]
    async fn disk_usage_is_cached_within_the_ttl() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("a.txt"), vec![0u8; 1024]).unwrap();
        let monitor = ResourceMonitor::new();
        let pid = std::process::id();
        let dir = tmp.path().to_path_buf();

        let first = monitor.sample(pid, Some(3), Some(&dir)).await.unwrap();
        std::fs::write(tmp.path().join("b.txt"), vec![0u8; 1024 * 1024]).unwrap();
        let second = monitor.sample(pid, Some(3), Some(&dir)).await.unwrap();

        assert_eq!(first.disk_mb, second.disk_mb);
    }
}
