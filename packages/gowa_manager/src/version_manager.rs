//! Multi-version binary cache: resolve, install, remove, list (§4.4).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{info, warn};

use crate::config::Paths;
use crate::error::AppError;
use crate::models::VersionInfo;

#[derive(Debug, Deserialize)]
struct ReleaseAsset {
    name: String,
    browser_download_url: String,
}

#[derive(Debug, Deserialize)]
struct Release {
    tag_name: String,
    assets: Vec<ReleaseAsset>,
}

pub struct VersionManager {
    paths: Paths,
    client: reqwest::Client,
    release_index_url: String,
}

impl VersionManager {
    pub fn new(paths: Paths, release_index_url: String) -> Self {
        Self {
            paths,
            client: reqwest::Client::new(),
            release_index_url,
        }
    }

    /// `latest` resolves to the newest installed tag (lexicographic
    /// descending), falling back to the legacy symlink path if none are
    /// installed.
    pub fn resolve(&self, version: &str) -> Result<PathBuf, AppError> {
        let path = if version == "latest" {
            match self.newest_installed_tag() {
                Some(tag) => self.paths.version_binary_path(&tag),
                None => self.paths.legacy_binary_path(),
            }
        } else {
            self.paths.version_binary_path(version)
        };

        if path.exists() {
            Ok(path)
        } else {
            Err(AppError::VersionUnavailable(version.to_string()))
        }
    }

    fn newest_installed_tag(&self) -> Option<String> {
        let mut tags = self.installed_tags();
        tags.sort_by(|a, b| b.cmp(a));
        tags.into_iter().next()
    }

    fn installed_tags(&self) -> Vec<String> {
        std::fs::read_dir(&self.paths.versions_dir)
            .into_iter()
            .flatten()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().is_dir())
            .filter_map(|entry| entry.file_name().into_string().ok())
            .collect()
    }

    /// Queries the upstream release index for a tag (or "latest"), picks
    /// the matching OS/arch asset, downloads and extracts it, and installs
    /// it under `bin/versions/<concrete-tag>`. Returns the concrete tag
    /// that was installed, which may differ from the requested `version`
    /// when `version == "latest"`.
    pub async fn install(&self, version: &str) -> Result<String> {
        let release = self.fetch_release(version).await?;
        let tag = release.tag_name.clone();

        let binary_path = self.paths.version_binary_path(&tag);
        if binary_path.exists() {
            info!("version {tag} already installed");
            return Ok(tag);
        }

        let asset = self
            .pick_asset(&release)
            .with_context(|| format!("no matching release asset for {tag}"))?;

        let temp_dir = self
            .paths
            .temp_dir
            .join(format!("{tag}-{}", std::process::id()));
        std::fs::create_dir_all(&temp_dir)
            .with_context(|| format!("failed to create temp dir: {temp_dir:?}"))?;

        let result = self.download_and_extract(&asset.browser_download_url, &temp_dir, &binary_path).await;

        let _ = std::fs::remove_dir_all(&temp_dir);
        result?;

        info!("installed GOWA version {tag}");
        Ok(tag)
    }

    async fn download_and_extract(
        &self,
        url: &str,
        temp_dir: &Path,
        binary_path: &Path,
    ) -> Result<()> {
        let bytes = self
            .client
            .get(url)
            .send()
            .await
            .context("failed to download release asset")?
            .error_for_status()
            .context("release asset download returned an error status")?
            .bytes()
            .await
            .context("failed to read release asset body")?;

        let zip_path = temp_dir.join("release.zip");
        std::fs::write(&zip_path, &bytes).context("failed to write downloaded archive")?;

        let file = std::fs::File::open(&zip_path)?;
        let mut archive = zip::ZipArchive::new(file).context("failed to open downloaded archive")?;

        let mut extracted_paths = Vec::new();
        for i in 0..archive.len() {
            let mut entry = archive.by_index(i)?;
            if entry.is_dir() {
                continue;
            }
            let out_path = temp_dir.join(entry.mangled_name());
            if let Some(parent) = out_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let mut out_file = std::fs::File::create(&out_path)?;
            std::io::copy(&mut entry, &mut out_file)?;
            extracted_paths.push(out_path);
        }

        let binary = extracted_paths
            .into_iter()
            .filter(|p| {
                let name = p.file_name().and_then(|n| n.to_str()).unwrap_or("");
                !name.starts_with("README") && !name.starts_with("LICENSE") && !name.contains('.')
            })
            .filter_map(|p| std::fs::metadata(&p).ok().map(|m| (p, m.len())))
            .max_by_key(|(_, size)| *size)
            .map(|(p, _)| p)
            .context("no plausible binary found in the downloaded archive")?;

        if let Some(parent) = binary_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::copy(&binary, binary_path)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = std::fs::metadata(binary_path)?.permissions();
            perms.set_mode(0o755);
            std::fs::set_permissions(binary_path, perms)?;
        }

        Ok(())
    }

    fn pick_asset<'a>(&self, release: &'a Release) -> Option<&'a ReleaseAsset> {
        let os = if cfg!(target_os = "macos") {
            "darwin"
        } else if cfg!(target_os = "windows") {
            "windows"
        } else {
            "linux"
        };
        let arch = if cfg!(target_arch = "aarch64") {
            "arm64"
        } else if cfg!(target_arch = "arm") {
            "arm"
        } else {
            "amd64"
        };
        let needle = format!("{os}_{arch}");
        release
            .assets
            .iter()
            .find(|a| a.name.contains(&needle) && a.name.ends_with(".zip"))
    }

    async fn fetch_release(&self, version: &str) -> Result<Release> {
        let url = if version == "latest" {
            format!("{}/latest", self.release_index_url)
        } else {
            format!("{}/tags/{version}", self.release_index_url)
        };
        self.client
            .get(&url)
            .header("User-Agent", "gowa-manager")
            .send()
            .await
            .context("failed to query release index")?
            .error_for_status()
            .context("release index returned an error status")?
            .json::<Release>()
            .await
            .context("failed to parse release index response")
    }

    async fn fetch_releases(&self, limit: usize) -> Result<Vec<Release>> {
        let url = &self.release_index_url;
        let mut releases: Vec<Release> = self
            .client
            .get(url)
            .header("User-Agent", "gowa-manager")
            .send()
            .await
            .context("failed to query release index")?
            .error_for_status()
            .context("release index returned an error status")?
            .json()
            .await
            .context("failed to parse release index response")?;
        releases.truncate(limit);
        Ok(releases)
    }

    /// Deletes `bin/versions/<tag>` recursively. `latest` is not removable.
    pub fn remove(&self, tag: &str) -> Result<(), AppError> {
        if tag == "latest" {
            return Err(AppError::Validation("the latest alias cannot be removed".to_string()));
        }
        let dir = self.paths.versions_dir.join(tag);
        if dir.exists() {
            std::fs::remove_dir_all(&dir)
                .map_err(|e| AppError::Internal(anyhow::anyhow!(e)))?;
        }
        Ok(())
    }

    pub fn installed(&self) -> Result<Vec<VersionInfo>> {
        let mut infos = Vec::new();
        for tag in self.installed_tags() {
            let path = self.paths.version_binary_path(&tag);
            let metadata = std::fs::metadata(&path).ok();
            infos.push((tag, path, metadata));
        }
        infos.sort_by(|a, b| b.0.cmp(&a.0));
        let newest = infos.first().map(|(tag, _, _)| tag.clone());

        Ok(infos
            .into_iter()
            .map(|(tag, path, metadata)| VersionInfo {
                is_latest: Some(&tag) == newest.as_ref(),
                installed: metadata.is_some(),
                size: metadata.as_ref().map(|m| m.len()),
                installed_at: metadata
                    .as_ref()
                    .and_then(|m| m.modified().ok())
                    .map(DateTime::<Utc>::from),
                path: Some(path.to_string_lossy().to_string()),
                version: tag,
            })
            .collect())
    }

    pub async fn available(&self, limit: usize) -> Result<Vec<VersionInfo>> {
        let installed_tags: Vec<String> = self.installed_tags();
        let newest_installed = {
            let mut tags = installed_tags.clone();
            tags.sort_by(|a, b| b.cmp(a));
            tags.into_iter().next()
        };

        let releases = self.fetch_releases(limit).await.unwrap_or_default();
        let head_tag = releases.first().map(|r| r.tag_name.clone());

        let mut out = vec![VersionInfo {
            version: "latest".to_string(),
            path: None,
            installed: newest_installed.is_some(),
            is_latest: true,
            size: None,
            installed_at: None,
        }];

        for release in releases {
            let is_installed = installed_tags.contains(&release.tag_name);
            out.push(VersionInfo {
                is_latest: Some(&release.tag_name) == head_tag.as_ref(),
                installed: is_installed,
                path: None,
                size: None,
                installed_at: None,
                version: release.tag_name,
            });
        }

        Ok(out)
    }

    /// Per-tag directory size under `bin/versions/`.
    pub fn usage(&self) -> Result<BTreeMap<String, u64>> {
        let mut usage = BTreeMap::new();
        for tag in self.installed_tags() {
            let dir = self.paths.versions_dir.join(&tag);
            usage.insert(tag, directory_size(&dir).unwrap_or(0));
        }
        Ok(usage)
    }

    /// Removes all but the `keep` newest installed versions (by install
    /// time). Returns the removed tags.
    pub fn cleanup(&self, keep: usize) -> Result<Vec<String>> {
        let mut tags_with_time: Vec<(String, std::time::SystemTime)> = self
            .installed_tags()
            .into_iter()
            .map(|tag| {
                let mtime = std::fs::metadata(self.paths.version_binary_path(&tag))
                    .and_then(|m| m.modified())
                    .unwrap_or(std::time::UNIX_EPOCH);
                (tag, mtime)
            })
            .collect();
        tags_with_time.sort_by(|a, b| b.1.cmp(&a.1));

        let mut removed = Vec::new();
        for (tag, _) in tags_with_time.into_iter().skip(keep) {
            match self.remove(&tag) {
                Ok(()) => removed.push(tag),
                Err(e) => warn!("failed to remove version {tag} during cleanup: {e}"),
            }
        }
        Ok(removed)
    }
}

fn directory_size(dir: &Path) -> Result<u64> {
    if !dir.exists() {
        bail!("directory does not exist: {dir:?}");
    }
    let mut total = 0u64;
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let metadata = entry.metadata()?;
        if metadata.is_dir() {
            total += directory_size(&entry.path()).unwrap_or(0);
        } else {
            total += metadata.len();
        }
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(tmp: &std::path::Path) -> VersionManager {
        let paths = Paths::new(Some(tmp.to_path_buf())).unwrap();
        VersionManager::new(paths, "http://127.0.0.1:0/releases".to_string())
    }

    #[test]
    fn resolve_latest_falls_back_to_legacy_path_when_nothing_installed() {
        let tmp = tempfile::tempdir().unwrap();
        let vm = manager(tmp.path());
        let err = vm.resolve("latest").unwrap_err();
        assert!(matches!(err, AppError::VersionUnavailable(_)));
    }

    #[test]
    fn resolve_latest_picks_lexicographically_newest_installed_tag() {
        let tmp = tempfile::tempdir().unwrap();
        let vm = manager(tmp.path());

        for tag in ["v7.5.0", "v7.5.1", "v7.4.9"] {
            let path = vm.paths.version_binary_path(tag);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(&path, b"fake-binary").unwrap();
        }

        let resolved = vm.resolve("latest").unwrap();
        assert!(resolved.ends_with("v7.5.1/gowa") || resolved.ends_with("v7.5.1\\gowa.exe"));
    }

    #[test]
    fn installed_marks_the_newest_tag() {
        let tmp = tempfile::tempdir().unwrap();
        let vm = manager(tmp.path());
        for tag in ["v1.0.0", "v1.1.0"] {
            let path = vm.paths.version_binary_path(tag);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(&path, b"x").unwrap();
        }
        let infos = vm.installed().unwrap();
        let newest = infos.iter().find(|i| i.version == "v1.1.0").unwrap();
        assert!(newest.is_latest);
        let older = infos.iter().find(|i| i.version == "v1.0.0").unwrap();
        assert!(!older.is_latest);
    }

    #[test]
    fn remove_refuses_the_latest_alias() {
        let tmp = tempfile::tempdir().unwrap();
        let vm = manager(tmp.path());
        let err = vm.remove("latest").unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[test]
    fn cleanup_keeps_only_the_newest_n() {
        let tmp = tempfile::tempdir().unwrap();
        let vm = manager(tmp.path());
        for tag in ["v1.0.0", "v1.1.0", "v1.2.0"] {
            let path = vm.paths.version_binary_path(tag);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(&path, b"x").unwrap();
        }
        let removed = vm.cleanup(1).unwrap();
        assert_eq!(removed.len(), 2);
        assert_eq!(vm.installed_tags().len(), 1);
    }
}
