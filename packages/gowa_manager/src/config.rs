use anyhow::{Context, Result};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

// =============================================================================
// Unified config (figment-deserialized from defaults / config.toml / env vars)
// =============================================================================
//
// Layering, lowest to highest precedence: struct defaults, config.toml under
// the data directory, environment variables, CLI flag overrides.

/// Tunable configuration, deserialized by figment.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub admin_username: Option<String>,
    #[serde(default)]
    pub admin_password: Option<String>,
    #[serde(default = "default_proxy_prefix")]
    pub proxy_prefix: String,
    #[serde(default = "default_release_index_url")]
    pub release_index_url: String,
}

impl Default for FileConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            admin_username: None,
            admin_password: None,
            proxy_prefix: default_proxy_prefix(),
            release_index_url: default_release_index_url(),
        }
    }
}

fn default_port() -> u16 {
    3000
}

fn default_proxy_prefix() -> String {
    "app".to_string()
}

fn default_release_index_url() -> String {
    "https://api.github.com/repos/dimaskiddo/go-whatsapp-multidevice-rest/releases".to_string()
}

/// CLI overrides. Per §1 the argument parser is treated as a black box;
/// this surface is intentionally minimal: one flag per recognized
/// environment variable plus an explicit config file path.
#[derive(Parser, Debug, Default)]
#[command(name = "gowa-manager", about = "Multi-tenant GOWA process supervisor and reverse proxy")]
pub struct CliArgs {
    /// Data directory (overrides DATA_DIR).
    #[arg(long)]
    pub data_dir: Option<PathBuf>,
    /// Public listen port (overrides PORT).
    #[arg(long)]
    pub port: Option<u16>,
    /// Admin basic-auth username (overrides ADMIN_USERNAME).
    #[arg(long)]
    pub admin_username: Option<String>,
    /// Admin basic-auth password (overrides ADMIN_PASSWORD).
    #[arg(long)]
    pub admin_password: Option<String>,
    /// Explicit config.toml path, instead of `<data-dir>/config.toml`.
    #[arg(long)]
    pub config: Option<PathBuf>,
}

/// Build a figment that layers: defaults → config.toml → `GOWA_*`/named env
/// vars → CLI overrides.
pub fn load_config(data_dir: &Path, config_path: Option<&Path>, cli: &CliArgs) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    let toml_path = config_path
        .map(Path::to_path_buf)
        .unwrap_or_else(|| data_dir.join("config.toml"));

    let mut figment = Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Toml::file(toml_path))
        .merge(Env::raw().only(&["PORT"]).map(|_| "port".into()))
        .merge(Env::raw().only(&["ADMIN_USERNAME"]).map(|_| "admin_username".into()))
        .merge(Env::raw().only(&["ADMIN_PASSWORD"]).map(|_| "admin_password".into()))
        .merge(Env::raw().only(&["GOWA_PROXY_PREFIX"]).map(|_| "proxy_prefix".into()))
        .merge(Env::raw().only(&["GOWA_RELEASE_INDEX_URL"]).map(|_| "release_index_url".into()));

    if let Some(port) = cli.port {
        figment = figment.merge(Serialized::default("port", port));
    }
    if let Some(user) = &cli.admin_username {
        figment = figment.merge(Serialized::default("admin_username", user));
    }
    if let Some(pass) = &cli.admin_password {
        figment = figment.merge(Serialized::default("admin_password", pass));
    }

    figment
}

/// Directory layout, derived from `--data-dir`/`DATA_DIR`, not tunable via
/// figment.
#[derive(Clone, Debug)]
pub struct Paths {
    pub data_dir: PathBuf,
    pub db_path: PathBuf,
    pub bin_dir: PathBuf,
    pub versions_dir: PathBuf,
    pub instances_dir: PathBuf,
    pub temp_dir: PathBuf,
}

impl Paths {
    pub fn new(custom_dir: Option<PathBuf>) -> Result<Self> {
        let data_dir = custom_dir
            .or_else(|| std::env::var("DATA_DIR").ok().map(PathBuf::from))
            .unwrap_or_else(|| {
                dirs::home_dir()
                    .expect("could not determine home directory")
                    .join(".gowa-manager")
            });

        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("failed to create data directory: {data_dir:?}"))?;

        let bin_dir = data_dir.join("bin");
        let versions_dir = bin_dir.join("versions");
        std::fs::create_dir_all(&versions_dir)
            .with_context(|| format!("failed to create versions directory: {versions_dir:?}"))?;

        let instances_dir = data_dir.join("instances");
        std::fs::create_dir_all(&instances_dir)
            .with_context(|| format!("failed to create instances directory: {instances_dir:?}"))?;

        let temp_dir = data_dir.join("temp");
        std::fs::create_dir_all(&temp_dir)
            .with_context(|| format!("failed to create temp directory: {temp_dir:?}"))?;

        let db_path = data_dir.join("gowa.db");

        info!("data directory: {}", data_dir.display());

        Ok(Self {
            data_dir,
            db_path,
            bin_dir,
            versions_dir,
            instances_dir,
            temp_dir,
        })
    }

    pub fn db_url(&self) -> String {
        format!("sqlite://{}?mode=rwc", self.db_path.display())
    }

    /// Binary name for the current OS (`gowa` / `gowa.exe`).
    pub fn binary_name(&self) -> &'static str {
        if cfg!(windows) { "gowa.exe" } else { "gowa" }
    }

    pub fn version_binary_path(&self, tag: &str) -> PathBuf {
        self.versions_dir.join(tag).join(self.binary_name())
    }

    pub fn legacy_binary_path(&self) -> PathBuf {
        self.bin_dir.join(self.binary_name())
    }

    pub fn instance_dir(&self, instance_id: i64) -> PathBuf {
        self.instances_dir.join(instance_id.to_string())
    }
}

/// Fully resolved runtime configuration, assembled in `main.rs`.
#[derive(Clone, Debug)]
pub struct AppConfig {
    pub paths: Paths,
    pub port: u16,
    pub admin_username: Option<String>,
    pub admin_password: Option<String>,
    pub proxy_prefix: String,
    pub release_index_url: String,
}

impl AppConfig {
    pub fn load(cli: &CliArgs) -> Result<Self> {
        let paths = Paths::new(cli.data_dir.clone())?;
        let figment = load_config(&paths.data_dir, cli.config.as_deref(), cli);
        let file: FileConfig = figment.extract().context("failed to parse configuration")?;

        Ok(Self {
            paths,
            port: file.port,
            admin_username: file.admin_username,
            admin_password: file.admin_password,
            proxy_prefix: file.proxy_prefix,
            release_index_url: file.release_index_url,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_config_defaults() {
        let fc = FileConfig::default();
        assert_eq!(fc.port, 3000);
        assert_eq!(fc.proxy_prefix, "app");
        assert!(fc.admin_username.is_none());
    }

    #[test]
    fn load_config_defaults_without_toml_or_env() {
        let tmp = tempfile::tempdir().unwrap();
        let cli = CliArgs::default();
        let fc: FileConfig = load_config(tmp.path(), None, &cli).extract().unwrap();
        assert_eq!(fc.port, 3000);
        assert_eq!(fc.proxy_prefix, "app");
    }

    #[test]
    fn load_config_toml_overrides_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("config.toml"), "port = 4000\nproxy_prefix = \"gw\"\n").unwrap();
        let cli = CliArgs::default();
        let fc: FileConfig = load_config(tmp.path(), None, &cli).extract().unwrap();
        assert_eq!(fc.port, 4000);
        assert_eq!(fc.proxy_prefix, "gw");
    }

    #[test]
    fn cli_overrides_take_highest_precedence() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("config.toml"), "port = 4000\n").unwrap();
        let cli = CliArgs {
            port: Some(5000),
            ..Default::default()
        };
        let fc: FileConfig = load_config(tmp.path(), None, &cli).extract().unwrap();
        assert_eq!(fc.port, 5000);
    }

    #[test]
    fn paths_create_expected_layout() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = Paths::new(Some(tmp.path().to_path_buf())).unwrap();
        assert!(tmp.path().join("bin/versions").exists());
        assert!(tmp.path().join("instances").exists());
        assert!(tmp.path().join("temp").exists());
        assert_eq!(paths.db_path, tmp.path().join("gowa.db"));
    }

    #[test]
    fn version_binary_path_is_scoped_under_tag() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = Paths::new(Some(tmp.path().to_path_buf())).unwrap();
        let path = paths.version_binary_path("v7.5.1");
        assert!(path.ends_with("bin/versions/v7.5.1/gowa") || path.ends_with("bin/versions/v7.5.1/gowa.exe"));
    }
}
