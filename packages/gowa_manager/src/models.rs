//! Domain types for instances, their configuration, and status reporting.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

/// Lifecycle status of a persisted instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum InstanceStatus {
    Stopped,
    Running,
    Error,
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            InstanceStatus::Stopped => "stopped",
            InstanceStatus::Running => "running",
            InstanceStatus::Error => "error",
        };
        write!(f, "{s}")
    }
}

/// `basicAuth` entry: one `--basic-auth=user:pass` flag per entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BasicAuthEntry {
    pub username: String,
    pub password: String,
}

/// Typed flag sub-object of `config`. Serialized to long-form `--flag=value`
/// CLI tokens in this exact field order, appended after `args`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Flags {
    #[serde(default, rename = "accountValidation", skip_serializing_if = "Option::is_none")]
    pub account_validation: Option<bool>,
    #[serde(default, rename = "basicAuth", skip_serializing_if = "Vec::is_empty")]
    pub basic_auth: Vec<BasicAuthEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub webhooks: Vec<String>,
    #[serde(default, rename = "autoMarkRead", skip_serializing_if = "Option::is_none")]
    pub auto_mark_read: Option<bool>,
    #[serde(default, rename = "autoReply", skip_serializing_if = "Option::is_none")]
    pub auto_reply: Option<String>,
    #[serde(default, rename = "basePath", skip_serializing_if = "Option::is_none")]
    pub base_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debug: Option<bool>,
    #[serde(default, rename = "webhookSecret", skip_serializing_if = "Option::is_none")]
    pub webhook_secret: Option<String>,
}

impl Flags {
    /// Serialize to long-form CLI tokens in the enumerated order. Deterministic.
    pub fn to_cli_args(&self) -> Vec<String> {
        let mut out = Vec::new();
        if let Some(v) = self.account_validation {
            out.push(format!("--account-validation={v}"));
        }
        for entry in &self.basic_auth {
            out.push(format!("--basic-auth={}:{}", entry.username, entry.password));
        }
        if let Some(v) = &self.os {
            out.push(format!("--os={v}"));
        }
        for url in &self.webhooks {
            out.push(format!("--webhook={url}"));
        }
        if let Some(v) = self.auto_mark_read {
            out.push(format!("--auto-mark-read={v}"));
        }
        if let Some(v) = &self.auto_reply {
            out.push(format!("--autoreply={v}"));
        }
        if let Some(v) = &self.base_path {
            out.push(format!("--base-path={v}"));
        }
        if let Some(v) = self.debug {
            out.push(format!("--debug={v}"));
        }
        if let Some(v) = &self.webhook_secret {
            out.push(format!("--webhook-secret={v}"));
        }
        out
    }
}

/// `args` accepts either a JSON array or a whitespace-split string. Tokens
/// are never shell-interpreted either way. Normalized to a `Vec<String>` at
/// ingress per the static-typed-rewrite design note in §9.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum ArgsInput {
    List(Vec<String>),
    Spaced(String),
}

impl ArgsInput {
    fn normalize(self) -> Vec<String> {
        match self {
            ArgsInput::List(v) => v,
            ArgsInput::Spaced(s) => s.split_whitespace().map(str::to_string).collect(),
        }
    }
}

fn deserialize_args<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<ArgsInput>::deserialize(deserializer)?
        .map(ArgsInput::normalize)
        .unwrap_or_default())
}

/// `env` accepts either a JSON object or a whitespace-split `KEY=value` string.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum EnvInput {
    Map(BTreeMap<String, String>),
    Spaced(String),
}

impl EnvInput {
    fn normalize(self) -> BTreeMap<String, String> {
        match self {
            EnvInput::Map(m) => m,
            EnvInput::Spaced(s) => parse_env_string(&s),
        }
    }
}

fn parse_env_string(s: &str) -> BTreeMap<String, String> {
    s.split_whitespace()
        .filter_map(|tok| tok.split_once('='))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn deserialize_env<'de, D>(deserializer: D) -> Result<BTreeMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<EnvInput>::deserialize(deserializer)?
        .map(EnvInput::normalize)
        .unwrap_or_default())
}

/// Structured form of the instance's JSON `config` column.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstanceConfig {
    #[serde(default, deserialize_with = "deserialize_args", skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, deserialize_with = "deserialize_env", skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    /// Legacy equivalent of `env`, accepted for historical callers.
    #[serde(default, rename = "envVars", skip_serializing_if = "Option::is_none")]
    pub env_vars: Option<String>,
    #[serde(default, skip_serializing_if = "is_default_flags")]
    pub flags: Flags,
}

fn is_default_flags(flags: &Flags) -> bool {
    flags == &Flags::default()
}

impl InstanceConfig {
    /// `env`, falling back to the legacy `envVars` string when `env` is empty.
    fn effective_env(&self) -> BTreeMap<String, String> {
        if !self.env.is_empty() {
            self.env.clone()
        } else if let Some(legacy) = &self.env_vars {
            parse_env_string(legacy)
        } else {
            BTreeMap::new()
        }
    }

    /// Default config assigned at create time, per §4.1.
    pub fn default_for(proxy_prefix: &str, key: &str) -> Self {
        InstanceConfig {
            args: vec!["rest".to_string(), "--port=PORT".to_string()],
            env: BTreeMap::new(),
            env_vars: None,
            flags: Flags {
                account_validation: Some(true),
                os: Some("GowaManager".to_string()),
                base_path: Some(format!("/{proxy_prefix}/{key}")),
                ..Default::default()
            },
        }
    }

    /// Materializes argv and env for spawning, substituting the literal
    /// substring `PORT` in every argv token and layering the child's
    /// environment: inherited parent env, then `PORT=<port>`, then the
    /// configured entries (which take precedence), per §4.1.
    pub fn materialize(&self, port: u16) -> (Vec<String>, Vec<(String, String)>) {
        let port_str = port.to_string();

        let mut argv: Vec<String> = self
            .args
            .iter()
            .map(|tok| tok.replace("PORT", &port_str))
            .collect();
        argv.extend(self.flags.to_cli_args());

        let mut env: Vec<(String, String)> = vec![("PORT".to_string(), port_str)];
        for (k, v) in self.effective_env() {
            if let Some(existing) = env.iter_mut().find(|(ek, _)| *ek == k) {
                existing.1 = v;
            } else {
                env.push((k, v));
            }
        }

        (argv, env)
    }
}

/// Primary entity: a named, persisted configuration for one child process.
#[derive(Debug, Clone, Serialize)]
pub struct Instance {
    pub id: i64,
    pub key: String,
    pub name: String,
    pub port: Option<u16>,
    pub status: InstanceStatus,
    pub config: InstanceConfig,
    #[serde(rename = "gowaVersion")]
    pub gowa_version: String,
    #[serde(rename = "errorMessage")]
    pub error_message: Option<String>,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
    #[serde(rename = "updatedAt")]
    pub updated_at: DateTime<Utc>,
}

/// Request body for create/update. All fields optional; absent fields keep
/// the existing value on update, or fall back to §4.1 defaults on create.
#[derive(Debug, Clone, Deserialize)]
pub struct InstanceRequest {
    pub name: Option<String>,
    pub config: Option<InstanceConfig>,
    #[serde(alias = "gowaVersion")]
    pub gowa_version: Option<String>,
}

/// `{id, name, status, port, pid?, uptime_ms?, error_message?, resources?}`.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub id: i64,
    pub name: String,
    pub status: InstanceStatus,
    pub port: Option<u16>,
    pub pid: Option<u32>,
    #[serde(rename = "uptimeMs", skip_serializing_if = "Option::is_none")]
    pub uptime_ms: Option<i64>,
    #[serde(rename = "errorMessage", skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceSample>,
}

/// One resource-monitor reading, present iff the child is live and sampling
/// succeeded.
#[derive(Debug, Clone, Serialize)]
pub struct ResourceSample {
    #[serde(rename = "cpuPercent")]
    pub cpu_percent: f32,
    #[serde(rename = "memoryMB")]
    pub memory_mb: f64,
    #[serde(rename = "memoryPercent")]
    pub memory_percent: f32,
    #[serde(rename = "avgCpu", skip_serializing_if = "Option::is_none")]
    pub avg_cpu: Option<f32>,
    #[serde(rename = "avgMemory", skip_serializing_if = "Option::is_none")]
    pub avg_memory: Option<f64>,
    #[serde(rename = "diskMB", skip_serializing_if = "Option::is_none")]
    pub disk_mb: Option<f64>,
}

/// Secondary entity, materialized from the filesystem — not persisted.
#[derive(Debug, Clone, Serialize)]
pub struct VersionInfo {
    pub version: String,
    pub path: Option<String>,
    pub installed: bool,
    #[serde(rename = "isLatest")]
    pub is_latest: bool,
    pub size: Option<u64>,
    #[serde(rename = "installedAt", skip_serializing_if = "Option::is_none")]
    pub installed_at: Option<DateTime<Utc>>,
}

/// Auto-updater status, polled via `GET /api/system/auto-update/status`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct UpdaterStatus {
    #[serde(rename = "lastCheck", skip_serializing_if = "Option::is_none")]
    pub last_check: Option<DateTime<Utc>>,
    #[serde(rename = "lastUpdate", skip_serializing_if = "Option::is_none")]
    pub last_update: Option<DateTime<Utc>>,
    #[serde(rename = "latestVersion", skip_serializing_if = "Option::is_none")]
    pub latest_version: Option<String>,
    #[serde(rename = "isChecking")]
    pub is_checking: bool,
    #[serde(rename = "nextCheck", skip_serializing_if = "Option::is_none")]
    pub next_check: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn args_accepts_array_or_spaced_string() {
        let from_array: InstanceConfig =
            serde_json::from_value(serde_json::json!({"args": ["rest", "--port=PORT"]})).unwrap();
        assert_eq!(from_array.args, vec!["rest", "--port=PORT"]);

        let from_string: InstanceConfig =
            serde_json::from_value(serde_json::json!({"args": "rest --port=PORT"})).unwrap();
        assert_eq!(from_string.args, vec!["rest", "--port=PORT"]);
    }

    #[test]
    fn env_accepts_object_or_spaced_string_or_legacy_env_vars() {
        let from_object: InstanceConfig =
            serde_json::from_value(serde_json::json!({"env": {"FOO": "bar"}})).unwrap();
        assert_eq!(from_object.effective_env().get("FOO"), Some(&"bar".to_string()));

        let from_string: InstanceConfig =
            serde_json::from_value(serde_json::json!({"env": "FOO=bar BAZ=qux"})).unwrap();
        assert_eq!(from_string.effective_env().len(), 2);

        let legacy: InstanceConfig =
            serde_json::from_value(serde_json::json!({"envVars": "FOO=bar"})).unwrap();
        assert_eq!(legacy.effective_env().get("FOO"), Some(&"bar".to_string()));
    }

    #[test]
    fn flags_serialize_in_enumerated_order() {
        let flags = Flags {
            account_validation: Some(true),
            basic_auth: vec![BasicAuthEntry {
                username: "u".to_string(),
                password: "p".to_string(),
            }],
            os: Some("linux".to_string()),
            webhooks: vec!["https://example.com/hook".to_string()],
            auto_mark_read: Some(false),
            auto_reply: Some("away".to_string()),
            base_path: Some("/app/ABCD1234".to_string()),
            debug: Some(true),
            webhook_secret: Some("s3cr3t".to_string()),
        };
        assert_eq!(
            flags.to_cli_args(),
            vec![
                "--account-validation=true".to_string(),
                "--basic-auth=u:p".to_string(),
                "--os=linux".to_string(),
                "--webhook=https://example.com/hook".to_string(),
                "--auto-mark-read=false".to_string(),
                "--autoreply=away".to_string(),
                "--base-path=/app/ABCD1234".to_string(),
                "--debug=true".to_string(),
                "--webhook-secret=s3cr3t".to_string(),
            ]
        );
    }

    #[test]
    fn materialize_substitutes_port_and_appends_flags_with_precedence() {
        let mut config = InstanceConfig::default_for("app", "ABCD1234");
        config.env.insert("PORT".to_string(), "9999".to_string());
        let (argv, env) = config.materialize(8005);

        assert_eq!(argv[0], "rest");
        assert_eq!(argv[1], "--port=8005");
        assert!(argv.contains(&"--account-validation=true".to_string()));
        assert!(argv.contains(&"--os=GowaManager".to_string()));
        assert!(argv.contains(&"--base-path=/app/ABCD1234".to_string()));

        // configured entries take precedence over the PORT default
        let port_entry = env.iter().find(|(k, _)| k == "PORT").unwrap();
        assert_eq!(port_entry.1, "9999");
    }

    #[test]
    fn round_trip_config_preserves_semantic_content() {
        let config = InstanceConfig::default_for("app", "ABCD1234");
        let json = serde_json::to_string(&config).unwrap();
        let parsed: InstanceConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.materialize(8000), config.materialize(8000));
    }
}
