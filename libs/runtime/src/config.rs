use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, Serialize};

use sandbox_rules::DelaySpec;

/// Main application configuration: strongly-typed sections, loaded layered
/// (defaults → YAML file → `SANDBOX__`-prefixed environment variables).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    /// Path to the OpenAPI document (JSON or YAML).
    pub oas: Option<String>,
    /// Path to the scenarios (rules) file.
    pub scenarios: Option<String>,
    /// Defaults to the in-memory backend when absent. Kept optional so the
    /// figment defaults layer never merges a second backend key into the
    /// externally-tagged enum.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub store: Option<StoreSettings>,
    #[serde(default)]
    pub validate: ValidateSettings,
    #[serde(default = "default_seed")]
    pub seed: String,
    #[serde(default)]
    pub chaos: ChaosSettings,
    #[serde(default)]
    pub logging: Option<LoggingSettings>,
    /// Reserved for the record/replay proxy; accepted but unused.
    #[serde(default)]
    pub proxy: Option<serde_json::Value>,
}

fn default_seed() -> String {
    "sandbox".to_string()
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            oas: None,
            scenarios: None,
            store: None,
            validate: ValidateSettings::default(),
            seed: default_seed(),
            chaos: ChaosSettings::default(),
            logging: None,
            proxy: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub cors_enabled: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8787,
            cors_enabled: false,
        }
    }
}

/// State store backend selection, externally tagged:
/// `store: { memory: {...} }` / `{ file: {...} }` / `{ network: {...} }`.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreSettings {
    Memory(MemoryStoreSettings),
    File(FileStoreSettings),
    Network(NetworkStoreSettings),
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self::Memory(MemoryStoreSettings::default())
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct MemoryStoreSettings {
    #[serde(default = "default_max_size")]
    pub max_size: usize,
    /// Seconds; applied to writes that carry no TTL of their own.
    #[serde(default)]
    pub default_ttl: Option<u64>,
}

fn default_max_size() -> usize {
    10_000
}

impl Default for MemoryStoreSettings {
    fn default() -> Self {
        Self {
            max_size: default_max_size(),
            default_ttl: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct FileStoreSettings {
    /// Base path; the store writes `<base>.log` and `<base>.snapshot`.
    pub path: String,
    #[serde(default = "default_compaction_interval", with = "humantime_serde")]
    pub compaction_interval: Duration,
    #[serde(default = "default_true")]
    pub snapshot_on_shutdown: bool,
}

fn default_compaction_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct NetworkStoreSettings {
    pub host: String,
    #[serde(default = "default_redis_port")]
    pub port: u16,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub db: i64,
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

fn default_redis_port() -> u16 {
    6379
}

fn default_key_prefix() -> String {
    "sandbox:".to_string()
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ValidateSettings {
    #[serde(default = "default_true")]
    pub requests: bool,
    #[serde(default)]
    pub responses: ResponsesMode,
}

impl Default for ValidateSettings {
    fn default() -> Self {
        Self {
            requests: true,
            responses: ResponsesMode::default(),
        }
    }
}

/// `"strict"`, `"warn"`, or `false` (spelled `off` from the environment).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponsesMode {
    Strict,
    #[default]
    Warn,
    Off,
}

impl<'de> Deserialize<'de> for ResponsesMode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Flag(bool),
            Name(String),
        }
        match Raw::deserialize(deserializer)? {
            Raw::Flag(false) => Ok(Self::Off),
            Raw::Flag(true) => Ok(Self::Warn),
            Raw::Name(name) => match name.as_str() {
                "strict" => Ok(Self::Strict),
                "warn" => Ok(Self::Warn),
                "off" | "false" => Ok(Self::Off),
                other => Err(serde::de::Error::custom(format!(
                    "responses must be \"strict\", \"warn\" or false, got '{other}'"
                ))),
            },
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ChaosSettings {
    /// Delay-spec grammar: `250`, `"250ms"`, `"100±20ms"`, `"p95=200ms"`.
    #[serde(default)]
    pub latency: Option<DelaySpec>,
    #[serde(default)]
    pub error_rate: f64,
}

/// Logging: console level plus an optional rotating file sink.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingSettings {
    #[serde(default = "default_console_level")]
    pub console_level: String,
    #[serde(default)]
    pub file: Option<String>,
    #[serde(default = "default_file_level")]
    pub file_level: String,
    #[serde(default = "default_backups")]
    pub max_backups: usize,
    #[serde(default = "default_file_size")]
    pub max_size_mb: u64,
}

fn default_console_level() -> String {
    "info".to_string()
}

fn default_file_level() -> String {
    "debug".to_string()
}

fn default_backups() -> usize {
    3
}

fn default_file_size() -> u64 {
    100
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            console_level: default_console_level(),
            file: None,
            file_level: default_file_level(),
            max_backups: default_backups(),
            max_size_mb: default_file_size(),
        }
    }
}

/// Command-line overrides applied after the layered load.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub port: Option<u16>,
    pub oas: Option<String>,
    pub scenarios: Option<String>,
    pub seed: Option<String>,
    pub verbose: u8,
}

impl AppConfig {
    /// Layered load: struct defaults → YAML file → environment variables.
    /// `SANDBOX__SERVER__PORT=9000` maps to `server.port`.
    pub fn load_layered<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        use figment::{
            providers::{Env, Format, Serialized, Yaml},
            Figment,
        };

        Figment::new()
            .merge(Serialized::defaults(AppConfig::default()))
            .merge(Yaml::file(config_path.as_ref()))
            .merge(Env::prefixed("SANDBOX__").split("__"))
            .extract()
            .context("failed to extract configuration")
    }

    pub fn load_or_default<P: AsRef<Path>>(config_path: Option<P>) -> Result<Self> {
        match config_path {
            Some(path) => Self::load_layered(path),
            None => Ok(Self::default()),
        }
    }

    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).context("failed to serialize config to YAML")
    }

    pub fn apply_cli_overrides(&mut self, overrides: &CliOverrides) {
        if let Some(port) = overrides.port {
            self.server.port = port;
        }
        if let Some(oas) = &overrides.oas {
            self.oas = Some(oas.clone());
        }
        if let Some(scenarios) = &overrides.scenarios {
            self.scenarios = Some(scenarios.clone());
        }
        if let Some(seed) = &overrides.seed {
            self.seed = seed.clone();
        }

        let logging = self.logging.get_or_insert_with(LoggingSettings::default);
        match overrides.verbose {
            0 => {}
            1 => logging.console_level = "debug".to_string(),
            _ => logging.console_level = "trace".to_string(),
        }
    }

    /// Effective store backend: configured, or the in-memory default.
    pub fn store_settings(&self) -> StoreSettings {
        self.store.clone().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn defaults_are_sane() {
        let c = AppConfig::default();
        assert_eq!(c.server.port, 8787);
        assert_eq!(c.seed, "sandbox");
        assert!(c.validate.requests);
        assert_eq!(c.validate.responses, ResponsesMode::Warn);
        assert!(c.store.is_none());
        assert!(matches!(c.store_settings(), StoreSettings::Memory(_)));
    }

    #[test]
    fn yaml_layer_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(
            &path,
            r#"
server: { host: 0.0.0.0, port: 9900 }
oas: ./spec.yaml
scenarios: ./rules.yaml
seed: replay-7
store:
  file:
    path: ./state/sandbox
    compactionInterval: 30s
    snapshotOnShutdown: false
validate:
  requests: false
  responses: strict
chaos:
  latency: "100±20ms"
  errorRate: 0.05
"#,
        )
        .unwrap();

        let c = AppConfig::load_layered(&path).unwrap();
        assert_eq!(c.server.port, 9900);
        assert_eq!(c.seed, "replay-7");
        assert!(!c.validate.requests);
        assert_eq!(c.validate.responses, ResponsesMode::Strict);
        assert_eq!(c.chaos.error_rate, 0.05);
        match &c.store_settings() {
            StoreSettings::File(f) => {
                assert_eq!(f.path, "./state/sandbox");
                assert_eq!(f.compaction_interval, Duration::from_secs(30));
                assert!(!f.snapshot_on_shutdown);
            }
            other => panic!("expected file store, got {other:?}"),
        }
    }

    #[test]
    fn responses_mode_accepts_false() {
        let c: ValidateSettings = serde_yaml::from_str("responses: false").unwrap();
        assert_eq!(c.responses, ResponsesMode::Off);
        let c: ValidateSettings = serde_yaml::from_str("responses: warn").unwrap();
        assert_eq!(c.responses, ResponsesMode::Warn);
        assert!(serde_yaml::from_str::<ValidateSettings>("responses: loud").is_err());
    }

    #[test]
    fn cli_overrides_win() {
        let mut c = AppConfig::default();
        c.apply_cli_overrides(&CliOverrides {
            port: Some(1234),
            oas: Some("api.json".to_string()),
            scenarios: None,
            seed: Some("s".to_string()),
            verbose: 2,
        });
        assert_eq!(c.server.port, 1234);
        assert_eq!(c.oas.as_deref(), Some("api.json"));
        assert_eq!(c.seed, "s");
        assert_eq!(c.logging.unwrap().console_level, "trace");
    }
}
