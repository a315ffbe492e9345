//! Node configuration loaded from TOML.
//!
//! Supports `${VAR_NAME}` environment variable substitution before parsing,
//! so secrets like the discovery API key can stay out of the file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use regex::Regex;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::auth::Ed25519Signer;
use crate::live::LiveConfig;
use crate::storage::{StateLayout, normalize_domain};

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Read(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid substitution pattern: {0}")]
    Pattern(#[from] regex::Error),

    #[error("config validation error: {0}")]
    Validation(String),
}

/// Root configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NodeConfig {
    #[serde(default)]
    pub node: NodeSection,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub comments: CommentsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NodeSection {
    /// This node's public domain.
    #[serde(default)]
    pub domain: String,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "default_site_dir")]
    pub site_dir: PathBuf,
}

impl Default for NodeSection {
    fn default() -> Self {
        Self {
            domain: String::new(),
            data_dir: default_data_dir(),
            site_dir: default_site_dir(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_site_dir() -> PathBuf {
    PathBuf::from("site")
}

#[derive(Debug, Clone, Deserialize)]
pub struct DiscoveryConfig {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_query_limit")]
    pub query_limit: usize,
    /// File holding a hex-encoded 32-byte Ed25519 seed. Enables signed
    /// queries.
    #[serde(default)]
    pub signing_key_path: Option<PathBuf>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            api_key: String::new(),
            timeout_secs: default_timeout_secs(),
            query_limit: default_query_limit(),
            signing_key_path: None,
        }
    }
}

fn default_timeout_secs() -> u64 {
    5
}

fn default_query_limit() -> usize {
    crate::engine::DEFAULT_QUERY_LIMIT
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
        }
    }
}

fn default_interval_secs() -> u64 {
    60
}

#[derive(Debug, Clone, Deserialize)]
pub struct CommentsConfig {
    /// Shell command run after a local comment draft is blessed or denied.
    #[serde(default)]
    pub hook: Option<String>,
    #[serde(default = "default_hook_timeout_secs")]
    pub hook_timeout_secs: u64,
}

impl Default for CommentsConfig {
    fn default() -> Self {
        Self {
            hook: None,
            hook_timeout_secs: default_hook_timeout_secs(),
        }
    }
}

fn default_hook_timeout_secs() -> u64 {
    10
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive when `POLIS_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_true")]
    pub stdout: bool,
    /// Write daily-rotated log files under `dir`.
    #[serde(default)]
    pub file: bool,
    #[serde(default = "default_log_dir")]
    pub dir: PathBuf,
    #[serde(default = "default_max_files")]
    pub max_files: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            stdout: true,
            file: false,
            dir: default_log_dir(),
            max_files: default_max_files(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_max_files() -> usize {
    7
}

impl NodeConfig {
    /// Load configuration from `path`. A missing file yields defaults.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            info!(path = %path.display(), "config file not found, using defaults");
            return Ok(Self::default());
        }
        info!(path = %path.display(), "loading configuration");
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate a TOML document, substituting `${VAR}` from the
    /// process environment.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let content = substitute_env_vars(content, |name| std::env::var(name).ok())?;
        debug!("parsing TOML configuration");
        let config: NodeConfig = toml::from_str(&content)?;
        config.validate()?;
        info!(
            domain = %config.node.domain,
            discovery = config.discovery_configured(),
            interval_secs = config.sync.interval_secs,
            "configuration loaded"
        );
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.discovery_configured() && normalize_domain(&self.node.domain).is_empty() {
            return Err(ConfigError::Validation(
                "node.domain is required when discovery is configured".to_string(),
            ));
        }
        if self.sync.interval_secs == 0 {
            return Err(ConfigError::Validation(
                "sync.interval_secs must be greater than zero".to_string(),
            ));
        }
        if self.discovery.query_limit == 0 {
            return Err(ConfigError::Validation(
                "discovery.query_limit must be greater than zero".to_string(),
            ));
        }
        if self.discovery.url.contains("${") || self.discovery.api_key.contains("${") {
            warn!("discovery settings contain an unsubstituted environment variable");
        }
        Ok(())
    }

    /// `false` when the discovery URL or API key is empty; the engine then
    /// makes no network calls.
    pub fn discovery_configured(&self) -> bool {
        !self.discovery.url.trim().is_empty() && !self.discovery.api_key.trim().is_empty()
    }

    /// Storage layout for this node and discovery service.
    pub fn layout(&self) -> StateLayout {
        StateLayout::new(
            &self.node.data_dir,
            &self.node.site_dir,
            namespace_for(&self.discovery.url),
        )
    }

    /// Bound on each discovery query and remote fetch.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.discovery.timeout_secs.max(1))
    }

    /// Bound on each comment hook run.
    pub fn hook_timeout(&self) -> Duration {
        Duration::from_secs(self.comments.hook_timeout_secs.max(1))
    }

    /// Scheduler settings.
    pub fn live_config(&self) -> LiveConfig {
        LiveConfig {
            interval: Duration::from_secs(self.sync.interval_secs),
            ..LiveConfig::default()
        }
    }

    /// Load the request signer, if a signing key is configured.
    pub fn signer(&self) -> Result<Option<Ed25519Signer>, ConfigError> {
        let Some(path) = &self.discovery.signing_key_path else {
            return Ok(None);
        };
        let seed_hex = std::fs::read_to_string(path)?;
        Ed25519Signer::from_hex_seed(normalize_domain(&self.node.domain), &seed_hex)
            .map(Some)
            .ok_or_else(|| {
                ConfigError::Validation(format!(
                    "{} does not hold a 64-digit hex seed",
                    path.display()
                ))
            })
    }
}

/// Storage namespace for a discovery service URL: its host, with
/// `_<port>` appended for a non-default port.
pub fn namespace_for(url: &str) -> String {
    match reqwest::Url::parse(url.trim()) {
        Ok(parsed) => match (parsed.host_str(), parsed.port()) {
            (Some(host), Some(port)) => format!("{}_{port}", host.to_ascii_lowercase()),
            (Some(host), None) => host.to_ascii_lowercase(),
            (None, _) => "default".to_string(),
        },
        Err(_) => "default".to_string(),
    }
}

/// Substitute `${VAR_NAME}` placeholders using `lookup`. Unset variables
/// keep their placeholder.
fn substitute_env_vars(
    content: &str,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<String, regex::Error> {
    let re = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}")?;
    Ok(re
        .replace_all(content, |caps: &regex::Captures| {
            let var_name = &caps[1];
            match lookup(var_name) {
                Some(value) => value,
                None => {
                    debug!(var = %var_name, "environment variable not set, keeping placeholder");
                    caps[0].to_string()
                }
            }
        })
        .into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_var_substitution() {
        let output = substitute_env_vars("api_key = \"${DS_KEY}\"", |name| {
            (name == "DS_KEY").then(|| "secret".to_string())
        })
        .expect("pattern compiles");
        assert_eq!(output, "api_key = \"secret\"");
    }

    #[test]
    fn env_var_not_set_keeps_placeholder() {
        let output = substitute_env_vars("url = \"${NOPE}\"", |_| None).expect("pattern compiles");
        assert_eq!(output, "url = \"${NOPE}\"");
    }

    #[test]
    fn defaults_without_discovery() {
        let config = NodeConfig::from_toml_str("").expect("empty config is valid");
        assert!(!config.discovery_configured());
        assert_eq!(config.sync.interval_secs, 60);
        assert_eq!(config.discovery.query_limit, 1000);
        assert_eq!(config.request_timeout(), Duration::from_secs(5));
        assert_eq!(config.comments.hook_timeout_secs, 10);
        assert!(config.logging.stdout);
    }

    #[test]
    fn parse_full_config() {
        let toml = r#"
            [node]
            domain = "alice.example"
            data_dir = "/var/lib/polis"
            site_dir = "/srv/site"

            [discovery]
            url = "https://ds.example:8443/api"
            api_key = "k"
            query_limit = 200

            [sync]
            interval_secs = 15

            [comments]
            hook = "make deploy"

            [logging]
            level = "debug"
            file = true
            max_files = 3
        "#;
        let config = NodeConfig::from_toml_str(toml).expect("config should parse");
        assert!(config.discovery_configured());
        assert_eq!(config.live_config().interval, Duration::from_secs(15));
        assert_eq!(config.layout().namespace(), "ds.example_8443");
        assert_eq!(config.comments.hook.as_deref(), Some("make deploy"));
        assert_eq!(config.logging.max_files, 3);
    }

    #[test]
    fn discovery_requires_domain() {
        let toml = r#"
            [discovery]
            url = "https://ds.example"
            api_key = "k"
        "#;
        assert!(matches!(
            NodeConfig::from_toml_str(toml),
            Err(ConfigError::Validation(_))
        ));
    }

    #[test]
    fn zero_interval_is_rejected() {
        let toml = "[sync]\ninterval_secs = 0\n";
        assert!(matches!(
            NodeConfig::from_toml_str(toml),
            Err(ConfigError::Validation(_))
        ));
    }

    #[test]
    fn namespace_derivation() {
        assert_eq!(namespace_for("https://DS.example/api"), "ds.example");
        assert_eq!(namespace_for("http://localhost:8080"), "localhost_8080");
        assert_eq!(namespace_for("https://ds.example:443"), "ds.example");
        assert_eq!(namespace_for(""), "default");
    }

    #[test]
    fn signer_reads_hex_seed() {
        let dir = tempfile::tempdir().expect("failed to create tmpdir");
        let key_path = dir.path().join("key.hex");
        std::fs::write(&key_path, format!("{}\n", "ab".repeat(32))).expect("write key");
        let config = NodeConfig {
            node: NodeSection {
                domain: "alice.example".to_string(),
                ..NodeSection::default()
            },
            discovery: DiscoveryConfig {
                signing_key_path: Some(key_path),
                ..DiscoveryConfig::default()
            },
            ..NodeConfig::default()
        };
        assert!(config.signer().expect("signer loads").is_some());
        assert!(NodeConfig::default().signer().expect("no key").is_none());
    }
}
