//! TOML configuration.
//!
//! Every section is optional; a missing config file yields
//! [`Config::minimal`]. Command-line flags override what the file says.
//!
//! ```toml
//! [source]
//! conn = "10.0.2.16:8091"
//! bucket = "default"
//!
//! [destination]
//! conn = "10.0.2.17:8091"
//! bucket = "default"
//! username = "Administrator"
//! password = "secret"
//!
//! [admin]
//! design_document = "cb_admin"
//!
//! [retry]
//! ceiling = 10
//! document_base_ms = 50
//! view_base_ms = 5000
//!
//! [bulk]
//! page_size = 1000
//! mutation_concurrency = 1
//! read_concurrency = 100
//! progress_every = 1000
//! ```

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

/// Upper bound on any fan-out concurrency setting.
pub const MAX_CONCURRENCY: usize = 100;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub source: ClusterConfig,
    #[serde(default)]
    pub destination: ClusterConfig,
    #[serde(default)]
    pub admin: AdminConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub bulk: BulkConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ClusterConfig {
    /// `host:port` of the cluster management endpoint.
    #[serde(default)]
    pub conn: Option<String>,
    #[serde(default = "default_bucket")]
    pub bucket: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_view_port")]
    pub view_port: u16,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            conn: None,
            bucket: default_bucket(),
            username: None,
            password: None,
            view_port: default_view_port(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_bucket() -> String {
    "default".to_string()
}
fn default_view_port() -> u16 {
    8092
}
fn default_timeout_secs() -> u64 {
    75
}

#[derive(Debug, Deserialize, Clone)]
pub struct AdminConfig {
    /// Design document that holds the generated filter views.
    #[serde(default = "default_admin_design_document")]
    pub design_document: String,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            design_document: default_admin_design_document(),
        }
    }
}

fn default_admin_design_document() -> String {
    "cb_admin".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetryConfig {
    #[serde(default = "default_ceiling")]
    pub ceiling: u32,
    #[serde(default = "default_document_base_ms")]
    pub document_base_ms: u64,
    #[serde(default = "default_view_base_ms")]
    pub view_base_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            ceiling: default_ceiling(),
            document_base_ms: default_document_base_ms(),
            view_base_ms: default_view_base_ms(),
        }
    }
}

fn default_ceiling() -> u32 {
    10
}
fn default_document_base_ms() -> u64 {
    50
}
fn default_view_base_ms() -> u64 {
    5000
}

#[derive(Debug, Deserialize, Clone)]
pub struct BulkConfig {
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    #[serde(default = "default_mutation_concurrency")]
    pub mutation_concurrency: usize,
    #[serde(default = "default_read_concurrency")]
    pub read_concurrency: usize,
    #[serde(default = "default_progress_every")]
    pub progress_every: u64,
}

impl Default for BulkConfig {
    fn default() -> Self {
        Self {
            page_size: default_page_size(),
            mutation_concurrency: default_mutation_concurrency(),
            read_concurrency: default_read_concurrency(),
            progress_every: default_progress_every(),
        }
    }
}

fn default_page_size() -> usize {
    1000
}
fn default_mutation_concurrency() -> usize {
    1
}
fn default_read_concurrency() -> usize {
    MAX_CONCURRENCY
}
fn default_progress_every() -> u64 {
    1000
}

impl Config {
    /// Defaults for every section, used when no config file exists.
    pub fn minimal() -> Self {
        Self::default()
    }
}

/// Load and validate the config file at `path`.
///
/// A path that does not exist is not an error: the defaults are returned.
pub fn load_config(path: &Path) -> Result<Config> {
    if !path.exists() {
        return Ok(Config::minimal());
    }

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    validate(&config)?;
    Ok(config)
}

/// Check value ranges. Also used after CLI overrides are applied.
pub fn validate(config: &Config) -> Result<()> {
    if config.retry.ceiling == 0 {
        anyhow::bail!("retry.ceiling must be >= 1");
    }

    if config.bulk.page_size == 0 {
        anyhow::bail!("bulk.page_size must be >= 1");
    }

    for (name, value) in [
        ("bulk.mutation_concurrency", config.bulk.mutation_concurrency),
        ("bulk.read_concurrency", config.bulk.read_concurrency),
    ] {
        if !(1..=MAX_CONCURRENCY).contains(&value) {
            anyhow::bail!("{} must be in [1, {}]", name, MAX_CONCURRENCY);
        }
    }

    if config.bulk.progress_every == 0 {
        anyhow::bail!("bulk.progress_every must be >= 1");
    }

    if config.admin.design_document.is_empty() {
        anyhow::bail!("admin.design_document must not be empty");
    }

    for (side, cluster) in [("source", &config.source), ("destination", &config.destination)] {
        if let Some(conn) = &cluster.conn {
            if !is_connection_string(conn) {
                anyhow::bail!("{}.conn must look like host:port, got '{}'", side, conn);
            }
        }
    }

    Ok(())
}

/// `host:port` where the host is made of word characters and dots and the
/// port has 1 to 5 digits.
pub fn is_connection_string(s: &str) -> bool {
    let Some((host, port)) = s.rsplit_once(':') else {
        return false;
    };
    let host_ok = !host.is_empty()
        && host
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.');
    let port_ok = (1..=5).contains(&port.len()) && port.chars().all(|c| c.is_ascii_digit());
    host_ok && port_ok
}
