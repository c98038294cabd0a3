//! Configuration parsing and validation.
//!
//! Sources, highest precedence first: CLI flags, `MCP_BRIDGE_*` env vars (both via clap), the
//! config file (YAML, or JSON when the extension is `.json`), built-in defaults.

use crate::error::{BridgeError, Result};
use clap::Parser;
use mcp_bridge_env::serde_helpers::deserialize_option_u64_env;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::time::Duration;

/// Separator between a server id and a tool's local name.
pub const NAMESPACE_SEPARATOR: &str = "__";

// ============================================================================
// CLI Arguments
// ============================================================================

/// CLI arguments for the bridge.
#[derive(Parser, Debug, Clone, Default)]
#[command(name = "mcp-bridge")]
#[command(
    version,
    about = "Aggregate stdio MCP tool servers behind REST and streamable HTTP"
)]
pub struct CliArgs {
    /// Path to the config file (`mcpServers` map plus optional `bridge` settings).
    #[arg(short = 'c', long = "config", env = "MCP_BRIDGE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Servers to start: `*` for all, or a comma-separated list of ids.
    #[arg(short = 'a', long = "auto-enable", env = "MCP_BRIDGE_AUTO_ENABLE")]
    pub auto_enable: Option<String>,

    /// Listen host (ignored when --bind is set).
    #[arg(long, env = "MCP_BRIDGE_HOST")]
    pub host: Option<String>,

    /// Listen port (ignored when --bind is set).
    #[arg(short = 'p', long, env = "MCP_BRIDGE_PORT")]
    pub port: Option<u16>,

    /// HTTP bind address (ip:port).
    #[arg(short = 'b', long, env = "MCP_BRIDGE_BIND")]
    pub bind: Option<String>,

    /// Log level. Supports tracing filter syntax.
    #[arg(short = 'l', long = "log-level", env = "MCP_BRIDGE_LOG")]
    pub log_level: Option<String>,

    /// Timeout for individual tool calls (seconds).
    #[arg(long, env = "MCP_BRIDGE_CALL_TIMEOUT")]
    pub call_timeout: Option<u64>,

    /// Max time to wait for a server's handshake and first tool listing (seconds).
    #[arg(long, env = "MCP_BRIDGE_STARTUP_TIMEOUT")]
    pub startup_timeout: Option<u64>,

    /// Close streaming sessions idle for longer than this (seconds).
    #[arg(long, env = "MCP_BRIDGE_SESSION_IDLE_TIMEOUT")]
    pub session_idle_timeout: Option<u64>,

    /// Print the fully resolved configuration and exit.
    #[arg(long = "print-effective-config")]
    pub print_effective_config: bool,
}

// ============================================================================
// Auto-enable policy
// ============================================================================

/// Which configured servers are started at boot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AutoEnable {
    All,
    Only(Vec<String>),
}

impl Default for AutoEnable {
    fn default() -> Self {
        AutoEnable::Only(Vec::new())
    }
}

impl AutoEnable {
    /// Parse `*` or a comma-separated list.
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        if raw.trim() == "*" {
            AutoEnable::All
        } else {
            AutoEnable::Only(mcp_bridge_env::csv_list(raw))
        }
    }

    #[must_use]
    pub fn includes(&self, id: &str) -> bool {
        match self {
            AutoEnable::All => true,
            AutoEnable::Only(ids) => ids.iter().any(|i| i == id),
        }
    }
}

impl<'de> Deserialize<'de> for AutoEnable {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Text(String),
            List(Vec<String>),
        }

        Ok(match Repr::deserialize(deserializer)? {
            Repr::Text(s) => AutoEnable::parse(&s),
            Repr::List(ids) if ids.iter().any(|i| i.trim() == "*") => AutoEnable::All,
            Repr::List(ids) => AutoEnable::parse(&ids.join(",")),
        })
    }
}

impl Serialize for AutoEnable {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            AutoEnable::All => serializer.serialize_str("*"),
            AutoEnable::Only(ids) => ids.serialize(serializer),
        }
    }
}

// ============================================================================
// Settings
// ============================================================================

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 8085;
const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_STARTUP_TIMEOUT_SECS: u64 = 30;
const DEFAULT_SESSION_IDLE_TIMEOUT_SECS: u64 = 30 * 60;
const DEFAULT_SESSION_SWEEP_INTERVAL_SECS: u64 = 60;
const DEFAULT_CONFIG_PATH: &str = "~/.config/mcp/mcp_servers.json";

/// Effective bridge settings (after merging defaults + config + env + CLI).
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeSettings {
    pub bind: String,
    pub log_level: String,
    pub call_timeout: u64,
    pub call_timeout_max: u64,
    pub startup_timeout: u64,
    pub session_idle_timeout: u64,
    pub session_sweep_interval: u64,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            bind: format!("{DEFAULT_HOST}:{DEFAULT_PORT}"),
            log_level: DEFAULT_LOG_LEVEL.to_string(),
            call_timeout: crate::timeouts::tool_call_timeout_default_secs(),
            call_timeout_max: crate::timeouts::tool_call_timeout_max_secs(),
            startup_timeout: DEFAULT_STARTUP_TIMEOUT_SECS,
            session_idle_timeout: DEFAULT_SESSION_IDLE_TIMEOUT_SECS,
            session_sweep_interval: DEFAULT_SESSION_SWEEP_INTERVAL_SECS,
        }
    }
}

impl BridgeSettings {
    pub fn call_timeout_duration(&self) -> Duration {
        Duration::from_secs(self.call_timeout)
    }

    pub fn call_timeout_max_duration(&self) -> Duration {
        Duration::from_secs(self.call_timeout_max)
    }

    pub fn startup_timeout_duration(&self) -> Duration {
        Duration::from_secs(self.startup_timeout)
    }

    pub fn session_idle_timeout_duration(&self) -> Duration {
        Duration::from_secs(self.session_idle_timeout)
    }

    pub fn session_sweep_interval_duration(&self) -> Duration {
        Duration::from_secs(self.session_sweep_interval)
    }
}

/// Settings as provided by the config file (all optional).
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct BridgeSection {
    #[serde(default)]
    pub bind: Option<String>,
    #[serde(default)]
    pub log_level: Option<String>,
    #[serde(default, deserialize_with = "deserialize_option_u64_env")]
    pub call_timeout: Option<u64>,
    #[serde(default, deserialize_with = "deserialize_option_u64_env")]
    pub startup_timeout: Option<u64>,
    #[serde(default, deserialize_with = "deserialize_option_u64_env")]
    pub session_idle_timeout: Option<u64>,
    #[serde(default, deserialize_with = "deserialize_option_u64_env")]
    pub session_sweep_interval: Option<u64>,
}

// ============================================================================
// Config File
// ============================================================================

/// On-disk config format.
///
/// A plain `{"mcpServers": {...}}` document (the common MCP client format) is valid as-is.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ConfigFile {
    #[serde(default)]
    pub bridge: BridgeSection,
    #[serde(default)]
    pub auto_enable: Option<AutoEnable>,
    #[serde(default)]
    pub mcp_servers: HashMap<String, McpServerConfig>,
}

/// One stdio server entry under `mcpServers`.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct McpServerConfig {
    pub command: String,

    #[serde(default)]
    pub args: Vec<String>,

    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Env var name -> argv of a command whose trimmed stdout becomes that variable.
    #[serde(default, alias = "passwordCommand")]
    pub secret_commands: BTreeMap<String, Vec<String>>,
}

/// A validated, env-expanded server definition.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ServerDefinition {
    pub id: String,
    pub command: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    /// Secret argv per env var. Values are not printed in the effective config.
    #[serde(serialize_with = "serialize_secret_names")]
    pub secret_commands: BTreeMap<String, Vec<String>>,
    pub enabled: bool,
}

fn serialize_secret_names<S: Serializer>(
    secrets: &BTreeMap<String, Vec<String>>,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    secrets.keys().collect::<Vec<_>>().serialize(serializer)
}

// ============================================================================
// Effective Configuration
// ============================================================================

/// Where the server definitions came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    File(PathBuf),
    /// The default path was used and does not exist; no servers are defined.
    MissingDefault(PathBuf),
}

/// Merged configuration from all sources.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub cli: CliArgs,
    pub source: ConfigSource,
    pub settings: BridgeSettings,
    pub auto_enable: AutoEnable,
    pub servers: BTreeMap<String, ServerDefinition>,
    /// The requested call timeout, when it exceeded the cap and was clamped.
    pub clamped_call_timeout: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EffectiveConfig {
    pub bridge: BridgeSettings,
    pub auto_enable: AutoEnable,
    pub mcp_servers: BTreeMap<String, ServerDefinition>,
}

impl BridgeConfig {
    pub fn effective(&self) -> EffectiveConfig {
        EffectiveConfig {
            bridge: self.settings.clone(),
            auto_enable: self.auto_enable.clone(),
            mcp_servers: self.servers.clone(),
        }
    }

    /// Load and merge configuration from CLI args, env, and the config file.
    pub fn load(cli: CliArgs) -> Result<Self> {
        let mut settings = BridgeSettings::default();

        // 1) Locate and read the config file.
        let (source, file) = match &cli.config {
            Some(path) => (ConfigSource::File(path.clone()), load_config_file(path)?),
            None => {
                let path = mcp_bridge_env::expand_home(DEFAULT_CONFIG_PATH);
                if path.exists() {
                    let file = load_config_file(&path)?;
                    (ConfigSource::File(path), file)
                } else {
                    (ConfigSource::MissingDefault(path), ConfigFile::default())
                }
            }
        };

        // 2) Settings: file, then CLI/ENV (CLI > ENV is handled by clap).
        apply_bridge_section(&mut settings, file.bridge)?;
        apply_cli_overrides(&mut settings, &cli)?;
        let clamped_call_timeout = validate_settings(&mut settings)?;

        // 3) Auto-enable policy: CLI/ENV beats the file.
        let auto_enable = match &cli.auto_enable {
            Some(raw) => AutoEnable::parse(raw),
            None => file.auto_enable.unwrap_or_default(),
        };

        // 4) Server definitions.
        let mut servers = BTreeMap::new();
        for (id, server) in file.mcp_servers {
            validate_server_id(&id)?;
            let server = expand_server_env_vars(server)?;
            validate_secret_commands(&id, &server)?;
            let enabled = auto_enable.includes(&id);
            servers.insert(
                id.clone(),
                ServerDefinition {
                    id,
                    command: server.command,
                    args: server.args,
                    env: server.env,
                    secret_commands: server.secret_commands,
                    enabled,
                },
            );
        }

        Ok(Self {
            cli,
            source,
            settings,
            auto_enable,
            servers,
            clamped_call_timeout,
        })
    }

    /// Ids named by the auto-enable list that have no definition.
    pub fn unknown_auto_enable_ids(&self) -> Vec<String> {
        match &self.auto_enable {
            AutoEnable::All => Vec::new(),
            AutoEnable::Only(ids) => ids
                .iter()
                .filter(|id| !self.servers.contains_key(*id))
                .cloned()
                .collect(),
        }
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

fn load_config_file(path: &std::path::Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| BridgeError::Config(format!("Failed to read {}: {}", path.display(), e)))?;

    // YAML by default; JSON when extension is .json
    if path.extension().is_some_and(|ext| ext == "json") {
        serde_json::from_str(&content)
            .map_err(|e| BridgeError::Config(format!("Failed to parse {}: {}", path.display(), e)))
    } else {
        serde_yaml::from_str(&content)
            .map_err(|e| BridgeError::Config(format!("Failed to parse {}: {}", path.display(), e)))
    }
}

fn apply_bridge_section(settings: &mut BridgeSettings, section: BridgeSection) -> Result<()> {
    if let Some(bind) = section.bind {
        settings.bind = expand_env_string(&bind)?;
    }
    if let Some(level) = section.log_level {
        settings.log_level = expand_env_string(&level)?;
    }
    if let Some(v) = section.call_timeout {
        settings.call_timeout = v;
    }
    if let Some(v) = section.startup_timeout {
        settings.startup_timeout = v;
    }
    if let Some(v) = section.session_idle_timeout {
        settings.session_idle_timeout = v;
    }
    if let Some(v) = section.session_sweep_interval {
        settings.session_sweep_interval = v;
    }
    Ok(())
}

fn apply_cli_overrides(settings: &mut BridgeSettings, cli: &CliArgs) -> Result<()> {
    if let Some(bind) = &cli.bind {
        settings.bind = expand_env_string(bind)?;
    } else if cli.host.is_some() || cli.port.is_some() {
        let (file_host, file_port) = split_bind(&settings.bind);
        let host = cli.host.clone().unwrap_or(file_host);
        let port = cli.port.unwrap_or(file_port);
        settings.bind = format!("{host}:{port}");
    }

    // Precedence for log level:
    // CLI flag (--log-level) / MCP_BRIDGE_LOG env (via clap) > RUST_LOG env > config file > defaults
    if let Some(level) = &cli.log_level {
        settings.log_level.clone_from(level);
    } else if let Ok(level) = std::env::var("RUST_LOG") {
        settings.log_level = level;
    }

    if let Some(v) = cli.call_timeout {
        settings.call_timeout = v;
    }
    if let Some(v) = cli.startup_timeout {
        settings.startup_timeout = v;
    }
    if let Some(v) = cli.session_idle_timeout {
        settings.session_idle_timeout = v;
    }
    Ok(())
}

/// Split `host:port`, falling back to defaults for whatever part is missing or invalid.
fn split_bind(bind: &str) -> (String, u16) {
    match bind.rsplit_once(':') {
        Some((host, port)) => (
            host.to_string(),
            port.parse::<u16>().unwrap_or(DEFAULT_PORT),
        ),
        None => (bind.to_string(), DEFAULT_PORT),
    }
}

/// Validate and normalize settings. Returns the original call timeout if it had to be clamped;
/// logging is not set up yet, so the caller reports it.
fn validate_settings(settings: &mut BridgeSettings) -> Result<Option<u64>> {
    if settings.call_timeout == 0 {
        return Err(BridgeError::Config("callTimeout must be > 0".to_string()));
    }
    let mut clamped = None;
    if settings.call_timeout > settings.call_timeout_max {
        clamped = Some(settings.call_timeout);
        settings.call_timeout = settings.call_timeout_max;
    }
    if settings.startup_timeout == 0 {
        return Err(BridgeError::Config("startupTimeout must be > 0".to_string()));
    }
    if settings.session_idle_timeout == 0 {
        return Err(BridgeError::Config(
            "sessionIdleTimeout must be > 0".to_string(),
        ));
    }
    if settings.session_sweep_interval == 0 {
        return Err(BridgeError::Config(
            "sessionSweepInterval must be > 0".to_string(),
        ));
    }
    Ok(clamped)
}

/// Reject ids that would make `server_id + "__" + tool` ambiguous or unroutable.
///
/// Ids must be non-empty, use only `[A-Za-z0-9_.-]`, must not contain the `__` separator and
/// must not end with `_` (so `"a_" + "__" + "x"` cannot collide with `"a" + "__" + "_x"`).
pub fn validate_server_id(id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(BridgeError::Config("server id must not be empty".to_string()));
    }
    if let Some(bad) = id
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.')))
    {
        return Err(BridgeError::Config(format!(
            "server id '{id}' contains invalid character '{bad}' (allowed: A-Z a-z 0-9 _ - .)"
        )));
    }
    if id.contains(NAMESPACE_SEPARATOR) {
        return Err(BridgeError::Config(format!(
            "server id '{id}' must not contain the namespace separator '{NAMESPACE_SEPARATOR}'"
        )));
    }
    if id.ends_with('_') {
        return Err(BridgeError::Config(format!(
            "server id '{id}' must not end with '_'"
        )));
    }
    Ok(())
}

fn validate_secret_commands(id: &str, server: &McpServerConfig) -> Result<()> {
    for (var, argv) in &server.secret_commands {
        if argv.first().is_none_or(|program| program.trim().is_empty()) {
            return Err(BridgeError::Config(format!(
                "server '{id}': secret command for '{var}' must name a program"
            )));
        }
    }
    Ok(())
}

/// Expand ${VAR} patterns in a server entry.
fn expand_server_env_vars(mut config: McpServerConfig) -> Result<McpServerConfig> {
    config.command = expand_env_string(&config.command)?;
    config.args = config
        .args
        .into_iter()
        .map(|arg| expand_env_string(&arg))
        .collect::<Result<Vec<_>>>()?;
    config.env = config
        .env
        .into_iter()
        .map(|(k, v)| Ok((k, expand_env_string(&v)?)))
        .collect::<Result<HashMap<_, _>>>()?;
    config.secret_commands = config
        .secret_commands
        .into_iter()
        .map(|(var, argv)| {
            let argv = argv
                .iter()
                .map(|a| expand_env_string(a))
                .collect::<Result<Vec<_>>>()?;
            Ok((var, argv))
        })
        .collect::<Result<BTreeMap<_, _>>>()?;
    Ok(config)
}

/// Expand ${VAR} patterns in a string.
pub fn expand_env_string(s: &str) -> Result<String> {
    mcp_bridge_env::expand_env_string(s).map_err(BridgeError::Config)
}

// ============================================================================
// Tests
// ============================================================================
