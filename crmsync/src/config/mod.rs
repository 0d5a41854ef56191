//! Configuration system for the crmsync client.
//!
//! Supports layered configuration with the following priority (highest first):
//! 1. CLI arguments
//! 2. Environment variables (via clap `env` attribute)
//! 3. TOML config file (`~/.config/crmsync/config.toml`)
//! 4. Compiled defaults
//!
//! Missing config file is not an error (defaults are used). An explicit
//! `--config` path that doesn't exist is an error.

use std::path::PathBuf;
use std::time::Duration;

use url::Url;

use crate::board::DeadlineFilter;
use crate::chat::DedupPolicy;
use crate::policy::PolicyKind;

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadFile {
        /// Path that was attempted.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Failed to parse the TOML configuration.
    #[error("failed to parse config file: {0}")]
    ParseToml(#[from] toml::de::Error),

    /// A URL setting is not a valid URL.
    #[error("invalid {field}: {source}")]
    InvalidUrl {
        /// Setting name.
        field: &'static str,
        /// Parser error.
        source: url::ParseError,
    },
}

// ---------------------------------------------------------------------------
// TOML file structs (all fields Option for partial overrides)
// ---------------------------------------------------------------------------

/// Top-level TOML config file structure.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ConfigFile {
    network: NetworkFileConfig,
    auth: AuthFileConfig,
    sync: SyncFileConfig,
}

/// `[network]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct NetworkFileConfig {
    api_url: Option<String>,
    ws_url: Option<String>,
    connect_timeout_secs: Option<u64>,
    handshake_timeout_secs: Option<u64>,
    request_timeout_secs: Option<u64>,
}

/// `[auth]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct AuthFileConfig {
    token: Option<String>,
    username: Option<String>,
}

/// `[sync]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct SyncFileConfig {
    chat_dedup: Option<DedupPolicy>,
    reconcile_policy: Option<PolicyKind>,
}

// ---------------------------------------------------------------------------
// Resolved configuration (concrete types, all fields populated)
// ---------------------------------------------------------------------------

const DEFAULT_API_URL: &str = "http://localhost:8080";
const DEFAULT_WS_URL: &str = "ws://localhost:8080/ws";

/// Fully resolved client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    // -- Network --
    /// Base URL of the REST API.
    pub api_url: Url,
    /// WebSocket endpoint of the broker.
    pub ws_url: Url,
    /// Timeout for opening the WebSocket.
    pub connect_timeout: Duration,
    /// Timeout for the broker's `CONNECTED` frame.
    pub handshake_timeout: Duration,
    /// Per-request REST timeout.
    pub request_timeout: Duration,

    // -- Auth --
    /// Bearer token of an existing login.
    pub token: Option<String>,
    /// Username of an existing login.
    pub username: Option<String>,

    // -- Sync --
    /// Duplicate handling for chat pushes.
    pub chat_dedup: DedupPolicy,
    /// Failure handling for optimistic changes.
    pub reconcile_policy: PolicyKind,
}

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

impl ClientConfig {
    /// Load configuration by merging CLI args, env vars, and a TOML file.
    ///
    /// If `--config` is given and the file does not exist, returns an error.
    /// Otherwise the default path (`~/.config/crmsync/config.toml`) is tried
    /// and silently ignored if missing.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the config file cannot be read or parsed,
    /// or if a URL setting is invalid.
    pub fn load(cli: &CliArgs) -> Result<Self, ConfigError> {
        let file = load_config_file(cli.config.as_deref())?;
        Self::resolve(cli, &file)
    }

    /// Resolve a `ClientConfig` from CLI args and a parsed config file.
    ///
    /// Priority: CLI > file > default.
    fn resolve(cli: &CliArgs, file: &ConfigFile) -> Result<Self, ConfigError> {
        Ok(Self {
            api_url: pick_url(
                "api_url",
                cli.api_url.as_deref(),
                file.network.api_url.as_deref(),
                DEFAULT_API_URL,
            )?,
            ws_url: pick_url(
                "ws_url",
                cli.ws_url.as_deref(),
                file.network.ws_url.as_deref(),
                DEFAULT_WS_URL,
            )?,
            connect_timeout: file
                .network
                .connect_timeout_secs
                .map_or(DEFAULT_CONNECT_TIMEOUT, Duration::from_secs),
            handshake_timeout: file
                .network
                .handshake_timeout_secs
                .map_or(DEFAULT_HANDSHAKE_TIMEOUT, Duration::from_secs),
            request_timeout: file
                .network
                .request_timeout_secs
                .map_or(DEFAULT_REQUEST_TIMEOUT, Duration::from_secs),
            token: cli.token.clone().or_else(|| file.auth.token.clone()),
            username: cli.username.clone().or_else(|| file.auth.username.clone()),
            chat_dedup: file.sync.chat_dedup.unwrap_or_default(),
            reconcile_policy: cli
                .policy
                .or(file.sync.reconcile_policy)
                .unwrap_or_default(),
        })
    }
}

fn pick_url(
    field: &'static str,
    cli: Option<&str>,
    file: Option<&str>,
    default: &str,
) -> Result<Url, ConfigError> {
    let raw = cli.or(file).unwrap_or(default);
    Url::parse(raw).map_err(|source| ConfigError::InvalidUrl { field, source })
}

/// CLI arguments parsed by clap.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "Real-time notifications, task chat and board sync for the CRM")]
pub struct CliArgs {
    /// Base URL of the REST API.
    #[arg(long, env = "CRMSYNC_API_URL")]
    pub api_url: Option<String>,

    /// WebSocket endpoint of the broker.
    #[arg(long, env = "CRMSYNC_WS_URL")]
    pub ws_url: Option<String>,

    /// Bearer token of an existing login.
    #[arg(long, env = "CRMSYNC_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// Username of an existing login.
    #[arg(long, env = "CRMSYNC_USERNAME")]
    pub username: Option<String>,

    /// Failure handling for optimistic changes.
    #[arg(long, value_enum)]
    pub policy: Option<PolicyKind>,

    /// Path to config file (default: `~/.config/crmsync/config.toml`).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Log level filter (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", env = "CRMSYNC_LOG")]
    pub log_level: String,

    /// Path to log file (default: `$TMPDIR/crmsync.log`).
    #[arg(long)]
    pub log_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

/// What the CLI should do.
#[derive(clap::Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Stream notifications with the unseen badge count.
    Watch {
        /// Mark everything viewed as it arrives.
        #[arg(long)]
        mark_viewed: bool,
    },
    /// Dismiss one notification.
    Dismiss {
        /// Notification id.
        id: i64,
    },
    /// Print a client's board.
    Board {
        /// Client id.
        #[arg(long)]
        client: i64,
        /// Case-insensitive description filter.
        #[arg(long)]
        search: Option<String>,
        /// Only tasks assigned to this contact.
        #[arg(long)]
        contact: Option<i64>,
        /// Deadline filter.
        #[arg(long, value_enum)]
        deadline: Option<DeadlineArg>,
    },
    /// Move a task to another column.
    Move {
        /// Client id the task belongs to.
        #[arg(long)]
        client: i64,
        /// Task id.
        #[arg(long)]
        task: i64,
        /// Target column (`TODO`, `IN_PROGRESS`, `DONE`).
        #[arg(long)]
        to: String,
    },
    /// Create a task in a column.
    Create {
        /// Client id.
        #[arg(long)]
        client: i64,
        /// Column (`TODO`, `IN_PROGRESS`, `DONE`).
        #[arg(long, default_value = "TODO")]
        column: String,
        /// Task description.
        description: String,
    },
    /// Follow a task's chat; lines typed on stdin are sent.
    Chat {
        /// Task id.
        #[arg(long)]
        task: i64,
    },
}

/// Deadline filter as a CLI value.
#[derive(clap::ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeadlineArg {
    Overdue,
    NotOverdue,
}

impl From<DeadlineArg> for DeadlineFilter {
    fn from(arg: DeadlineArg) -> Self {
        match arg {
            DeadlineArg::Overdue => Self::Overdue,
            DeadlineArg::NotOverdue => Self::NotOverdue,
        }
    }
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

/// Load and parse a TOML config file.
///
/// If `explicit_path` is `Some`, the file must exist (error if not).
/// If `explicit_path` is `None`, the default path is tried and missing file
/// is treated as empty config.
fn load_config_file(explicit_path: Option<&std::path::Path>) -> Result<ConfigFile, ConfigError> {
    let path = if let Some(p) = explicit_path {
        let contents = std::fs::read_to_string(p).map_err(|e| ConfigError::ReadFile {
            path: p.to_path_buf(),
            source: e,
        })?;
        return Ok(toml::from_str(&contents)?);
    } else {
        let Some(config_dir) = dirs::config_dir() else {
            return Ok(ConfigFile::default());
        };
        config_dir.join("crmsync").join("config.toml")
    };

    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(toml::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ConfigFile::default()),
        Err(e) => Err(ConfigError::ReadFile { path, source: e }),
    }
}
