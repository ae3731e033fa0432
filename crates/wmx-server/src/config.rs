//! Server configuration: TOML file + CLI overrides.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::info;
use wmx_core::{WmxError, WmxResult};
use wmx_session::ShellKind;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub sidecar: SidecarSection,
    #[serde(default)]
    pub session: SessionSection,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
        }
    }
}

/// `[sidecar]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct SidecarSection {
    #[serde(default)]
    pub standalone: bool,
    #[serde(default = "default_true")]
    pub auto_spawn: bool,
    #[serde(default)]
    pub host_path: String,
    #[serde(default)]
    pub endpoint: String,
    #[serde(default)]
    pub secret: String,
}

impl Default for SidecarSection {
    fn default() -> Self {
        Self {
            standalone: false,
            auto_spawn: true,
            host_path: String::new(),
            endpoint: String::new(),
            secret: String::new(),
        }
    }
}

/// `[session]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionSection {
    #[serde(default)]
    pub default_shell: String,
    #[serde(default)]
    pub default_working_directory: String,
    #[serde(default = "default_scrollback")]
    pub scrollback_chars: usize,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            default_shell: String::new(),
            default_working_directory: String::new(),
            scrollback_chars: default_scrollback(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    7070
}
fn default_true() -> bool {
    true
}
fn default_scrollback() -> usize {
    100_000
}

/// Resolved configuration (paths expanded, CLI overrides applied).
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind: String,
    pub port: u16,
    pub standalone: bool,
    pub auto_spawn: bool,
    pub host_path: Option<PathBuf>,
    pub endpoint: Option<PathBuf>,
    pub secret: Option<String>,
    pub default_shell: Option<ShellKind>,
    pub default_working_directory: Option<PathBuf>,
    pub scrollback_chars: usize,
}

impl AppConfig {
    /// Load config from the TOML file, then apply CLI overrides.
    pub fn load(
        config_path: Option<&Path>,
        cli_bind: Option<&str>,
        cli_port: Option<u16>,
        cli_standalone: bool,
    ) -> WmxResult<Self> {
        let path = match config_path {
            Some(p) => expand_tilde(&p.to_string_lossy()),
            None => default_config_path(),
        };

        let file_config = if path.exists() {
            info!(path = %path.display(), "loading config file");
            let content = std::fs::read_to_string(&path)?;
            toml::from_str::<ConfigFile>(&content)
                .map_err(|e| WmxError::Other(format!("config parse error: {e}")))?
        } else {
            info!(path = %path.display(), "config file not found, using defaults");
            ConfigFile::default()
        };

        Self::resolve(file_config, cli_bind, cli_port, cli_standalone)
    }

    fn resolve(
        file: ConfigFile,
        cli_bind: Option<&str>,
        cli_port: Option<u16>,
        cli_standalone: bool,
    ) -> WmxResult<Self> {
        let default_shell = if file.session.default_shell.is_empty() {
            None
        } else {
            Some(ShellKind::from_str(&file.session.default_shell)?)
        };

        Ok(Self {
            bind: cli_bind
                .map(|s| s.to_string())
                .unwrap_or(file.server.bind),
            port: cli_port.unwrap_or(file.server.port),
            standalone: cli_standalone || file.sidecar.standalone,
            auto_spawn: file.sidecar.auto_spawn,
            host_path: non_empty_path(&file.sidecar.host_path),
            endpoint: non_empty_path(&file.sidecar.endpoint),
            secret: non_empty(&file.sidecar.secret),
            default_shell,
            default_working_directory: non_empty_path(&file.session.default_working_directory),
            scrollback_chars: file.session.scrollback_chars,
        })
    }
}

fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("wmx")
        .join("config.toml")
}

fn non_empty(s: &str) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s.to_string())
    }
}

fn non_empty_path(s: &str) -> Option<PathBuf> {
    if s.is_empty() {
        None
    } else {
        Some(expand_tilde(s))
    }
}

/// Expand `~` to the user's home directory.
fn expand_tilde(s: &str) -> PathBuf {
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s)
}
