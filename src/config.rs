use crate::pool::PortRange;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// Global configuration for the daemon
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// HTTP API settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Port range handed out per IP
    #[serde(default)]
    pub ports: PortsConfig,

    /// Key-value store settings
    #[serde(default)]
    pub store: StoreConfig,

    /// Proxy-config generation settings
    #[serde(default)]
    pub renderer: RendererConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Bind address (default: 127.0.0.1)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// API port (default: 5000)
    #[serde(default = "default_listen_port")]
    pub port: u16,
}

impl ServerConfig {
    pub fn socket_addr(&self) -> anyhow::Result<SocketAddr> {
        format!("{}:{}", self.bind, self.port)
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid bind address {}:{}: {}", self.bind, self.port, e))
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            port: default_listen_port(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct PortsConfig {
    /// First port of every pool (inclusive)
    #[serde(default = "default_port_start")]
    pub start: u16,

    /// Last port of every pool (inclusive)
    #[serde(default = "default_port_end")]
    pub end: u16,
}

impl PortsConfig {
    pub fn range(&self) -> anyhow::Result<PortRange> {
        PortRange::new(self.start, self.end).map_err(|e| anyhow::anyhow!(e))
    }
}

impl Default for PortsConfig {
    fn default() -> Self {
        Self {
            start: default_port_start(),
            end: default_port_end(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    /// SQLite database path
    #[serde(default = "default_store_path")]
    pub path: PathBuf,

    /// Keep everything in memory instead (state is lost on exit)
    #[serde(default)]
    pub in_memory: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
            in_memory: false,
        }
    }
}

/// Settings for the nginx config writer
#[derive(Debug, Deserialize, Clone)]
pub struct RendererConfig {
    /// Directory receiving one `<branch>.conf` per preview
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    /// Template file; the built-in nginx server block is used when unset
    pub template: Option<PathBuf>,

    /// Command run after every config change, e.g. "nginx -s reload".
    /// Split shell-style and executed without a shell.
    pub reload_command: Option<String>,

    /// Domain appended to every generated server name
    #[serde(default = "default_base_domain")]
    pub base_domain: String,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            template: None,
            reload_command: None,
            base_domain: default_base_domain(),
        }
    }
}

// Default value functions
fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_listen_port() -> u16 {
    5000
}

fn default_port_start() -> u16 {
    8100
}

fn default_port_end() -> u16 {
    8299
}

fn default_store_path() -> PathBuf {
    PathBuf::from("./previewd.db")
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("./previews")
}

fn default_base_domain() -> String {
    "preview.localhost".to_string()
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if let Err(e) = self.ports.range() {
            errors.push(format!("[ports] {}", e));
        }

        if self.server.port == 0 {
            errors.push("[server] 'port' must be greater than 0".to_string());
        }

        if self.renderer.base_domain.trim_matches('.').trim().is_empty() {
            errors.push("[renderer] 'base_domain' must not be empty".to_string());
        }

        if let Some(cmd) = &self.renderer.reload_command {
            match shell_words::split(cmd) {
                Ok(argv) if argv.is_empty() => {
                    errors.push("[renderer] 'reload_command' is empty".to_string())
                }
                Ok(_) => {}
                Err(e) => errors.push(format!("[renderer] 'reload_command': {}", e)),
            }
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}
