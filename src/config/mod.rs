use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::port_manager::{DEFAULT_UDP_END_PORT, DEFAULT_UDP_START_PORT};

pub const DEFAULT_CONFIG_PATH: &str = "config/server.toml";

/// `[server]` section of the configuration file.
#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub ssl: bool,
    pub certfile: Option<PathBuf>,
    pub certkey: Option<PathBuf>,
    /// Enables live reload.
    pub debug: bool,
    pub projects_path: PathBuf,
    /// Extra files checked by live reload, besides the executable.
    pub watch_paths: Vec<PathBuf>,
    pub udp_start_port: u16,
    pub udp_end_port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3080,
            ssl: false,
            certfile: None,
            certkey: None,
            debug: false,
            projects_path: PathBuf::from("./projects"),
            watch_paths: Vec::new(),
            udp_start_port: DEFAULT_UDP_START_PORT,
            udp_end_port: DEFAULT_UDP_END_PORT,
        }
    }
}

#[derive(Deserialize, Debug, Default)]
struct ConfigFile {
    #[serde(default)]
    server: ServerConfig,
}

impl ServerConfig {
    /// Load from a TOML file. A missing file yields the defaults; a file that
    /// exists but does not parse is an error.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(s) => Self::from_toml_str(&s)
                .map_err(|e| anyhow::anyhow!("Invalid config {}: {}", path.display(), e)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("No config at {}, using defaults", path.display());
                Ok(Self::default())
            }
            Err(e) => Err(anyhow::anyhow!("Could not read {}: {}", path.display(), e)),
        }
    }

    pub fn from_toml_str(s: &str) -> anyhow::Result<Self> {
        let file: ConfigFile = toml::from_str(s)?;
        Ok(file.server)
    }

    /// `NETEMU_HOST` / `NETEMU_PORT` take precedence over the file.
    pub fn apply_env_overrides(mut self) -> Self {
        if let Ok(host) = std::env::var("NETEMU_HOST") {
            self.host = host;
        }
        if let Ok(port) = std::env::var("NETEMU_PORT") {
            match port.parse() {
                Ok(port) => self.port = port,
                Err(_) => tracing::warn!("Ignoring invalid NETEMU_PORT '{}'", port),
            }
        }
        self
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_when_section_missing() {
        let cfg = ServerConfig::from_toml_str("").unwrap();
        assert_eq!(cfg.host, "127.0.0.1");
        assert_eq!(cfg.port, 3080);
        assert!(!cfg.ssl && !cfg.debug);
    }

    #[test]
    fn server_section() {
        let cfg = ServerConfig::from_toml_str(
            r#"
            [server]
            host = "0.0.0.0"
            port = 4000
            ssl = true
            certfile = "/etc/netemu/server.crt"
            certkey = "/etc/netemu/server.key"
            debug = true
            watch_paths = ["config/server.toml"]
            "#,
        )
        .unwrap();
        assert_eq!(cfg.listen_addr(), "0.0.0.0:4000");
        assert!(cfg.ssl);
        assert_eq!(cfg.certkey.as_deref(), Some(Path::new("/etc/netemu/server.key")));
        assert!(cfg.debug);
        assert_eq!(cfg.watch_paths.len(), 1);
        assert_eq!(cfg.udp_start_port, DEFAULT_UDP_START_PORT);
    }

    #[test]
    fn missing_file_is_default() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = ServerConfig::load(&tmp.path().join("nope.toml")).unwrap();
        assert_eq!(cfg.port, 3080);
    }

    #[test]
    fn broken_file_is_error() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("server.toml");
        std::fs::write(&path, "[server\nport = ").unwrap();
        assert!(ServerConfig::load(&path).is_err());
    }
}
