//! Load config from file and environment.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use cnc_core::{ChunkEncoding, IceServer, PeerConfig};
use serde::Deserialize;
use tracing::warn;

/// Node configuration. File: ~/.config/cybernetcall/config.toml or /etc/cybernetcall/config.toml.
/// Env overrides: CNC_STUN_URL, CNC_CHUNK_SIZE, CNC_DOWNLOAD_DIR, CNC_RELAY_URL.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// STUN/TURN servers (default: one public STUN server).
    #[serde(default = "default_ice_servers")]
    pub ice_servers: Vec<IceServer>,
    /// File chunk size in bytes (default 16 KiB).
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Buffered bytes, in chunks, above which sends wait (default 16).
    #[serde(default = "default_backpressure_chunks")]
    pub backpressure_chunks: usize,
    /// Pause before retrying a send held back by backpressure (default 100 ms).
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default)]
    pub chunk_encoding: ChunkEncoding,
    /// Where received files are written.
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,
    /// JSON file holding posts. Posts stay in memory only when unset.
    #[serde(default = "default_posts_file")]
    pub posts_file: Option<PathBuf>,
    /// Optional websocket relay for offer/answer envelopes.
    #[serde(default)]
    pub relay_url: Option<String>,
    /// Seconds to wait for ICE gathering before giving up on an offer or answer.
    #[serde(default = "default_ice_gather_timeout_secs")]
    pub ice_gather_timeout_secs: u64,
}

fn default_ice_servers() -> Vec<IceServer> {
    PeerConfig::default().ice_servers
}
fn default_chunk_size() -> usize {
    cnc_core::protocol::DEFAULT_CHUNK_SIZE
}
fn default_backpressure_chunks() -> usize {
    cnc_core::transport::DEFAULT_BACKPRESSURE_CHUNKS
}
fn default_retry_delay_ms() -> u64 {
    100
}
fn default_download_dir() -> PathBuf {
    data_home().join("downloads")
}
fn default_posts_file() -> Option<PathBuf> {
    Some(data_home().join("posts.json"))
}
fn default_ice_gather_timeout_secs() -> u64 {
    10
}

fn data_home() -> PathBuf {
    match std::env::var_os("HOME") {
        Some(h) => PathBuf::from(h).join(".local/share/cybernetcall"),
        None => PathBuf::from("cybernetcall"),
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ice_servers: default_ice_servers(),
            chunk_size: default_chunk_size(),
            backpressure_chunks: default_backpressure_chunks(),
            retry_delay_ms: default_retry_delay_ms(),
            chunk_encoding: ChunkEncoding::default(),
            download_dir: default_download_dir(),
            posts_file: default_posts_file(),
            relay_url: None,
            ice_gather_timeout_secs: default_ice_gather_timeout_secs(),
        }
    }
}

impl Config {
    pub fn peer_config(&self) -> PeerConfig {
        let chunk_size = self.chunk_size.max(1);
        PeerConfig {
            ice_servers: self.ice_servers.clone(),
            chunk_size,
            backpressure_threshold: chunk_size.saturating_mul(self.backpressure_chunks.max(1)),
            retry_delay: Duration::from_millis(self.retry_delay_ms),
            chunk_encoding: self.chunk_encoding,
            ..PeerConfig::default()
        }
    }

    pub fn ice_gather_timeout(&self) -> Duration {
        Duration::from_secs(self.ice_gather_timeout_secs.max(1))
    }

    fn apply_env(&mut self) {
        self.apply_vars(|k| std::env::var(k).ok());
    }

    fn apply_vars(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(url) = var("CNC_STUN_URL").filter(|s| !s.is_empty()) {
            self.ice_servers = vec![IceServer::stun(url)];
        }
        if let Some(s) = var("CNC_CHUNK_SIZE") {
            match s.parse::<usize>() {
                Ok(n) if n > 0 => self.chunk_size = n,
                _ => warn!(event = "config_env_ignored", var = "CNC_CHUNK_SIZE", value = %s),
            }
        }
        if let Some(dir) = var("CNC_DOWNLOAD_DIR").filter(|s| !s.is_empty()) {
            self.download_dir = PathBuf::from(dir);
        }
        if let Some(url) = var("CNC_RELAY_URL") {
            self.relay_url = Some(url).filter(|s| !s.is_empty());
        }
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = load_file().unwrap_or_default();
    c.apply_env();
    c
}

/// Same as [`load`] but with an explicit file, which must exist and parse.
pub fn load_from(path: &Path) -> anyhow::Result<Config> {
    let mut c = parse_file(path)?;
    c.apply_env();
    Ok(c)
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/cybernetcall/config.toml"));
    }
    out.push(PathBuf::from("/etc/cybernetcall/config.toml"));
    out
}

fn load_file() -> Option<Config> {
    let path = config_paths().into_iter().find(|p| p.exists())?;
    match parse_file(&path) {
        Ok(c) => Some(c),
        Err(e) => {
            warn!(event = "config_invalid", path = %path.display(), error = %format!("{e:#}"), "Using defaults");
            None
        }
    }
}

fn parse_file(path: &Path) -> anyhow::Result<Config> {
    let s = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    toml::from_str(&s).with_context(|| format!("parsing {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_match_core() {
        let c = Config::default();
        let p = c.peer_config();
        assert_eq!(p.chunk_size, 16 * 1024);
        assert_eq!(p.backpressure_threshold, 16 * 16 * 1024);
        assert_eq!(p.retry_delay, Duration::from_millis(100));
        assert_eq!(p.ice_servers, PeerConfig::default().ice_servers);
    }

    #[test]
    fn parses_partial_file() {
        let c: Config = toml::from_str(
            r#"
            chunk_size = 8192
            chunk_encoding = "binary"
            relay_url = "ws://localhost:8765"

            [[ice_servers]]
            urls = ["turn:turn.example.org:3478"]
            username = "u"
            credential = "p"
            "#,
        )
        .unwrap();
        assert_eq!(c.chunk_size, 8192);
        assert_eq!(c.chunk_encoding, ChunkEncoding::Binary);
        assert_eq!(c.relay_url.as_deref(), Some("ws://localhost:8765"));
        assert_eq!(c.ice_servers[0].username, "u");
        assert_eq!(c.peer_config().backpressure_threshold, 8192 * 16);
    }

    #[test]
    fn rejects_unknown_keys() {
        assert!(toml::from_str::<Config>("proxy_port = 3128").is_err());
    }

    #[test]
    fn env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("CNC_STUN_URL", "stun:stun.example.org:3478"),
            ("CNC_CHUNK_SIZE", "4096"),
            ("CNC_DOWNLOAD_DIR", "/tmp/cnc"),
            ("CNC_RELAY_URL", "ws://relay"),
        ]
        .into_iter()
        .collect();
        let mut c = Config::default();
        c.apply_vars(|k| vars.get(k).map(|v| v.to_string()));
        assert_eq!(c.ice_servers[0].urls, vec!["stun:stun.example.org:3478"]);
        assert_eq!(c.chunk_size, 4096);
        assert_eq!(c.download_dir, PathBuf::from("/tmp/cnc"));
        assert_eq!(c.relay_url.as_deref(), Some("ws://relay"));
    }

    #[test]
    fn bad_chunk_size_env_is_ignored() {
        let mut c = Config::default();
        c.apply_vars(|k| (k == "CNC_CHUNK_SIZE").then(|| "zero".to_string()));
        assert_eq!(c.chunk_size, default_chunk_size());
    }

    #[test]
    fn load_from_reports_parse_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "chunk_size = \"big\"").unwrap();
        assert!(load_from(&path).is_err());
        std::fs::write(&path, "chunk_size = 1024").unwrap();
        assert_eq!(load_from(&path).unwrap().chunk_size, 1024);
    }
}
