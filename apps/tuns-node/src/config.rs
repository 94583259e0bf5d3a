//! Node configuration: an optional YAML file overlaid by `TUNS_*` variables.

use anyhow::{Context, Result};
use core_mesh::MeshConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const CONFIG_ENV: &str = "TUNS_CONFIG";
pub const DEFAULT_CONFIG_FILE: &str = "tuns.yaml";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Port of the HTTP proxy entrypoint and status endpoint.
    pub http_port: u16,
    /// Local SOCKS5 entry port; 0 disables it.
    pub socks_port: u16,
    pub key_file: PathBuf,
    pub log_dir: PathBuf,
    #[serde(flatten)]
    pub mesh: MeshConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            http_port: 8080,
            socks_port: 1080,
            key_file: PathBuf::from("node.key"),
            log_dir: PathBuf::from("logs"),
            mesh: MeshConfig::default(),
        }
    }
}

impl NodeConfig {
    /// Reads the file named by `TUNS_CONFIG` (default `tuns.yaml`), then
    /// applies environment overrides. A missing file means defaults.
    ///
    /// Runs before logging is up, so ignored overrides are handed back as
    /// `KEY=value` strings for the caller to report.
    pub fn load() -> Result<(Self, Vec<String>)> {
        let path = std::env::var(CONFIG_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_FILE.to_string());
        let mut cfg = Self::from_file(Path::new(&path))?;
        let ignored = cfg.apply_env(|key| std::env::var(key).ok());
        Ok((cfg, ignored))
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(text) => Self::from_yaml(&text).with_context(|| format!("parse {}", path.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e).with_context(|| format!("read {}", path.display())),
        }
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(text)?)
    }

    /// Env overrides: TUNS_HTTP_PORT, TUNS_SOCKS_PORT, TUNS_HOSTS,
    /// TUNS_SLOTS, TUNS_SLOT_COOLDOWN_SECS, TUNS_KEY_FILE, TUNS_LISTEN,
    /// TUNS_BOOTSTRAP. Unparseable numbers are skipped and returned.
    pub fn apply_env(&mut self, get: impl Fn(&str) -> Option<String>) -> Vec<String> {
        let mut ignored = Vec::new();
        if let Some(v) = get("TUNS_HTTP_PORT") {
            parse_into(&mut self.http_port, "TUNS_HTTP_PORT", &v, &mut ignored);
        }
        if let Some(v) = get("TUNS_SOCKS_PORT") {
            parse_into(&mut self.socks_port, "TUNS_SOCKS_PORT", &v, &mut ignored);
        }
        if let Some(v) = get("TUNS_SLOTS") {
            parse_into(&mut self.mesh.admission.slots, "TUNS_SLOTS", &v, &mut ignored);
        }
        if let Some(v) = get("TUNS_SLOT_COOLDOWN_SECS") {
            parse_into(
                &mut self.mesh.admission.cooldown_secs,
                "TUNS_SLOT_COOLDOWN_SECS",
                &v,
                &mut ignored,
            );
        }
        if let Some(v) = get("TUNS_KEY_FILE") {
            self.key_file = PathBuf::from(v);
        }
        if let Some(v) = get("TUNS_HOSTS") {
            self.mesh.hosts = split_list(&v);
        }
        if let Some(v) = get("TUNS_LISTEN") {
            self.mesh.listen_addrs = split_list(&v);
        }
        if let Some(v) = get("TUNS_BOOTSTRAP") {
            self.mesh.bootstrap_peers = split_list(&v);
        }
        ignored
    }
}

fn parse_into<T: std::str::FromStr>(
    slot: &mut T,
    key: &str,
    raw: &str,
    ignored: &mut Vec<String>,
) {
    match raw.trim().parse() {
        Ok(v) => *slot = v,
        Err(_) => ignored.push(format!("{}={}", key, raw)),
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn yaml_overlays_defaults() {
        let cfg = NodeConfig::from_yaml(
            "http_port: 9000\nhosts: ['*.example.com']\nadmission:\n  slots: 2\n",
        )
        .unwrap();
        assert_eq!(cfg.http_port, 9000);
        assert_eq!(cfg.socks_port, 1080);
        assert_eq!(cfg.mesh.hosts, vec!["*.example.com"]);
        assert_eq!(cfg.mesh.admission.slots, 2);
        assert_eq!(cfg.mesh.admission.cooldown_secs, 1);
    }

    #[test]
    fn env_overrides_win() {
        let env: HashMap<&str, &str> = [
            ("TUNS_HTTP_PORT", "8181"),
            ("TUNS_SOCKS_PORT", "nope"),
            ("TUNS_HOSTS", "a.com, *.b.com,,"),
            ("TUNS_SLOTS", "7"),
            ("TUNS_BOOTSTRAP", "/ip4/1.2.3.4/tcp/4001/p2p/x"),
        ]
        .into_iter()
        .collect();
        let mut cfg = NodeConfig::default();
        let ignored = cfg.apply_env(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(ignored, vec!["TUNS_SOCKS_PORT=nope"]);
        assert_eq!(cfg.http_port, 8181);
        assert_eq!(cfg.socks_port, 1080);
        assert_eq!(cfg.mesh.hosts, vec!["a.com", "*.b.com"]);
        assert_eq!(cfg.mesh.admission.slots, 7);
        assert_eq!(cfg.mesh.bootstrap_peers.len(), 1);
    }

    #[test]
    fn missing_file_means_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = NodeConfig::from_file(&dir.path().join("absent.yaml")).unwrap();
        assert_eq!(cfg.http_port, 8080);
        assert_eq!(cfg.mesh.hosts, vec!["*themoviedb.org", "*tmdb.org"]);
    }
}
