use std::path::{Path, PathBuf};
use std::time::Duration;
use serde::Deserialize;
use anyhow::{bail, Context, Result};
use url::Url;
use shared::protocol::DEFAULT_WATCH_ERROR_THRESHOLD;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub haproxy: ProxyConfig,
    #[serde(default)]
    pub reconcile: ReconcileConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegistryConfig {
    /// etcd URL whose path is the watched subtree, e.g. `http://127.0.0.1:2379/pulcy/wormhole`.
    /// Several endpoints sharing one path may be given comma-separated.
    pub etcd_addr: Option<String>,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_watch_error_threshold")]
    pub watch_error_threshold: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProxyConfig {
    #[serde(default = "default_conf_path")]
    pub conf_path: PathBuf,
    /// Command run after a changed config has been written; empty disables reloading
    #[serde(default)]
    pub reload_command: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReconcileConfig {
    #[serde(default = "default_retry_base")]
    pub retry_base_ms: u64,
    #[serde(default = "default_retry_max")]
    pub retry_max_ms: u64,
}

fn default_request_timeout() -> u64 {
    10
}

fn default_watch_error_threshold() -> u32 {
    DEFAULT_WATCH_ERROR_THRESHOLD
}

fn default_conf_path() -> PathBuf {
    PathBuf::from("/data/config/haproxy.cfg")
}

fn default_retry_base() -> u64 {
    500
}

fn default_retry_max() -> u64 {
    30_000
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            etcd_addr: None,
            request_timeout_secs: default_request_timeout(),
            watch_error_threshold: default_watch_error_threshold(),
        }
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            conf_path: default_conf_path(),
            reload_command: Vec::new(),
        }
    }
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            retry_base_ms: default_retry_base(),
            retry_max_ms: default_retry_max(),
        }
    }
}

impl RegistryConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Split `etcd_addr` into endpoint base URLs and the watched key.
    pub fn endpoints_and_key(&self) -> Result<(Vec<String>, String)> {
        let addr = match self.etcd_addr.as_deref().map(str::trim) {
            Some(addr) if !addr.is_empty() => addr,
            _ => bail!("Please specify --etcd-addr"),
        };

        let mut endpoints = Vec::new();
        let mut key: Option<String> = None;

        for part in addr.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let url = Url::parse(part)
                .with_context(|| format!("--etcd-addr '{}' is not valid", part))?;
            let host = url
                .host_str()
                .with_context(|| format!("--etcd-addr '{}' has no host", part))?;

            let endpoint = match url.port() {
                Some(port) => format!("{}://{}:{}", url.scheme(), host, port),
                None => format!("{}://{}", url.scheme(), host),
            };
            endpoints.push(endpoint);

            let path = url.path().trim_end_matches('/');
            let path = if path.is_empty() { "/" } else { path };
            if let Some(existing) = key.as_deref() {
                if existing != path {
                    bail!("--etcd-addr endpoints disagree on the key: '{}' vs '{}'", existing, path);
                }
            }
            key.get_or_insert_with(|| path.to_string());
        }

        match key {
            Some(key) => Ok((endpoints, key)),
            None => bail!("Please specify --etcd-addr"),
        }
    }
}

impl ReconcileConfig {
    pub fn validate(&self) -> Result<()> {
        if self.retry_base_ms == 0 || self.retry_max_ms < self.retry_base_ms {
            bail!(
                "Invalid retry settings: base {}ms, max {}ms",
                self.retry_base_ms,
                self.retry_max_ms
            );
        }
        Ok(())
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Command line values take precedence over the file
    pub fn with_overrides(mut self, etcd_addr: Option<String>, conf_path: Option<PathBuf>) -> Self {
        if let Some(addr) = etcd_addr {
            self.registry.etcd_addr = Some(addr);
        }
        if let Some(path) = conf_path {
            self.haproxy.conf_path = path;
        }
        self
    }

    /// Check everything needed at startup. Failures here are fatal.
    pub fn validate(&self) -> Result<()> {
        self.registry.endpoints_and_key()?;
        if self.haproxy.conf_path.as_os_str().is_empty() {
            bail!("Please specify --haproxy-conf");
        }
        self.reconcile.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn registry(addr: &str) -> RegistryConfig {
        RegistryConfig {
            etcd_addr: Some(addr.to_string()),
            ..RegistryConfig::default()
        }
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.haproxy.conf_path, PathBuf::from("/data/config/haproxy.cfg"));
        assert_eq!(config.registry.watch_error_threshold, 5);
        assert_eq!(config.registry.request_timeout(), Duration::from_secs(10));
        assert!(config.validate().is_err(), "etcd_addr is required");
    }

    #[test]
    fn test_load_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
[registry]
etcd_addr = "http://10.0.0.1:2379/pulcy/wormhole"
watch_error_threshold = 3

[haproxy]
conf_path = "/tmp/haproxy.cfg"
reload_command = ["systemctl", "reload", "haproxy"]
"#
        )
        .unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.registry.watch_error_threshold, 3);
        assert_eq!(config.registry.request_timeout_secs, 10);
        assert_eq!(config.haproxy.reload_command, vec!["systemctl", "reload", "haproxy"]);
        assert_eq!(config.reconcile.retry_base_ms, 500);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_missing_file() {
        assert!(Config::load("/nonexistent/wormhole.toml").is_err());
    }

    #[test]
    fn test_overrides() {
        let config = Config::default()
            .with_overrides(Some("http://etcd:2379/svc".to_string()), Some(PathBuf::from("/x.cfg")));
        assert_eq!(config.registry.etcd_addr.as_deref(), Some("http://etcd:2379/svc"));
        assert_eq!(config.haproxy.conf_path, PathBuf::from("/x.cfg"));

        let config = config.with_overrides(None, None);
        assert_eq!(config.haproxy.conf_path, PathBuf::from("/x.cfg"));
    }

    #[test]
    fn test_endpoints_and_key() {
        let (endpoints, key) = registry("http://127.0.0.1:2379/pulcy/wormhole/").endpoints_and_key().unwrap();
        assert_eq!(endpoints, vec!["http://127.0.0.1:2379"]);
        assert_eq!(key, "/pulcy/wormhole");

        let (endpoints, key) = registry("https://etcd.local").endpoints_and_key().unwrap();
        assert_eq!(endpoints, vec!["https://etcd.local"]);
        assert_eq!(key, "/");

        let (endpoints, key) = registry("http://a:2379/svc, http://b:2379/svc").endpoints_and_key().unwrap();
        assert_eq!(endpoints, vec!["http://a:2379", "http://b:2379"]);
        assert_eq!(key, "/svc");
    }

    #[test]
    fn test_endpoints_and_key_errors() {
        assert!(RegistryConfig::default().endpoints_and_key().is_err());
        assert!(registry("   ").endpoints_and_key().is_err());
        assert!(registry("not a url").endpoints_and_key().is_err());
        assert!(registry("http://a:2379/one,http://b:2379/two").endpoints_and_key().is_err());
    }

    #[test]
    fn test_reconcile_validation() {
        let bad = ReconcileConfig {
            retry_base_ms: 1000,
            retry_max_ms: 10,
        };
        assert!(bad.validate().is_err());
        assert!(ReconcileConfig::default().validate().is_ok());
    }
}
