use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use anyhow::{bail, Context, Result};
use tokio::process::Command;
use crate::config::ProxyConfig;

/// Persists rendered configuration and asks haproxy to pick it up.
/// Applying the content that is already on disk is a no-op.
#[derive(Debug, Clone)]
pub struct ConfigApplier {
    conf_path: PathBuf,
    reload_command: Vec<String>,
    /// Set while the file on disk has not been picked up by a successful reload
    reload_pending: bool,
}

impl ConfigApplier {
    pub fn new(conf_path: impl Into<PathBuf>, reload_command: Vec<String>) -> Self {
        Self {
            conf_path: conf_path.into(),
            reload_command,
            reload_pending: false,
        }
    }

    pub fn from_config(config: &ProxyConfig) -> Self {
        Self::new(config.conf_path.clone(), config.reload_command.clone())
    }

    pub fn conf_path(&self) -> &Path {
        &self.conf_path
    }

    /// Write `content` and trigger a reload. Returns false if the file already
    /// held exactly this content.
    pub async fn apply(&mut self, content: &str) -> Result<bool> {
        match tokio::fs::read_to_string(&self.conf_path).await {
            Ok(existing) if existing == content => {
                if self.reload_pending {
                    self.reload().await?;
                    self.reload_pending = false;
                }
                return Ok(false);
            }
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read {}", self.conf_path.display()));
            }
        }

        if let Some(parent) = self.conf_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }

        // Write next to the target and rename so haproxy never reads a partial file
        let mut tmp = self.conf_path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        tokio::fs::write(&tmp, content)
            .await
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &self.conf_path)
            .await
            .with_context(|| format!("Failed to move config into place: {}", self.conf_path.display()))?;

        self.reload_pending = true;
        self.reload().await?;
        self.reload_pending = false;
        Ok(true)
    }

    async fn reload(&self) -> Result<()> {
        let Some((program, args)) = self.reload_command.split_first() else {
            return Ok(());
        };

        let output = Command::new(program)
            .args(args)
            .output()
            .await
            .with_context(|| format!("Failed to run reload command '{}'", program))?;

        if !output.status.success() {
            bail!(
                "Reload command '{}' failed with {}: {}",
                self.reload_command.join(" "),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        tracing::debug!("Reload command '{}' succeeded", program);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_apply_writes_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("haproxy.cfg");
        let mut applier = ConfigApplier::new(&path, Vec::new());

        assert!(applier.apply("global\n").await.unwrap(), "First apply should write");
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "global\n");

        assert!(!applier.apply("global\n").await.unwrap(), "Identical apply should be a no-op");

        assert!(applier.apply("defaults\n").await.unwrap());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "defaults\n");
        assert!(!path.with_extension("cfg.tmp").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_reload_command_runs_on_change_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("haproxy.cfg");
        let marker = dir.path().join("reloads");
        let script = format!("echo reload >> {}", marker.display());
        let mut applier = ConfigApplier::new(&path, vec!["sh".to_string(), "-c".to_string(), script]);

        applier.apply("a\n").await.unwrap();
        applier.apply("a\n").await.unwrap();
        applier.apply("b\n").await.unwrap();

        let reloads = std::fs::read_to_string(&marker).unwrap();
        assert_eq!(reloads.lines().count(), 2);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failing_reload_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("haproxy.cfg");
        let mut applier = ConfigApplier::new(&path, vec!["false".to_string()]);

        assert!(applier.apply("a\n").await.is_err());
        assert!(applier.apply("a\n").await.is_err(), "Reload should be retried for unchanged content");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_pending_reload_retried() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("haproxy.cfg");
        let gate = dir.path().join("gate");
        let script = format!("test -e {}", gate.display());
        let mut applier = ConfigApplier::new(&path, vec!["sh".to_string(), "-c".to_string(), script]);

        assert!(applier.apply("a\n").await.is_err());

        std::fs::write(&gate, "").unwrap();
        assert!(!applier.apply("a\n").await.unwrap());
        assert!(!applier.apply("a\n").await.unwrap());
    }
}
