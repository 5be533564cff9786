//! Reconciliation loop: watch → read → render → apply, one cycle at a time.

use std::time::Duration;
use anyhow::{Context, Result};
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use shared::types::{canonicalize, fingerprint};
use crate::apply::ConfigApplier;
use crate::backend::Backend;
use crate::config::ReconcileConfig;
use crate::digest;
use crate::registry::Registry;
use crate::render::render_config;

pub struct Service<R: Registry> {
    backend: Backend<R>,
    applier: ConfigApplier,
    retry: ReconcileConfig,
    /// Fingerprint of the snapshot behind the last successfully applied config
    last_applied: Option<String>,
}

impl<R: Registry> Service<R> {
    pub fn new(backend: Backend<R>, applier: ConfigApplier, retry: ReconcileConfig) -> Self {
        Self {
            backend,
            applier,
            retry,
            last_applied: None,
        }
    }

    /// Run until `cancel` fires. Errors are logged and retried, never returned:
    /// while the registry is unreachable the last applied config stays in place.
    pub async fn run(mut self, cancel: CancellationToken) {
        info!(
            key = %self.backend.key(),
            conf_path = %self.applier.conf_path().display(),
            "Starting reconciliation loop"
        );

        let mut watch_failures = 0u32;
        if self.update_until_applied(&cancel).await {
            loop {
                let result = tokio::select! {
                    _ = cancel.cancelled() => break,
                    result = self.backend.watch() => result,
                };

                match result {
                    Ok(()) => watch_failures = 0,
                    Err(e) => {
                        watch_failures += 1;
                        warn!(
                            consecutive = self.backend.consecutive_watch_errors(),
                            "Failed to watch registry: {}", e
                        );
                        if !pause(self.delay(watch_failures), &cancel).await {
                            break;
                        }
                        // Something may have changed while the watch was down
                    }
                }

                if !self.update_until_applied(&cancel).await {
                    break;
                }
            }
        }

        info!("Reconciliation loop shutting down");
    }

    /// Read, render and apply once, without touching the config file.
    pub async fn run_once(&self) -> Result<String> {
        let services = self
            .backend
            .get()
            .await
            .context("Failed to load service registrations")?;
        Ok(render_config(&services))
    }

    /// Retry `update` with backoff until it succeeds. Returns false if cancelled.
    async fn update_until_applied(&mut self, cancel: &CancellationToken) -> bool {
        let mut attempt = 0u32;
        loop {
            let result = tokio::select! {
                _ = cancel.cancelled() => return false,
                result = self.update() => result,
            };

            match result {
                Ok(_) => return true,
                Err(e) => {
                    attempt += 1;
                    error!(attempt, "Failed to update haproxy config: {:#}", e);
                    if !pause(self.delay(attempt), cancel).await {
                        return false;
                    }
                }
            }
        }
    }

    /// One full cycle. Returns true if a new config was applied.
    async fn update(&mut self) -> Result<bool> {
        let services = self
            .backend
            .get()
            .await
            .context("Failed to load service registrations")?;
        let services = canonicalize(services);
        let current = fingerprint(&services);

        if self.last_applied.as_deref() == Some(current.as_str()) {
            debug!(registrations = services.len(), "Service registrations unchanged");
            return Ok(false);
        }

        let config = render_config(&services);
        let written = self
            .applier
            .apply(&config)
            .await
            .context("Failed to apply haproxy config")?;

        let hash = digest::compute_hash(&services);
        info!(
            registrations = services.len(),
            instances = services.instance_count(),
            digest = digest::short(&hash),
            written,
            "Applied haproxy config"
        );
        debug!(fingerprint = %current, "Applied routing table");

        self.last_applied = Some(current);
        Ok(true)
    }

    fn delay(&self, attempt: u32) -> Duration {
        retry_delay(&self.retry, attempt)
    }

    pub fn last_applied(&self) -> Option<&str> {
        self.last_applied.as_deref()
    }
}

/// Pause before retry number `attempt` (1-based): `retry_base_ms` doubled per
/// further attempt, capped at `retry_max_ms`, plus up to a tenth of random jitter.
fn retry_delay(retry: &ReconcileConfig, attempt: u32) -> Duration {
    let doublings = attempt.saturating_sub(1).min(32);
    let delay_ms = retry
        .retry_base_ms
        .saturating_mul(1u64 << doublings)
        .min(retry.retry_max_ms);

    let spread = delay_ms / 10;
    let extra = if spread > 0 { rand::thread_rng().gen_range(0..spread) } else { 0 };
    Duration::from_millis(delay_ms + extra)
}

/// Sleep unless cancelled first. Returns false if cancelled.
async fn pause(delay: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}
