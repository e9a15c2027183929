//! Daemon lifecycle: vault, storage, services, background sweeps, shutdown

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use cdrop_core::config::{CdropConfig, CryptoConfig};
use cdrop_core::types::now_unix;
use cdrop_crypto::{KdfParams, MasterKeyVault};
use cdrop_files::{FileService, JsonMetadataStore, UploadPipeline};
use cdrop_storage::{build_driver, ActiveDriver};
use cdrop_upload::sweeper::spawn_periodic;
use cdrop_upload::{Assembler, Publisher, RateLimiter, StatusTable};
use secrecy::SecretString;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Everything the request layer needs, shared by `Arc`.
pub struct Services {
    pub vault: Arc<MasterKeyVault>,
    pub drivers: ActiveDriver,
    pub publisher: Publisher,
    pub status: Arc<StatusTable>,
    pub limiter: RateLimiter,
    pub files: Arc<FileService>,
    pub pipeline: Arc<UploadPipeline>,
}

pub async fn run(config: CdropConfig) -> Result<()> {
    config.validate().context("invalid configuration")?;
    info!("daemon starting");

    let services = Arc::new(build_services(&config).await?);

    let driver = services.drivers.current();
    if driver.is_available().await {
        info!(driver = driver.name(), "storage: available");
    } else {
        warn!(driver = driver.name(), "storage: not reachable yet");
    }

    let cancel = CancellationToken::new();
    let mut tasks = Vec::new();

    // ── Background sweeps ────────────────────────────────────────────────
    {
        let status = Arc::clone(&services.status);
        tasks.push(spawn_periodic(
            "status-sweep",
            Duration::from_secs(config.status.sweep_secs),
            cancel.clone(),
            move || {
                status.sweep_expired(now_unix());
                std::future::ready(())
            },
        ));
    }
    {
        let pipeline = Arc::clone(&services.pipeline);
        let max_idle = Duration::from_secs(config.upload.session_idle_secs);
        tasks.push(spawn_periodic(
            "upload-session-sweep",
            Duration::from_secs(config.upload.session_sweep_secs),
            cancel.clone(),
            move || {
                let pipeline = Arc::clone(&pipeline);
                async move {
                    pipeline.sweep_idle(max_idle).await;
                }
            },
        ));
    }
    {
        let files = Arc::clone(&services.files);
        tasks.push(spawn_periodic(
            "file-cleanup",
            Duration::from_secs(config.cleanup.interval_secs),
            cancel.clone(),
            move || {
                let files = Arc::clone(&files);
                async move {
                    if let Err(e) = files.cleanup().await {
                        error!("file cleanup failed: {e}");
                    }
                }
            },
        ));
    }

    // ── Metrics + health endpoint ────────────────────────────────────────
    if let Some(addr) = config.daemon.metrics_addr.clone() {
        let state = crate::metrics::HealthState {
            metrics: Arc::new(crate::metrics::Metrics::new()),
            services: Arc::clone(&services),
        };
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = crate::metrics::serve(addr, state, cancel).await {
                error!("metrics server failed: {e}");
            }
        });
    }

    info!(
        level = ?config.crypto.level,
        vault = services.vault.is_initialized(),
        driver = services.drivers.current().name(),
        data_dir = %config.daemon.data_dir.display(),
        "daemon ready"
    );

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("shutdown requested");

    cancel.cancel();
    services.publisher.shutdown();
    services.limiter.stop();
    for task in tasks {
        if let Err(e) = task.await {
            warn!("background task ended abnormally: {e}");
        }
    }

    info!("daemon stopped");
    Ok(())
}

pub async fn build_services(config: &CdropConfig) -> Result<Services> {
    let vault = Arc::new(build_vault(&config.crypto)?);

    let data_dir = &config.daemon.data_dir;
    let staging_dir = data_dir.join("staging");
    tokio::fs::create_dir_all(&staging_dir)
        .await
        .with_context(|| format!("creating staging dir {}", staging_dir.display()))?;

    let driver = build_driver(&config.storage).context("building storage driver")?;
    info!(kind = %driver.kind(), name = driver.name(), "storage driver configured");
    let drivers = ActiveDriver::new(driver);

    let publisher = Publisher::new(
        Duration::from_secs(config.events.heartbeat_secs),
        Duration::from_secs(config.events.max_connection_secs),
    );
    let status = Arc::new(StatusTable::new(
        publisher.clone(),
        Duration::from_secs(config.status.ttl_secs),
    ));
    let limiter = RateLimiter::new(&config.limits);
    let assembler = Arc::new(Assembler::new(
        Arc::clone(&vault),
        config.upload.max_file_size_mb * 1024 * 1024,
    ));

    let metadata_path = data_dir.join("metadata.json");
    let metadata = JsonMetadataStore::open(&metadata_path)
        .await
        .with_context(|| format!("opening metadata {}", metadata_path.display()))?;

    let files = Arc::new(FileService::new(
        Arc::new(metadata),
        drivers.clone(),
        Arc::clone(&vault),
        publisher.clone(),
        config.crypto.level,
        staging_dir,
    ));
    let pipeline = Arc::new(UploadPipeline::new(
        assembler,
        Arc::clone(&status),
        limiter.clone(),
        Arc::clone(&files),
    ));

    Ok(Services {
        vault,
        drivers,
        publisher,
        status,
        limiter,
        files,
        pipeline,
    })
}

fn kdf_params(cfg: &CryptoConfig) -> KdfParams {
    KdfParams {
        mem_cost_kib: cfg.argon2_mem_cost_kib,
        time_cost: cfg.argon2_time_cost,
        parallelism: cfg.argon2_parallelism,
    }
}

/// Initialise the master key vault from config. Any failure is fatal: the
/// daemon never runs with a key it could not verify.
pub fn build_vault(cfg: &CryptoConfig) -> Result<MasterKeyVault> {
    let vault = MasterKeyVault::new();

    if let Some(encoded) = cfg.master_key.as_deref() {
        let raw = STANDARD
            .decode(encoded.trim())
            .context("crypto.master_key is not valid base64")?;
        vault
            .init_with_key(&raw)
            .context("initialising vault from master key")?;
        info!("vault: master key loaded");
    } else if let Some(password) = cfg.password.as_deref() {
        let password = SecretString::from(password.to_string());
        vault
            .init_with_password(&password, cfg.salt.as_bytes(), &kdf_params(cfg))
            .context("deriving master key from password")?;
        info!("vault: master key derived from password");
    } else if cfg.level.needs_vault() {
        bail!("crypto.level {:?} requires a master key or password", cfg.level);
    } else {
        info!("vault: not initialised (encryption level {:?})", cfg.level);
        return Ok(vault);
    }

    if let Some(expected) = cfg.password_checksum.as_deref() {
        let actual = vault.reveal().context("reading back master key")?.checksum();
        if !actual.eq_ignore_ascii_case(expected.trim()) {
            bail!("master key checksum mismatch: wrong password or key");
        }
        info!("vault: checksum verified");
    }
    Ok(vault)
}

/// Checksum of the configured master key, for `password_checksum`.
pub fn vault_checksum(cfg: &CryptoConfig) -> Result<String> {
    let cfg = CryptoConfig {
        password_checksum: None,
        ..cfg.clone()
    };
    let vault = build_vault(&cfg)?;
    if !vault.is_initialized() {
        bail!("no crypto.master_key or crypto.password configured");
    }
    Ok(vault.reveal()?.checksum())
}
