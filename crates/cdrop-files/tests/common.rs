#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use cdrop_core::config::{EncryptionLevel, LimitsConfig, LocalConfig};
use cdrop_crypto::{KdfParams, MasterKeyVault};
use cdrop_files::{FileService, MemoryMetadataStore, UploadPipeline};
use cdrop_storage::{ActiveDriver, LocalDriver};
use cdrop_upload::{Assembler, Publisher, RateLimiter, StatusTable};
use secrecy::SecretString;

pub struct Fixture {
    _dir: tempfile::TempDir,
    pub data_dir: PathBuf,
    pub staging_dir: PathBuf,
    pub vault: Arc<MasterKeyVault>,
    pub publisher: Publisher,
    pub files: Arc<FileService>,
    pub pipeline: UploadPipeline,
}

pub fn fast_params() -> KdfParams {
    KdfParams {
        mem_cost_kib: 1024,
        time_cost: 1,
        parallelism: 1,
    }
}

pub fn fixture(level: EncryptionLevel) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let data_dir = dir.path().join("data");
    let staging_dir = dir.path().join("staging");
    std::fs::create_dir_all(&data_dir).unwrap();
    std::fs::create_dir_all(&staging_dir).unwrap();

    let vault = Arc::new(MasterKeyVault::new());
    vault
        .init_with_password(&SecretString::from("pw".to_string()), b"salt", &fast_params())
        .unwrap();

    let driver = LocalDriver::new(&LocalConfig {
        data_dir: data_dir.clone(),
        file_prefix: String::new(),
    });
    let drivers = ActiveDriver::new(Arc::new(driver));
    let publisher = Publisher::new(Duration::from_secs(15), Duration::from_secs(7200));

    let files = Arc::new(FileService::new(
        Arc::new(MemoryMetadataStore::new()),
        drivers,
        Arc::clone(&vault),
        publisher.clone(),
        level,
        &staging_dir,
    ));
    let pipeline = UploadPipeline::new(
        Arc::new(Assembler::new(Arc::clone(&vault), 64 * 1024 * 1024)),
        Arc::new(StatusTable::new(
            publisher.clone(),
            Duration::from_secs(24 * 60 * 60),
        )),
        RateLimiter::new(&LimitsConfig::default()),
        Arc::clone(&files),
    );

    Fixture {
        _dir: dir,
        data_dir,
        staging_dir,
        vault,
        publisher,
        files,
        pipeline,
    }
}

/// Deterministic, non-repeating test content.
pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}
