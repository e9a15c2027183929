use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::ConfigError;

/// Top-level daemon configuration (loaded from cryptdrop.toml)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CdropConfig {
    pub daemon: DaemonConfig,
    pub storage: StorageConfig,
    pub crypto: CryptoConfig,
    pub upload: UploadConfig,
    pub limits: LimitsConfig,
    pub status: StatusConfig,
    pub events: EventsConfig,
    pub cleanup: CleanupConfig,
}

impl CdropConfig {
    /// Reject values that would make a service misbehave at runtime.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.daemon.data_dir.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("daemon.data_dir must not be empty".into()));
        }
        if self.limits.rate_per_second == 0 || self.limits.burst == 0 {
            return Err(ConfigError::Invalid(
                "limits.rate_per_second and limits.burst must be > 0".into(),
            ));
        }
        for (name, secs) in [
            ("limits.sweep_secs", self.limits.sweep_secs),
            ("status.sweep_secs", self.status.sweep_secs),
            ("upload.session_sweep_secs", self.upload.session_sweep_secs),
            ("events.heartbeat_secs", self.events.heartbeat_secs),
            ("cleanup.interval_secs", self.cleanup.interval_secs),
        ] {
            if secs == 0 {
                return Err(ConfigError::Invalid(format!("{name} must be > 0")));
            }
        }
        if self.crypto.level.needs_vault()
            && self.crypto.master_key.is_none()
            && self.crypto.password.is_none()
        {
            return Err(ConfigError::Invalid(format!(
                "crypto.level = {:?} requires crypto.master_key or crypto.password",
                self.crypto.level
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Working directory for staging files and the metadata store
    pub data_dir: PathBuf,
    /// Prometheus metrics endpoint (default: 127.0.0.1:9100)
    pub metrics_addr: Option<String>,
    /// Log level (default: info)
    pub log_level: String,
    /// Log format: "json" or "text"
    pub log_format: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/var/lib/cryptdrop"),
            metrics_addr: Some("127.0.0.1:9100".into()),
            log_level: "info".into(),
            log_format: "json".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Which backend receives new uploads
    pub driver: DriverConfig,
    /// How remote objects are handed to downloaders
    pub serve_policy: ServePolicy,
    /// Lifetime of presigned redirect URLs in seconds (default: 300)
    pub presign_ttl_secs: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            driver: DriverConfig::default(),
            serve_policy: ServePolicy::Proxy,
            presign_ttl_secs: 300,
        }
    }
}

/// Storage backend selection. One concrete config type per driver.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum DriverConfig {
    Local(LocalConfig),
    S3(S3Config),
}

impl Default for DriverConfig {
    fn default() -> Self {
        DriverConfig::Local(LocalConfig::default())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalConfig {
    /// Directory holding content objects
    pub data_dir: PathBuf,
    /// Optional prefix prepended to every object file name
    pub file_prefix: String,
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/var/lib/cryptdrop/data"),
            file_prefix: String::new(),
        }
    }
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct S3Config {
    /// S3-compatible endpoint
    pub endpoint: String,
    /// S3 region (default: us-east-1)
    pub region: String,
    /// Bucket receiving new objects
    pub bucket: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    /// Refuse plaintext HTTP endpoints
    pub enforce_tls: bool,
}

impl Default for S3Config {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:9000".into(),
            region: "us-east-1".into(),
            bucket: "cryptdrop".into(),
            access_key_id: String::new(),
            secret_access_key: String::new(),
            enforce_tls: false,
        }
    }
}

impl std::fmt::Debug for S3Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Config")
            .field("endpoint", &self.endpoint)
            .field("region", &self.region)
            .field("bucket", &self.bucket)
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"[REDACTED]")
            .field("enforce_tls", &self.enforce_tls)
            .finish()
    }
}

/// Remote download handling. Applies to every request of a deployment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServePolicy {
    /// Stream bytes through the server
    #[default]
    Proxy,
    /// Answer with a time-limited presigned URL (unencrypted objects only)
    Redirect,
}

/// At-rest encryption level
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EncryptionLevel {
    /// Files are stored as uploaded
    #[default]
    None,
    /// Encrypt files that land on the local driver only
    Local,
    /// Encrypt every file regardless of driver
    Full,
    /// Clients encrypt before upload; the server stores opaque bytes
    EndToEnd,
}

impl EncryptionLevel {
    /// Whether the server must hold a master key for this level.
    pub fn needs_vault(self) -> bool {
        matches!(self, EncryptionLevel::Local | EncryptionLevel::Full)
    }

    /// Whether the server encrypts a file bound for a driver of the given kind.
    pub fn encrypts_on(self, remote: bool) -> bool {
        match self {
            EncryptionLevel::None | EncryptionLevel::EndToEnd => false,
            EncryptionLevel::Local => !remote,
            EncryptionLevel::Full => true,
        }
    }
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CryptoConfig {
    pub level: EncryptionLevel,
    /// Base64 encoded 32-byte master key (takes precedence over password)
    pub master_key: Option<String>,
    /// Master password, stretched with Argon2id
    pub password: Option<String>,
    /// Salt for the password KDF
    pub salt: String,
    /// Hex checksum of the derived key, used to reject a wrong password at startup
    pub password_checksum: Option<String>,
    /// Argon2id memory cost in KiB (default: 65536 = 64 MiB)
    pub argon2_mem_cost_kib: u32,
    /// Argon2id time cost (iterations, default: 3)
    pub argon2_time_cost: u32,
    /// Argon2id parallelism (default: 4)
    pub argon2_parallelism: u32,
}

impl Default for CryptoConfig {
    fn default() -> Self {
        Self {
            level: EncryptionLevel::None,
            master_key: None,
            password: None,
            salt: "cryptdrop".into(),
            password_checksum: None,
            argon2_mem_cost_kib: 65536,
            argon2_time_cost: 3,
            argon2_parallelism: 4,
        }
    }
}

impl std::fmt::Debug for CryptoConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let redact = |v: &Option<String>| v.as_ref().map(|_| "[REDACTED]");
        f.debug_struct("CryptoConfig")
            .field("level", &self.level)
            .field("master_key", &redact(&self.master_key))
            .field("password", &redact(&self.password))
            .field("salt", &self.salt)
            .field("password_checksum", &self.password_checksum)
            .field("argon2_mem_cost_kib", &self.argon2_mem_cost_kib)
            .field("argon2_time_cost", &self.argon2_time_cost)
            .field("argon2_parallelism", &self.argon2_parallelism)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    /// Largest accepted file in MiB
    pub max_file_size_mb: u64,
    /// Sessions without activity for this long are discarded
    pub session_idle_secs: u64,
    pub session_sweep_secs: u64,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_file_size_mb: 102_400,
            session_idle_secs: 6 * 60 * 60,
            session_sweep_secs: 10 * 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Token refill rate per key
    pub rate_per_second: u32,
    /// Bucket capacity per key
    pub burst: u32,
    /// Entries untouched for this long are evicted
    pub idle_secs: u64,
    pub sweep_secs: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            rate_per_second: 1,
            burst: 4,
            idle_secs: 12 * 60 * 60,
            sweep_secs: 30 * 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StatusConfig {
    /// Upload status entries are dropped this long after creation
    pub ttl_secs: u64,
    pub sweep_secs: u64,
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 24 * 60 * 60,
            sweep_secs: 60 * 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    /// Idle connections get a ping this often
    pub heartbeat_secs: u64,
    /// Subscriber connections are closed after this long
    pub max_connection_secs: u64,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            heartbeat_secs: 15,
            max_connection_secs: 2 * 60 * 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CleanupConfig {
    /// Interval of the expired-file sweep
    pub interval_secs: u64,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60 * 60,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let toml_str = r#"
[daemon]
data_dir = "/srv/cryptdrop"
log_level = "debug"
log_format = "text"

[storage]
serve_policy = "redirect"
presign_ttl_secs = 60

[storage.driver]
type = "s3"
endpoint = "https://s3.example.com"
region = "eu-central-1"
bucket = "drops"
access_key_id = "AKIA"
secret_access_key = "shh"
enforce_tls = true

[crypto]
level = "full"
password = "hunter2"
salt = "pepper"
argon2_mem_cost_kib = 131072

[limits]
rate_per_second = 2
burst = 8

[status]
ttl_secs = 3600
"#;
        let config: CdropConfig = toml::from_str(toml_str).unwrap();

        assert_eq!(config.daemon.data_dir, PathBuf::from("/srv/cryptdrop"));
        assert_eq!(config.daemon.log_level, "debug");
        assert_eq!(config.storage.serve_policy, ServePolicy::Redirect);
        assert_eq!(config.storage.presign_ttl_secs, 60);
        match &config.storage.driver {
            DriverConfig::S3(s3) => {
                assert_eq!(s3.bucket, "drops");
                assert_eq!(s3.region, "eu-central-1");
                assert!(s3.enforce_tls);
            }
            other => panic!("expected s3 driver, got {other:?}"),
        }
        assert_eq!(config.crypto.level, EncryptionLevel::Full);
        assert_eq!(config.crypto.salt, "pepper");
        assert_eq!(config.crypto.argon2_mem_cost_kib, 131072);
        assert_eq!(config.limits.burst, 8);
        assert_eq!(config.status.ttl_secs, 3600);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_defaults() {
        let config: CdropConfig = toml::from_str("").unwrap();

        assert!(matches!(config.storage.driver, DriverConfig::Local(_)));
        assert_eq!(config.storage.serve_policy, ServePolicy::Proxy);
        assert_eq!(config.crypto.level, EncryptionLevel::None);
        assert_eq!(config.limits.rate_per_second, 1);
        assert_eq!(config.limits.burst, 4);
        assert_eq!(config.limits.idle_secs, 12 * 60 * 60);
        assert_eq!(config.status.ttl_secs, 24 * 60 * 60);
        assert_eq!(config.events.heartbeat_secs, 15);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_local_driver() {
        let toml_str = r#"
[storage.driver]
type = "local"
data_dir = "/tmp/objects"
file_prefix = "obj-"
"#;
        let config: CdropConfig = toml::from_str(toml_str).unwrap();
        match config.storage.driver {
            DriverConfig::Local(local) => {
                assert_eq!(local.data_dir, PathBuf::from("/tmp/objects"));
                assert_eq!(local.file_prefix, "obj-");
            }
            other => panic!("expected local driver, got {other:?}"),
        }
        // Untouched sections keep their defaults
        assert_eq!(config.daemon.log_level, "info");
    }

    #[test]
    fn test_validate_rejects_missing_key_material() {
        let mut config = CdropConfig::default();
        config.crypto.level = EncryptionLevel::Local;
        assert!(config.validate().is_err());

        config.crypto.password = Some("pw".into());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_burst() {
        let mut config = CdropConfig::default();
        config.limits.burst = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_encryption_level_driver_rules() {
        assert!(!EncryptionLevel::None.encrypts_on(false));
        assert!(EncryptionLevel::Local.encrypts_on(false));
        assert!(!EncryptionLevel::Local.encrypts_on(true));
        assert!(EncryptionLevel::Full.encrypts_on(true));
        assert!(!EncryptionLevel::EndToEnd.encrypts_on(false));
        assert!(!EncryptionLevel::EndToEnd.needs_vault());
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let crypto = CryptoConfig {
            password: Some("hunter2".into()),
            ..Default::default()
        };
        let rendered = format!("{crypto:?}");
        assert!(!rendered.contains("hunter2"));

        let s3 = S3Config {
            secret_access_key: "topsecret".into(),
            ..Default::default()
        };
        assert!(!format!("{s3:?}").contains("topsecret"));
    }

    #[test]
    fn test_serialize_roundtrip() {
        let config = CdropConfig::default();
        let toml_str = toml::to_string(&config).unwrap();
        let parsed: CdropConfig = toml::from_str(&toml_str).unwrap();

        assert_eq!(config.daemon.data_dir, parsed.daemon.data_dir);
        assert_eq!(config.limits.burst, parsed.limits.burst);
        assert_eq!(config.crypto.level, parsed.crypto.level);
    }
}
