//! OpenDAL Operator factory for the S3 driver

use cdrop_core::config::S3Config;
use opendal::Operator;

use crate::error::StorageError;

/// Build an OpenDAL Operator for any S3-compatible endpoint.
///
/// Uses path-style addressing (default in opendal 0.55), which MinIO and
/// SeaweedFS require. If `enforce_tls` is set, plaintext HTTP endpoints are
/// rejected; otherwise they only log a warning.
pub fn build_operator(cfg: &S3Config) -> Result<Operator, StorageError> {
    if cfg.endpoint.starts_with("http://") {
        if cfg.enforce_tls {
            return Err(StorageError::Config(format!(
                "S3 endpoint uses plaintext HTTP ({}), but enforce_tls is enabled",
                cfg.endpoint
            )));
        }
        tracing::warn!(
            endpoint = %cfg.endpoint,
            "S3 endpoint uses plaintext HTTP, credentials are transmitted unencrypted"
        );
    }

    // opendal 0.55: S3 builder uses consuming pattern (methods take `self`, return `Self`)
    let builder = opendal::services::S3::default()
        .endpoint(&cfg.endpoint)
        .region(&cfg.region)
        .bucket(&cfg.bucket)
        .access_key_id(&cfg.access_key_id)
        .secret_access_key(&cfg.secret_access_key);

    let op = Operator::new(builder)?
        .layer(opendal::layers::LoggingLayer::default())
        .layer(
            opendal::layers::RetryLayer::new()
                .with_max_times(5)
                .with_jitter(),
        )
        .finish();

    Ok(op)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_operator_http_allowed() {
        let cfg = S3Config {
            endpoint: "http://localhost:9000".into(),
            enforce_tls: false,
            ..Default::default()
        };
        assert!(build_operator(&cfg).is_ok());
    }

    #[test]
    fn test_build_operator_http_enforce_tls() {
        let cfg = S3Config {
            endpoint: "http://insecure:9000".into(),
            enforce_tls: true,
            ..Default::default()
        };
        let err = build_operator(&cfg).unwrap_err();
        assert!(
            err.to_string().contains("enforce_tls"),
            "error message should mention enforce_tls"
        );
    }

    #[test]
    fn test_build_operator_https() {
        let cfg = S3Config {
            endpoint: "https://s3.example.com".into(),
            enforce_tls: true,
            ..Default::default()
        };
        assert!(build_operator(&cfg).is_ok());
    }
}
