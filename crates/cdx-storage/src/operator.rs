//! OpenDAL Operator factory for cipherdex document storage

use anyhow::Context;
use cdx_core::config::{expand_tilde, StorageBackendKind, StorageConfig};
use cdx_core::{CdxError, CdxResult};
use opendal::Operator;
use secrecy::{ExposeSecret, SecretString};
use std::path::Path;

/// Static S3 credentials, loaded by the caller (env or secrets file).
#[derive(Debug)]
pub struct S3Credentials {
    pub access_key_id: String,
    pub secret_access_key: SecretString,
}

fn with_layers(op: Operator) -> Operator {
    op.layer(opendal::layers::LoggingLayer::default())
        .layer(
            opendal::layers::RetryLayer::new()
                .with_max_times(5)
                .with_jitter(),
        )
}

/// In-memory operator for tests and throwaway sessions.
pub fn build_memory_operator() -> CdxResult<Operator> {
    let op = Operator::new(opendal::services::Memory::default())
        .context("creating OpenDAL memory operator")?
        .finish();
    Ok(op)
}

/// Build the document-store operator selected by `storage.backend`.
///
/// For S3, an `http://` endpoint is refused when `enforce_tls` is set and
/// logged as a warning otherwise.
pub fn build_operator(
    storage: &StorageConfig,
    credentials: Option<&S3Credentials>,
) -> CdxResult<Operator> {
    match storage.backend {
        StorageBackendKind::Memory => build_memory_operator(),
        StorageBackendKind::Fs => {
            let root = expand_tilde(Path::new(&storage.root));
            std::fs::create_dir_all(&root)
                .with_context(|| format!("creating document root: {}", root.display()))?;
            let builder = opendal::services::Fs::default().root(&root.to_string_lossy());
            let op = Operator::new(builder)
                .context("creating OpenDAL fs operator")?
                .finish();
            Ok(with_layers(op))
        }
        StorageBackendKind::S3 => {
            if storage.endpoint.starts_with("http://") {
                if storage.enforce_tls {
                    return Err(CdxError::Config(format!(
                        "S3 endpoint uses plaintext HTTP ({}), but enforce_tls is enabled. \
                         Use an HTTPS endpoint or set storage.enforce_tls = false for local development.",
                        storage.endpoint
                    )));
                }
                tracing::warn!(
                    endpoint = %storage.endpoint,
                    "S3 endpoint uses plaintext HTTP; credentials are transmitted unencrypted"
                );
            }
            let creds = credentials.ok_or_else(|| {
                CdxError::Config("S3 storage requires access credentials".into())
            })?;

            // opendal 0.55: S3 builder uses consuming pattern (methods take `self`, return `Self`)
            let builder = opendal::services::S3::default()
                .endpoint(&storage.endpoint)
                .region(&storage.region)
                .bucket(&storage.bucket)
                .root(&storage.root)
                .access_key_id(&creds.access_key_id)
                .secret_access_key(creds.secret_access_key.expose_secret());
            let op = Operator::new(builder)
                .context("creating OpenDAL S3 operator")?
                .finish();
            Ok(with_layers(op))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn creds() -> S3Credentials {
        S3Credentials {
            access_key_id: "key".into(),
            secret_access_key: SecretString::from("secret"),
        }
    }

    #[test]
    fn test_build_fs_operator_creates_root() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("docs");
        let storage = StorageConfig {
            backend: StorageBackendKind::Fs,
            root: root.to_string_lossy().into_owned(),
            ..Default::default()
        };
        assert!(build_operator(&storage, None).is_ok());
        assert!(root.is_dir());
    }

    #[test]
    fn test_s3_http_enforce_tls_fails() {
        let storage = StorageConfig {
            backend: StorageBackendKind::S3,
            endpoint: "http://insecure:8333".into(),
            enforce_tls: true,
            ..Default::default()
        };
        let err = build_operator(&storage, Some(&creds())).unwrap_err();
        assert!(err.to_string().contains("enforce_tls"));
    }

    #[test]
    fn test_s3_requires_credentials() {
        let storage = StorageConfig {
            backend: StorageBackendKind::S3,
            endpoint: "https://s3.example.com".into(),
            ..Default::default()
        };
        assert!(matches!(
            build_operator(&storage, None),
            Err(CdxError::Config(_))
        ));
        assert!(build_operator(&storage, Some(&creds())).is_ok());
    }

    #[test]
    fn test_memory_operator() {
        let storage = StorageConfig {
            backend: StorageBackendKind::Memory,
            ..Default::default()
        };
        assert!(build_operator(&storage, None).is_ok());
    }
}
