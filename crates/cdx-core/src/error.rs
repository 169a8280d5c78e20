use thiserror::Error;

use crate::types::DocumentId;

pub type CdxResult<T> = Result<T, CdxError>;

/// Vault-level authentication failures. All of these are recoverable:
/// the caller can retry with another password or unlock first.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum AuthError {
    #[error("wrong password")]
    WrongPassword,

    #[error("vault is locked")]
    Locked,

    #[error("vault is not initialized")]
    Uninitialized,

    #[error("vault is already initialized")]
    AlreadyInitialized,
}

#[derive(Debug, Error)]
pub enum CdxError {
    #[error("authentication error: {0}")]
    Auth(#[from] AuthError),

    /// AEAD tag mismatch: tampered or corrupted ciphertext.
    #[error("authenticated decryption failed: {context}")]
    AuthFailure { context: String },

    /// Posting-list MAC mismatch. Never filtered silently.
    #[error("index integrity check failed for token {token_prefix}")]
    IndexIntegrity { token_prefix: String },

    #[error("document not found: {0}")]
    NotFound(DocumentId),

    #[error("invalid document id: {0}")]
    InvalidDocumentId(String),

    #[error("invalid query: {0}")]
    InvalidQuery(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("index error: {0}")]
    Index(String),

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl CdxError {
    pub fn auth_failure(context: impl Into<String>) -> Self {
        CdxError::AuthFailure {
            context: context.into(),
        }
    }

    /// True for cryptographic and integrity failures, which must never be
    /// retried automatically.
    pub fn is_tamper(&self) -> bool {
        matches!(
            self,
            CdxError::AuthFailure { .. } | CdxError::IndexIntegrity { .. }
        )
    }

    pub fn is_auth(&self) -> bool {
        matches!(self, CdxError::Auth(_))
    }
}

/// Map a poisoned lock into an error instead of panicking.
pub fn poisoned<T>(what: &str) -> impl FnOnce(T) -> CdxError + '_ {
    move |_| CdxError::Other(anyhow::anyhow!("{what} lock poisoned"))
}
