use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{CdxError, CdxResult};

/// Lowest PBKDF2 iteration count accepted for key derivation.
pub const MIN_PBKDF2_ITERATIONS: u32 = 200_000;
/// Lowest salt length (bytes) accepted for key derivation.
pub const MIN_SALT_LEN: usize = 16;

/// Top-level configuration (loaded from cdx.toml)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CdxConfig {
    pub vault: VaultConfig,
    pub index: IndexConfig,
    pub search: SearchConfig,
    pub storage: StorageConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KdfKind {
    #[serde(rename = "argon2id")]
    Argon2id,
    #[serde(rename = "pbkdf2-sha256")]
    Pbkdf2Sha256,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultConfig {
    /// Vault header file (salt, KDF parameters, verifier)
    pub header_path: PathBuf,
    /// Password KDF: "argon2id" or "pbkdf2-sha256"
    pub kdf: KdfKind,
    /// Argon2id memory cost in KiB (default: 65536 = 64 MiB)
    pub argon2_mem_cost_kib: u32,
    /// Argon2id time cost (iterations, default: 3)
    pub argon2_time_cost: u32,
    /// Argon2id parallelism (default: 4)
    pub argon2_parallelism: u32,
    /// PBKDF2-HMAC-SHA256 iterations (minimum 200000)
    pub pbkdf2_iterations: u32,
    /// Random salt length in bytes (minimum 16)
    pub salt_len: usize,
    /// Lock after this many idle seconds (0 = never)
    pub auto_lock_secs: u64,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            header_path: PathBuf::from("~/.local/share/cdx/vault.json"),
            kdf: KdfKind::Argon2id,
            argon2_mem_cost_kib: 65536,
            argon2_time_cost: 3,
            argon2_parallelism: 4,
            pbkdf2_iterations: MIN_PBKDF2_ITERATIONS,
            salt_len: 32,
            auto_lock_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexBackendKind {
    /// Whole-index rewrite on every mutation; small deployments.
    #[serde(rename = "log")]
    Log,
    /// Hash table with an append-only journal and periodic compaction.
    #[serde(rename = "table")]
    Table,
    /// RocksDB column store (requires the `rocksdb` feature).
    #[serde(rename = "rocksdb")]
    RocksDb,
}

impl IndexBackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            IndexBackendKind::Log => "log",
            IndexBackendKind::Table => "table",
            IndexBackendKind::RocksDb => "rocksdb",
        }
    }
}

impl std::fmt::Display for IndexBackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for IndexBackendKind {
    type Err = CdxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "log" => Ok(IndexBackendKind::Log),
            "table" => Ok(IndexBackendKind::Table),
            "rocksdb" => Ok(IndexBackendKind::RocksDb),
            other => Err(CdxError::Config(format!("unknown index backend: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    pub backend: IndexBackendKind,
    /// Directory holding the index files for one isolation scope
    pub path: PathBuf,
    /// Number of lock shards guarding posting lists and counters
    pub shards: usize,
    /// Insert counter-bound tokens alongside exact tokens
    pub forward_privacy: bool,
    /// n-gram width used at upload time for substring search
    pub substring_n: usize,
    /// Insert Soundex tokens for fuzzy search
    pub phonetic: bool,
    /// Journal records before the table backend compacts into a snapshot
    pub compact_after: usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            backend: IndexBackendKind::Table,
            path: PathBuf::from("~/.local/share/cdx/index"),
            shards: 64,
            forward_privacy: true,
            substring_n: 3,
            phonetic: true,
            compact_after: 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    pub max_edit_distance: usize,
    pub default_top_k: usize,
    pub max_top_k: usize,
    /// Queries longer than this (in chars) are rejected
    pub max_query_len: usize,
    /// Upper bound on keywords per multi-keyword query
    pub max_keywords: usize,
    /// Page size when the caller gives no limit
    pub default_limit: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            max_edit_distance: 2,
            default_top_k: 20,
            max_top_k: 100,
            max_query_len: 256,
            max_keywords: 10,
            default_limit: 100,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageBackendKind {
    #[serde(rename = "fs")]
    Fs,
    #[serde(rename = "memory")]
    Memory,
    #[serde(rename = "s3")]
    S3,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackendKind,
    /// Root directory (fs) or key prefix (s3) for document ciphertexts
    pub root: String,
    /// S3 endpoint
    pub endpoint: String,
    /// S3 region (default: us-east-1)
    pub region: String,
    /// S3 bucket name
    pub bucket: String,
    /// Enforce HTTPS for S3 connections (warn/error on HTTP endpoints)
    pub enforce_tls: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackendKind::Fs,
            root: "~/.local/share/cdx/documents".into(),
            endpoint: "http://localhost:8333".into(),
            region: "us-east-1".into(),
            bucket: "cdx".into(),
            enforce_tls: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (default: info)
    pub level: String,
    /// Log format: "json" or "text"
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "text".into(),
        }
    }
}

impl CdxConfig {
    /// Load and validate a config file. A missing file yields defaults.
    pub fn load(path: &Path) -> CdxResult<Self> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "config file not found, using defaults");
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        let config: CdxConfig = toml::from_str(&content)
            .map_err(|e| CdxError::Config(format!("parsing {}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> CdxResult<()> {
        let v = &self.vault;
        if v.salt_len < MIN_SALT_LEN {
            return Err(CdxError::Config(format!(
                "vault.salt_len must be at least {MIN_SALT_LEN}, got {}",
                v.salt_len
            )));
        }
        if v.kdf == KdfKind::Pbkdf2Sha256 && v.pbkdf2_iterations < MIN_PBKDF2_ITERATIONS {
            return Err(CdxError::Config(format!(
                "vault.pbkdf2_iterations must be at least {MIN_PBKDF2_ITERATIONS}, got {}",
                v.pbkdf2_iterations
            )));
        }
        if v.kdf == KdfKind::Argon2id && (v.argon2_time_cost == 0 || v.argon2_parallelism == 0) {
            return Err(CdxError::Config(
                "argon2 time cost and parallelism must be non-zero".into(),
            ));
        }

        let i = &self.index;
        if i.shards == 0 {
            return Err(CdxError::Config("index.shards must be non-zero".into()));
        }
        if i.substring_n == 0 {
            return Err(CdxError::Config("index.substring_n must be non-zero".into()));
        }

        let s = &self.search;
        if s.max_top_k == 0 || s.default_top_k > s.max_top_k {
            return Err(CdxError::Config(format!(
                "search.default_top_k ({}) must be within 1..={}",
                s.default_top_k, s.max_top_k
            )));
        }
        if s.max_query_len == 0 || s.max_keywords == 0 {
            return Err(CdxError::Config(
                "search.max_query_len and search.max_keywords must be non-zero".into(),
            ));
        }

        match self.logging.format.as_str() {
            "json" | "text" => {}
            other => {
                return Err(CdxError::Config(format!(
                    "logging.format must be \"json\" or \"text\", got {other:?}"
                )))
            }
        }
        Ok(())
    }
}

/// Expand a leading `~/` against $HOME.
pub fn expand_tilde(path: &Path) -> PathBuf {
    if let Ok(rest) = path.strip_prefix("~") {
        if let Some(home) = std::env::var_os("HOME") {
            return PathBuf::from(home).join(rest);
        }
    }
    path.to_path_buf()
}
