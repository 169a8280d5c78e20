//! Key derivation: password + salt → master key

use argon2::{Algorithm, Argon2, Params, Version};
use cdx_core::config::{KdfKind, VaultConfig, MIN_PBKDF2_ITERATIONS, MIN_SALT_LEN};
use cdx_core::{CdxError, CdxResult};
use rand::RngCore;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use zeroize::Zeroize;

use crate::KEY_SIZE;

/// A 256-bit master key derived from a password.
///
/// Zeroized on drop. Never persisted; only the salt and KDF parameters are.
pub struct MasterKey {
    bytes: [u8; KEY_SIZE],
}

impl MasterKey {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

impl Drop for MasterKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MasterKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Password KDF and its cost parameters. Persisted in the vault header so a
/// later unlock re-derives the same master key even if config changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "algorithm", rename_all = "kebab-case")]
pub enum KdfParams {
    Argon2id {
        /// Memory cost in KiB
        mem_cost_kib: u32,
        time_cost: u32,
        parallelism: u32,
    },
    Pbkdf2Sha256 {
        iterations: u32,
    },
}

impl Default for KdfParams {
    fn default() -> Self {
        KdfParams::Argon2id {
            mem_cost_kib: 65536,
            time_cost: 3,
            parallelism: 4,
        }
    }
}

impl KdfParams {
    pub fn from_config(config: &VaultConfig) -> Self {
        match config.kdf {
            KdfKind::Argon2id => KdfParams::Argon2id {
                mem_cost_kib: config.argon2_mem_cost_kib,
                time_cost: config.argon2_time_cost,
                parallelism: config.argon2_parallelism,
            },
            KdfKind::Pbkdf2Sha256 => KdfParams::Pbkdf2Sha256 {
                iterations: config.pbkdf2_iterations,
            },
        }
    }

    /// Cheap Argon2id parameters. Only for tests and benches.
    pub fn insecure_fast() -> Self {
        KdfParams::Argon2id {
            mem_cost_kib: 1024,
            time_cost: 1,
            parallelism: 1,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            KdfParams::Argon2id { .. } => "argon2id",
            KdfParams::Pbkdf2Sha256 { .. } => "pbkdf2-sha256",
        }
    }
}

/// Generate a random salt of `len` bytes (at least 16).
pub fn generate_salt(len: usize) -> CdxResult<Vec<u8>> {
    if len < MIN_SALT_LEN {
        return Err(CdxError::Crypto(format!(
            "salt must be at least {MIN_SALT_LEN} bytes, got {len}"
        )));
    }
    let mut salt = vec![0u8; len];
    rand::rngs::OsRng.fill_bytes(&mut salt);
    Ok(salt)
}

/// Derive a 256-bit master key from a password and salt.
pub fn derive_master_key(
    password: &SecretString,
    salt: &[u8],
    params: &KdfParams,
) -> CdxResult<MasterKey> {
    if salt.len() < MIN_SALT_LEN {
        return Err(CdxError::Crypto(format!(
            "salt must be at least {MIN_SALT_LEN} bytes, got {}",
            salt.len()
        )));
    }

    let mut key = [0u8; KEY_SIZE];
    match params {
        KdfParams::Argon2id {
            mem_cost_kib,
            time_cost,
            parallelism,
        } => {
            let argon2_params =
                Params::new(*mem_cost_kib, *time_cost, *parallelism, Some(KEY_SIZE))
                    .map_err(|e| CdxError::Crypto(format!("invalid Argon2id params: {e}")))?;
            Argon2::new(Algorithm::Argon2id, Version::V0x13, argon2_params)
                .hash_password_into(password.expose_secret().as_bytes(), salt, &mut key)
                .map_err(|e| CdxError::Crypto(format!("Argon2id KDF failed: {e}")))?;
        }
        KdfParams::Pbkdf2Sha256 { iterations } => {
            if *iterations < MIN_PBKDF2_ITERATIONS {
                return Err(CdxError::Crypto(format!(
                    "PBKDF2 needs at least {MIN_PBKDF2_ITERATIONS} iterations, got {iterations}"
                )));
            }
            pbkdf2::pbkdf2_hmac::<Sha256>(
                password.expose_secret().as_bytes(),
                salt,
                *iterations,
                &mut key,
            );
        }
    }

    Ok(MasterKey::from_bytes(key))
}
