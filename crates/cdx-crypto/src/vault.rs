//! Vault lifecycle: Uninitialized → Unlocked ⇄ Locked
//!
//! The vault exclusively owns the `KeySet`. Callers borrow it through a
//! [`KeyGuard`], which holds a read lock for its lifetime; [`Vault::lock`]
//! takes the write lock, so it waits for every in-flight guard before the
//! keys are dropped and zeroized. Guards are `!Send` and therefore cannot be
//! held across an `.await`; async callers re-acquire with
//! [`Vault::keys_at`], which fails if the vault was locked in between.

use anyhow::Context;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use cdx_core::config::{expand_tilde, VaultConfig};
use cdx_core::error::poisoned;
use cdx_core::{AuthError, CdxError, CdxResult};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, RwLock, RwLockReadGuard};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::kdf::{derive_master_key, generate_salt, KdfParams};
use crate::keys::{open_verifier, seal_verifier, KeySet};

const HEADER_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VaultState {
    Uninitialized,
    Locked,
    Unlocked,
}

impl std::fmt::Display for VaultState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            VaultState::Uninitialized => "uninitialized",
            VaultState::Locked => "locked",
            VaultState::Unlocked => "unlocked",
        };
        f.write_str(s)
    }
}

/// Persisted vault metadata. Contains no secret material.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultHeader {
    pub version: u32,
    pub kdf: KdfParams,
    /// Base64 salt
    pub salt: String,
    /// Base64 `[nonce][sealed canary]`
    pub verifier: String,
}

impl VaultHeader {
    pub fn salt_bytes(&self) -> CdxResult<Vec<u8>> {
        STANDARD
            .decode(&self.salt)
            .map_err(|e| CdxError::Crypto(format!("vault header salt: {e}")))
    }

    fn verifier_bytes(&self) -> CdxResult<Vec<u8>> {
        STANDARD
            .decode(&self.verifier)
            .map_err(|e| CdxError::Crypto(format!("vault header verifier: {e}")))
    }

    pub fn load(path: &Path) -> CdxResult<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading vault header: {}", path.display()))?;
        let header: VaultHeader = serde_json::from_str(&content)
            .with_context(|| format!("parsing vault header: {}", path.display()))?;
        if header.version != HEADER_VERSION {
            return Err(CdxError::Config(format!(
                "unsupported vault header version {}",
                header.version
            )));
        }
        Ok(Some(header))
    }

    pub fn save(&self, path: &Path) -> CdxResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating vault dir: {}", parent.display()))?;
        }
        let json = serde_json::to_string_pretty(self)?;

        // Atomic write: write to temp file, then rename
        let tmp_path = path.with_extension("tmp");
        std::fs::write(&tmp_path, &json)
            .with_context(|| format!("writing vault header temp: {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("renaming vault header: {}", path.display()))?;
        Ok(())
    }
}

/// How a new vault derives its master key, and when it auto-locks.
#[derive(Debug, Clone)]
pub struct VaultOptions {
    pub kdf: KdfParams,
    pub salt_len: usize,
    /// `None` disables inactivity auto-lock
    pub auto_lock: Option<Duration>,
}

impl Default for VaultOptions {
    fn default() -> Self {
        Self {
            kdf: KdfParams::default(),
            salt_len: 32,
            auto_lock: Some(Duration::from_secs(300)),
        }
    }
}

impl VaultOptions {
    pub fn from_config(config: &VaultConfig) -> Self {
        Self {
            kdf: KdfParams::from_config(config),
            salt_len: config.salt_len,
            auto_lock: (config.auto_lock_secs > 0)
                .then(|| Duration::from_secs(config.auto_lock_secs)),
        }
    }

    /// Fast KDF and no auto-lock. Only for tests and benches.
    pub fn insecure_fast() -> Self {
        Self {
            kdf: KdfParams::insecure_fast(),
            salt_len: 32,
            auto_lock: None,
        }
    }
}

/// Borrowed access to the unlocked `KeySet`.
///
/// While any guard is alive, `lock()` blocks.
pub struct KeyGuard<'a> {
    guard: RwLockReadGuard<'a, Option<KeySet>>,
    generation: u64,
}

impl KeyGuard<'_> {
    /// Unlock epoch this guard was taken in.
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

impl Deref for KeyGuard<'_> {
    type Target = KeySet;

    fn deref(&self) -> &KeySet {
        // Constructed only when the slot is populated; the read lock keeps it so.
        match self.guard.as_ref() {
            Some(keys) => keys,
            None => unreachable!("KeyGuard over an empty key slot"),
        }
    }
}

pub struct Vault {
    header_path: Option<PathBuf>,
    options: VaultOptions,
    header: RwLock<Option<VaultHeader>>,
    keys: RwLock<Option<KeySet>>,
    /// Bumped on every unlock and lock, always under the `keys` write lock.
    generation: AtomicU64,
    last_activity: Mutex<Instant>,
    /// Serializes initialize/unlock so concurrent KDF runs cannot race.
    lifecycle: Mutex<()>,
}

impl std::fmt::Debug for Vault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vault")
            .field("header_path", &self.header_path)
            .field("state", &self.status())
            .finish_non_exhaustive()
    }
}

impl Vault {
    /// Open a vault backed by a header file. A missing file means the vault
    /// is uninitialized.
    pub fn open(header_path: impl Into<PathBuf>, options: VaultOptions) -> CdxResult<Self> {
        let header_path = header_path.into();
        let header = VaultHeader::load(&header_path)?;
        debug!(
            path = %header_path.display(),
            initialized = header.is_some(),
            "opened vault"
        );
        Ok(Self::build(Some(header_path), options, header))
    }

    pub fn from_config(config: &VaultConfig) -> CdxResult<Self> {
        Self::open(
            expand_tilde(&config.header_path),
            VaultOptions::from_config(config),
        )
    }

    /// A vault whose header lives only in memory.
    pub fn in_memory(options: VaultOptions) -> Self {
        Self::build(None, options, None)
    }

    fn build(header_path: Option<PathBuf>, options: VaultOptions, header: Option<VaultHeader>) -> Self {
        Self {
            header_path,
            options,
            header: RwLock::new(header),
            keys: RwLock::new(None),
            generation: AtomicU64::new(0),
            last_activity: Mutex::new(Instant::now()),
            lifecycle: Mutex::new(()),
        }
    }

    /// Set the password of a fresh vault. Returns the new salt and leaves
    /// the vault unlocked.
    pub fn initialize(&self, password: &SecretString) -> CdxResult<Vec<u8>> {
        let _serial = self.lifecycle.lock().map_err(poisoned("vault lifecycle"))?;
        if self.header.read().map_err(poisoned("vault header"))?.is_some() {
            return Err(AuthError::AlreadyInitialized.into());
        }

        let salt = generate_salt(self.options.salt_len)?;
        let master = derive_master_key(password, &salt, &self.options.kdf)?;
        let verifier = seal_verifier(&master)?;
        let keyset = KeySet::derive(&master)?;
        drop(master);

        let header = VaultHeader {
            version: HEADER_VERSION,
            kdf: self.options.kdf.clone(),
            salt: STANDARD.encode(&salt),
            verifier: STANDARD.encode(verifier),
        };
        if let Some(path) = &self.header_path {
            header.save(path)?;
        }
        *self.header.write().map_err(poisoned("vault header"))? = Some(header);
        self.install(keyset)?;

        info!(kdf = self.options.kdf.name(), "vault initialized");
        Ok(salt)
    }

    /// Derive keys from the password and check them against the stored
    /// verifier. Nothing changes on failure.
    pub fn unlock(&self, password: &SecretString) -> CdxResult<()> {
        let _serial = self.lifecycle.lock().map_err(poisoned("vault lifecycle"))?;
        let header = self
            .header
            .read()
            .map_err(poisoned("vault header"))?
            .clone()
            .ok_or(AuthError::Uninitialized)?;

        let salt = header.salt_bytes()?;
        let master = derive_master_key(password, &salt, &header.kdf)?;
        if let Err(e) = open_verifier(&master, &header.verifier_bytes()?) {
            warn!("vault unlock rejected");
            return Err(e);
        }

        if self.keys.read().map_err(poisoned("vault keys"))?.is_some() {
            debug!("vault already unlocked");
            self.touch();
            return Ok(());
        }
        let keyset = KeySet::derive(&master)?;
        drop(master);
        self.install(keyset)?;
        info!("vault unlocked");
        Ok(())
    }

    fn install(&self, keyset: KeySet) -> CdxResult<()> {
        let mut slot = self.keys.write().map_err(poisoned("vault keys"))?;
        *slot = Some(keyset);
        self.generation.fetch_add(1, Ordering::SeqCst);
        drop(slot);
        self.touch();
        Ok(())
    }

    /// Drop and zeroize the keys. Blocks until in-flight guards are released.
    pub fn lock(&self) -> CdxResult<()> {
        let mut slot = self.keys.write().map_err(poisoned("vault keys"))?;
        if slot.take().is_some() {
            self.generation.fetch_add(1, Ordering::SeqCst);
            info!("vault locked");
        }
        Ok(())
    }

    pub fn status(&self) -> VaultState {
        let initialized = self.header.read().map(|h| h.is_some()).unwrap_or(false);
        if !initialized {
            return VaultState::Uninitialized;
        }
        match self.keys.read() {
            Ok(slot) if slot.is_some() => VaultState::Unlocked,
            _ => VaultState::Locked,
        }
    }

    /// Salt of an initialized vault.
    pub fn salt(&self) -> CdxResult<Vec<u8>> {
        self.header
            .read()
            .map_err(poisoned("vault header"))?
            .as_ref()
            .ok_or(AuthError::Uninitialized)?
            .salt_bytes()
    }

    pub fn header(&self) -> Option<VaultHeader> {
        self.header.read().ok().and_then(|h| h.clone())
    }

    /// Borrow the keys. Fails with `AuthError` unless unlocked.
    pub fn keys(&self) -> CdxResult<KeyGuard<'_>> {
        self.check_inactivity()?;
        let guard = self.keys.read().map_err(poisoned("vault keys"))?;
        if guard.is_none() {
            drop(guard);
            return Err(self.not_unlocked());
        }
        let generation = self.generation.load(Ordering::SeqCst);
        self.touch();
        Ok(KeyGuard { guard, generation })
    }

    /// Borrow the keys only if the vault has stayed unlocked since
    /// `generation`. A lock (or lock and re-unlock) in between cancels the
    /// caller's operation with `AuthError::Locked`.
    pub fn keys_at(&self, generation: u64) -> CdxResult<KeyGuard<'_>> {
        let guard = self.keys()?;
        if guard.generation() != generation {
            debug!("vault relocked during operation");
            return Err(AuthError::Locked.into());
        }
        Ok(guard)
    }

    fn not_unlocked(&self) -> CdxError {
        match self.status() {
            VaultState::Uninitialized => AuthError::Uninitialized.into(),
            _ => AuthError::Locked.into(),
        }
    }

    fn touch(&self) {
        if let Ok(mut last) = self.last_activity.lock() {
            *last = Instant::now();
        }
    }

    /// Lock if the vault has been idle longer than the auto-lock window.
    /// Returns whether it locked.
    pub fn check_inactivity(&self) -> CdxResult<bool> {
        let Some(limit) = self.options.auto_lock else {
            return Ok(false);
        };
        let idle = self
            .last_activity
            .lock()
            .map_err(poisoned("vault activity"))?
            .elapsed();
        if idle < limit || self.status() != VaultState::Unlocked {
            return Ok(false);
        }
        info!(idle_secs = idle.as_secs(), "vault auto-locked after inactivity");
        self.lock()?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aead::{decrypt_document, encrypt_document};
    use cdx_core::DocumentId;
    use std::sync::Arc;

    fn pw(s: &str) -> SecretString {
        SecretString::from(s)
    }

    #[test]
    fn test_lifecycle() {
        let vault = Vault::in_memory(VaultOptions::insecure_fast());
        assert_eq!(vault.status(), VaultState::Uninitialized);
        assert!(matches!(
            vault.keys().map(|_| ()),
            Err(CdxError::Auth(AuthError::Uninitialized))
        ));

        let salt = vault.initialize(&pw("p@ss1234")).unwrap();
        assert_eq!(salt.len(), 32);
        assert_eq!(vault.status(), VaultState::Unlocked);
        assert_eq!(vault.salt().unwrap(), salt);

        vault.lock().unwrap();
        assert_eq!(vault.status(), VaultState::Locked);
        assert!(matches!(
            vault.keys().map(|_| ()),
            Err(CdxError::Auth(AuthError::Locked))
        ));

        vault.unlock(&pw("p@ss1234")).unwrap();
        assert_eq!(vault.status(), VaultState::Unlocked);
    }

    #[test]
    fn test_double_initialize_rejected() {
        let vault = Vault::in_memory(VaultOptions::insecure_fast());
        vault.initialize(&pw("a")).unwrap();
        assert!(matches!(
            vault.initialize(&pw("b")),
            Err(CdxError::Auth(AuthError::AlreadyInitialized))
        ));
    }

    #[test]
    fn test_wrong_password_leaves_state() {
        let vault = Vault::in_memory(VaultOptions::insecure_fast());
        vault.initialize(&pw("right")).unwrap();
        vault.lock().unwrap();
        assert!(matches!(
            vault.unlock(&pw("wrong")),
            Err(CdxError::Auth(AuthError::WrongPassword))
        ));
        assert_eq!(vault.status(), VaultState::Locked);
    }

    #[test]
    fn test_unlock_uninitialized() {
        let vault = Vault::in_memory(VaultOptions::insecure_fast());
        assert!(matches!(
            vault.unlock(&pw("x")),
            Err(CdxError::Auth(AuthError::Uninitialized))
        ));
    }

    #[test]
    fn test_reunlock_reproduces_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vault.json");
        let id = DocumentId::generate();

        let blob = {
            let vault = Vault::open(&path, VaultOptions::insecure_fast()).unwrap();
            vault.initialize(&pw("p@ss1234")).unwrap();
            let keys = vault.keys().unwrap();
            encrypt_document(&keys.file_enc, &id, b"invoice for March").unwrap()
        };

        // Fresh process: header reloaded from disk
        let vault = Vault::open(&path, VaultOptions::insecure_fast()).unwrap();
        assert_eq!(vault.status(), VaultState::Locked);
        vault.unlock(&pw("p@ss1234")).unwrap();
        let keys = vault.keys().unwrap();
        assert_eq!(
            decrypt_document(&keys.file_enc, &id, &blob).unwrap(),
            b"invoice for March"
        );
    }

    #[test]
    fn test_header_persists_kdf_choice() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vault.json");
        let options = VaultOptions {
            kdf: KdfParams::Pbkdf2Sha256 {
                iterations: 200_000,
            },
            salt_len: 16,
            auto_lock: None,
        };
        Vault::open(&path, options)
            .unwrap()
            .initialize(&pw("pw"))
            .unwrap();

        // Reopened with different defaults: the header still decides.
        let vault = Vault::open(&path, VaultOptions::insecure_fast()).unwrap();
        let header = vault.header().unwrap();
        assert_eq!(header.kdf.name(), "pbkdf2-sha256");
        assert_eq!(header.salt_bytes().unwrap().len(), 16);
        vault.unlock(&pw("pw")).unwrap();
    }

    #[test]
    fn test_keys_at_detects_relock() {
        let vault = Vault::in_memory(VaultOptions::insecure_fast());
        vault.initialize(&pw("pw")).unwrap();
        let generation = vault.keys().unwrap().generation();
        assert!(vault.keys_at(generation).is_ok());

        vault.lock().unwrap();
        vault.unlock(&pw("pw")).unwrap();
        assert!(matches!(
            vault.keys_at(generation).map(|_| ()),
            Err(CdxError::Auth(AuthError::Locked))
        ));
    }

    #[test]
    fn test_lock_waits_for_in_flight_guard() {
        let vault = Arc::new(Vault::in_memory(VaultOptions::insecure_fast()));
        vault.initialize(&pw("pw")).unwrap();

        let guard = vault.keys().unwrap();
        let locker = {
            let vault = Arc::clone(&vault);
            std::thread::spawn(move || vault.lock().unwrap())
        };
        std::thread::sleep(Duration::from_millis(50));
        // Still usable: lock() is parked on the write lock.
        assert_eq!(guard.search.as_bytes().len(), 32);
        drop(guard);

        locker.join().unwrap();
        assert_eq!(vault.status(), VaultState::Locked);
    }

    #[test]
    fn test_inactivity_auto_lock() {
        let options = VaultOptions {
            auto_lock: Some(Duration::from_millis(20)),
            ..VaultOptions::insecure_fast()
        };
        let vault = Vault::in_memory(options);
        vault.initialize(&pw("pw")).unwrap();
        assert!(!vault.check_inactivity().unwrap());

        std::thread::sleep(Duration::from_millis(40));
        assert!(matches!(
            vault.keys().map(|_| ()),
            Err(CdxError::Auth(AuthError::Locked))
        ));
        assert_eq!(vault.status(), VaultState::Locked);
    }
}
