//! Key hierarchy: master key → purpose-bound KeySet, vault verifier canary

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    XChaCha20Poly1305, XNonce,
};
use cdx_core::{AuthError, CdxError, CdxResult};
use hkdf::Hkdf;
use hmac::digest::generic_array::GenericArray;
use hmac::digest::KeyInit as _;
use hmac::Hmac;
use rand::RngCore;
use sha2::Sha256;
use zeroize::Zeroize;

use crate::kdf::MasterKey;
use crate::{KEY_SIZE, TAG_SIZE, XNONCE_SIZE};

pub type HmacSha256 = Hmac<Sha256>;

const HMAC_BLOCK_SIZE: usize = 64;

/// Fixed plaintext sealed into the vault header.
const VERIFIER_CANARY: &[u8] = b"cipherdex vault verifier v1";
const VERIFIER_LABEL: &[u8] = b"vault-verifier";

/// A 256-bit symmetric key. Zeroized on drop.
pub struct SecretKey {
    bytes: [u8; KEY_SIZE],
}

impl SecretKey {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }

    /// HMAC-SHA256 keyed with this key.
    pub fn hmac(&self) -> HmacSha256 {
        // HMAC zero-pads short keys to the 64-byte block, so padding here
        // yields the same MAC while keeping construction infallible.
        let mut block = [0u8; HMAC_BLOCK_SIZE];
        block[..KEY_SIZE].copy_from_slice(&self.bytes);
        let mac = HmacSha256::new(GenericArray::from_slice(&block));
        block.zeroize();
        mac
    }
}

impl Drop for SecretKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// The HKDF info label of each derived key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyPurpose {
    FileEnc,
    FilenameEnc,
    Search,
    Index,
    IndexMac,
}

impl KeyPurpose {
    pub const ALL: [KeyPurpose; 5] = [
        KeyPurpose::FileEnc,
        KeyPurpose::FilenameEnc,
        KeyPurpose::Search,
        KeyPurpose::Index,
        KeyPurpose::IndexMac,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            KeyPurpose::FileEnc => "file-enc",
            KeyPurpose::FilenameEnc => "filename-enc",
            KeyPurpose::Search => "search",
            KeyPurpose::Index => "index",
            KeyPurpose::IndexMac => "index-mac",
        }
    }
}

/// Purpose-separated keys derived from one master key.
///
/// Exclusively owned by the vault; every field zeroizes itself on drop.
#[derive(Debug)]
pub struct KeySet {
    pub file_enc: SecretKey,
    pub filename_enc: SecretKey,
    pub search: SecretKey,
    pub index: SecretKey,
    pub index_mac: SecretKey,
}

impl KeySet {
    pub fn derive(master: &MasterKey) -> CdxResult<Self> {
        let ks = |p: KeyPurpose| -> CdxResult<SecretKey> {
            Ok(SecretKey::from_bytes(hkdf_derive(
                master.as_bytes(),
                p.label().as_bytes(),
            )?))
        };
        Ok(Self {
            file_enc: ks(KeyPurpose::FileEnc)?,
            filename_enc: ks(KeyPurpose::FilenameEnc)?,
            search: ks(KeyPurpose::Search)?,
            index: ks(KeyPurpose::Index)?,
            index_mac: ks(KeyPurpose::IndexMac)?,
        })
    }

    pub fn get(&self, purpose: KeyPurpose) -> &SecretKey {
        match purpose {
            KeyPurpose::FileEnc => &self.file_enc,
            KeyPurpose::FilenameEnc => &self.filename_enc,
            KeyPurpose::Search => &self.search,
            KeyPurpose::Index => &self.index,
            KeyPurpose::IndexMac => &self.index_mac,
        }
    }
}

/// HKDF-SHA256 key derivation with a domain-specific info string.
fn hkdf_derive(ikm: &[u8; KEY_SIZE], info: &[u8]) -> CdxResult<[u8; KEY_SIZE]> {
    let hkdf = Hkdf::<Sha256>::new(None, ikm);
    let mut okm = [0u8; KEY_SIZE];
    hkdf.expand(info, &mut okm)
        .map_err(|e| CdxError::Crypto(format!("HKDF expand failed: {e}")))?;
    Ok(okm)
}

/// Seal the verifier canary under the master key.
///
/// Output: `[24-byte nonce][ciphertext + 16-byte tag]`
pub fn seal_verifier(master: &MasterKey) -> CdxResult<Vec<u8>> {
    let mut vk = hkdf_derive(master.as_bytes(), VERIFIER_LABEL)?;
    let cipher = XChaCha20Poly1305::new((&vk).into());
    vk.zeroize();

    let mut nonce_bytes = [0u8; XNONCE_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = XNonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, VERIFIER_CANARY)
        .map_err(|e| CdxError::Crypto(format!("verifier sealing failed: {e}")))?;

    let mut result = Vec::with_capacity(XNONCE_SIZE + ciphertext.len());
    result.extend_from_slice(&nonce_bytes);
    result.extend_from_slice(&ciphertext);
    Ok(result)
}

/// Check the verifier canary. Any failure means the password was wrong.
pub fn open_verifier(master: &MasterKey, sealed: &[u8]) -> CdxResult<()> {
    if sealed.len() < XNONCE_SIZE + TAG_SIZE {
        return Err(AuthError::WrongPassword.into());
    }
    let (nonce_bytes, ciphertext) = sealed.split_at(XNONCE_SIZE);
    let mut vk = hkdf_derive(master.as_bytes(), VERIFIER_LABEL)?;
    let cipher = XChaCha20Poly1305::new((&vk).into());
    vk.zeroize();

    let plaintext = cipher
        .decrypt(XNonce::from_slice(nonce_bytes), ciphertext)
        .map_err(|_| CdxError::from(AuthError::WrongPassword))?;
    if plaintext != VERIFIER_CANARY {
        return Err(AuthError::WrongPassword.into());
    }
    Ok(())
}
