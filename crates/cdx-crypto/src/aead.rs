//! AES-256-GCM for document bodies and filenames
//!
//! Every call draws a fresh 96-bit IV from the OS CSPRNG inside the
//! function; callers cannot supply one. The AAD binds each ciphertext to its
//! document ID so ciphertexts cannot be swapped between IDs:
//! ```text
//! AAD = "cdx.document.v1" || 0x00 || document_id
//! AAD = "cdx.filename.v1" || 0x00 || document_id
//! ```

use aes_gcm::{
    aead::{AeadInPlace, KeyInit},
    Aes256Gcm, Nonce, Tag,
};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use cdx_core::{CdxError, CdxResult, DocumentId};
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::keys::SecretKey;
use crate::{IV_SIZE, TAG_SIZE};

const DOCUMENT_DOMAIN: &[u8] = b"cdx.document.v1";
const FILENAME_DOMAIN: &[u8] = b"cdx.filename.v1";

/// Detached AEAD output: ciphertext, IV, and tag stored as separate fields.
#[derive(Clone, PartialEq, Eq)]
pub struct EncryptedBlob {
    pub ciphertext: Vec<u8>,
    pub iv: [u8; IV_SIZE],
    pub tag: [u8; TAG_SIZE],
}

impl std::fmt::Debug for EncryptedBlob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptedBlob")
            .field("ciphertext_len", &self.ciphertext.len())
            .finish_non_exhaustive()
    }
}

/// Encrypted filename as stored next to the document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilenamePayload {
    pub encrypted_filename: String,
    pub filename_iv: String,
    pub filename_tag: String,
}

impl FilenamePayload {
    fn from_blob(blob: &EncryptedBlob) -> Self {
        Self {
            encrypted_filename: URL_SAFE_NO_PAD.encode(&blob.ciphertext),
            filename_iv: URL_SAFE_NO_PAD.encode(blob.iv),
            filename_tag: URL_SAFE_NO_PAD.encode(blob.tag),
        }
    }

    fn to_blob(&self) -> CdxResult<EncryptedBlob> {
        let malformed = || CdxError::auth_failure("filename payload is malformed");
        let ciphertext = URL_SAFE_NO_PAD
            .decode(&self.encrypted_filename)
            .map_err(|_| malformed())?;
        let iv: [u8; IV_SIZE] = URL_SAFE_NO_PAD
            .decode(&self.filename_iv)
            .map_err(|_| malformed())?
            .try_into()
            .map_err(|_| malformed())?;
        let tag: [u8; TAG_SIZE] = URL_SAFE_NO_PAD
            .decode(&self.filename_tag)
            .map_err(|_| malformed())?
            .try_into()
            .map_err(|_| malformed())?;
        Ok(EncryptedBlob {
            ciphertext,
            iv,
            tag,
        })
    }
}

fn build_aad(domain: &[u8], id: &DocumentId) -> Vec<u8> {
    let mut aad = Vec::with_capacity(domain.len() + 1 + id.as_str().len());
    aad.extend_from_slice(domain);
    aad.push(0);
    aad.extend_from_slice(id.as_str().as_bytes());
    aad
}

fn seal(key: &SecretKey, aad: &[u8], plaintext: &[u8]) -> CdxResult<EncryptedBlob> {
    let cipher = Aes256Gcm::new(key.as_bytes().into());

    let mut iv = [0u8; IV_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut iv);

    let mut buffer = plaintext.to_vec();
    let tag = cipher
        .encrypt_in_place_detached(Nonce::from_slice(&iv), aad, &mut buffer)
        .map_err(|e| CdxError::Crypto(format!("AES-GCM encryption failed: {e}")))?;

    let mut tag_bytes = [0u8; TAG_SIZE];
    tag_bytes.copy_from_slice(&tag);
    Ok(EncryptedBlob {
        ciphertext: buffer,
        iv,
        tag: tag_bytes,
    })
}

fn open(key: &SecretKey, aad: &[u8], blob: &EncryptedBlob, context: &str) -> CdxResult<Vec<u8>> {
    let cipher = Aes256Gcm::new(key.as_bytes().into());
    let mut buffer = blob.ciphertext.clone();
    cipher
        .decrypt_in_place_detached(
            Nonce::from_slice(&blob.iv),
            aad,
            &mut buffer,
            Tag::from_slice(&blob.tag),
        )
        .map_err(|_| CdxError::auth_failure(context))?;
    Ok(buffer)
}

/// Encrypt a document body under `K_fileEnc`.
pub fn encrypt_document(
    key: &SecretKey,
    id: &DocumentId,
    plaintext: &[u8],
) -> CdxResult<EncryptedBlob> {
    seal(key, &build_aad(DOCUMENT_DOMAIN, id), plaintext)
}

/// Decrypt a document body. A tag mismatch is `AuthFailure`.
pub fn decrypt_document(key: &SecretKey, id: &DocumentId, blob: &EncryptedBlob) -> CdxResult<Vec<u8>> {
    open(key, &build_aad(DOCUMENT_DOMAIN, id), blob, "document")
}

/// Encrypt a filename under `K_filenameEnc`.
pub fn encrypt_filename(
    key: &SecretKey,
    id: &DocumentId,
    filename: &str,
) -> CdxResult<FilenamePayload> {
    let blob = seal(key, &build_aad(FILENAME_DOMAIN, id), filename.as_bytes())?;
    Ok(FilenamePayload::from_blob(&blob))
}

pub fn decrypt_filename(
    key: &SecretKey,
    id: &DocumentId,
    payload: &FilenamePayload,
) -> CdxResult<String> {
    let blob = payload.to_blob()?;
    let plaintext = open(key, &build_aad(FILENAME_DOMAIN, id), &blob, "filename")?;
    String::from_utf8(plaintext).map_err(|_| CdxError::auth_failure("filename is not UTF-8"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::KEY_SIZE;
    use proptest::prelude::*;

    fn key(b: u8) -> SecretKey {
        SecretKey::from_bytes([b; KEY_SIZE])
    }

    #[test]
    fn test_document_roundtrip() {
        let id = DocumentId::generate();
        let blob = encrypt_document(&key(1), &id, b"invoice for March").unwrap();
        assert_ne!(blob.ciphertext, b"invoice for March");
        let plain = decrypt_document(&key(1), &id, &blob).unwrap();
        assert_eq!(plain, b"invoice for March");
    }

    #[test]
    fn test_fresh_iv_per_call() {
        let id = DocumentId::generate();
        let a = encrypt_document(&key(1), &id, b"same").unwrap();
        let b = encrypt_document(&key(1), &id, b"same").unwrap();
        assert_ne!(a.iv, b.iv);
        assert_ne!(a.ciphertext, b.ciphertext);
    }

    #[test]
    fn test_tampered_ciphertext_is_auth_failure() {
        let id = DocumentId::generate();
        let mut blob = encrypt_document(&key(1), &id, b"quarterly report").unwrap();
        blob.ciphertext[0] ^= 0x01;
        let err = decrypt_document(&key(1), &id, &blob).unwrap_err();
        assert!(matches!(err, CdxError::AuthFailure { .. }));
    }

    #[test]
    fn test_tampered_tag_and_wrong_key() {
        let id = DocumentId::generate();
        let mut blob = encrypt_document(&key(1), &id, b"x").unwrap();
        assert!(decrypt_document(&key(2), &id, &blob).is_err());
        blob.tag[15] ^= 0x80;
        assert!(decrypt_document(&key(1), &id, &blob).is_err());
    }

    #[test]
    fn test_ciphertext_bound_to_id() {
        let a = DocumentId::generate();
        let b = DocumentId::generate();
        let blob = encrypt_document(&key(1), &a, b"secret").unwrap();
        assert!(matches!(
            decrypt_document(&key(1), &b, &blob),
            Err(CdxError::AuthFailure { .. })
        ));
    }

    #[test]
    fn test_filename_roundtrip_and_encoding() {
        let id = DocumentId::generate();
        let payload = encrypt_filename(&key(5), &id, "März-Rechnung.pdf").unwrap();
        for field in [
            &payload.encrypted_filename,
            &payload.filename_iv,
            &payload.filename_tag,
        ] {
            assert!(!field.contains('='));
            assert!(!field.contains('+') && !field.contains('/'));
        }
        assert_eq!(
            decrypt_filename(&key(5), &id, &payload).unwrap(),
            "März-Rechnung.pdf"
        );
    }

    #[test]
    fn test_malformed_filename_payload() {
        let id = DocumentId::generate();
        let mut payload = encrypt_filename(&key(5), &id, "a.txt").unwrap();
        payload.filename_iv = "!!".into();
        assert!(matches!(
            decrypt_filename(&key(5), &id, &payload),
            Err(CdxError::AuthFailure { .. })
        ));
    }

    proptest! {
        #[test]
        fn document_roundtrip_any_bytes(data in proptest::collection::vec(any::<u8>(), 0..2048)) {
            let id = DocumentId::generate();
            let blob = encrypt_document(&key(9), &id, &data).unwrap();
            prop_assert_eq!(blob.ciphertext.len(), data.len());
            prop_assert_eq!(decrypt_document(&key(9), &id, &blob).unwrap(), data);
        }

        #[test]
        fn filename_roundtrip_any_str(name in "\\PC{0,64}") {
            let id = DocumentId::generate();
            let payload = encrypt_filename(&key(9), &id, &name).unwrap();
            prop_assert_eq!(decrypt_filename(&key(9), &id, &payload).unwrap(), name);
        }
    }
}
