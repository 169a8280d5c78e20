//! Ciphertext document store over an OpenDAL operator
//!
//! Layout: `documents/{id}.json`, one [`DocumentRecord`] per object. The
//! store never sees plaintext or key material.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use cdx_core::{CdxError, CdxResult, DocumentId};
use cdx_crypto::{EncryptedBlob, FilenamePayload, IV_SIZE, TAG_SIZE};
use opendal::Operator;
use serde::{Deserialize, Serialize};
use tracing::debug;

const PREFIX: &str = "documents/";
const SUFFIX: &str = ".json";

/// One stored upload: AEAD output for the body plus the encrypted filename.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentRecord {
    pub id: DocumentId,
    pub ciphertext: String,
    pub iv: String,
    pub tag: String,
    pub encrypted_filename: FilenamePayload,
}

impl DocumentRecord {
    pub fn new(id: DocumentId, body: &EncryptedBlob, encrypted_filename: FilenamePayload) -> Self {
        Self {
            id,
            ciphertext: URL_SAFE_NO_PAD.encode(&body.ciphertext),
            iv: URL_SAFE_NO_PAD.encode(body.iv),
            tag: URL_SAFE_NO_PAD.encode(body.tag),
            encrypted_filename,
        }
    }

    /// Decode the body back into a blob. Bad encoding counts as tampering.
    pub fn blob(&self) -> CdxResult<EncryptedBlob> {
        let decode = |field: &str, value: &str| {
            URL_SAFE_NO_PAD
                .decode(value)
                .map_err(|_| CdxError::auth_failure(format!("document {field} encoding")))
        };
        let iv: [u8; IV_SIZE] = decode("iv", &self.iv)?
            .try_into()
            .map_err(|_| CdxError::auth_failure("document iv length"))?;
        let tag: [u8; TAG_SIZE] = decode("tag", &self.tag)?
            .try_into()
            .map_err(|_| CdxError::auth_failure("document tag length"))?;
        Ok(EncryptedBlob {
            ciphertext: decode("ciphertext", &self.ciphertext)?,
            iv,
            tag,
        })
    }

    /// Raw ciphertext length in bytes.
    pub fn ciphertext_len(&self) -> usize {
        // base64 without padding: 4 chars per 3 bytes
        self.ciphertext.len() * 3 / 4
    }
}

fn object_path(id: &DocumentId) -> String {
    format!("{PREFIX}{id}{SUFFIX}")
}

fn storage_err(what: &str, id: &str, e: opendal::Error) -> CdxError {
    CdxError::Storage(format!("{what} {id}: {e}"))
}

#[derive(Debug, Clone)]
pub struct DocumentStore {
    op: Operator,
}

impl DocumentStore {
    pub fn new(op: Operator) -> Self {
        Self { op }
    }

    pub fn operator(&self) -> &Operator {
        &self.op
    }

    pub async fn put(&self, record: &DocumentRecord) -> CdxResult<()> {
        let bytes = serde_json::to_vec(record)?;
        self.op
            .write(&object_path(&record.id), bytes)
            .await
            .map_err(|e| storage_err("writing document", record.id.as_str(), e))?;
        debug!(doc_id = %record.id, "stored document");
        Ok(())
    }

    /// Fetch a record. Unknown IDs are `NotFound`.
    pub async fn get(&self, id: &DocumentId) -> CdxResult<DocumentRecord> {
        let buf = match self.op.read(&object_path(id)).await {
            Ok(buf) => buf,
            Err(e) if e.kind() == opendal::ErrorKind::NotFound => {
                return Err(CdxError::NotFound(id.clone()))
            }
            Err(e) => return Err(storage_err("reading document", id.as_str(), e)),
        };
        let record: DocumentRecord = serde_json::from_slice(&buf.to_vec())?;
        if &record.id != id {
            return Err(CdxError::auth_failure(format!(
                "record stored under {id} names another document"
            )));
        }
        Ok(record)
    }

    pub async fn exists(&self, id: &DocumentId) -> CdxResult<bool> {
        self.op
            .exists(&object_path(id))
            .await
            .map_err(|e| storage_err("checking document", id.as_str(), e))
    }

    /// Remove a record. Unknown IDs are `NotFound`.
    pub async fn delete(&self, id: &DocumentId) -> CdxResult<()> {
        if !self.exists(id).await? {
            return Err(CdxError::NotFound(id.clone()));
        }
        self.op
            .delete(&object_path(id))
            .await
            .map_err(|e| storage_err("deleting document", id.as_str(), e))
    }

    /// Every stored document ID, sorted. Objects that do not look like
    /// records are skipped.
    pub async fn list(&self) -> CdxResult<Vec<DocumentId>> {
        let entries = match self.op.list(PREFIX).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == opendal::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(storage_err("listing", PREFIX, e)),
        };
        let mut ids: Vec<DocumentId> = entries
            .iter()
            .filter_map(|entry| entry.name().strip_suffix(SUFFIX))
            .filter_map(|stem| DocumentId::parse(stem).ok())
            .collect();
        ids.sort();
        Ok(ids)
    }
}
