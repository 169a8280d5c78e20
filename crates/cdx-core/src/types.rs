use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

use crate::error::CdxError;

/// Token length in bytes (HMAC-SHA256 output).
pub const TOKEN_SIZE: usize = 32;

/// Reserved prefix for synthetic padding IDs. Real IDs can never carry it.
pub const SYNTHETIC_ID_PREFIX: &str = "pad-";

const MAX_DOCUMENT_ID_LEN: usize = 128;

/// Opaque search handle (trapdoor). The index never sees anything else.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Token([u8; TOKEN_SIZE]);

impl Token {
    pub fn from_bytes(bytes: [u8; TOKEN_SIZE]) -> Self {
        Self(bytes)
    }

    /// `None` for anything that is not exactly 32 bytes.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; TOKEN_SIZE] = bytes.try_into().ok()?;
        Some(Self(arr))
    }

    /// `None` for malformed hex or the wrong length.
    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s.trim()).ok()?;
        Self::from_slice(&bytes)
    }

    pub fn as_bytes(&self) -> &[u8; TOKEN_SIZE] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// First 4 bytes as hex, for logs and error messages.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }

    /// Shard selector for lock striping.
    pub fn shard(&self, shards: usize) -> usize {
        let n = u16::from_be_bytes([self.0[0], self.0[1]]) as usize;
        n % shards.max(1)
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Token({}..)", self.short())
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl Serialize for Token {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Token {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Token::from_hex(&s).ok_or_else(|| serde::de::Error::custom("token must be 64 hex chars"))
    }
}

/// Document identifier. Generated IDs are 32 lowercase hex chars.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DocumentId(String);

impl DocumentId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    /// Validate a caller-supplied ID. Rejects anything that could collide
    /// with padding IDs or escape the document store's key space.
    pub fn parse(s: &str) -> Result<Self, CdxError> {
        if s.is_empty() || s.len() > MAX_DOCUMENT_ID_LEN {
            return Err(CdxError::InvalidDocumentId(format!(
                "length must be 1..={MAX_DOCUMENT_ID_LEN}"
            )));
        }
        if s.starts_with(SYNTHETIC_ID_PREFIX) {
            return Err(CdxError::InvalidDocumentId(format!(
                "prefix {SYNTHETIC_ID_PREFIX:?} is reserved"
            )));
        }
        if s.starts_with('.')
            || !s
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        {
            return Err(CdxError::InvalidDocumentId(s.to_string()));
        }
        Ok(Self(s.to_string()))
    }

    /// A padding ID, disjoint from every real ID.
    pub fn synthetic() -> Self {
        Self(format!(
            "{SYNTHETIC_ID_PREFIX}{}",
            uuid::Uuid::new_v4().simple()
        ))
    }

    pub fn is_synthetic(&self) -> bool {
        self.0.starts_with(SYNTHETIC_ID_PREFIX)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for DocumentId {
    type Error = CdxError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        // Padding IDs round-trip through serde (search responses) but are
        // never accepted by `parse`.
        if s.starts_with(SYNTHETIC_ID_PREFIX) {
            return Ok(Self(s));
        }
        Self::parse(&s)
    }
}

impl From<DocumentId> for String {
    fn from(id: DocumentId) -> Self {
        id.0
    }
}

impl std::str::FromStr for DocumentId {
    type Err = CdxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Search mode with its mode-specific parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum SearchMode {
    Exact,
    /// Union over every counter epoch of the keyword.
    Forward,
    Substring { n: usize },
    Fuzzy { max_distance: usize },
    Ranked { top_k: usize },
}

impl SearchMode {
    pub fn name(&self) -> &'static str {
        match self {
            SearchMode::Exact => "exact",
            SearchMode::Forward => "forward",
            SearchMode::Substring { .. } => "substring",
            SearchMode::Fuzzy { .. } => "fuzzy",
            SearchMode::Ranked { .. } => "ranked",
        }
    }

    /// Whether candidates must be decrypted and checked client-side.
    pub fn needs_verification(&self) -> bool {
        matches!(
            self,
            SearchMode::Substring { .. } | SearchMode::Fuzzy { .. } | SearchMode::Ranked { .. }
        )
    }
}

impl fmt::Display for SearchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// How multi-keyword queries combine per-keyword results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeywordCombine {
    #[default]
    And,
    Or,
}
