//! cdx-crypto: key hierarchy, vault lifecycle, and search tokens for cipherdex
//!
//! Key hierarchy:
//! ```text
//! Master Key (256-bit, Argon2id or PBKDF2-HMAC-SHA256 from password + salt)
//!   ├── K_fileEnc      HKDF(info="file-enc")      AES-256-GCM document bodies
//!   ├── K_filenameEnc  HKDF(info="filename-enc")  AES-256-GCM filenames
//!   ├── K_search       HKDF(info="search")        HMAC-SHA256 tokens
//!   ├── K_index        HKDF(info="index")         forward-privacy counter keys
//!   └── K_indexMac     HKDF(info="index-mac")     posting-list integrity tags
//! ```
//!
//! The vault verifier is an XChaCha20-Poly1305 canary sealed under a key
//! derived from the master key with its own label, so a wrong password is
//! detected without touching any index or document.

pub mod aead;
pub mod integrity;
pub mod kdf;
pub mod keys;
pub mod phonetic;
pub mod tokens;
pub mod vault;

pub use aead::{
    decrypt_document, decrypt_filename, encrypt_document, encrypt_filename, EncryptedBlob,
    FilenamePayload,
};
pub use integrity::{posting_tag, tokens_equal, verify_posting_tag, PostingTag};
pub use kdf::{derive_master_key, generate_salt, KdfParams, MasterKey};
pub use keys::{HmacSha256, KeyPurpose, KeySet, SecretKey};
pub use phonetic::{levenshtein, soundex};
pub use tokens::{
    counter_key, exact_token, extract_keywords, forward_token, ngram_tokens, ngrams,
    normalize_keyword, phonetic_token, tokenize,
};
pub use vault::{KeyGuard, Vault, VaultHeader, VaultOptions, VaultState};

/// Size of every symmetric key in bytes (256-bit)
pub const KEY_SIZE: usize = 32;

/// AES-GCM nonce size (96-bit)
pub const IV_SIZE: usize = 12;

/// AES-GCM / Poly1305 authentication tag size
pub const TAG_SIZE: usize = 16;

/// XChaCha20-Poly1305 nonce size (192-bit), used by the vault verifier
pub const XNONCE_SIZE: usize = 24;
