//! cdx-core: shared types, config schema, and error taxonomy for cipherdex

pub mod config;
pub mod error;
pub mod types;

pub use config::CdxConfig;
pub use error::{AuthError, CdxError, CdxResult};
pub use types::{DocumentId, KeywordCombine, SearchMode, Token, TOKEN_SIZE};
