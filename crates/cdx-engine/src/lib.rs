//! cdx-engine: upload, search, fetch and delete over an encrypted index
//!
//! The [`Engine`] owns the client side of the protocol: it encrypts
//! documents, derives tokens, verifies substring/fuzzy/ranked candidates
//! by decrypting them, and pads responses. The index and document store
//! only ever see tokens and ciphertexts.

pub mod document;
pub mod engine;
pub mod metrics;
pub mod search;

pub use document::{DocumentRecord, DocumentStore};
pub use engine::{DocumentPage, DocumentSummary, Engine, UploadReceipt};
pub use metrics::EngineMetrics;
pub use search::{SearchOptions, SearchOutcome};
