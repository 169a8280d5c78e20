//! cdx-storage: OpenDAL operators for document ciphertext storage

pub mod health;
pub mod operator;

pub use health::{check_health, is_healthy};
pub use operator::{build_memory_operator, build_operator, S3Credentials};
