//! Storage health check

use cdx_core::{CdxError, CdxResult};
use opendal::Operator;

/// Verify the document store is reachable by listing the root.
pub async fn check_health(op: &Operator) -> CdxResult<()> {
    op.list("/")
        .await
        .map(|_| ())
        .map_err(|e| CdxError::Storage(format!("storage health check failed: {e}")))
}

/// Returns true if storage is reachable, false otherwise (non-panicking)
pub async fn is_healthy(op: &Operator) -> bool {
    check_health(op).await.is_ok()
}
