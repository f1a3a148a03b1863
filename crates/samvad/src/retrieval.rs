//! Black-box retrieval boundary.
//!
//! The core only consumes ranked text chunks; indexing and embedding live
//! behind this trait.

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::ChatError;
use crate::types::FileItem;

#[async_trait]
pub trait RetrievalService: Send + Sync {
    /// Return the top `k` chunks for `query` within the given file scope.
    async fn retrieve(
        &self,
        query: &str,
        file_scope: &[Uuid],
        embeddings_provider: &str,
        k: usize,
    ) -> Result<Vec<FileItem>, ChatError>;
}

/// Default implementation for deployments without a retrieval backend.
pub struct NoRetrieval;

#[async_trait]
impl RetrievalService for NoRetrieval {
    async fn retrieve(
        &self,
        _query: &str,
        _file_scope: &[Uuid],
        _embeddings_provider: &str,
        _k: usize,
    ) -> Result<Vec<FileItem>, ChatError> {
        Ok(Vec::new())
    }
}
