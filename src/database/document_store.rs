use async_trait::async_trait;

use super::query::SortOrder;
use crate::error::{RelvalError, Result};
use crate::models::Document;

/// Persistence of one document collection
#[async_trait]
pub trait DocumentStore<T: Document>: Send + Sync {
    async fn get(&self, prepid: &str) -> Result<Option<T>>;

    /// Insert or replace the document with the same prepid
    async fn save(&self, document: &T) -> Result<()>;

    /// Returns whether a document was removed
    async fn delete(&self, prepid: &str) -> Result<bool>;

    /// Documents matching a `field=value&&...` expression
    async fn query(
        &self,
        expression: &str,
        sort: Option<&SortOrder>,
        limit: Option<usize>,
    ) -> Result<Vec<T>>;

    async fn exists(&self, prepid: &str) -> Result<bool>;

    /// Highest trailing serial among identities matching `prefix_glob`, 0 if none
    async fn highest_serial_matching(&self, prefix_glob: &str) -> Result<u32>;

    /// Like [`get`](Self::get) but a missing document is an error
    async fn get_required(&self, prepid: &str) -> Result<T> {
        self.get(prepid).await?.ok_or_else(|| {
            RelvalError::NotFound(format!("{} {prepid} does not exist", T::COLLECTION))
        })
    }
}
