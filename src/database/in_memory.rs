use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use serde_json::Value;
use std::marker::PhantomData;
use tracing::debug;

use super::document_store::DocumentStore;
use super::query::{glob_to_regex, serial_of, QueryExpression, SortOrder};
use crate::error::Result;
use crate::models::Document;

/// Document store backed by a concurrent map of serialized documents.
///
/// Identities of deleted documents are remembered so that serial allocation
/// never hands out a number twice.
pub struct InMemoryDocumentStore<T: Document> {
    documents: DashMap<String, Value>,
    retired: DashSet<String>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Document> InMemoryDocumentStore<T> {
    pub fn new() -> Self {
        Self {
            documents: DashMap::new(),
            retired: DashSet::new(),
            _marker: PhantomData,
        }
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }
}

impl<T: Document> std::fmt::Debug for InMemoryDocumentStore<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryDocumentStore")
            .field("collection", &T::COLLECTION)
            .field("documents", &self.documents.len())
            .field("retired", &self.retired.len())
            .finish()
    }
}

impl<T: Document> Default for InMemoryDocumentStore<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<T: Document> DocumentStore<T> for InMemoryDocumentStore<T> {
    async fn get(&self, prepid: &str) -> Result<Option<T>> {
        match self.documents.get(prepid) {
            Some(value) => Ok(Some(serde_json::from_value(value.clone())?)),
            None => Ok(None),
        }
    }

    async fn save(&self, document: &T) -> Result<()> {
        let value = serde_json::to_value(document)?;
        debug!(
            collection = T::COLLECTION,
            prepid = %document.prepid(),
            "💾 STORE: Saving document"
        );
        self.documents.insert(document.prepid().to_string(), value);
        Ok(())
    }

    async fn delete(&self, prepid: &str) -> Result<bool> {
        let removed = self.documents.remove(prepid).is_some();
        if removed {
            self.retired.insert(prepid.to_string());
            debug!(collection = T::COLLECTION, prepid = %prepid, "💾 STORE: Deleted document");
        }
        Ok(removed)
    }

    async fn query(
        &self,
        expression: &str,
        sort: Option<&SortOrder>,
        limit: Option<usize>,
    ) -> Result<Vec<T>> {
        let expression = QueryExpression::parse(expression)?;
        let mut matching: Vec<Value> = self
            .documents
            .iter()
            .filter(|entry| expression.matches(entry.value()))
            .map(|entry| entry.value().clone())
            .collect();

        match sort {
            Some(order) => matching.sort_by(|a, b| order.compare(a, b)),
            None => matching.sort_by(|a, b| SortOrder::ascending("prepid").compare(a, b)),
        }
        if let Some(limit) = limit {
            matching.truncate(limit);
        }

        matching
            .into_iter()
            .map(|value| serde_json::from_value(value).map_err(Into::into))
            .collect()
    }

    async fn exists(&self, prepid: &str) -> Result<bool> {
        Ok(self.documents.contains_key(prepid))
    }

    async fn highest_serial_matching(&self, prefix_glob: &str) -> Result<u32> {
        let pattern = glob_to_regex(prefix_glob)?;
        let live = self.documents.iter().map(|entry| entry.key().clone());
        let retired = self.retired.iter().map(|entry| entry.key().clone());
        Ok(live
            .chain(retired)
            .filter(|prepid| pattern.is_match(prepid))
            .filter_map(|prepid| serial_of(&prepid))
            .max()
            .unwrap_or(0))
    }
}
