//! Per-operation query memoisation with single-flight semantics — §4.9.
//! Lives for exactly one `AnalysisStrategy` run: never shared across
//! operations, never invalidated (the analysis sees one stable snapshot).

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OnceCell};

use super::{QueryParameters, QueryResult, QueryService};
use crate::docstore::Collection;
use crate::errors::Error;

type Slot = Arc<OnceCell<Result<Arc<QueryResult>, CacheError>>>;

#[derive(Debug, Clone)]
pub struct CacheError(pub String);

impl From<Error> for CacheError {
    fn from(err: Error) -> Self {
        CacheError(err.to_string())
    }
}

pub struct AnalysisContext {
    operation_id: String,
    slots: Mutex<HashMap<String, Slot>>,
}

impl AnalysisContext {
    pub fn new(operation_id: impl Into<String>) -> Self {
        Self { operation_id: operation_id.into(), slots: Mutex::new(HashMap::new()) }
    }

    pub fn operation_id(&self) -> &str {
        &self.operation_id
    }

    /// Runs `params` against `collection`, or returns the cached result for
    /// an identical (by canonical key) query already run in this context.
    /// Concurrent callers with equal params block on the same in-flight
    /// request rather than issuing duplicate reads.
    pub async fn query(&self, collection: &dyn Collection, params: &QueryParameters) -> Result<Arc<QueryResult>, Error> {
        let key = params.cache_key();

        let slot = {
            let mut slots = self.slots.lock().await;
            slots.entry(key).or_insert_with(|| Arc::new(OnceCell::new())).clone()
        };

        let result = slot
            .get_or_init(|| async { QueryService::query(collection, params).await.map(Arc::new).map_err(CacheError::from) })
            .await;

        match result {
            Ok(value) => Ok(value.clone()),
            Err(err) => Err(Error::TransientIo { message: err.0.clone(), attempts: 1 }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::docstore::memory::InMemoryDocumentStore;
    use crate::docstore::DocumentStore;
    use crate::query::Filter;
    use bson::{doc, Bson};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn repeated_equal_params_hit_the_cache_once() {
        let store = InMemoryDocumentStore::new();
        let collection = store.collection("animals");
        collection.insert_one(doc! { "_id": "a1", "CPH": "001" }).await.unwrap();

        let ctx = AnalysisContext::new("op-1");
        let params = QueryParameters { collection_name: "animals".into(), filter: Filter::Eq("CPH".into(), Bson::String("001".into())), order_by: None, skip: None, top: None };

        let first = ctx.query(collection.as_ref(), &params).await.unwrap();
        let second = ctx.query(collection.as_ref(), &params).await.unwrap();
        assert_eq!(first.data.len(), 1);
        assert_eq!(second.data.len(), 1);
        assert!(Arc::ptr_eq(&first, &second), "equal-parameter queries must return the same cached instance");
    }

    #[tokio::test]
    async fn concurrent_identical_queries_single_flight() {
        let store = InMemoryDocumentStore::new();
        let collection = store.collection("animals");
        for i in 0..5 {
            collection.insert_one(doc! { "_id": format!("a{i}"), "CPH": "001" }).await.unwrap();
        }

        let ctx = Arc::new(AnalysisContext::new("op-1"));
        let params = Arc::new(QueryParameters { collection_name: "animals".into(), filter: Filter::Eq("CPH".into(), Bson::String("001".into())), order_by: None, skip: None, top: None });
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let ctx = ctx.clone();
            let params = params.clone();
            let collection = collection.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                let result = ctx.query(collection.as_ref(), &params).await.unwrap();
                calls.fetch_add(1, Ordering::SeqCst);
                result.data.len()
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap(), 5);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 8);
    }
}
