//! Façade over the document database (MongoDB). Every collaborator upstream
//! of this module (`upsert`, `lineage_recorder`, `issues`, `lock`, `query`)
//! talks to `DocumentStore`/`Collection`, never to `mongodb::Client` directly,
//! so the rest of the core stays testable against an alternate backend.

pub mod memory;
pub mod mongo;

use async_trait::async_trait;
use bson::{Bson, Document};
use futures::stream::BoxStream;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::errors::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexOrder {
    Asc,
    Desc,
}

#[derive(Debug, Clone)]
pub struct IndexSpec {
    pub name: String,
    pub keys: Vec<(String, IndexOrder)>,
    pub unique: bool,
}

impl IndexSpec {
    pub fn new(name: impl Into<String>, keys: Vec<(&str, IndexOrder)>) -> Self {
        Self { name: name.into(), keys: keys.into_iter().map(|(k, o)| (k.to_string(), o)).collect(), unique: false }
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct FindOptions {
    pub skip: Option<u64>,
    pub limit: Option<i64>,
    pub sort: Option<Document>,
}

/// Tally of a bulk upsert: how many documents were freshly inserted versus
/// how many matched and were modified in place.
#[derive(Debug, Clone, Copy, Default)]
pub struct BulkWriteOutcome {
    pub inserted: u64,
    pub modified: u64,
}

/// One `(filter, replacement)` pair in a bulk upsert batch.
pub struct UpsertOne {
    pub filter: Document,
    pub replacement: Document,
}

/// A single typed collection. `T` is the document's Rust shape; callers
/// serialize to/from `bson::Document` at the boundary so the store itself
/// stays untyped and batch-friendly.
#[async_trait]
pub trait Collection: Send + Sync {
    fn name(&self) -> &str;

    async fn find_one(&self, filter: Document) -> Result<Option<Document>, Error>;

    async fn find(&self, filter: Document, options: FindOptions) -> Result<BoxStream<'static, Result<Document, Error>>, Error>;

    async fn count(&self, filter: Document) -> Result<u64, Error>;

    async fn insert_one(&self, document: Document) -> Result<(), Error>;

    /// Replaces the document matching `filter` with `replacement`, inserting
    /// it if no document matches (`upsert: true`).
    async fn replace_one(&self, filter: Document, replacement: Document) -> Result<(), Error>;

    async fn update_one(&self, filter: Document, update: Document) -> Result<(), Error>;

    async fn delete_one(&self, filter: Document) -> Result<(), Error>;

    /// Unordered bulk upsert. A partial failure still reports the
    /// documents that did succeed; the error (if any) is surfaced alongside.
    async fn bulk_upsert(&self, items: Vec<UpsertOne>) -> Result<BulkWriteOutcome, Error>;

    async fn ensure_indexes(&self, specs: Vec<IndexSpec>) -> Result<(), Error>;
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    fn collection(&self, name: &str) -> std::sync::Arc<dyn Collection>;

    /// Drops every document-store collection this store was scoped to — used
    /// by the `ClearDown` administrative operation in test/staging
    /// environments, never called against production without an explicit
    /// operator action.
    async fn clear_down(&self, collections: &[&str]) -> Result<(), Error>;
}

pub fn to_document<T: Serialize>(value: &T) -> Result<Document, Error> {
    match bson::to_bson(value)? {
        Bson::Document(doc) => Ok(doc),
        other => Err(Error::IntegrityViolation(format!("expected a document, got {other:?}"))),
    }
}

pub fn from_document<T: DeserializeOwned>(document: Document) -> Result<T, Error> {
    Ok(bson::from_document(document)?)
}
