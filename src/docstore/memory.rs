//! In-process `DocumentStore` used by tests and local development. Mirrors
//! `object_store::memory::InMemory`'s role for `ObjectStore`: exercise the
//! real trait rather than a hand-rolled mock.

use async_trait::async_trait;
use bson::{Bson, Document};
use futures::stream;
use std::collections::HashMap;
use std::sync::Mutex;

use super::{BulkWriteOutcome, Collection as CollectionTrait, DocumentStore, FindOptions, IndexSpec, UpsertOne};
use crate::errors::Error;

#[derive(Default)]
pub struct InMemoryDocumentStore {
    collections: Mutex<HashMap<String, std::sync::Arc<InMemoryCollection>>>,
}

impl InMemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    fn collection(&self, name: &str) -> std::sync::Arc<dyn CollectionTrait> {
        let mut collections = self.collections.lock().expect("in-memory document store mutex poisoned");
        collections.entry(name.to_string()).or_insert_with(|| std::sync::Arc::new(InMemoryCollection::new(name))).clone()
    }

    async fn clear_down(&self, names: &[&str]) -> Result<(), Error> {
        let collections = self.collections.lock().expect("in-memory document store mutex poisoned");
        for name in names {
            if let Some(coll) = collections.get(*name) {
                coll.docs.lock().expect("in-memory collection mutex poisoned").clear();
            }
        }
        Ok(())
    }
}

pub struct InMemoryCollection {
    name: String,
    docs: Mutex<Vec<Document>>,
}

impl InMemoryCollection {
    fn new(name: &str) -> Self {
        Self { name: name.to_string(), docs: Mutex::new(Vec::new()) }
    }
}

/// Matches a subset of the mongo query language sufficient for this crate's
/// own filters: field equality, `$and`/`$or`, `$gt`/`$gte`/`$lt`/`$lte`,
/// `$ne`, `$in`, `$exists`.
fn matches(doc: &Document, filter: &Document) -> bool {
    filter.iter().all(|(key, expected)| match key.as_str() {
        "$and" => expected.as_array().map(|arr| arr.iter().all(|f| f.as_document().map(|d| matches(doc, d)).unwrap_or(false))).unwrap_or(false),
        "$or" => expected.as_array().map(|arr| arr.iter().any(|f| f.as_document().map(|d| matches(doc, d)).unwrap_or(false))).unwrap_or(false),
        _ => field_matches(doc.get(key), expected),
    })
}

fn field_matches(actual: Option<&Bson>, expected: &Bson) -> bool {
    match expected {
        Bson::Document(ops) if ops.iter().all(|(k, _)| k.starts_with('$')) && !ops.is_empty() => ops.iter().all(|(op, value)| match op.as_str() {
            "$gt" => compare(actual, value).map(|o| o.is_gt()).unwrap_or(false),
            "$gte" => compare(actual, value).map(|o| o.is_ge()).unwrap_or(false),
            "$lt" => compare(actual, value).map(|o| o.is_lt()).unwrap_or(false),
            "$lte" => compare(actual, value).map(|o| o.is_le()).unwrap_or(false),
            "$ne" => actual != Some(value),
            "$in" => value.as_array().map(|arr| arr.iter().any(|v| actual == Some(v))).unwrap_or(false),
            "$exists" => actual.is_some() == value.as_bool().unwrap_or(true),
            _ => false,
        }),
        _ => actual == Some(expected),
    }
}

fn compare(actual: Option<&Bson>, expected: &Bson) -> Option<std::cmp::Ordering> {
    let actual = actual?;
    match (actual, expected) {
        (Bson::DateTime(a), Bson::DateTime(b)) => a.partial_cmp(b),
        (Bson::Int32(a), Bson::Int32(b)) => a.partial_cmp(b),
        (Bson::Int64(a), Bson::Int64(b)) => a.partial_cmp(b),
        (Bson::Double(a), Bson::Double(b)) => a.partial_cmp(b),
        (Bson::String(a), Bson::String(b)) => a.partial_cmp(b),
        _ => None,
    }
}

fn apply_update(doc: &mut Document, update: &Document) {
    if let Some(Bson::Document(set)) = update.get("$set") {
        for (k, v) in set {
            doc.insert(k.clone(), v.clone());
        }
    }
    if let Some(Bson::Document(unset)) = update.get("$unset") {
        for (k, _) in unset {
            doc.remove(k);
        }
    }
}

#[async_trait]
impl CollectionTrait for InMemoryCollection {
    fn name(&self) -> &str {
        &self.name
    }

    async fn find_one(&self, filter: Document) -> Result<Option<Document>, Error> {
        let docs = self.docs.lock().expect("in-memory collection mutex poisoned");
        Ok(docs.iter().find(|d| matches(d, &filter)).cloned())
    }

    async fn find(&self, filter: Document, options: FindOptions) -> Result<futures::stream::BoxStream<'static, Result<Document, Error>>, Error> {
        let docs = self.docs.lock().expect("in-memory collection mutex poisoned");
        let mut matched: Vec<Document> = docs.iter().filter(|d| matches(d, &filter)).cloned().collect();

        if let Some(sort) = &options.sort {
            for (field, direction) in sort.iter().collect::<Vec<_>>().into_iter().rev() {
                let dir = direction.as_i32().unwrap_or(1);
                matched.sort_by(|a, b| {
                    let default = Bson::Null;
                    let b_value = b.get(field).unwrap_or(&default);
                    let ord = compare(a.get(field), b_value).unwrap_or(std::cmp::Ordering::Equal);
                    if dir < 0 {
                        ord.reverse()
                    } else {
                        ord
                    }
                });
            }
        }

        let skip = options.skip.unwrap_or(0) as usize;
        let matched = if skip < matched.len() { matched.split_off(skip) } else { Vec::new() };
        let matched = match options.limit {
            Some(limit) if limit >= 0 => matched.into_iter().take(limit as usize).collect(),
            _ => matched,
        };

        Ok(Box::pin(stream::iter(matched.into_iter().map(Ok))))
    }

    async fn count(&self, filter: Document) -> Result<u64, Error> {
        let docs = self.docs.lock().expect("in-memory collection mutex poisoned");
        Ok(docs.iter().filter(|d| matches(d, &filter)).count() as u64)
    }

    async fn insert_one(&self, document: Document) -> Result<(), Error> {
        let mut docs = self.docs.lock().expect("in-memory collection mutex poisoned");
        docs.push(document);
        Ok(())
    }

    async fn replace_one(&self, filter: Document, replacement: Document) -> Result<(), Error> {
        let mut docs = self.docs.lock().expect("in-memory collection mutex poisoned");
        if let Some(existing) = docs.iter_mut().find(|d| matches(d, &filter)) {
            *existing = replacement;
        } else {
            docs.push(replacement);
        }
        Ok(())
    }

    async fn update_one(&self, filter: Document, update: Document) -> Result<(), Error> {
        let mut docs = self.docs.lock().expect("in-memory collection mutex poisoned");
        if let Some(existing) = docs.iter_mut().find(|d| matches(d, &filter)) {
            apply_update(existing, &update);
        }
        Ok(())
    }

    async fn delete_one(&self, filter: Document) -> Result<(), Error> {
        let mut docs = self.docs.lock().expect("in-memory collection mutex poisoned");
        if let Some(pos) = docs.iter().position(|d| matches(d, &filter)) {
            docs.remove(pos);
        }
        Ok(())
    }

    async fn bulk_upsert(&self, items: Vec<UpsertOne>) -> Result<BulkWriteOutcome, Error> {
        let mut outcome = BulkWriteOutcome::default();
        for item in items {
            let mut docs = self.docs.lock().expect("in-memory collection mutex poisoned");
            if let Some(existing) = docs.iter_mut().find(|d| matches(d, &item.filter)) {
                *existing = item.replacement;
                outcome.modified += 1;
            } else {
                docs.push(item.replacement);
                outcome.inserted += 1;
            }
        }
        Ok(outcome)
    }

    async fn ensure_indexes(&self, _specs: Vec<IndexSpec>) -> Result<(), Error> {
        Ok(())
    }
}
