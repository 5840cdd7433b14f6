//! Applies insert/update/delete change-type semantics to a batch of parsed
//! rows against a dataset's collection — §4.7.

use bson::{doc, Bson, Document};
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::Arc;

use crate::docstore::{Collection, DocumentStore, UpsertOne};
use crate::errors::Error;
use crate::model::ChangeType;

pub const CREATED_AT: &str = "CreatedAtUtc";
pub const UPDATED_AT: &str = "UpdatedAtUtc";
pub const IS_DELETED: &str = "IsDeleted";
pub const DELETED_AT: &str = "DeletedAtUtc";

/// One parsed CSV row, ready for upsert: its deterministic `_id`, the raw
/// column values (already bson-encoded), the requested change type, and the
/// accumulator columns to set-union rather than overwrite.
pub struct UpsertRow {
    pub record_id: String,
    pub columns: Document,
    pub change_type: ChangeType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowOutcome {
    Created,
    Updated,
    Deleted,
    Undeleted,
    NoOp,
}

pub struct RowResult {
    pub record_id: String,
    pub outcome: RowOutcome,
    pub change_type: ChangeType,
    pub previous_values: Option<Document>,
    pub new_values: Option<Document>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct UpsertCounts {
    pub created: u64,
    pub updated: u64,
    pub deleted: u64,
    pub undeleted: u64,
}

impl UpsertCounts {
    fn record(&mut self, outcome: RowOutcome) {
        match outcome {
            RowOutcome::Created => self.created += 1,
            RowOutcome::Updated => self.updated += 1,
            RowOutcome::Deleted => self.deleted += 1,
            RowOutcome::Undeleted => self.undeleted += 1,
            RowOutcome::NoOp => {}
        }
    }
}

pub struct UpsertEngine {
    accumulator_columns: HashSet<String>,
}

impl UpsertEngine {
    pub fn new(accumulator_columns: HashSet<String>) -> Self {
        Self { accumulator_columns }
    }

    /// Applies `rows` to `collection` as a single bulk-write, input order
    /// preserved. Returns aggregate counts plus one `RowResult` per row that
    /// actually changed (no-ops are reported too, with `outcome: NoOp`, so
    /// the caller can still account for every input row).
    pub async fn apply(&self, store: &dyn DocumentStore, collection_name: &str, rows: Vec<UpsertRow>, now: DateTime<Utc>) -> Result<(UpsertCounts, Vec<RowResult>), Error> {
        let collection = store.collection(collection_name);
        let mut counts = UpsertCounts::default();
        let mut results = Vec::with_capacity(rows.len());
        let mut batch = Vec::with_capacity(rows.len());

        // Rows are processed in file order against an in-batch working copy,
        // seeded lazily from the store, so a key touched twice in one batch
        // (e.g. Insert then Delete) has its second row see the first's effect
        // instead of the stale pre-batch state.
        let mut working: std::collections::HashMap<String, Option<Document>> = std::collections::HashMap::new();

        for row in rows {
            let existing = match working.get(&row.record_id) {
                Some(doc) => doc.clone(),
                None => collection.find_one(doc! { "_id": &row.record_id }).await?,
            };
            let (outcome, replacement, previous_values, new_values) = self.transition(&row, existing.clone(), now);
            counts.record(outcome);
            // A `NoOp` leaves the record's state exactly as it was; only a
            // real transition's replacement should become the new working
            // value, else a later row in the batch would see `None` for a
            // record that is merely untouched, not absent.
            working.insert(row.record_id.clone(), if outcome == RowOutcome::NoOp { existing } else { replacement.clone() });
            if outcome != RowOutcome::NoOp {
                if let Some(replacement) = replacement {
                    batch.push(UpsertOne { filter: doc! { "_id": &row.record_id }, replacement });
                }
            }
            results.push(RowResult { record_id: row.record_id, outcome, change_type: row.change_type, previous_values, new_values });
        }

        if !batch.is_empty() {
            collection.bulk_upsert(batch).await?;
        }

        Ok((counts, results))
    }

    fn transition(&self, row: &UpsertRow, existing: Option<Document>, now: DateTime<Utc>) -> (RowOutcome, Option<Document>, Option<Document>, Option<Document>) {
        let now_bson = Bson::DateTime(now.into());

        match existing {
            None => match row.change_type {
                ChangeType::Delete => (RowOutcome::NoOp, None, None, None),
                ChangeType::Insert | ChangeType::Update => {
                    let mut doc = row.columns.clone();
                    doc.insert("_id", &row.record_id);
                    doc.insert(CREATED_AT, now_bson.clone());
                    doc.insert(UPDATED_AT, now_bson);
                    doc.insert(IS_DELETED, false);
                    for column in &self.accumulator_columns {
                        if let Some(value) = row.columns.get(column) {
                            doc.insert(column, Bson::Array(vec![value.clone()]));
                        }
                    }
                    let new_values = Some(doc.clone());
                    (RowOutcome::Created, Some(doc), None, new_values)
                }
            },

            Some(current) if is_deleted(&current) => match row.change_type {
                ChangeType::Update => {
                    let mut doc = self.replace_columns(&current, row, now_bson);
                    doc.insert(IS_DELETED, false);
                    doc.remove(DELETED_AT);
                    let new_values = Some(doc.clone());
                    (RowOutcome::Undeleted, Some(doc), Some(current), new_values)
                }
                ChangeType::Insert | ChangeType::Delete => (RowOutcome::NoOp, None, None, None),
            },

            Some(current) => match row.change_type {
                ChangeType::Insert | ChangeType::Update => {
                    let doc = self.replace_columns(&current, row, now_bson);
                    let new_values = Some(doc.clone());
                    (RowOutcome::Updated, Some(doc), Some(current), new_values)
                }
                ChangeType::Delete => {
                    let mut doc = current.clone();
                    doc.insert(IS_DELETED, true);
                    doc.insert(DELETED_AT, now_bson.clone());
                    doc.insert(UPDATED_AT, now_bson);
                    (RowOutcome::Deleted, Some(doc), Some(current), None)
                }
            },
        }
    }

    fn replace_columns(&self, current: &Document, row: &UpsertRow, now_bson: Bson) -> Document {
        let mut doc = row.columns.clone();
        doc.insert("_id", &row.record_id);
        doc.insert(CREATED_AT, current.get(CREATED_AT).cloned().unwrap_or_else(|| now_bson.clone()));
        doc.insert(UPDATED_AT, now_bson);
        doc.insert(IS_DELETED, current.get(IS_DELETED).cloned().unwrap_or(Bson::Boolean(false)));
        if let Some(deleted_at) = current.get(DELETED_AT) {
            doc.insert(DELETED_AT, deleted_at.clone());
        }
        for column in &self.accumulator_columns {
            let mut union: Vec<Bson> = current.get_array(column).map(|arr| arr.to_vec()).unwrap_or_default();
            if let Some(value) = row.columns.get(column) {
                if !union.contains(value) {
                    union.push(value.clone());
                }
            }
            doc.insert(column, Bson::Array(union));
        }
        doc
    }
}

fn is_deleted(doc: &Document) -> bool {
    doc.get_bool(IS_DELETED).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::docstore::memory::InMemoryDocumentStore;
    use crate::record_id::record_id;
    use chrono::TimeZone;

    fn row(id: &str, change: ChangeType, value: &str) -> UpsertRow {
        UpsertRow { record_id: id.to_string(), columns: doc! { "NAME": value }, change_type: change }
    }

    #[tokio::test]
    async fn insert_then_update_then_delete_then_undelete_lifecycle() {
        let store = InMemoryDocumentStore::new();
        let engine = UpsertEngine::new(HashSet::new());
        let now = Utc::now();
        let id = record_id(&["A"]).unwrap();

        let (counts, _) = engine.apply(&store, "keepers", vec![row(&id, ChangeType::Insert, "Alice")], now).await.unwrap();
        assert_eq!(counts.created, 1);

        let (counts, _) = engine.apply(&store, "keepers", vec![row(&id, ChangeType::Update, "Alice Jones")], now).await.unwrap();
        assert_eq!(counts.updated, 1);

        let (counts, _) = engine.apply(&store, "keepers", vec![row(&id, ChangeType::Delete, "")], now).await.unwrap();
        assert_eq!(counts.deleted, 1);

        let (counts, _) = engine.apply(&store, "keepers", vec![row(&id, ChangeType::Delete, "")], now).await.unwrap();
        assert_eq!(counts.deleted, 0, "deleting an already-deleted record is a no-op");

        let (counts, results) = engine.apply(&store, "keepers", vec![row(&id, ChangeType::Update, "Alice Restored")], now).await.unwrap();
        assert_eq!(counts.undeleted, 1);
        assert_eq!(results[0].outcome, RowOutcome::Undeleted);

        let stored = store.collection("keepers").find_one(doc! { "_id": &id }).await.unwrap().unwrap();
        assert_eq!(stored.get_bool(IS_DELETED).unwrap(), false);
        assert!(stored.get(DELETED_AT).is_none());
    }

    #[tokio::test]
    async fn created_at_is_preserved_across_updates() {
        let store = InMemoryDocumentStore::new();
        let engine = UpsertEngine::new(HashSet::new());
        let id = record_id(&["B"]).unwrap();
        let t0 = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let t1 = Utc.with_ymd_and_hms(2026, 1, 2, 0, 0, 0).unwrap();

        engine.apply(&store, "keepers", vec![row(&id, ChangeType::Insert, "x")], t0).await.unwrap();
        engine.apply(&store, "keepers", vec![row(&id, ChangeType::Update, "y")], t1).await.unwrap();

        let stored = store.collection("keepers").find_one(doc! { "_id": &id }).await.unwrap().unwrap();
        assert_eq!(stored.get_datetime(CREATED_AT).unwrap().to_chrono(), t0);
        assert_eq!(stored.get_datetime(UPDATED_AT).unwrap().to_chrono(), t1);
    }

    #[tokio::test]
    async fn accumulator_columns_union_across_imports() {
        let store = InMemoryDocumentStore::new();
        let engine = UpsertEngine::new(HashSet::from(["HOLDING".to_string()]));
        let id = record_id(&["C"]).unwrap();
        let now = Utc::now();

        let first = UpsertRow { record_id: id.clone(), columns: doc! { "HOLDING": "CPH1" }, change_type: ChangeType::Insert };
        engine.apply(&store, "animals", vec![first], now).await.unwrap();

        let second = UpsertRow { record_id: id.clone(), columns: doc! { "HOLDING": "CPH2" }, change_type: ChangeType::Update };
        engine.apply(&store, "animals", vec![second], now).await.unwrap();

        let stored = store.collection("animals").find_one(doc! { "_id": &id }).await.unwrap().unwrap();
        let holdings = stored.get_array("HOLDING").unwrap();
        assert_eq!(holdings.as_slice(), [Bson::String("CPH1".into()), Bson::String("CPH2".into())]);
    }
}
