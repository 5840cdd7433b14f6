//! Batched writer of per-record lineage events and the lifecycle rollup
//! that owns them — §4.8.

use bson::{doc, Document};
use chrono::{DateTime, Utc};
use std::sync::Arc;

use crate::docstore::{to_document, Collection, DocumentStore, UpsertOne};
use crate::errors::Error;
use crate::model::lineage::{LineageEventType, LineageStatus, RecordLineage, RecordLineageEvent};
use crate::model::ChangeType;
use crate::upsert::{RowOutcome, RowResult};

pub const COLLECTION: &str = "record_lineage";

pub struct LineageEntry {
    pub collection: String,
    pub record_id: String,
    pub import_id: String,
    pub file_key: String,
    pub event_date: DateTime<Utc>,
    pub change_type: ChangeType,
    pub previous_values: Option<Document>,
    pub new_values: Option<Document>,
}

fn event_type_for(outcome: RowOutcome) -> Option<LineageEventType> {
    match outcome {
        RowOutcome::Created => Some(LineageEventType::Created),
        RowOutcome::Updated => Some(LineageEventType::Updated),
        RowOutcome::Deleted => Some(LineageEventType::Deleted),
        RowOutcome::Undeleted => Some(LineageEventType::Undeleted),
        RowOutcome::NoOp => None,
    }
}

/// Builds the lineage entries for one batch's row results, omitting no-ops.
pub fn entries_from_row_results(collection: &str, import_id: &str, file_key: &str, results: &[RowResult], event_date: DateTime<Utc>) -> Vec<LineageEntry> {
    results
        .iter()
        .filter_map(|r| {
            event_type_for(r.outcome)?;
            Some(LineageEntry {
                collection: collection.to_string(),
                record_id: r.record_id.clone(),
                import_id: import_id.to_string(),
                file_key: file_key.to_string(),
                event_date,
                change_type: r.change_type,
                previous_values: r.previous_values.clone(),
                new_values: r.new_values.clone(),
            })
        })
        .collect()
}

pub struct LineageRecorder {
    lineage: Arc<dyn Collection>,
}

impl LineageRecorder {
    pub fn new(store: &dyn DocumentStore) -> Self {
        Self { lineage: store.collection(COLLECTION) }
    }

    /// Records one batch of lineage entries: each rollup is loaded, the
    /// matching event appended (skipped if the exact
    /// `(collection,recordId,eventDate,importId)` tuple is already present,
    /// giving at-least-once delivery an idempotent landing), and the whole
    /// set bulk-upserted.
    pub async fn record(&self, entries: Vec<LineageEntry>) -> Result<(), Error> {
        let mut batch = Vec::with_capacity(entries.len());

        for entry in entries {
            let lineage_id = RecordLineage::lineage_id(&entry.collection, &entry.record_id);
            let existing = self.lineage.find_one(doc! { "_id": &lineage_id }).await?;

            let Some(event_type) = (match existing {
                Some(ref doc) => self.next_event_type(doc, &entry)?,
                None => Some(LineageEventType::Created),
            }) else {
                continue; // duplicate delivery of an already-recorded event
            };

            let mut rollup: RecordLineage = match existing {
                Some(doc) => bson::from_document(doc)?,
                None => RecordLineage::new_created(&entry.collection, &entry.record_id, &entry.import_id, entry.event_date),
            };

            if self.is_duplicate(&rollup, &entry, event_type) {
                continue;
            }

            rollup.events.push(RecordLineageEvent {
                event_type,
                import_id: entry.import_id.clone(),
                file_key: entry.file_key.clone(),
                event_date: entry.event_date,
                change_type: entry.change_type,
                previous_values: entry.previous_values,
                new_values: entry.new_values,
            });
            rollup.last_modified_by_import = entry.import_id.clone();
            rollup.last_modified_at = entry.event_date;
            rollup.current_status = match event_type {
                LineageEventType::Deleted => LineageStatus::Deleted,
                _ => LineageStatus::Active,
            };

            batch.push(UpsertOne { filter: doc! { "_id": &rollup.id }, replacement: to_document(&rollup)? });
        }

        if !batch.is_empty() {
            self.lineage.bulk_upsert(batch).await?;
        }
        Ok(())
    }

    fn is_duplicate(&self, rollup: &RecordLineage, entry: &LineageEntry, event_type: LineageEventType) -> bool {
        rollup
            .events
            .iter()
            .any(|e| e.event_type == event_type && e.import_id == entry.import_id && e.event_date == entry.event_date)
    }

    fn next_event_type(&self, doc: &Document, entry: &LineageEntry) -> Result<Option<LineageEventType>, Error> {
        let rollup: RecordLineage = bson::from_document(doc.clone())?;
        let was_deleted = matches!(rollup.current_status, LineageStatus::Deleted);
        Ok(Some(match entry.change_type {
            ChangeType::Delete if !was_deleted => LineageEventType::Deleted,
            ChangeType::Delete => return Ok(None),
            _ if was_deleted => LineageEventType::Undeleted,
            _ => LineageEventType::Updated,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::docstore::memory::InMemoryDocumentStore;

    #[tokio::test]
    async fn created_then_updated_builds_a_well_formed_rollup() {
        let store = InMemoryDocumentStore::new();
        let recorder = LineageRecorder::new(&store);
        let now = Utc::now();

        recorder
            .record(vec![LineageEntry {
                collection: "keepers".into(),
                record_id: "r1".into(),
                import_id: "import-1".into(),
                file_key: "f1".into(),
                event_date: now,
                change_type: ChangeType::Insert,
                previous_values: None,
                new_values: Some(doc! { "NAME": "Alice" }),
            }])
            .await
            .unwrap();

        recorder
            .record(vec![LineageEntry {
                collection: "keepers".into(),
                record_id: "r1".into(),
                import_id: "import-2".into(),
                file_key: "f2".into(),
                event_date: now + chrono::Duration::seconds(1),
                change_type: ChangeType::Update,
                previous_values: Some(doc! { "NAME": "Alice" }),
                new_values: Some(doc! { "NAME": "Alice Jones" }),
            }])
            .await
            .unwrap();

        let rollup_doc = store.collection(COLLECTION).find_one(doc! { "_id": "keepers:r1" }).await.unwrap().unwrap();
        let rollup: RecordLineage = bson::from_document(rollup_doc).unwrap();
        assert_eq!(rollup.events.len(), 2);
        assert!(crate::model::lineage::lineage_events_are_well_formed(&rollup.events));
        assert_eq!(rollup.created_by_import, "import-1");
        assert_eq!(rollup.last_modified_by_import, "import-2");
    }

    #[tokio::test]
    async fn duplicate_delivery_of_the_same_event_is_not_recorded_twice() {
        let store = InMemoryDocumentStore::new();
        let recorder = LineageRecorder::new(&store);
        let now = Utc::now();
        let entry = || LineageEntry {
            collection: "keepers".into(),
            record_id: "r1".into(),
            import_id: "import-1".into(),
            file_key: "f1".into(),
            event_date: now,
            change_type: ChangeType::Insert,
            previous_values: None,
            new_values: Some(doc! { "NAME": "Alice" }),
        };

        recorder.record(vec![entry()]).await.unwrap();
        recorder.record(vec![entry()]).await.unwrap();

        let rollup_doc = store.collection(COLLECTION).find_one(doc! { "_id": "keepers:r1" }).await.unwrap().unwrap();
        let rollup: RecordLineage = bson::from_document(rollup_doc).unwrap();
        assert_eq!(rollup.events.len(), 1);
    }
}
