//! Streams decrypted CSVs from the target store, parses them row-by-row,
//! and hands batches to the `UpsertEngine`/`LineageRecorder` — §4.5.

use bson::{doc, Bson, Document};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;

use crate::catalogue::{DateRange, FileCatalogue};
use crate::dedup::Deduper;
use crate::docstore::DocumentStore;
use crate::errors::Error;
use crate::frames::RowBatches;
use crate::lineage_recorder::{entries_from_row_results, LineageRecorder};
use crate::model::{ChangeType, DatasetDefinition, FileProcessingReport, FileStatus, IngestionDetail};
use crate::objectstore::ObjectStoreReader;
use crate::record_id::record_id;
use crate::upsert::{UpsertEngine, UpsertRow};

const DEFAULT_BATCH_SIZE: usize = 1000;

pub struct IngestionOutcome {
    pub reports: Vec<FileProcessingReport>,
    pub files_discovered: u64,
    pub files_processed: u64,
    pub files_skipped: u64,
    pub files_failed: u64,
    pub records_created: u64,
    pub records_updated: u64,
    pub records_deleted: u64,
}

/// Owns `Arc`-wrapped collaborators (rather than borrows) so the import
/// orchestrator can spawn ingestion as a detached background task.
pub struct IngestionStage {
    target: Arc<dyn ObjectStoreReader>,
    store: Arc<dyn DocumentStore>,
    deduper: Deduper,
    batch_size: usize,
}

impl IngestionStage {
    pub fn new(target: Arc<dyn ObjectStoreReader>, store: Arc<dyn DocumentStore>, deduper: Deduper) -> Self {
        Self { target, store, deduper, batch_size: DEFAULT_BATCH_SIZE }
    }

    pub async fn run(&self, import_id: &str, definitions: &[DatasetDefinition], range: DateRange, now: DateTime<Utc>) -> Result<IngestionOutcome, Error> {
        let catalogue = FileCatalogue::new(self.target.as_ref());
        let resolved = catalogue.resolve(definitions, range).await?;

        let mut outcome = IngestionOutcome {
            reports: Vec::new(),
            files_discovered: 0,
            files_processed: 0,
            files_skipped: 0,
            files_failed: 0,
            records_created: 0,
            records_updated: 0,
            records_deleted: 0,
        };

        for definition in definitions {
            let Some(files) = resolved.get(&definition.name) else { continue };
            for object in files {
                outcome.files_discovered += 1;

                if self.deduper.already_processed(&object.key, &object.e_tag, FileStatus::Ingested).await? {
                    outcome.files_skipped += 1;
                    outcome.reports.push(self.skipped_report(import_id, definition, &object.key, &object.e_tag, object.size));
                    continue;
                }

                match self.ingest_one(import_id, definition, &object.key, &object.e_tag, object.size, now).await {
                    Ok(report) => {
                        outcome.records_created += report.ingestion.as_ref().map(|i| i.records_created).unwrap_or(0);
                        outcome.records_updated += report.ingestion.as_ref().map(|i| i.records_updated).unwrap_or(0);
                        outcome.records_deleted += report.ingestion.as_ref().map(|i| i.records_deleted).unwrap_or(0);
                        outcome.files_processed += 1;
                        outcome.reports.push(report);
                    }
                    Err(err) => {
                        outcome.files_failed += 1;
                        outcome.reports.push(FileProcessingReport {
                            id: format!("{import_id}:{}", object.key),
                            import_id: import_id.to_string(),
                            file_name: file_name(&object.key),
                            file_key: object.key.clone(),
                            dataset_name: definition.name.clone(),
                            md5: None,
                            e_tag: object.e_tag.clone(),
                            file_size: object.size,
                            status: FileStatus::Failed,
                            acquisition: None,
                            ingestion: None,
                            error: Some(err.to_string()),
                        });
                    }
                }
            }
        }

        Ok(outcome)
    }

    async fn ingest_one(&self, import_id: &str, definition: &DatasetDefinition, file_key: &str, e_tag: &str, file_size: u64, now: DateTime<Utc>) -> Result<FileProcessingReport, Error> {
        let started = std::time::Instant::now();
        let mut stream = self.target.open_read(file_key).await?;
        let mut body = Vec::new();
        while let Some(chunk) = stream.next().await {
            body.extend_from_slice(&chunk?);
        }

        let delimiter = detect_delimiter(&body);
        let mut reader = csv::ReaderBuilder::new().delimiter(delimiter).from_reader(body.as_slice());
        let headers = reader.headers().map_err(Error::Csv)?.clone();

        for column in &definition.primary_key_columns {
            if !headers.iter().any(|h| h == column) {
                return Err(Error::PermanentIo(format!("MissingPrimaryKeyColumn: {column} absent from {file_key} header")));
            }
        }

        let engine = UpsertEngine::new(definition.accumulator_columns.clone());
        let recorder = LineageRecorder::new(self.store.as_ref());

        let rows = reader.records().map(|record| parse_row(record.map_err(Error::Csv)?, &headers, definition));
        let mut created = 0u64;
        let mut updated = 0u64;
        let mut deleted = 0u64;
        let mut processed = 0u64;

        for batch in RowBatches::new(rows, self.batch_size) {
            let batch = batch?;
            processed += batch.len() as u64;
            let (counts, results) = engine.apply(self.store.as_ref(), &definition.name, batch, now).await?;
            created += counts.created;
            updated += counts.updated + counts.undeleted;
            deleted += counts.deleted;

            let entries = entries_from_row_results(&definition.name, import_id, file_key, &results, now);
            recorder.record(entries).await?;
        }

        Ok(FileProcessingReport {
            id: format!("{import_id}:{file_key}"),
            import_id: import_id.to_string(),
            file_name: file_name(file_key),
            file_key: file_key.to_string(),
            dataset_name: definition.name.clone(),
            md5: None,
            e_tag: e_tag.to_string(),
            file_size,
            status: FileStatus::Ingested,
            acquisition: None,
            ingestion: Some(IngestionDetail {
                records_processed: processed,
                records_created: created,
                records_updated: updated,
                records_deleted: deleted,
                ingestion_duration_ms: started.elapsed().as_millis() as u64,
                ingested_at: Utc::now(),
            }),
            error: None,
        })
    }

    fn skipped_report(&self, import_id: &str, definition: &DatasetDefinition, file_key: &str, e_tag: &str, file_size: u64) -> FileProcessingReport {
        FileProcessingReport {
            id: format!("{import_id}:{file_key}"),
            import_id: import_id.to_string(),
            file_name: file_name(file_key),
            file_key: file_key.to_string(),
            dataset_name: definition.name.clone(),
            md5: None,
            e_tag: e_tag.to_string(),
            file_size,
            status: FileStatus::Skipped,
            acquisition: None,
            ingestion: None,
            error: None,
        }
    }
}

fn file_name(key: &str) -> String {
    key.rsplit('/').next().unwrap_or(key).to_string()
}

/// The header's first line is scanned for `|` before `,`; defaulting to
/// comma when neither or both occur, matching the "auto-detect `,` or `|`"
/// contract.
fn detect_delimiter(body: &[u8]) -> u8 {
    let first_line_end = body.iter().position(|&b| b == b'\n').unwrap_or(body.len());
    let first_line = &body[..first_line_end];
    if first_line.contains(&b'|') && !first_line.contains(&b',') {
        b'|'
    } else {
        b','
    }
}

fn parse_row(record: csv::StringRecord, headers: &csv::StringRecord, definition: &DatasetDefinition) -> Result<UpsertRow, Error> {
    let mut columns = Document::new();
    let mut row_values: HashMap<&str, &str> = HashMap::new();
    for (header, value) in headers.iter().zip(record.iter()) {
        columns.insert(header, Bson::String(value.to_string()));
        row_values.insert(header, value);
    }

    let key_parts: Vec<&str> = definition
        .primary_key_columns
        .iter()
        .map(|col| row_values.get(col.as_str()).copied().unwrap_or(""))
        .collect();
    let record_id = record_id(&key_parts)?;

    let change_type = definition
        .change_type_column
        .as_ref()
        .and_then(|col| row_values.get(col.as_str()))
        .map(|raw| ChangeType::parse(raw))
        .unwrap_or_default();

    if let Some(col) = &definition.change_type_column {
        columns.remove(col);
    }

    Ok(UpsertRow { record_id, columns, change_type })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::docstore::memory::InMemoryDocumentStore;
    use crate::objectstore::s3::S3ObjectStore;
    use crate::objectstore::ObjectStoreWriter;
    use bytes::Bytes;

    fn keepers_def() -> DatasetDefinition {
        DatasetDefinition::new("KEEPERS", "LITP_KEEPERS_{0}", vec!["KEEPER_ID".into()])
    }

    #[tokio::test]
    async fn ingests_a_comma_delimited_file_and_records_lineage() {
        let target = S3ObjectStore::in_memory("target", "");
        target
            .upload("LITP_KEEPERS_20260101000000.csv", Bytes::from_static(b"KEEPER_ID,NAME,CHANGETYPE\nK1,Alice,I\nK2,Bob,I\n"), None, None)
            .await
            .unwrap();

        let store = InMemoryDocumentStore::new();
        let deduper = Deduper::new(&store);
        let store: Arc<dyn DocumentStore> = Arc::new(store);
        let stage = IngestionStage::new(Arc::new(target), store.clone(), deduper);

        let range = DateRange { from: chrono::NaiveDate::from_ymd_opt(2026, 1, 1).unwrap(), to: chrono::NaiveDate::from_ymd_opt(2026, 1, 2).unwrap() };
        let now = Utc::now();
        let outcome = stage.run("import-1", &[keepers_def()], range, now).await.unwrap();

        assert_eq!(outcome.files_processed, 1);
        assert_eq!(outcome.records_created, 2);
        assert_eq!(outcome.reports[0].status, FileStatus::Ingested);

        let count = store.collection("KEEPERS").count(Document::new()).await.unwrap();
        assert_eq!(count, 2);
        let lineage_count = store.collection(crate::lineage_recorder::COLLECTION).count(Document::new()).await.unwrap();
        assert_eq!(lineage_count, 2);
    }

    #[tokio::test]
    async fn pipe_delimited_files_are_auto_detected() {
        let target = S3ObjectStore::in_memory("target", "");
        target
            .upload("LITP_KEEPERS_20260101000000.csv", Bytes::from_static(b"KEEPER_ID|NAME\nK1|Alice\n"), None, None)
            .await
            .unwrap();

        let store = InMemoryDocumentStore::new();
        let deduper = Deduper::new(&store);
        let stage = IngestionStage::new(Arc::new(target), Arc::new(store), deduper);
        let range = DateRange { from: chrono::NaiveDate::from_ymd_opt(2026, 1, 1).unwrap(), to: chrono::NaiveDate::from_ymd_opt(2026, 1, 2).unwrap() };
        let outcome = stage.run("import-1", &[keepers_def().with_change_type_column(None::<String>)], range, Utc::now()).await.unwrap();
        assert_eq!(outcome.records_created, 1);
    }

    #[tokio::test]
    async fn missing_primary_key_column_fails_the_file_permanently() {
        let target = S3ObjectStore::in_memory("target", "");
        target.upload("LITP_KEEPERS_20260101000000.csv", Bytes::from_static(b"NAME\nAlice\n"), None, None).await.unwrap();

        let store = InMemoryDocumentStore::new();
        let deduper = Deduper::new(&store);
        let stage = IngestionStage::new(Arc::new(target), Arc::new(store), deduper);
        let range = DateRange { from: chrono::NaiveDate::from_ymd_opt(2026, 1, 1).unwrap(), to: chrono::NaiveDate::from_ymd_opt(2026, 1, 2).unwrap() };
        let outcome = stage.run("import-1", &[keepers_def()], range, Utc::now()).await.unwrap();
        assert_eq!(outcome.files_failed, 1);
        assert!(outcome.reports[0].error.as_ref().unwrap().contains("MissingPrimaryKeyColumn"));
    }

    #[tokio::test]
    async fn already_ingested_files_are_skipped_on_rerun() {
        let target = S3ObjectStore::in_memory("target", "");
        target.upload("LITP_KEEPERS_20260101000000.csv", Bytes::from_static(b"KEEPER_ID,NAME\nK1,Alice\n"), None, None).await.unwrap();

        let store = InMemoryDocumentStore::new();
        let deduper = Deduper::new(&store);
        let store: Arc<dyn DocumentStore> = Arc::new(store);
        let stage = IngestionStage::new(Arc::new(target), store.clone(), deduper);
        let range = DateRange { from: chrono::NaiveDate::from_ymd_opt(2026, 1, 1).unwrap(), to: chrono::NaiveDate::from_ymd_opt(2026, 1, 2).unwrap() };
        let now = Utc::now();
        let first = stage.run("import-1", &[keepers_def().with_change_type_column(None::<String>)], range, now).await.unwrap();
        assert_eq!(first.files_processed, 1);

        let file_reports = store.collection("file_processing_reports");
        for report in &first.reports {
            file_reports.insert_one(crate::docstore::to_document(report).unwrap()).await.unwrap();
        }

        let second = stage.run("import-2", &[keepers_def().with_change_type_column(None::<String>)], range, now).await.unwrap();
        assert_eq!(second.files_skipped, 1);
        assert_eq!(second.files_processed, 0);
    }
}
