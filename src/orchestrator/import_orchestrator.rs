//! Serializes import runs behind the `import` lock and drives acquisition
//! then ingestion to completion as a detached background task, returning the
//! persisted `ImportReport` to the caller before the pipeline finishes —
//! §4.12, §5.

use chrono::Utc;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::acquisition::{AcquisitionStage, PasswordSaltProvider, StreamDecryptor};
use crate::catalogue::DateRange;
use crate::config::Tuning;
use crate::dedup::Deduper;
use crate::docstore::{to_document, DocumentStore};
use crate::errors::Error;
use crate::ingestion::IngestionStage;
use crate::lock::LockService;
use crate::model::dataset::DatasetRegistry;
use crate::model::import::{ImportReport, ImportSourceType, ImportStatus, PhaseStatus};
use crate::objectstore::s3::S3ObjectStore;
use crate::objectstore::{ObjectStoreReader, ObjectStoreWriter};
use crate::reporting::IMPORT_REPORTS_COLLECTION;

use super::IMPORT_LOCK;

pub struct ImportOrchestrator {
    store: Arc<dyn DocumentStore>,
    source: Arc<S3ObjectStore>,
    target: Arc<S3ObjectStore>,
    registry: Arc<DatasetRegistry>,
    decryptor: Arc<dyn StreamDecryptor>,
    password_salt: Arc<dyn PasswordSaltProvider>,
    locks: Arc<LockService>,
    tuning: Tuning,
}

impl ImportOrchestrator {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        source: Arc<S3ObjectStore>,
        target: Arc<S3ObjectStore>,
        registry: Arc<DatasetRegistry>,
        decryptor: Arc<dyn StreamDecryptor>,
        password_salt: Arc<dyn PasswordSaltProvider>,
        locks: Arc<LockService>,
        tuning: Tuning,
    ) -> Self {
        Self { store, source, target, registry, decryptor, password_salt, locks, tuning }
    }

    /// Returns `Ok(None)` if another import already holds the lock; otherwise
    /// persists a `Started` report, spawns the pipeline, and returns
    /// immediately with that report.
    pub async fn start_import(&self, source_type: ImportSourceType) -> Result<Option<ImportReport>, Error> {
        let holder = format!("import-{}", Uuid::new_v4());
        let guard = match self.locks.acquire(IMPORT_LOCK, &holder, self.tuning.lock_acquire_timeout(), std::time::Duration::from_millis(50)).await {
            Ok(guard) => guard,
            Err(Error::Conflict(_)) => return Ok(None),
            Err(err) => return Err(err),
        };

        let now = Utc::now();
        let import_id = Uuid::new_v4().to_string();
        let report = ImportReport::new(import_id.clone(), source_type, now);
        let imports = self.store.collection(IMPORT_REPORTS_COLLECTION);
        imports.insert_one(to_document(&report)?).await?;

        let store = self.store.clone();
        let source: Arc<dyn ObjectStoreReader> = self.source.clone();
        let target_writer: Arc<dyn ObjectStoreWriter> = self.target.clone();
        let target_reader: Arc<dyn ObjectStoreReader> = self.target.clone();
        let registry = self.registry.clone();
        let decryptor = self.decryptor.clone();
        let password_salt = self.password_salt.clone();
        let acquisition_workers = self.tuning.acquisition_workers;
        let batch_size = self.tuning.ingestion_batch_size;

        tokio::spawn(async move {
            let result = run_import(
                store.clone(),
                source,
                target_writer,
                target_reader,
                registry,
                decryptor,
                password_salt,
                &import_id,
                source_type,
                acquisition_workers,
                batch_size,
            )
            .await;

            if let Err(err) = result {
                error!(import_id = %import_id, error = %err, "import pipeline failed");
                let imports = store.collection(IMPORT_REPORTS_COLLECTION);
                if let Some(doc) = imports.find_one(bson::doc! { "_id": &import_id }).await.ok().flatten() {
                    if let Ok(mut report) = bson::from_document::<ImportReport>(doc) {
                        report.complete(ImportStatus::Failed, Some(err.to_string()), Utc::now());
                        let _ = imports.replace_one(bson::doc! { "_id": &import_id }, to_document(&report).unwrap()).await;
                    }
                }
            }

            if let Err(err) = guard.release().await {
                warn!(error = %err, "failed to release import lock");
            }
        });

        Ok(Some(report))
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_import(
    store: Arc<dyn DocumentStore>,
    source: Arc<dyn ObjectStoreReader>,
    target_writer: Arc<dyn ObjectStoreWriter>,
    target_reader: Arc<dyn ObjectStoreReader>,
    registry: Arc<DatasetRegistry>,
    decryptor: Arc<dyn StreamDecryptor>,
    password_salt: Arc<dyn PasswordSaltProvider>,
    import_id: &str,
    source_type: ImportSourceType,
    acquisition_workers: usize,
    batch_size: usize,
) -> Result<(), Error> {
    let imports = store.collection(IMPORT_REPORTS_COLLECTION);
    let deduper = Deduper::new(store.as_ref());

    if matches!(source_type, ImportSourceType::External) {
        let started = Utc::now();
        update_phase(&imports, import_id, |r| {
            r.acquisition.status = PhaseStatus::Started;
            r.acquisition.started_at = Some(started);
        })
        .await?;

        let stage = AcquisitionStage::new(source, target_writer, registry.clone(), decryptor, password_salt, deduper.clone(), acquisition_workers.max(1));
        let outcome = stage.run(import_id).await?;

        let all_failed = outcome.files_discovered > 0 && outcome.files_failed == outcome.files_discovered;
        update_phase(&imports, import_id, |r| {
            r.acquisition.status = if all_failed { PhaseStatus::Failed } else { PhaseStatus::Completed };
            r.acquisition.completed_at = Some(Utc::now());
            r.acquisition.counts.files_discovered = outcome.files_discovered;
            r.acquisition.counts.files_processed = outcome.files_processed;
            r.acquisition.counts.files_skipped = outcome.files_skipped;
            r.acquisition.counts.files_failed = outcome.files_failed;
        })
        .await?;

        let reports = store.collection(crate::dedup::FILE_REPORTS_COLLECTION);
        for report in &outcome.reports {
            reports.insert_one(to_document(report)?).await?;
        }

        if all_failed {
            update_phase(&imports, import_id, |r| r.complete(ImportStatus::Failed, Some("all acquisition files failed".to_string()), Utc::now())).await?;
            return Ok(());
        } else if outcome.files_failed > 0 {
            info!(import_id, files_failed = outcome.files_failed, "acquisition completed with failures, continuing to ingestion");
        }
    } else {
        update_phase(&imports, import_id, |r| {
            r.acquisition.status = PhaseStatus::Completed;
            r.acquisition.started_at = Some(Utc::now());
            r.acquisition.completed_at = Some(Utc::now());
        })
        .await?;
    }

    let ingestion_started = Utc::now();
    update_phase(&imports, import_id, |r| {
        r.ingestion.status = PhaseStatus::Started;
        r.ingestion.started_at = Some(ingestion_started);
    })
    .await?;

    let ingestion_stage = IngestionStage::new(target_reader, store.clone(), deduper);
    let range = DateRange::today(Utc::now());
    let outcome = ingestion_stage.run(import_id, registry.all(), range, Utc::now()).await?;

    let reports = store.collection(crate::dedup::FILE_REPORTS_COLLECTION);
    for report in &outcome.reports {
        reports.insert_one(to_document(report)?).await?;
    }

    let all_failed = outcome.files_discovered > 0 && outcome.files_failed == outcome.files_discovered;
    update_phase(&imports, import_id, |r| {
        r.ingestion.status = if all_failed { PhaseStatus::Failed } else { PhaseStatus::Completed };
        r.ingestion.completed_at = Some(Utc::now());
        r.ingestion.counts.files_discovered = outcome.files_discovered;
        r.ingestion.counts.files_processed = outcome.files_processed;
        r.ingestion.counts.files_skipped = outcome.files_skipped;
        r.ingestion.counts.files_failed = outcome.files_failed;
        r.ingestion.records.records_created = outcome.records_created;
        r.ingestion.records.records_updated = outcome.records_updated;
        r.ingestion.records.records_deleted = outcome.records_deleted;
    })
    .await?;

    let final_status = if all_failed { ImportStatus::Failed } else { ImportStatus::Completed };
    let final_error = if all_failed { Some(format!("{} file(s) failed ingestion", outcome.files_failed)) } else { None };
    update_phase(&imports, import_id, |r| {
        r.complete(final_status, final_error.clone(), Utc::now());
    })
    .await?;

    Ok(())
}

async fn update_phase(imports: &Arc<dyn crate::docstore::Collection>, import_id: &str, mutate: impl FnOnce(&mut ImportReport)) -> Result<(), Error> {
    let Some(doc) = imports.find_one(bson::doc! { "_id": import_id }).await? else {
        return Err(Error::NotFound(format!("import report {import_id} vanished mid-run")));
    };
    let mut report: ImportReport = bson::from_document(doc)?;
    mutate(&mut report);
    imports.replace_one(bson::doc! { "_id": import_id }, to_document(&report)?).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acquisition::IdentityDecryptor;
    use crate::docstore::memory::InMemoryDocumentStore;
    use crate::model::dataset::DatasetDefinition;
    use bytes::Bytes;
    use std::time::Duration;

    struct FixedSalt;
    impl PasswordSaltProvider for FixedSalt {
        fn derive(&self, _object_key: &str) -> (Vec<u8>, Vec<u8>) {
            (b"password".to_vec(), b"salt".to_vec())
        }
    }

    fn orchestrator(store: Arc<dyn DocumentStore>, source: Arc<S3ObjectStore>, target: Arc<S3ObjectStore>) -> ImportOrchestrator {
        let registry = Arc::new(DatasetRegistry::new(vec![DatasetDefinition::new("KEEPERS", "LITP_KEEPERS_{0}", vec!["KEEPER_ID".into()]).with_change_type_column(None::<String>)]));
        let locks = Arc::new(LockService::new(store.as_ref(), Duration::from_secs(30), Duration::from_secs(10)));
        ImportOrchestrator::new(store, source, target, registry, Arc::new(IdentityDecryptor), Arc::new(FixedSalt), locks, Tuning::default())
    }

    #[tokio::test]
    async fn an_external_import_acquires_then_ingests_and_completes() {
        let store: Arc<dyn DocumentStore> = Arc::new(InMemoryDocumentStore::new());
        let source = Arc::new(S3ObjectStore::in_memory("source", ""));
        let target = Arc::new(S3ObjectStore::in_memory("target", ""));
        source.upload("LITP_KEEPERS_20260101000000.csv.enc", Bytes::from_static(b"KEEPER_ID,NAME\nK1,Alice\n"), None, None).await.unwrap();

        let orchestrator = orchestrator(store.clone(), source, target);
        let report = orchestrator.start_import(ImportSourceType::External).await.unwrap().unwrap();
        assert_eq!(report.status, ImportStatus::Started);

        let imports = store.collection(IMPORT_REPORTS_COLLECTION);
        let final_report = wait_for_completion(imports.as_ref(), &report.id).await;
        assert_eq!(final_report.status, ImportStatus::Completed);
        assert_eq!(final_report.acquisition.counts.files_processed, 1);
        assert_eq!(final_report.ingestion.records.records_created, 1);
    }

    #[tokio::test]
    async fn a_second_import_is_rejected_while_one_is_in_flight() {
        let store: Arc<dyn DocumentStore> = Arc::new(InMemoryDocumentStore::new());
        let source = Arc::new(S3ObjectStore::in_memory("source", ""));
        let target = Arc::new(S3ObjectStore::in_memory("target", ""));

        let orchestrator = orchestrator(store.clone(), source, target);
        let holder = "test-holder".to_string();
        let guard = orchestrator.locks.acquire(IMPORT_LOCK, &holder, Duration::from_millis(10), Duration::from_millis(5)).await.unwrap();

        let second = orchestrator.start_import(ImportSourceType::External).await.unwrap();
        assert!(second.is_none());

        guard.release().await.unwrap();
    }

    async fn wait_for_completion(imports: &dyn crate::docstore::Collection, import_id: &str) -> ImportReport {
        for _ in 0..100 {
            if let Some(doc) = imports.find_one(bson::doc! { "_id": import_id }).await.unwrap() {
                let report: ImportReport = bson::from_document(doc).unwrap();
                if report.status != ImportStatus::Started {
                    return report;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("import {import_id} did not complete in time");
    }
}
