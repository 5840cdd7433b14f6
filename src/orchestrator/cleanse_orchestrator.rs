//! Serializes cleanse-analysis runs behind the `cleanse-analysis` lock, runs
//! every registered strategy, exports active issues as a zipped CSV, and
//! emails the report link — §4.12 step (c)-(e), §5.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, warn};
use uuid::Uuid;

use crate::analysis::{AnalysisMetrics, ErasedStrategy};
use crate::config::Tuning;
use crate::docstore::{to_document, DocumentStore};
use crate::errors::Error;
use crate::export::Exporter;
use crate::issues::IssueRepository;
use crate::lock::LockService;
use crate::model::cleanse::{AnalysisOperationStatus, CleanseAnalysisOperation};
use crate::notify::NotificationSink;
use crate::objectstore::s3::S3ObjectStore;

use super::CLEANSE_LOCK;

pub const CLEANSE_OPERATIONS_COLLECTION: &str = "cleanse_analysis_operations";

pub struct CleanseOrchestrator {
    store: Arc<dyn DocumentStore>,
    report_sink: Arc<S3ObjectStore>,
    notifications: Arc<dyn NotificationSink>,
    locks: Arc<LockService>,
    strategies: Vec<Arc<dyn ErasedStrategy>>,
    tuning: Tuning,
}

impl CleanseOrchestrator {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        report_sink: Arc<S3ObjectStore>,
        notifications: Arc<dyn NotificationSink>,
        locks: Arc<LockService>,
        strategies: Vec<Arc<dyn ErasedStrategy>>,
        tuning: Tuning,
    ) -> Self {
        Self { store, report_sink, notifications, locks, strategies, tuning }
    }

    /// Returns `Ok(None)` if another analysis already holds the lock;
    /// otherwise persists a `Running` operation, spawns the pipeline, and
    /// returns immediately with that operation.
    pub async fn start_analysis(&self) -> Result<Option<CleanseAnalysisOperation>, Error> {
        let holder = format!("cleanse-{}", Uuid::new_v4());
        let guard = match self.locks.acquire(CLEANSE_LOCK, &holder, self.tuning.lock_acquire_timeout(), Duration::from_millis(50)).await {
            Ok(guard) => guard,
            Err(Error::Conflict(_)) => return Ok(None),
            Err(err) => return Err(err),
        };

        let now = Utc::now();
        let operation_id = Uuid::new_v4().to_string();
        let operation = CleanseAnalysisOperation::new(operation_id.clone(), now);
        let operations = self.store.collection(CLEANSE_OPERATIONS_COLLECTION);
        operations.insert_one(to_document(&operation)?).await?;

        let store = self.store.clone();
        let report_sink = self.report_sink.clone();
        let notifications = self.notifications.clone();
        let strategies = self.strategies.clone();
        let presign_ttl = self.tuning.presign_ttl();

        tokio::spawn(async move {
            let result = run_analysis(store.clone(), report_sink, notifications, strategies, &operation_id, presign_ttl).await;

            if let Err(err) = result {
                error!(operation_id = %operation_id, error = %err, "cleanse analysis failed");
                let operations = store.collection(CLEANSE_OPERATIONS_COLLECTION);
                if let Some(doc) = operations.find_one(bson::doc! { "_id": &operation_id }).await.ok().flatten() {
                    if let Ok(mut operation) = bson::from_document::<CleanseAnalysisOperation>(doc) {
                        operation.fail(err.to_string(), Utc::now());
                        let _ = operations.replace_one(bson::doc! { "_id": &operation_id }, to_document(&operation).unwrap()).await;
                    }
                }
            }

            if let Err(err) = guard.release().await {
                warn!(error = %err, "failed to release cleanse-analysis lock");
            }
        });

        Ok(Some(operation))
    }

    /// Looks up a past operation and re-presigns its stored report object,
    /// updating `report_url` in place. Fails if the operation never produced
    /// a report (still running, or failed before export).
    pub async fn regenerate_report_url(&self, operation_id: &str) -> Result<CleanseAnalysisOperation, Error> {
        let operations = self.store.collection(CLEANSE_OPERATIONS_COLLECTION);
        let doc = operations
            .find_one(bson::doc! { "_id": operation_id })
            .await?
            .ok_or_else(|| Error::NotFound(format!("cleanse analysis operation {operation_id} not found")))?;
        let mut operation: CleanseAnalysisOperation = bson::from_document(doc)?;

        let object_key = operation
            .report_object_key
            .clone()
            .ok_or_else(|| Error::InputInvalid(format!("operation {operation_id} has no report to regenerate a link for")))?;

        use crate::objectstore::ObjectStoreReader;
        operation.report_url = Some(self.report_sink.presign(&object_key, self.tuning.presign_ttl())?);
        operations.replace_one(bson::doc! { "_id": operation_id }, to_document(&operation)?).await?;
        Ok(operation)
    }
}

async fn run_analysis(
    store: Arc<dyn DocumentStore>,
    report_sink: Arc<S3ObjectStore>,
    notifications: Arc<dyn NotificationSink>,
    strategies: Vec<Arc<dyn ErasedStrategy>>,
    operation_id: &str,
    presign_ttl: Duration,
) -> Result<(), Error> {
    let operations = store.collection(CLEANSE_OPERATIONS_COLLECTION);
    let now = Utc::now();

    let mut total = AnalysisMetrics::default();
    for strategy in &strategies {
        let metrics = strategy.run_erased(store.as_ref(), operation_id, now).await?;
        total.records_analyzed += metrics.records_analyzed;
        total.total_records += metrics.total_records;
        total.issues_found += metrics.issues_found;
        total.issues_resolved += metrics.issues_resolved;

        let (analyzed, records, found, resolved) = (total.records_analyzed, total.total_records, total.issues_found, total.issues_resolved);
        update_operation(&operations, operation_id, |op| op.report_progress(analyzed, records, found, resolved)).await?;
    }

    let issues = IssueRepository::new(store.as_ref());
    let exporter = Exporter::new(&issues, report_sink.as_ref());
    let exported = exporter.export(operation_id, presign_ttl).await?;

    update_operation(&operations, operation_id, |op| {
        op.report_object_key = Some(exported.object_key.clone());
        op.report_url = Some(exported.presigned_url.clone());
    })
    .await?;

    if let Err(err) = notifications.send_report(&exported.presigned_url).await {
        warn!(operation_id, error = %err, "failed to send cleanse report notification");
        update_operation(&operations, operation_id, |op| op.error = Some(format!("notification failed: {err}"))).await?;
    }

    update_operation(&operations, operation_id, |op| op.complete(Utc::now())).await?;
    Ok(())
}

async fn update_operation(operations: &Arc<dyn crate::docstore::Collection>, operation_id: &str, mutate: impl FnOnce(&mut CleanseAnalysisOperation)) -> Result<(), Error> {
    let Some(doc) = operations.find_one(bson::doc! { "_id": operation_id }).await? else {
        return Err(Error::NotFound(format!("cleanse analysis operation {operation_id} vanished mid-run")));
    };
    let mut operation: CleanseAnalysisOperation = bson::from_document(doc)?;
    mutate(&mut operation);
    operations.replace_one(bson::doc! { "_id": operation_id }, to_document(&operation)?).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::AnalysisStrategy;
    use crate::docstore::memory::InMemoryDocumentStore;
    use crate::notify::NullNotificationSink;
    use crate::query::Filter;
    use crate::rules::Pipeline;

    struct NeverNotifiedSink;
    #[async_trait::async_trait]
    impl NotificationSink for NeverNotifiedSink {
        async fn send_report(&self, _url: &str) -> Result<(), Error> {
            Err(Error::TransientIo { message: "smtp down".to_string(), attempts: 1 })
        }
        async fn send_test(&self, _addr: &str) -> Result<(), Error> {
            Ok(())
        }
    }

    fn empty_strategy() -> Arc<dyn ErasedStrategy> {
        Arc::new(AnalysisStrategy {
            outer_collection: "cts_movements".to_string(),
            outer_filter: Filter::Empty,
            issue_codes: vec!["SAM_RECORD_MISSING".to_string()],
            pipeline: Pipeline::<bson::Document>::new(),
            build_carrier: Box::new(|doc: bson::Document| Some(doc)),
            identifiers: Box::new(|_doc: &bson::Document| (String::new(), String::new())),
            page_size: 500,
            progress_every: 1,
        })
    }

    #[tokio::test]
    async fn a_run_with_no_active_issues_exports_an_empty_report_and_completes() {
        let store: Arc<dyn DocumentStore> = Arc::new(InMemoryDocumentStore::new());
        let report_sink = Arc::new(S3ObjectStore::in_memory("reports", "cleanse"));
        let locks = Arc::new(LockService::new(store.as_ref(), Duration::from_secs(30), Duration::from_secs(10)));
        let orchestrator = CleanseOrchestrator::new(store.clone(), report_sink, Arc::new(NullNotificationSink::default()), locks, vec![empty_strategy()], Tuning::default());

        let operation = orchestrator.start_analysis().await.unwrap().unwrap();
        assert_eq!(operation.status, AnalysisOperationStatus::Running);

        let operations = store.collection(CLEANSE_OPERATIONS_COLLECTION);
        let final_op = wait_for_completion(operations.as_ref(), &operation.id).await;
        assert_eq!(final_op.status, AnalysisOperationStatus::Completed);
        assert!(final_op.report_object_key.is_some());
        assert!(final_op.report_url.is_some());
    }

    #[tokio::test]
    async fn a_failed_notification_still_completes_the_operation_with_an_error_recorded() {
        let store: Arc<dyn DocumentStore> = Arc::new(InMemoryDocumentStore::new());
        let report_sink = Arc::new(S3ObjectStore::in_memory("reports", "cleanse"));
        let locks = Arc::new(LockService::new(store.as_ref(), Duration::from_secs(30), Duration::from_secs(10)));
        let orchestrator = CleanseOrchestrator::new(store.clone(), report_sink, Arc::new(NeverNotifiedSink), locks, vec![empty_strategy()], Tuning::default());

        let operation = orchestrator.start_analysis().await.unwrap().unwrap();
        let operations = store.collection(CLEANSE_OPERATIONS_COLLECTION);
        let final_op = wait_for_completion(operations.as_ref(), &operation.id).await;
        assert_eq!(final_op.status, AnalysisOperationStatus::Completed);
        assert!(final_op.error.as_ref().unwrap().contains("notification failed"));
    }

    #[tokio::test]
    async fn regenerating_a_report_url_requires_a_prior_export() {
        let store: Arc<dyn DocumentStore> = Arc::new(InMemoryDocumentStore::new());
        let report_sink = Arc::new(S3ObjectStore::in_memory("reports", "cleanse"));
        let locks = Arc::new(LockService::new(store.as_ref(), Duration::from_secs(30), Duration::from_secs(10)));
        let orchestrator = CleanseOrchestrator::new(store.clone(), report_sink, Arc::new(NullNotificationSink::default()), locks, vec![], Tuning::default());

        let operations = store.collection(CLEANSE_OPERATIONS_COLLECTION);
        let pending = CleanseAnalysisOperation::new("op-no-report".to_string(), Utc::now());
        operations.insert_one(to_document(&pending).unwrap()).await.unwrap();

        let result = orchestrator.regenerate_report_url("op-no-report").await;
        assert!(result.is_err());

    }

    async fn wait_for_completion(operations: &dyn crate::docstore::Collection, operation_id: &str) -> CleanseAnalysisOperation {
        for _ in 0..100 {
            if let Some(doc) = operations.find_one(bson::doc! { "_id": operation_id }).await.unwrap() {
                let operation: CleanseAnalysisOperation = bson::from_document(doc).unwrap();
                if operation.status != AnalysisOperationStatus::Running {
                    return operation;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("operation {operation_id} did not complete in time");
    }
}
