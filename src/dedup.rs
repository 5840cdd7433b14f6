//! Answers "has this exact object already been fully processed?" by
//! consulting the file-processing-report collection — §2 Deduper.

use bson::doc;
use std::sync::Arc;

use crate::docstore::{Collection, DocumentStore};
use crate::model::FileStatus;

pub const FILE_REPORTS_COLLECTION: &str = "file_processing_reports";

#[derive(Clone)]
pub struct Deduper {
    reports: Arc<dyn Collection>,
}

impl Deduper {
    pub fn new(store: &dyn DocumentStore) -> Self {
        Self { reports: store.collection(FILE_REPORTS_COLLECTION) }
    }

    /// True if a prior report for this exact `(file_key, e_tag)` already
    /// reached a successful terminal state (`Acquired` or `Ingested`).
    pub async fn already_processed(&self, file_key: &str, e_tag: &str, terminal: FileStatus) -> Result<bool, crate::errors::Error> {
        let status = match terminal {
            FileStatus::Acquired => "acquired",
            FileStatus::Ingested => "ingested",
            FileStatus::Failed => "failed",
            FileStatus::Skipped => "skipped",
        };
        let filter = doc! { "file_key": file_key, "e_tag": e_tag, "status": status };
        Ok(self.reports.count(filter).await? > 0)
    }
}
