use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImportSourceType {
    Internal,
    External,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImportStatus {
    Started,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    NotStarted,
    Started,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    Acquired,
    Ingested,
    Failed,
    Skipped,
}

/// Per-row instruction to the upsert engine. Defaults to `Insert` when the
/// column is absent or blank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    #[default]
    Insert,
    Update,
    Delete,
}

impl ChangeType {
    pub fn parse(raw: &str) -> ChangeType {
        match raw.trim().to_ascii_uppercase().as_str() {
            "U" => ChangeType::Update,
            "D" => ChangeType::Delete,
            _ => ChangeType::Insert,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PhaseCounts {
    pub files_discovered: u64,
    pub files_processed: u64,
    pub files_skipped: u64,
    pub files_failed: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecordCounts {
    pub records_created: u64,
    pub records_updated: u64,
    pub records_deleted: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcquisitionPhaseReport {
    pub status: PhaseStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub counts: PhaseCounts,
}

impl Default for AcquisitionPhaseReport {
    fn default() -> Self {
        Self { status: PhaseStatus::NotStarted, started_at: None, completed_at: None, counts: PhaseCounts::default() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestionPhaseReport {
    pub status: PhaseStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub counts: PhaseCounts,
    #[serde(flatten)]
    pub records: RecordCounts,
}

impl Default for IngestionPhaseReport {
    fn default() -> Self {
        Self {
            status: PhaseStatus::NotStarted,
            started_at: None,
            completed_at: None,
            counts: PhaseCounts::default(),
            records: RecordCounts::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcquisitionDetail {
    pub source_key: String,
    pub decryption_duration_ms: u64,
    pub acquired_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestionDetail {
    pub records_processed: u64,
    pub records_created: u64,
    pub records_updated: u64,
    pub records_deleted: u64,
    pub ingestion_duration_ms: u64,
    pub ingested_at: DateTime<Utc>,
}

/// One per (import id, file key). `ingestion.is_some()` implies
/// `acquisition.is_some()` unless the import's `source_type` is `Internal`
/// (internal imports read already-decrypted target objects directly).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileProcessingReport {
    #[serde(rename = "_id")]
    pub id: String,
    pub import_id: String,
    pub file_name: String,
    pub file_key: String,
    pub dataset_name: String,
    pub md5: Option<String>,
    pub e_tag: String,
    pub file_size: u64,
    pub status: FileStatus,
    pub acquisition: Option<AcquisitionDetail>,
    pub ingestion: Option<IngestionDetail>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportReport {
    #[serde(rename = "_id")]
    pub id: String,
    pub source_type: ImportSourceType,
    pub status: ImportStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub acquisition: AcquisitionPhaseReport,
    pub ingestion: IngestionPhaseReport,
}

impl ImportReport {
    pub fn new(id: String, source_type: ImportSourceType, now: DateTime<Utc>) -> Self {
        Self {
            id,
            source_type,
            status: ImportStatus::Started,
            started_at: now,
            completed_at: None,
            error: None,
            acquisition: AcquisitionPhaseReport::default(),
            ingestion: IngestionPhaseReport::default(),
        }
    }

    pub fn complete(&mut self, status: ImportStatus, error: Option<String>, now: DateTime<Utc>) {
        self.status = status;
        self.error = error;
        self.completed_at = Some(now);
    }
}
