use bson::Document;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisOperationStatus {
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanseAnalysisOperation {
    #[serde(rename = "_id")]
    pub id: String,
    pub status: AnalysisOperationStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub progress_pct: f64,
    pub status_description: String,
    pub records_analyzed: u64,
    pub total_records: u64,
    pub issues_found: u64,
    pub issues_resolved: u64,
    pub duration_ms: Option<u64>,
    pub error: Option<String>,
    pub report_object_key: Option<String>,
    pub report_url: Option<String>,
}

impl CleanseAnalysisOperation {
    pub fn new(id: String, now: DateTime<Utc>) -> Self {
        Self {
            id,
            status: AnalysisOperationStatus::Running,
            started_at: now,
            completed_at: None,
            progress_pct: 0.0,
            status_description: "starting".to_string(),
            records_analyzed: 0,
            total_records: 0,
            issues_found: 0,
            issues_resolved: 0,
            duration_ms: None,
            error: None,
            report_object_key: None,
            report_url: None,
        }
    }

    pub fn report_progress(&mut self, analyzed: u64, total: u64, found: u64, resolved: u64) {
        self.records_analyzed = analyzed;
        self.total_records = total;
        self.issues_found = found;
        self.issues_resolved = resolved;
        self.progress_pct = if total == 0 { 100.0 } else { (analyzed as f64 / total as f64) * 100.0 };
        self.status_description = format!("analyzed {analyzed}/{total} records, {found} issue(s) found, {resolved} resolved");
    }

    pub fn complete(&mut self, now: DateTime<Utc>) {
        self.status = AnalysisOperationStatus::Completed;
        self.completed_at = Some(now);
        self.duration_ms = Some((now - self.started_at).num_milliseconds().max(0) as u64);
        self.status_description = "completed".to_string();
    }

    pub fn fail(&mut self, error: String, now: DateTime<Utc>) {
        self.status = AnalysisOperationStatus::Failed;
        self.completed_at = Some(now);
        self.duration_ms = Some((now - self.started_at).num_milliseconds().max(0) as u64);
        self.status_description = format!("failed: {error}");
        self.error = Some(error);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStatus {
    #[default]
    None,
    Todo,
    InProgress,
    Resolved,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssueHistoryEntry {
    pub timestamp: DateTime<Utc>,
    pub actor: String,
    pub action: String,
    pub before: Option<Document>,
    pub after: Option<Document>,
}

/// A data-quality issue. `id` is deterministic (`hash(code, lid)`) so that a
/// re-occurring issue updates the same row instead of duplicating it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Issue {
    #[serde(rename = "_id")]
    pub id: String,
    pub code: String,
    pub rule_code: Option<String>,
    pub error_code: Option<String>,
    pub cts_lid_full_identifier: String,
    pub cph: String,
    pub created_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
    pub is_active: bool,
    pub is_ignored: bool,
    pub resolution_status: ResolutionStatus,
    pub assigned_to: Option<String>,
    pub history: Vec<IssueHistoryEntry>,
}

impl Issue {
    /// Deterministic id so that re-occurrence updates the issue in place
    /// rather than creating a duplicate.
    pub fn issue_id(code: &str, cts_lid_full_identifier: &str) -> String {
        crate::record_id::hash_parts(&[code, cts_lid_full_identifier]).unwrap_or_else(|_| format!("{code}:{cts_lid_full_identifier}"))
    }
}
