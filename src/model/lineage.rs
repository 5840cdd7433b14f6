use bson::Document;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ChangeType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LineageStatus {
    Active,
    Deleted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LineageEventType {
    Created,
    Updated,
    Deleted,
    Undeleted,
}

/// One entry in a record's append-only history. `Created` never carries
/// `previous_values`; `Deleted` never carries `new_values`; `Undeleted` only
/// ever appears after a `Deleted` for the same record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordLineageEvent {
    pub event_type: LineageEventType,
    pub import_id: String,
    pub file_key: String,
    pub event_date: DateTime<Utc>,
    pub change_type: ChangeType,
    pub previous_values: Option<Document>,
    pub new_values: Option<Document>,
}

/// Lifecycle rollup owned by the (collection, record_id) pair. References
/// (does not own) imports by id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordLineage {
    #[serde(rename = "_id")]
    pub id: String,
    pub record_id: String,
    pub collection: String,
    pub current_status: LineageStatus,
    pub created_by_import: String,
    pub last_modified_by_import: String,
    pub created_at: DateTime<Utc>,
    pub last_modified_at: DateTime<Utc>,
    pub events: Vec<RecordLineageEvent>,
}

impl RecordLineage {
    pub fn lineage_id(collection: &str, record_id: &str) -> String {
        format!("{collection}:{record_id}")
    }

    pub fn new_created(collection: &str, record_id: &str, import_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            id: Self::lineage_id(collection, record_id),
            record_id: record_id.to_string(),
            collection: collection.to_string(),
            current_status: LineageStatus::Active,
            created_by_import: import_id.to_string(),
            last_modified_by_import: import_id.to_string(),
            created_at: now,
            last_modified_at: now,
            events: Vec::new(),
        }
    }
}

/// Verifies the lineage-closure invariant: every `Updated`/`Deleted`/`Undeleted`
/// event has an earlier `Created` event for the same record.
pub fn lineage_events_are_well_formed(events: &[RecordLineageEvent]) -> bool {
    let mut seen_created = false;
    let mut seen_deleted_since_created = false;

    for event in events {
        match event.event_type {
            LineageEventType::Created => {
                if seen_created {
                    return false;
                }
                seen_created = true;
            }
            LineageEventType::Updated | LineageEventType::Deleted => {
                if !seen_created {
                    return false;
                }
                if event.event_type == LineageEventType::Deleted {
                    seen_deleted_since_created = true;
                }
            }
            LineageEventType::Undeleted => {
                if !seen_deleted_since_created {
                    return false;
                }
                seen_deleted_since_created = false;
            }
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(kind: LineageEventType) -> RecordLineageEvent {
        RecordLineageEvent {
            event_type: kind,
            import_id: "import-1".into(),
            file_key: "file-1".into(),
            event_date: Utc::now(),
            change_type: ChangeType::Insert,
            previous_values: None,
            new_values: None,
        }
    }

    #[test]
    fn created_updated_deleted_undeleted_is_well_formed() {
        use LineageEventType::*;
        let events = vec![event(Created), event(Updated), event(Deleted), event(Undeleted)];
        assert!(lineage_events_are_well_formed(&events));
    }

    #[test]
    fn updated_without_created_is_rejected() {
        let events = vec![event(LineageEventType::Updated)];
        assert!(!lineage_events_are_well_formed(&events));
    }

    #[test]
    fn undeleted_without_a_preceding_delete_is_rejected() {
        let events = vec![event(LineageEventType::Created), event(LineageEventType::Undeleted)];
        assert!(!lineage_events_are_well_formed(&events));
    }
}
