//! Maintains the data-quality issue log: insert-if-absent, reactivate-if-inactive,
//! touch-if-active, and end-of-run deactivation of issues no longer observed — §4.11.

use bson::{doc, Document};
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::Arc;

use crate::docstore::{to_document, Collection, DocumentStore, FindOptions};
use crate::errors::Error;
use crate::model::cleanse::{Issue, IssueHistoryEntry, ResolutionStatus};
use futures::TryStreamExt;

pub const COLLECTION: &str = "issues";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertEffect {
    Inserted,
    Reactivated,
    Touched,
}

pub struct IssueRepository {
    issues: Arc<dyn Collection>,
}

impl IssueRepository {
    pub fn new(store: &dyn DocumentStore) -> Self {
        Self { issues: store.collection(COLLECTION) }
    }

    /// Insert-if-absent / activate-if-inactive / touch-if-active.
    pub async fn upsert(&self, code: &str, cts_lid_full_identifier: &str, cph: &str, context_data: Option<Document>, now: DateTime<Utc>) -> Result<UpsertEffect, Error> {
        let id = Issue::issue_id(code, cts_lid_full_identifier);
        let existing = self.issues.find_one(doc! { "_id": &id }).await?;

        let (mut issue, effect) = match existing {
            None => (
                Issue {
                    id: id.clone(),
                    code: code.to_string(),
                    rule_code: Some(code.to_string()),
                    error_code: None,
                    cts_lid_full_identifier: cts_lid_full_identifier.to_string(),
                    cph: cph.to_string(),
                    created_at: now,
                    last_updated_at: now,
                    is_active: true,
                    is_ignored: false,
                    resolution_status: ResolutionStatus::None,
                    assigned_to: None,
                    history: Vec::new(),
                },
                UpsertEffect::Inserted,
            ),
            Some(doc) => {
                let mut issue: Issue = bson::from_document(doc)?;
                let effect = if issue.is_active { UpsertEffect::Touched } else { UpsertEffect::Reactivated };
                issue.is_active = true;
                issue.last_updated_at = now;
                (issue, effect)
            }
        };

        issue.history.push(IssueHistoryEntry { timestamp: now, actor: "cleanse-engine".to_string(), action: format!("{effect:?}"), before: None, after: context_data });

        self.issues.replace_one(doc! { "_id": &id }, to_document(&issue)?).await?;
        Ok(effect)
    }

    /// Deactivates every currently-active issue for `code` whose id is not in
    /// `seen`; returns the count deactivated (the strategy's `issuesResolved`).
    pub async fn deactivate_all_active_except(&self, code: &str, seen: &HashSet<String>, now: DateTime<Utc>) -> Result<u64, Error> {
        let filter = doc! { "code": code, "is_active": true };
        let stream = self.issues.find(filter, FindOptions::default()).await?;
        let actives: Vec<Document> = stream.try_collect().await?;

        let mut deactivated = 0u64;
        for doc in actives {
            let mut issue: Issue = bson::from_document(doc)?;
            if seen.contains(&issue.id) {
                continue;
            }
            issue.is_active = false;
            issue.last_updated_at = now;
            issue.history.push(IssueHistoryEntry { timestamp: now, actor: "cleanse-engine".to_string(), action: "Deactivated".to_string(), before: None, after: None });
            self.issues.replace_one(doc! { "_id": &issue.id }, to_document(&issue)?).await?;
            deactivated += 1;
        }
        Ok(deactivated)
    }

    pub async fn list_active(&self, skip: u64, top: u64) -> Result<Vec<Issue>, Error> {
        let filter = doc! { "is_active": true };
        let stream = self.issues.find(filter, FindOptions { skip: Some(skip), limit: Some(top as i64), sort: Some(doc! { "_id": 1 }) }).await?;
        let rows: Vec<Document> = stream.try_collect().await?;
        rows.into_iter().map(bson::from_document).collect::<Result<Vec<_>, _>>().map_err(Error::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::docstore::memory::InMemoryDocumentStore;

    #[tokio::test]
    async fn reoccurring_issue_updates_the_same_row() {
        let store = InMemoryDocumentStore::new();
        let repo = IssueRepository::new(&store);
        let now = Utc::now();

        let first = repo.upsert("SAM_RECORD_MISSING", "AH-12/345/0002", "12/345/0002", None, now).await.unwrap();
        assert_eq!(first, UpsertEffect::Inserted);

        let second = repo.upsert("SAM_RECORD_MISSING", "AH-12/345/0002", "12/345/0002", None, now).await.unwrap();
        assert_eq!(second, UpsertEffect::Touched);

        let count = store.collection(COLLECTION).count(Document::new()).await.unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn deactivate_except_seen_resolves_the_missing_ones() {
        let store = InMemoryDocumentStore::new();
        let repo = IssueRepository::new(&store);
        let now = Utc::now();

        repo.upsert("SAM_RECORD_MISSING", "AH-12/345/0001", "12/345/0001", None, now).await.unwrap();
        repo.upsert("SAM_RECORD_MISSING", "AH-12/345/0002", "12/345/0002", None, now).await.unwrap();

        let keep_id = Issue::issue_id("SAM_RECORD_MISSING", "AH-12/345/0001");
        let mut seen = HashSet::new();
        seen.insert(keep_id);

        let resolved = repo.deactivate_all_active_except("SAM_RECORD_MISSING", &seen, now).await.unwrap();
        assert_eq!(resolved, 1);

        let reoccurred = repo.upsert("SAM_RECORD_MISSING", "AH-12/345/0002", "12/345/0002", None, now).await.unwrap();
        assert_eq!(reoccurred, UpsertEffect::Reactivated);
    }
}
