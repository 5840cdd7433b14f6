//! Drives an outer-collection scan through a rule pipeline and reconciles
//! the issue log — §4.11.

use async_trait::async_trait;
use bson::Document;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};

use crate::docstore::{Collection, DocumentStore};
use crate::errors::Error;
use crate::issues::{IssueRepository, UpsertEffect};
use crate::model::cleanse::Issue;
use crate::query::cache::AnalysisContext;
use crate::query::{Filter, QueryParameters, QueryService};
use crate::rules::Pipeline;

#[derive(Debug, Clone, Copy, Default)]
pub struct AnalysisMetrics {
    pub records_analyzed: u64,
    pub total_records: u64,
    pub issues_found: u64,
    pub issues_resolved: u64,
}

/// Extracts `(ctsLidFullIdentifier, cph)` from a carrier once the pipeline
/// has run, for issue identity and reconciliation bookkeeping.
pub type IdentifierFn<I> = Box<dyn Fn(&I) -> (String, String) + Send + Sync>;
pub type CarrierBuilderFn<I> = Box<dyn Fn(Document) -> Option<I> + Send + Sync>;
pub type ProgressFn = Box<dyn FnMut(AnalysisMetrics) + Send>;

pub struct AnalysisStrategy<I: Send + Sync> {
    pub outer_collection: String,
    pub outer_filter: Filter,
    pub issue_codes: Vec<String>,
    pub pipeline: Pipeline<I>,
    pub build_carrier: CarrierBuilderFn<I>,
    pub identifiers: IdentifierFn<I>,
    pub page_size: u64,
    pub progress_every: u64,
}

impl<I: Send + Sync> AnalysisStrategy<I> {
    pub async fn run(&self, store: &dyn DocumentStore, operation_id: &str, now: DateTime<Utc>, mut progress: Option<ProgressFn>) -> Result<AnalysisMetrics, Error> {
        let outer = store.collection(&self.outer_collection);
        let ctx = AnalysisContext::new(operation_id);
        let issue_repo = IssueRepository::new(store);

        let mut metrics = AnalysisMetrics { total_records: outer.count(self.outer_filter.to_document()).await?, ..Default::default() };
        let mut seen_by_code: HashMap<String, HashSet<String>> = self.issue_codes.iter().map(|c| (c.clone(), HashSet::new())).collect();

        let mut skip = 0u64;
        loop {
            let params = QueryParameters { collection_name: self.outer_collection.clone(), filter: self.outer_filter.clone(), order_by: None, skip: Some(skip), top: Some(self.page_size) };
            let page = QueryService::query(outer.as_ref(), &params).await?;
            if page.data.is_empty() {
                break;
            }
            let page_len = page.data.len() as u64;

            for record in page.data {
                let Some(mut carrier) = (self.build_carrier)(record) else { continue };
                let steps = self.pipeline.run(&mut carrier, &ctx).await;
                let (cts_lid, cph) = (self.identifiers)(&carrier);

                for step in steps {
                    let Ok(result) = step.result else { continue };
                    if !result.has_issue {
                        continue;
                    }
                    let code = result.issue_code.unwrap_or(step.rule_code);
                    let effect = issue_repo.upsert(&code, &cts_lid, &cph, result.context_data, now).await?;
                    if matches!(effect, UpsertEffect::Inserted | UpsertEffect::Reactivated) {
                        metrics.issues_found += 1;
                    }
                    seen_by_code.entry(code.clone()).or_default().insert(Issue::issue_id(&code, &cts_lid));
                }

                metrics.records_analyzed += 1;
                if metrics.records_analyzed % self.progress_every == 0 {
                    if let Some(progress) = progress.as_mut() {
                        progress(metrics);
                    }
                }
            }

            skip += page_len;
            if !page.has_more {
                break;
            }
        }

        for (code, seen) in &seen_by_code {
            metrics.issues_resolved += issue_repo.deactivate_all_active_except(code, seen, now).await?;
        }

        if let Some(progress) = progress.as_mut() {
            progress(metrics);
        }
        Ok(metrics)
    }
}

/// Object-safe view of `AnalysisStrategy<I>` so the cleanse orchestrator can
/// hold a heterogeneous list of strategies without naming each carrier type.
#[async_trait]
pub trait ErasedStrategy: Send + Sync {
    fn codes(&self) -> &[String];
    async fn run_erased(&self, store: &dyn DocumentStore, operation_id: &str, now: DateTime<Utc>) -> Result<AnalysisMetrics, Error>;
}

#[async_trait]
impl<I: Send + Sync> ErasedStrategy for AnalysisStrategy<I> {
    fn codes(&self) -> &[String] {
        &self.issue_codes
    }

    async fn run_erased(&self, store: &dyn DocumentStore, operation_id: &str, now: DateTime<Utc>) -> Result<AnalysisMetrics, Error> {
        self.run(store, operation_id, now, None).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::docstore::memory::InMemoryDocumentStore;
    use crate::rules::cts_rules::{CtsCarrier, SamLookupRule, SamSupportingDataRule, SAM_COLLECTION};
    use crate::rules::Continuation;
    use bson::doc;

    fn strategy() -> AnalysisStrategy<CtsCarrier> {
        AnalysisStrategy {
            outer_collection: "cts_movements".to_string(),
            outer_filter: Filter::Empty,
            issue_codes: vec!["SAM_RECORD_MISSING".to_string()],
            pipeline: Pipeline::new(),
            build_carrier: Box::new(|doc| CtsCarrier::new(doc, "AH")),
            identifiers: Box::new(|carrier: &CtsCarrier| (carrier.cts_lid_full_identifier.clone(), carrier.cph.clone())),
            page_size: 500,
            progress_every: 1,
        }
    }

    #[tokio::test]
    async fn scenario_missing_then_resolved_then_missing_again() {
        let store = InMemoryDocumentStore::new();
        let cts = store.collection("cts_movements");
        for n in 1..=3 {
            cts.insert_one(doc! { "_id": format!("c{n}"), "CPH": format!("12/345/000{n}") }).await.unwrap();
        }
        let sam = store.collection(SAM_COLLECTION);
        sam.insert_one(doc! { "_id": "s1", "CPH": "12/345/0001", "PARTY_NAME": "A", "EMAIL": "a@x.com" }).await.unwrap();
        sam.insert_one(doc! { "_id": "s3", "CPH": "12/345/0003", "PARTY_NAME": "C", "EMAIL": "c@x.com" }).await.unwrap();

        let mut strat = strategy();
        strat.pipeline = Pipeline::new()
            .add(Box::new(SamLookupRule { sam_collection: sam.clone() }), Continuation::ContinueAlways)
            .add(Box::new(SamSupportingDataRule), Continuation::ContinueAlways);

        let now = Utc::now();
        let metrics = strat.run(&store, "op-1", now, None).await.unwrap();
        assert_eq!(metrics.records_analyzed, 3);
        assert_eq!(metrics.issues_found, 1);

        sam.insert_one(doc! { "_id": "s2", "CPH": "12/345/0002", "PARTY_NAME": "B", "EMAIL": "b@x.com" }).await.unwrap();
        let metrics2 = strat.run(&store, "op-2", now, None).await.unwrap();
        assert_eq!(metrics2.issues_resolved, 1);

        let active = IssueRepository::new(&store).list_active(0, 10).await.unwrap();
        assert!(active.is_empty());

        sam.delete_one(doc! { "_id": "s2" }).await.unwrap();
        let metrics3 = strat.run(&store, "op-3", now, None).await.unwrap();
        assert_eq!(metrics3.issues_found, 1);
        let active = IssueRepository::new(&store).list_active(0, 10).await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, Issue::issue_id("SAM_RECORD_MISSING", "AH-12/345/0002"));
    }
}
