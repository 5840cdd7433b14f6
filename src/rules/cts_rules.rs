//! A concrete cross-dataset rule: every CTS (cattle tracing) row must have a
//! matching SAM (single application/holding) record for its CPH, with the
//! holding's supporting party and email data populated — §8 scenario 5.

use async_trait::async_trait;
use bson::Document;

use super::{Rule, RuleResult};
use crate::query::cache::AnalysisContext;
use crate::query::{Filter, QueryParameters};

pub const SAM_COLLECTION: &str = "sam_holdings";
pub const ISSUE_SAM_MISSING: &str = "SAM_RECORD_MISSING";

/// Carrier threaded through the pipeline for one CTS record. `sam_record` is
/// populated by `SamLookupRule` so `SamSupportingDataRule` doesn't re-query.
pub struct CtsCarrier {
    pub cts_record: Document,
    pub cph: String,
    pub cts_lid_full_identifier: String,
    pub sam_record: Option<Document>,
}

impl CtsCarrier {
    pub fn new(cts_record: Document, region: &str) -> Option<Self> {
        let cph = cts_record.get_str("CPH").ok()?.to_string();
        Some(Self { cts_lid_full_identifier: format!("{region}-{cph}"), cph, cts_record, sam_record: None })
    }
}

/// Looks up the SAM record for the carrier's CPH via the shared query cache
/// and attaches it to the carrier. Never itself reports an issue.
pub struct SamLookupRule {
    pub sam_collection: std::sync::Arc<dyn crate::docstore::Collection>,
}

#[async_trait]
impl Rule<CtsCarrier> for SamLookupRule {
    fn code(&self) -> &str {
        "SAM_LOOKUP"
    }

    async fn execute(&self, input: &mut CtsCarrier, ctx: &AnalysisContext) -> RuleResult {
        let params = QueryParameters { collection_name: SAM_COLLECTION.to_string(), filter: Filter::Eq("CPH".into(), input.cph.clone().into()), order_by: None, skip: None, top: Some(1) };

        match ctx.query(self.sam_collection.as_ref(), &params).await {
            Ok(result) => {
                input.sam_record = result.data.first().cloned();
                RuleResult::no_issue()
            }
            Err(_) => RuleResult::no_issue(),
        }
    }
}

/// Flags a CTS record whose CPH has no SAM holding, or whose SAM holding is
/// missing supporting party/email data.
pub struct SamSupportingDataRule;

#[async_trait]
impl Rule<CtsCarrier> for SamSupportingDataRule {
    fn code(&self) -> &str {
        ISSUE_SAM_MISSING
    }

    async fn execute(&self, input: &mut CtsCarrier, _ctx: &AnalysisContext) -> RuleResult {
        match &input.sam_record {
            None => RuleResult::issue(ISSUE_SAM_MISSING, Some(bson::doc! { "reason": "no SAM holding for CPH", "cph": &input.cph })),
            Some(sam) => {
                let has_party = sam.get_str("PARTY_NAME").map(|s| !s.trim().is_empty()).unwrap_or(false);
                let has_email = sam.get_str("EMAIL").map(|s| !s.trim().is_empty()).unwrap_or(false);
                if has_party && has_email {
                    RuleResult::no_issue()
                } else {
                    RuleResult::issue(ISSUE_SAM_MISSING, Some(bson::doc! { "reason": "SAM holding missing party or email", "cph": &input.cph }))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::docstore::memory::InMemoryDocumentStore;
    use crate::docstore::DocumentStore;
    use crate::rules::{Continuation, Pipeline};
    use bson::doc;

    #[tokio::test]
    async fn flags_a_cts_record_with_no_matching_sam_holding() {
        let store = InMemoryDocumentStore::new();
        let sam = store.collection(SAM_COLLECTION);

        let ctx = AnalysisContext::new("op-1");
        let pipeline = Pipeline::new()
            .add(Box::new(SamLookupRule { sam_collection: sam.clone() }), Continuation::ContinueAlways)
            .add(Box::new(SamSupportingDataRule), Continuation::ContinueAlways);

        let mut carrier = CtsCarrier::new(doc! { "CPH": "12/345/0001" }, "AH").unwrap();
        let steps = pipeline.run(&mut carrier, &ctx).await;
        let last = steps.last().unwrap();
        assert!(last.result.as_ref().unwrap().has_issue);
    }

    #[tokio::test]
    async fn no_issue_once_sam_holding_has_supporting_data() {
        let store = InMemoryDocumentStore::new();
        let sam = store.collection(SAM_COLLECTION);
        sam.insert_one(doc! { "_id": "s1", "CPH": "12/345/0002", "PARTY_NAME": "A Farmer", "EMAIL": "a@example.com" }).await.unwrap();

        let ctx = AnalysisContext::new("op-1");
        let pipeline = Pipeline::new()
            .add(Box::new(SamLookupRule { sam_collection: sam.clone() }), Continuation::ContinueAlways)
            .add(Box::new(SamSupportingDataRule), Continuation::ContinueAlways);

        let mut carrier = CtsCarrier::new(doc! { "CPH": "12/345/0002" }, "AH").unwrap();
        let steps = pipeline.run(&mut carrier, &ctx).await;
        assert!(!steps.last().unwrap().result.as_ref().unwrap().has_issue);
    }
}
